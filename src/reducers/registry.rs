use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::instrument;

use super::{Append, ChannelError, ChannelWrite, Reducer, ERRORS_CHANNEL};
use crate::node::PartialUpdate;
use crate::state::ChannelStore;
use crate::types::NodeId;

/// Channel-key to reducer bindings, fixed at graph-definition time.
///
/// The registry is the single authority consulted by the barrier: every
/// channel a node writes must have a binding here, and each channel has
/// exactly one reducer. Re-binding a key replaces the previous reducer.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use stategraph::reducers::{Append, Overwrite, ReducerRegistry};
///
/// let registry = ReducerRegistry::new()
///     .with_reducer("message", Arc::new(Overwrite))
///     .with_reducer("steps", Arc::new(Append));
/// assert!(registry.contains("message"));
/// ```
#[derive(Clone)]
pub struct ReducerRegistry {
    bindings: FxHashMap<String, Arc<dyn Reducer>>,
}

impl Default for ReducerRegistry {
    /// Registry with only the reserved `errors` channel bound ([`Append`]).
    fn default() -> Self {
        Self::new().with_reducer(ERRORS_CHANNEL, Arc::new(Append))
    }
}

impl ReducerRegistry {
    /// Empty registry with no bindings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bindings: FxHashMap::default(),
        }
    }

    /// Bind a reducer to a channel key, replacing any previous binding.
    pub fn register(&mut self, channel: impl Into<String>, reducer: Arc<dyn Reducer>) -> &mut Self {
        self.bindings.insert(channel.into(), reducer);
        self
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with_reducer(mut self, channel: impl Into<String>, reducer: Arc<dyn Reducer>) -> Self {
        self.register(channel, reducer);
        self
    }

    /// Reducer bound to a channel, if declared.
    #[must_use]
    pub fn get(&self, channel: &str) -> Option<&Arc<dyn Reducer>> {
        self.bindings.get(channel)
    }

    /// `true` if the channel has a binding.
    #[must_use]
    pub fn contains(&self, channel: &str) -> bool {
        self.bindings.contains_key(channel)
    }

    /// Declared channel keys.
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    /// Fold one superstep's outputs into the store.
    ///
    /// Contributions are grouped per channel in registration order (the
    /// order of `outputs`, which the scheduler keeps equal to frontier
    /// order), then each touched channel is folded through its reducer and
    /// committed. Channels are processed in sorted key order so error
    /// precedence and the returned update list are reproducible.
    ///
    /// Returns the keys whose committed value actually changed.
    #[instrument(skip(self, store, outputs), fields(outputs = outputs.len()))]
    pub fn apply_step(
        &self,
        store: &mut ChannelStore,
        outputs: &[(NodeId, PartialUpdate)],
    ) -> Result<Vec<String>, ChannelError> {
        let mut per_channel: FxHashMap<&str, Vec<ChannelWrite>> = FxHashMap::default();
        for (writer, update) in outputs {
            let mut keys: Vec<&str> = update.iter().map(|(key, _)| key).collect();
            keys.sort_unstable();
            for key in keys {
                if let Some(value) = update.get(key) {
                    per_channel.entry(key).or_default().push(ChannelWrite {
                        writer: writer.clone(),
                        value: value.clone(),
                    });
                }
            }
        }

        let mut touched: Vec<&str> = per_channel.keys().copied().collect();
        touched.sort_unstable();

        // Fold everything before committing anything, so a conflict or type
        // error leaves the store exactly as the previous superstep left it.
        let mut staged = Vec::with_capacity(touched.len());
        for channel in touched {
            let writes = &per_channel[channel];
            let Some(reducer) = self.bindings.get(channel) else {
                let writer = writes
                    .first()
                    .map_or_else(|| "unknown".to_string(), |w| w.writer.to_string());
                return Err(ChannelError::Undeclared {
                    channel: channel.to_string(),
                    writer,
                });
            };
            let folded = reducer.fold(channel, store.get(channel), writes)?;
            staged.push((channel, folded));
        }

        let mut updated = Vec::new();
        for (channel, folded) in staged {
            if store.commit(channel, folded) {
                updated.push(channel.to_string());
            }
        }
        Ok(updated)
    }
}
