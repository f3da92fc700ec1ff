//! Channel state for the stategraph runtime.
//!
//! State lives in named channels, each holding one `serde_json::Value` plus a
//! version counter that is bumped only when a barrier merge actually changes
//! the value. Nodes never see the store itself; they receive an immutable
//! [`Snapshot`] taken at the superstep boundary.
//!
//! # Core Types
//!
//! - [`ChannelStore`]: the mutable container owned by the execution engine
//! - [`Snapshot`]: immutable view handed to nodes and routers
//!
//! # Examples
//!
//! ```rust
//! use stategraph::state::ChannelStore;
//! use serde_json::json;
//!
//! let store = ChannelStore::builder()
//!     .with("message", json!("Hello"))
//!     .with("number", json!(4))
//!     .build();
//!
//! let snapshot = store.snapshot();
//! assert_eq!(snapshot.get_str("message"), Some("Hello"));
//! assert_eq!(snapshot.get_i64("number"), Some(4));
//! assert_eq!(snapshot.version("message"), 1);
//! ```

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One channel's current value and version.
///
/// Versions start at 1 on first write and increase by one each time a merge
/// commits a different value. A version of 0 is never stored; absent channels
/// simply have no cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelCell {
    /// Current value of the channel.
    pub value: Value,
    /// Number of distinct values this channel has held.
    pub version: u64,
}

/// The mutable state container owned by the execution engine.
///
/// `ChannelStore` maps channel keys to [`ChannelCell`]s. All mutation goes
/// through [`commit`](Self::commit) so version counters stay truthful; nodes
/// and routers only ever observe a [`Snapshot`].
///
/// # Examples
///
/// ```rust
/// use stategraph::state::ChannelStore;
/// use serde_json::json;
///
/// let mut store = ChannelStore::default();
/// assert!(store.commit("result", json!("ok")));
/// // Same value again: no version bump.
/// assert!(!store.commit("result", json!("ok")));
/// assert_eq!(store.version("result"), 1);
///
/// assert!(store.commit("result", json!("better")));
/// assert_eq!(store.version("result"), 2);
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChannelStore {
    cells: FxHashMap<String, ChannelCell>,
}

impl ChannelStore {
    /// Empty store with no channels.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fluent construction for seeding initial state.
    #[must_use]
    pub fn builder() -> ChannelStoreBuilder {
        ChannelStoreBuilder::default()
    }

    /// Seed a store from an initial value map. Every seeded channel starts at
    /// version 1; keys absent from the map stay absent until first written.
    #[must_use]
    pub fn seeded(values: FxHashMap<String, Value>) -> Self {
        let cells = values
            .into_iter()
            .map(|(key, value)| (key, ChannelCell { value, version: 1 }))
            .collect();
        Self { cells }
    }

    /// Current value of a channel, or `None` if it has never been written.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.cells.get(key).map(|cell| &cell.value)
    }

    /// Full cell (value + version) for a channel.
    #[must_use]
    pub fn cell(&self, key: &str) -> Option<&ChannelCell> {
        self.cells.get(key)
    }

    /// Version of a channel; 0 if it has never been written.
    #[must_use]
    pub fn version(&self, key: &str) -> u64 {
        self.cells.get(key).map_or(0, |cell| cell.version)
    }

    /// Commit a merged value for a channel. Returns `true` when the value
    /// differed from the stored one (version bumped), `false` when the merge
    /// was a no-op.
    pub fn commit(&mut self, key: &str, value: Value) -> bool {
        match self.cells.get_mut(key) {
            Some(cell) => {
                if cell.value == value {
                    false
                } else {
                    cell.value = value;
                    cell.version += 1;
                    true
                }
            }
            None => {
                self.cells
                    .insert(key.to_string(), ChannelCell { value, version: 1 });
                true
            }
        }
    }

    /// Restore a cell exactly as persisted. Used when rehydrating from a
    /// checkpoint; does not bump versions.
    pub fn restore(&mut self, key: impl Into<String>, cell: ChannelCell) {
        self.cells.insert(key.into(), cell);
    }

    /// Keys of every channel that has been written at least once.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.cells.keys().map(String::as_str)
    }

    /// Iterate over `(key, cell)` pairs. Order is unspecified.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ChannelCell)> {
        self.cells.iter().map(|(key, cell)| (key.as_str(), cell))
    }

    /// Number of channels holding a value.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// `true` when no channel has been written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Immutable view of the current state for nodes and routers.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let mut channels = FxHashMap::default();
        let mut versions = FxHashMap::default();
        for (key, cell) in &self.cells {
            channels.insert(key.clone(), cell.value.clone());
            versions.insert(key.clone(), cell.version);
        }
        Snapshot { channels, versions }
    }
}

/// Fluent seeding for [`ChannelStore`].
#[derive(Default)]
pub struct ChannelStoreBuilder {
    values: FxHashMap<String, Value>,
}

impl ChannelStoreBuilder {
    /// Seed one channel.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    /// Finish building the seeded store.
    #[must_use]
    pub fn build(self) -> ChannelStore {
        ChannelStore::seeded(self.values)
    }
}

/// Immutable view of channel state at a superstep boundary.
///
/// Snapshots are created by [`ChannelStore::snapshot`] and handed by value to
/// every node of a superstep, so concurrent node executions read identical
/// state and never observe each other's output. Routers receive the
/// post-merge snapshot of the same superstep.
///
/// The typed accessors are conveniences over the underlying
/// `serde_json::Value` cells; they return `None` both when the channel is
/// absent and when it holds a different type.
///
/// # Examples
///
/// ```rust
/// use stategraph::state::ChannelStore;
/// use serde_json::json;
///
/// let mut store = ChannelStore::default();
/// store.commit("message", json!("Hello"));
/// let snapshot = store.snapshot();
///
/// // Snapshot is independent of later mutation.
/// store.commit("message", json!("changed"));
/// assert_eq!(snapshot.get_str("message"), Some("Hello"));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Channel values at snapshot time.
    pub channels: FxHashMap<String, Value>,
    /// Channel versions at snapshot time.
    pub versions: FxHashMap<String, u64>,
}

impl Snapshot {
    /// Raw value of a channel.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.channels.get(key)
    }

    /// `true` if the channel has been written at least once.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.channels.contains_key(key)
    }

    /// Version of a channel; 0 if it has never been written.
    #[must_use]
    pub fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    /// String value of a channel.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.channels.get(key).and_then(Value::as_str)
    }

    /// Signed integer value of a channel.
    #[must_use]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.channels.get(key).and_then(Value::as_i64)
    }

    /// Unsigned integer value of a channel.
    #[must_use]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.channels.get(key).and_then(Value::as_u64)
    }

    /// Float value of a channel.
    #[must_use]
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.channels.get(key).and_then(Value::as_f64)
    }

    /// Boolean value of a channel.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.channels.get(key).and_then(Value::as_bool)
    }

    /// Array value of a channel.
    #[must_use]
    pub fn get_array(&self, key: &str) -> Option<&Vec<Value>> {
        self.channels.get(key).and_then(Value::as_array)
    }

    /// Object value of a channel.
    #[must_use]
    pub fn get_object(&self, key: &str) -> Option<&serde_json::Map<String, Value>> {
        self.channels.get(key).and_then(Value::as_object)
    }

    /// Keys of every channel present in the snapshot.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }
}
