use serde_json::Value;

use super::{ChannelError, ChannelWrite, ConflictError, Reducer};

/// Last-write-wins semantics for single-owner channels.
///
/// A superstep may contain several writes to an overwrite channel only if
/// they all agree; two writers contributing different values is a fatal
/// [`ConflictError`], because the order of concurrent writers is undefined
/// and picking one silently would hide the race.
#[derive(Debug, PartialEq, Clone, Hash, Eq, Default)]
pub struct Overwrite;

impl Reducer for Overwrite {
    fn fold(
        &self,
        channel: &str,
        current: Option<&Value>,
        writes: &[ChannelWrite],
    ) -> Result<Value, ChannelError> {
        let Some(first) = writes.first() else {
            // No contribution: keep the committed value.
            return Ok(current.cloned().unwrap_or(Value::Null));
        };
        for later in &writes[1..] {
            if later.value != first.value {
                return Err(ConflictError {
                    channel: channel.to_string(),
                    left_writer: first.writer.to_string(),
                    left: first.value.clone(),
                    right_writer: later.writer.to_string(),
                    right: later.value.clone(),
                }
                .into());
            }
        }
        Ok(first.value.clone())
    }
}
