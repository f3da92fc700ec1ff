use serde_json::Value;

use super::{value_type_name, ChannelError, ChannelWrite, Reducer};

/// Ordered concatenation into an array channel.
///
/// Contributions are appended in registration order. An array contribution
/// extends the channel; any other value is pushed as a single element, so
/// nodes can contribute one entry without wrapping it themselves. The merged
/// length is always the sum of contributed lengths.
#[derive(Debug, PartialEq, Clone, Hash, Eq, Default)]
pub struct Append;

impl Reducer for Append {
    fn fold(
        &self,
        channel: &str,
        current: Option<&Value>,
        writes: &[ChannelWrite],
    ) -> Result<Value, ChannelError> {
        let mut items = match current {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(existing)) => existing.clone(),
            Some(other) => {
                return Err(ChannelError::TypeMismatch {
                    channel: channel.to_string(),
                    expected: "array",
                    found: value_type_name(other),
                });
            }
        };
        for write in writes {
            match &write.value {
                Value::Array(contributed) => items.extend(contributed.iter().cloned()),
                single => items.push(single.clone()),
            }
        }
        Ok(Value::Array(items))
    }
}
