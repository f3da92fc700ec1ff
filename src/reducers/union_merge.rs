use serde_json::Value;

use super::{value_type_name, ChannelError, ChannelWrite, Reducer};

/// Shallow structural merge for object channels; later keys win.
///
/// Each contribution must be an object. Keys are merged into the committed
/// object in registration order, so when two writers touch the same key the
/// later registration wins deterministically.
#[derive(Debug, PartialEq, Clone, Hash, Eq, Default)]
pub struct UnionMerge;

impl Reducer for UnionMerge {
    fn fold(
        &self,
        channel: &str,
        current: Option<&Value>,
        writes: &[ChannelWrite],
    ) -> Result<Value, ChannelError> {
        let mut merged = match current {
            None | Some(Value::Null) => serde_json::Map::new(),
            Some(Value::Object(existing)) => existing.clone(),
            Some(other) => {
                return Err(ChannelError::TypeMismatch {
                    channel: channel.to_string(),
                    expected: "object",
                    found: value_type_name(other),
                });
            }
        };
        for write in writes {
            match &write.value {
                Value::Object(contributed) => {
                    for (key, value) in contributed {
                        merged.insert(key.clone(), value.clone());
                    }
                }
                other => {
                    return Err(ChannelError::TypeMismatch {
                        channel: channel.to_string(),
                        expected: "object",
                        found: value_type_name(other),
                    });
                }
            }
        }
        Ok(Value::Object(merged))
    }
}
