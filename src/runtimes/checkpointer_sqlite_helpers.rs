//! JSON glue for the SQLite checkpointer, kept out of the I/O path.

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::checkpointer::{CheckpointerError, Result};

/// Serialize a persisted model, labelling failures with the field name.
pub(super) fn serialize_json<T: Serialize>(value: &T, what: &'static str) -> Result<String> {
    serde_json::to_string(value).map_err(|e| CheckpointerError::Serde {
        message: format!("{what}: {e}"),
    })
}

/// Deserialize a persisted model, labelling failures with the field name.
pub(super) fn deserialize_json<T: DeserializeOwned>(payload: &str, what: &'static str) -> Result<T> {
    serde_json::from_str(payload).map_err(|e| CheckpointerError::Serde {
        message: format!("{what}: {e}"),
    })
}
