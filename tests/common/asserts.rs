//! Assertion helpers for integration tests.

use serde_json::Value;
use stategraph::state::Snapshot;

/// The `messages` channel as plain strings, panicking on shape surprises.
#[allow(dead_code)]
pub fn messages_of(snapshot: &Snapshot) -> Vec<String> {
    snapshot
        .get_array("messages")
        .expect("messages channel should hold an array")
        .iter()
        .map(|entry| {
            entry
                .as_str()
                .expect("messages entries should be strings")
                .to_string()
        })
        .collect()
}

/// Asserts the `messages` channel holds exactly the expected entries.
#[allow(dead_code)]
pub fn assert_messages(snapshot: &Snapshot, expected: &[&str]) {
    let actual = messages_of(snapshot);
    assert_eq!(actual, expected, "messages channel mismatch");
}

/// Records in the reserved `errors` channel, as raw JSON.
#[allow(dead_code)]
pub fn error_records(snapshot: &Snapshot) -> Vec<Value> {
    snapshot
        .get_array("errors")
        .cloned()
        .unwrap_or_default()
}

/// Asserts the errors channel contains a record attributed to `node`.
#[allow(dead_code)]
pub fn assert_error_from(snapshot: &Snapshot, node: &str) {
    let records = error_records(snapshot);
    assert!(
        records
            .iter()
            .any(|record| record.get("node").and_then(Value::as_str) == Some(node)),
        "no error record from '{node}' in {records:?}"
    );
}
