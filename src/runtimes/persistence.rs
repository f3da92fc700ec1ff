/*!
Serde models for checkpoint storage.

These shapes are deliberately decoupled from the in-memory types: the
engine's `ChannelStore` and `NodeId` evolve freely while the persisted
form stays a stable, explicit contract. Conversion lives here (`From` /
`TryFrom` impls) so checkpointer backends stay lean I/O code.

Channel maps serialize through `BTreeMap`, giving key-sorted, reproducible
JSON. Decoding an encoded checkpoint yields a value equal to the original,
and re-encoding yields identical bytes.

This module performs no I/O.
*/

use std::collections::BTreeMap;

use chrono::Utc;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::runtimes::checkpointer::Checkpoint;
use crate::state::{ChannelCell, ChannelStore};
use crate::types::NodeId;

/// Persisted form of one channel cell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedCell {
    pub value: Value,
    pub version: u64,
}

/// Persisted form of the full channel store, key-sorted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistedStore {
    #[serde(default)]
    pub channels: BTreeMap<String, PersistedCell>,
}

/// Full persisted checkpoint representation.
///
/// Node ids are stored as their `NodeId::encode` strings; `created_at` is
/// RFC3339 text so the serialized shape carries no chrono types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedCheckpoint {
    pub thread_id: String,
    pub step: u64,
    pub store: PersistedStore,
    pub frontier: Vec<String>,
    pub concurrency_limit: usize,
    pub created_at: String,
    #[serde(default)]
    pub ran_nodes: Vec<String>,
    #[serde(default)]
    pub skipped_nodes: Vec<String>,
    #[serde(default)]
    pub updated_channels: Vec<String>,
}

/// Conversion and serialization errors for the persistence models.
#[derive(Debug, Error, Diagnostic)]
pub enum PersistenceError {
    #[error("missing field: {0}")]
    #[diagnostic(
        code(stategraph::persistence::missing_field),
        help("populate the field in the persisted JSON before conversion")
    )]
    MissingField(&'static str),

    #[error("JSON serialization/deserialization failed: {source}")]
    #[diagnostic(
        code(stategraph::persistence::serde),
        help("ensure the JSON structure matches the Persisted* types")
    )]
    Serde {
        #[source]
        source: serde_json::Error,
    },

    #[error("persistence error: {0}")]
    #[diagnostic(code(stategraph::persistence::other))]
    Other(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/* ---------- ChannelStore <-> PersistedStore ---------- */

impl From<&ChannelStore> for PersistedStore {
    fn from(store: &ChannelStore) -> Self {
        let channels = store
            .iter()
            .map(|(key, cell)| {
                (
                    key.to_string(),
                    PersistedCell {
                        value: cell.value.clone(),
                        version: cell.version,
                    },
                )
            })
            .collect();
        PersistedStore { channels }
    }
}

impl From<PersistedStore> for ChannelStore {
    fn from(persisted: PersistedStore) -> Self {
        let mut store = ChannelStore::new();
        for (key, cell) in persisted.channels {
            store.restore(
                key,
                ChannelCell {
                    value: cell.value,
                    version: cell.version,
                },
            );
        }
        store
    }
}

/* ---------- Checkpoint <-> PersistedCheckpoint ---------- */

fn encode_nodes(nodes: &[NodeId]) -> Vec<String> {
    nodes.iter().map(NodeId::encode).collect()
}

fn decode_nodes(encoded: &[String]) -> Vec<NodeId> {
    encoded.iter().map(|s| NodeId::decode(s)).collect()
}

impl From<&Checkpoint> for PersistedCheckpoint {
    fn from(cp: &Checkpoint) -> Self {
        PersistedCheckpoint {
            thread_id: cp.thread_id.clone(),
            step: cp.step,
            store: PersistedStore::from(&cp.store),
            frontier: encode_nodes(&cp.frontier),
            concurrency_limit: cp.concurrency_limit,
            created_at: cp.created_at.to_rfc3339(),
            ran_nodes: encode_nodes(&cp.ran_nodes),
            skipped_nodes: encode_nodes(&cp.skipped_nodes),
            updated_channels: cp.updated_channels.clone(),
        }
    }
}

impl TryFrom<PersistedCheckpoint> for Checkpoint {
    type Error = PersistenceError;

    fn try_from(p: PersistedCheckpoint) -> Result<Self> {
        let created_at = chrono::DateTime::parse_from_rfc3339(&p.created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Ok(Checkpoint {
            thread_id: p.thread_id,
            step: p.step,
            store: ChannelStore::from(p.store),
            frontier: decode_nodes(&p.frontier),
            concurrency_limit: p.concurrency_limit,
            created_at,
            ran_nodes: decode_nodes(&p.ran_nodes),
            skipped_nodes: decode_nodes(&p.skipped_nodes),
            updated_channels: p.updated_channels,
        })
    }
}
