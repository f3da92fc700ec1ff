/*!
SQLite-backed [`Checkpointer`].

## Behavior

- One row per `(thread, step)` in `checkpoints`, written with
  `INSERT OR REPLACE` inside a transaction so re-saving a step is
  idempotent.
- A denormalized `threads` table tracks each thread's `last_step`, which
  is how `get_latest` finds the newest row without scanning history.
- A put at step S deletes rows with step > S for that thread, keeping a
  single timeline after a time-travel resume.
- Payloads go through the serde models in `runtimes::persistence`;
  node ids are stored as their `NodeId::encode` strings.
- With the `sqlite-migrations` feature (default), embedded migrations
  (`sqlx::migrate!("./migrations")`) run on connect; without it, schema
  setup is the operator's responsibility.

## Schema mapping

- `threads.id` ← `checkpoint.thread_id`
- `threads.last_step` ← highest persisted step
- `checkpoints.store_json` ← serialized channel store
- `checkpoints.frontier_json` ← JSON array of encoded node ids
- `checkpoints.ran_nodes_json` / `skipped_nodes_json` ← execution metadata
- `checkpoints.updated_channels_json` ← JSON array of channel keys
*/

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tracing::instrument;

use crate::runtimes::checkpointer::{Checkpoint, Checkpointer, CheckpointerError, Result};
use crate::runtimes::persistence::PersistedStore;
use crate::state::ChannelStore;
use crate::types::NodeId;

use super::checkpointer_sqlite_helpers::{deserialize_json, serialize_json};

/// Durable checkpoint storage over a SQLite file.
///
/// Storage grows with `(threads × steps_per_thread × store_size)`; retire
/// finished threads by deleting their `threads` row (checkpoint rows
/// cascade).
pub struct SQLiteCheckpointer {
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for SQLiteCheckpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SQLiteCheckpointer").finish()
    }
}

impl SQLiteCheckpointer {
    /// Connect to (or create) a SQLite database at `database_url`, for
    /// example `sqlite://stategraph.db`.
    #[must_use = "checkpointer must be used to persist state"]
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> std::result::Result<Self, CheckpointerError> {
        let pool =
            SqlitePool::connect(database_url)
                .await
                .map_err(|e| CheckpointerError::Backend {
                    message: format!("connect error: {e}"),
                })?;
        #[cfg(feature = "sqlite-migrations")]
        {
            if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
                return Err(CheckpointerError::Backend {
                    message: format!("migration failure: {e}"),
                });
            }
        }
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

fn encode_ids(ids: &[NodeId]) -> Vec<String> {
    ids.iter().map(NodeId::encode).collect()
}

fn decode_ids(encoded: Vec<String>) -> Vec<NodeId> {
    encoded.iter().map(|s| NodeId::decode(s)).collect()
}

fn row_to_checkpoint(thread_id: &str, row: &SqliteRow) -> Result<Checkpoint> {
    let step: i64 = row.get("step");
    let store_json: String = row.get("store_json");
    let frontier_json: String = row.get("frontier_json");
    let ran_nodes_json: String = row.get("ran_nodes_json");
    let skipped_nodes_json: String = row.get("skipped_nodes_json");
    let updated_channels_json: String = row.get("updated_channels_json");
    let concurrency_limit: i64 = row.get("concurrency_limit");
    let created_at_str: String = row.get("created_at");

    let store: PersistedStore = deserialize_json(&store_json, "store")?;
    let frontier: Vec<String> = deserialize_json(&frontier_json, "frontier")?;
    let ran_nodes: Vec<String> = deserialize_json(&ran_nodes_json, "ran_nodes")?;
    let skipped_nodes: Vec<String> = deserialize_json(&skipped_nodes_json, "skipped_nodes")?;
    let updated_channels: Vec<String> =
        deserialize_json(&updated_channels_json, "updated_channels")?;

    let created_at = DateTime::parse_from_rfc3339(&created_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(Checkpoint {
        thread_id: thread_id.to_string(),
        step: step as u64,
        store: ChannelStore::from(store),
        frontier: decode_ids(frontier),
        concurrency_limit: concurrency_limit as usize,
        created_at,
        ran_nodes: decode_ids(ran_nodes),
        skipped_nodes: decode_ids(skipped_nodes),
        updated_channels,
    })
}

#[async_trait::async_trait]
impl Checkpointer for SQLiteCheckpointer {
    #[instrument(skip(self, checkpoint), err)]
    async fn put(&self, checkpoint: Checkpoint) -> Result<()> {
        let store_json = serialize_json(&PersistedStore::from(&checkpoint.store), "store")?;
        let frontier_json = serialize_json(&encode_ids(&checkpoint.frontier), "frontier")?;
        let ran_nodes_json = serialize_json(&encode_ids(&checkpoint.ran_nodes), "ran_nodes")?;
        let skipped_nodes_json =
            serialize_json(&encode_ids(&checkpoint.skipped_nodes), "skipped_nodes")?;
        let updated_channels_json =
            serialize_json(&checkpoint.updated_channels, "updated_channels")?;
        let created_at = checkpoint.created_at.to_rfc3339();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CheckpointerError::Backend {
                message: format!("tx begin: {e}"),
            })?;

        sqlx::query(
            r#"
            INSERT INTO threads (id, concurrency_limit, last_step, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                concurrency_limit = excluded.concurrency_limit,
                last_step = excluded.last_step,
                updated_at = excluded.updated_at
        "#,
        )
        .bind(&checkpoint.thread_id)
        .bind(checkpoint.concurrency_limit as i64)
        .bind(checkpoint.step as i64)
        .bind(&created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| CheckpointerError::Backend {
            message: format!("upsert thread: {e}"),
        })?;

        // Single-timeline rule: anything beyond this step is a stale future.
        sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?1 AND step > ?2")
            .bind(&checkpoint.thread_id)
            .bind(checkpoint.step as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| CheckpointerError::Backend {
                message: format!("truncate future steps: {e}"),
            })?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO checkpoints (
                thread_id,
                step,
                store_json,
                frontier_json,
                ran_nodes_json,
                skipped_nodes_json,
                updated_channels_json,
                concurrency_limit,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        )
        .bind(&checkpoint.thread_id)
        .bind(checkpoint.step as i64)
        .bind(&store_json)
        .bind(&frontier_json)
        .bind(&ran_nodes_json)
        .bind(&skipped_nodes_json)
        .bind(&updated_channels_json)
        .bind(checkpoint.concurrency_limit as i64)
        .bind(&created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| CheckpointerError::Backend {
            message: format!("insert checkpoint: {e}"),
        })?;

        tx.commit().await.map_err(|e| CheckpointerError::Backend {
            message: format!("tx commit: {e}"),
        })?;

        Ok(())
    }

    #[instrument(skip(self, thread_id), err)]
    async fn get_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let last_step: Option<i64> =
            sqlx::query_scalar("SELECT last_step FROM threads WHERE id = ?1")
                .bind(thread_id)
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| CheckpointerError::Backend {
                    message: format!("select latest step: {e}"),
                })?;

        match last_step {
            Some(step) => self.get(thread_id, step as u64).await,
            None => Ok(None),
        }
    }

    #[instrument(skip(self, thread_id), err)]
    async fn get(&self, thread_id: &str, step: u64) -> Result<Option<Checkpoint>> {
        let row_opt: Option<SqliteRow> = sqlx::query(
            r#"
            SELECT step, store_json, frontier_json, ran_nodes_json,
                   skipped_nodes_json, updated_channels_json,
                   concurrency_limit, created_at
            FROM checkpoints
            WHERE thread_id = ?1 AND step = ?2
            "#,
        )
        .bind(thread_id)
        .bind(step as i64)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| CheckpointerError::Backend {
            message: format!("select checkpoint: {e}"),
        })?;

        row_opt
            .map(|row| row_to_checkpoint(thread_id, &row))
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_threads(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM threads
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| CheckpointerError::Backend {
            message: format!("list threads: {e}"),
        })?;

        Ok(rows.into_iter().map(|r| r.get::<String, _>("id")).collect())
    }

    #[instrument(skip(self, thread_id), err)]
    async fn list_steps(&self, thread_id: &str) -> Result<Vec<u64>> {
        let rows = sqlx::query(
            r#"
            SELECT step FROM checkpoints
            WHERE thread_id = ?1
            ORDER BY step ASC
            "#,
        )
        .bind(thread_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| CheckpointerError::Backend {
            message: format!("list steps: {e}"),
        })?;

        Ok(rows
            .into_iter()
            .map(|r| r.get::<i64, _>("step") as u64)
            .collect())
    }
}
