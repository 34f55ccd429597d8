//! Per-(user, channel) read markers.
//!
//! `advance` only ever moves a marker forward. The SQLite store opens a fresh
//! connection per call on the blocking pool, so pairs never contend on a
//! process-wide lock; per-key atomicity comes from an immediate transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recap_channels::{ChannelId, Position, UserId};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadMarker {
    pub user_id: UserId,
    pub channel_id: ChannelId,
    pub position: Position,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Created,
    Advanced { previous: Position },
    /// The stored marker was already at or past the requested position.
    Stale { current: Position },
}

#[derive(Debug, Error)]
pub enum ReadStateError {
    #[error("read state storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("read state io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("read state worker failed: {0}")]
    Worker(String),

    #[error("stored read marker is corrupt: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait ReadStateStore: Send + Sync {
    async fn get(
        &self,
        user: &UserId,
        channel: &ChannelId,
    ) -> Result<Option<ReadMarker>, ReadStateError>;

    /// Set the marker to `max(current, position)`.
    async fn advance(
        &self,
        user: &UserId,
        channel: &ChannelId,
        position: Position,
    ) -> Result<AdvanceOutcome, ReadStateError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS read_markers (
    user_id         TEXT    NOT NULL,
    channel_id      TEXT    NOT NULL,
    position        TEXT    NOT NULL,
    position_micros INTEGER NOT NULL,
    created_at      TEXT    NOT NULL,
    updated_at      TEXT    NOT NULL,
    PRIMARY KEY (user_id, channel_id)
);
CREATE INDEX IF NOT EXISTS read_markers_updated_at ON read_markers (updated_at);
";

pub struct SqliteReadStateStore {
    path: PathBuf,
}

impl SqliteReadStateStore {
    /// Create the parent directory and schema if needed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, ReadStateError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let store = Self { path };
        store
            .with_connection(|conn| conn.execute_batch(SCHEMA))
            .await?;
        tracing::info!(path = %store.path.display(), "read state store ready");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T, ReadStateError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&path)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| ReadStateError::Worker(e.to_string()))?;
        Ok(result?)
    }
}

fn open_connection(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    Ok(conn)
}

struct MarkerRow {
    position_micros: i64,
    updated_at: String,
}

#[async_trait]
impl ReadStateStore for SqliteReadStateStore {
    async fn get(
        &self,
        user: &UserId,
        channel: &ChannelId,
    ) -> Result<Option<ReadMarker>, ReadStateError> {
        let (user_key, channel_key) = (user.to_string(), channel.to_string());
        let row = self
            .with_connection(move |conn| {
                conn.query_row(
                    "SELECT position_micros, updated_at FROM read_markers
                     WHERE user_id = ?1 AND channel_id = ?2",
                    params![user_key, channel_key],
                    |row| {
                        Ok(MarkerRow {
                            position_micros: row.get(0)?,
                            updated_at: row.get(1)?,
                        })
                    },
                )
                .optional()
            })
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let updated_at = DateTime::parse_from_rfc3339(&row.updated_at)
            .map_err(|e| ReadStateError::Corrupt(format!("updated_at {:?}: {e}", row.updated_at)))?
            .with_timezone(&Utc);
        Ok(Some(ReadMarker {
            user_id: user.clone(),
            channel_id: channel.clone(),
            position: Position::from_micros(row.position_micros),
            updated_at,
        }))
    }

    #[tracing::instrument(level = "debug", skip(self), fields(user_id = %user, channel_id = %channel, position = %position))]
    async fn advance(
        &self,
        user: &UserId,
        channel: &ChannelId,
        position: Position,
    ) -> Result<AdvanceOutcome, ReadStateError> {
        let (user_key, channel_key) = (user.to_string(), channel.to_string());
        let now = Utc::now().to_rfc3339();
        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current: Option<i64> = tx
                .query_row(
                    "SELECT position_micros FROM read_markers WHERE user_id = ?1 AND channel_id = ?2",
                    params![user_key, channel_key],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(current) = current.filter(|current| *current >= position.as_micros()) {
                tx.commit()?;
                return Ok(AdvanceOutcome::Stale {
                    current: Position::from_micros(current),
                });
            }
            tx.execute(
                "INSERT INTO read_markers
                     (user_id, channel_id, position, position_micros, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT (user_id, channel_id) DO UPDATE SET
                     position = excluded.position,
                     position_micros = excluded.position_micros,
                     updated_at = excluded.updated_at
                 WHERE excluded.position_micros > read_markers.position_micros",
                params![
                    user_key,
                    channel_key,
                    position.to_slack_ts(),
                    position.as_micros(),
                    now
                ],
            )?;
            tx.commit()?;
            Ok(match current {
                Some(previous) => AdvanceOutcome::Advanced {
                    previous: Position::from_micros(previous),
                },
                None => AdvanceOutcome::Created,
            })
        })
        .await
    }
}

#[cfg(test)]
pub use memory::MemoryReadStateStore;

#[cfg(test)]
mod memory {
    use super::*;
    use dashmap::DashMap;
    use dashmap::mapref::entry::Entry;

    /// DashMap-backed store with the same monotonic semantics.
    #[derive(Default)]
    pub struct MemoryReadStateStore {
        markers: DashMap<(UserId, ChannelId), ReadMarker>,
    }

    impl MemoryReadStateStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed(&self, user: &UserId, channel: &ChannelId, position: Position) {
            self.markers.insert(
                (user.clone(), channel.clone()),
                ReadMarker {
                    user_id: user.clone(),
                    channel_id: channel.clone(),
                    position,
                    updated_at: Utc::now(),
                },
            );
        }

        pub fn position(&self, user: &UserId, channel: &ChannelId) -> Option<Position> {
            self.markers
                .get(&(user.clone(), channel.clone()))
                .map(|marker| marker.position)
        }
    }

    #[async_trait]
    impl ReadStateStore for MemoryReadStateStore {
        async fn get(
            &self,
            user: &UserId,
            channel: &ChannelId,
        ) -> Result<Option<ReadMarker>, ReadStateError> {
            Ok(self
                .markers
                .get(&(user.clone(), channel.clone()))
                .map(|marker| marker.value().clone()))
        }

        async fn advance(
            &self,
            user: &UserId,
            channel: &ChannelId,
            position: Position,
        ) -> Result<AdvanceOutcome, ReadStateError> {
            match self.markers.entry((user.clone(), channel.clone())) {
                Entry::Occupied(mut entry) => {
                    let current = entry.get().position;
                    if position <= current {
                        return Ok(AdvanceOutcome::Stale { current });
                    }
                    let marker = entry.get_mut();
                    marker.position = position;
                    marker.updated_at = Utc::now();
                    Ok(AdvanceOutcome::Advanced { previous: current })
                }
                Entry::Vacant(entry) => {
                    entry.insert(ReadMarker {
                        user_id: user.clone(),
                        channel_id: channel.clone(),
                        position,
                        updated_at: Utc::now(),
                    });
                    Ok(AdvanceOutcome::Created)
                }
            }
        }
    }
}
