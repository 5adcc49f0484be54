//! Durable outbox of closures submitted while offline.
//!
//! The production store keeps records in a SQLite table (`pending_closures`)
//! under the OS data directory, so queued closures survive restarts and long
//! offline periods. Records are replayed by the sync engine once connectivity
//! returns.
//!
//! The schema evolves additively and is tracked with `PRAGMA user_version`:
//!
//! - version 1: `id, ticket_id, data, timestamp`
//! - version 2: adds `retry_count` (defaults to 0 for version-1 rows)
//!
//! Upgrades never rewrite or drop existing rows.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldops_core::{OutboxId, TicketId};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

pub use crate::types::{ClosurePayload, PendingClosure};

/// Storage operations the closure pipeline needs from the outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persist a new record with a generated id and `retry_count == 0`.
    ///
    /// Returns `Ok(None)` when the device is out of storage quota; the caller
    /// is expected to warn the user. Other storage failures are errors.
    async fn put(
        &self,
        ticket_id: TicketId,
        payload: ClosurePayload,
    ) -> Result<Option<OutboxId>, OutboxError>;

    /// All currently queued records, in no particular order.
    async fn get_all(&self) -> Result<Vec<PendingClosure>, OutboxError>;

    /// Delete a record. Removing an unknown id is not an error.
    async fn remove(&self, id: OutboxId) -> Result<(), OutboxError>;

    /// Persist the replay failure counter of a record.
    async fn set_retry_count(&self, id: OutboxId, retry_count: u32) -> Result<(), OutboxError>;
}

/// Outbox operation error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OutboxError {
    #[error("outbox unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("could not encode outbox payload: {0}")]
    Encode(String),
}

/// Schema steps, applied in order. Index `n` upgrades from version `n` to `n + 1`.
const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS pending_closures (
        id          TEXT PRIMARY KEY,
        ticket_id   TEXT NOT NULL,
        data        TEXT NOT NULL,
        timestamp   TEXT NOT NULL
    )
    "#,
    r#"
    ALTER TABLE pending_closures
    ADD COLUMN retry_count INTEGER NOT NULL DEFAULT 0
    "#,
];

/// Current schema version.
pub const SCHEMA_VERSION: i64 = MIGRATIONS.len() as i64;

/// Where the SQLite outbox lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxLocation {
    /// A database file, created on first use.
    File(PathBuf),
    /// A private in-memory database (tests, ephemeral sessions).
    Memory,
}

/// SQLite-backed outbox.
///
/// This struct is cheap to clone and is safe to share across threads. The
/// database is opened and migrated lazily on first use.
#[derive(Debug, Clone)]
pub struct SqliteOutbox {
    location: OutboxLocation,
    state: Arc<tokio::sync::Mutex<PoolState>>,
}

#[derive(Debug, Default)]
struct PoolState {
    pool: Option<SqlitePool>,
    migrated: bool,
}

impl SqliteOutbox {
    pub fn new(location: OutboxLocation) -> Self {
        Self {
            location,
            state: Arc::new(tokio::sync::Mutex::new(PoolState::default())),
        }
    }

    /// Outbox in the default per-user location: `{data_dir}/fieldops/outbox.db`.
    pub fn open_default() -> anyhow::Result<Self> {
        Ok(Self::new(OutboxLocation::File(default_outbox_path()?)))
    }

    /// Wrap an existing pool. Migrations still run on first use.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            location: OutboxLocation::Memory,
            state: Arc::new(tokio::sync::Mutex::new(PoolState {
                pool: Some(pool),
                migrated: false,
            })),
        }
    }

    /// Open the database and bring its schema up to date.
    async fn ensure_initialized(&self) -> anyhow::Result<SqlitePool> {
        let mut state = self.state.lock().await;

        let pool = match state.pool.as_ref() {
            Some(pool) => pool.clone(),
            None => {
                let pool = self.connect().await?;
                state.pool = Some(pool.clone());
                pool
            }
        };

        if !state.migrated {
            migrate(&pool).await?;
            state.migrated = true;
        }

        Ok(pool)
    }

    async fn connect(&self) -> anyhow::Result<SqlitePool> {
        match &self.location {
            OutboxLocation::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create outbox directory at {:?}", parent)
                    })?;
                }
                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true);
                SqlitePoolOptions::new()
                    .max_connections(4)
                    .connect_with(options)
                    .await
                    .with_context(|| format!("failed to open outbox database at {:?}", path))
            }
            OutboxLocation::Memory => memory_pool()
                .await
                .context("failed to open in-memory outbox database"),
        }
    }

    async fn pool(&self) -> Result<SqlitePool, OutboxError> {
        self.ensure_initialized()
            .await
            .map_err(|err| OutboxError::Unavailable(format!("{err:#}")))
    }
}

/// Single-connection pool over a private in-memory database.
///
/// Each SQLite connection to `:memory:` sees its own database, so the pool must
/// never open a second one or recycle the first.
pub async fn memory_pool() -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
}

/// Apply every migration step above the database's `user_version`.
async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    let current: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await
        .context("failed to read outbox schema version")?;

    if current > SCHEMA_VERSION {
        anyhow::bail!(
            "outbox schema version {current} is newer than supported version {SCHEMA_VERSION}"
        );
    }

    for (step, sql) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let next = step as i64 + 1;
        let mut tx = pool.begin().await.context("failed to begin outbox migration")?;
        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to apply outbox migration to version {next}"))?;
        // PRAGMA does not accept bound parameters.
        sqlx::query(&format!("PRAGMA user_version = {next}"))
            .execute(&mut *tx)
            .await
            .context("failed to record outbox schema version")?;
        tx.commit().await.context("failed to commit outbox migration")?;
        tracing::info!(version = next, "outbox schema upgraded");
    }

    Ok(())
}

#[async_trait]
impl OutboxStore for SqliteOutbox {
    async fn put(
        &self,
        ticket_id: TicketId,
        payload: ClosurePayload,
    ) -> Result<Option<OutboxId>, OutboxError> {
        let pool = self.pool().await?;
        let id = OutboxId::new();
        let data =
            serde_json::to_string(&payload).map_err(|e| OutboxError::Encode(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO pending_closures (id, ticket_id, data, timestamp, retry_count)
            VALUES (?1, ?2, ?3, ?4, 0)
            "#,
        )
        .bind(id.to_string())
        .bind(ticket_id.to_string())
        .bind(data)
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await;

        match result {
            Ok(_) => {
                tracing::debug!(%id, %ticket_id, "closure queued in outbox");
                Ok(Some(id))
            }
            Err(err) if is_quota_exceeded(&err) => {
                tracing::error!(%ticket_id, "outbox storage quota exceeded: {err}");
                Ok(None)
            }
            Err(err) => Err(OutboxError::Storage(err.to_string())),
        }
    }

    async fn get_all(&self) -> Result<Vec<PendingClosure>, OutboxError> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            r#"
            SELECT id, ticket_id, data, timestamp, retry_count
            FROM pending_closures
            "#,
        )
        .fetch_all(&pool)
        .await
        .map_err(|e| OutboxError::Storage(e.to_string()))?;

        let mut closures = Vec::with_capacity(rows.len());
        for row in rows {
            // One unreadable record must not block the rest of the queue.
            match row_to_closure(&row) {
                Ok(closure) => closures.push(closure),
                Err(err) => tracing::error!("skipping unreadable outbox record: {err:#}"),
            }
        }
        Ok(closures)
    }

    async fn remove(&self, id: OutboxId) -> Result<(), OutboxError> {
        let pool = self.pool().await?;
        sqlx::query("DELETE FROM pending_closures WHERE id = ?1")
            .bind(id.to_string())
            .execute(&pool)
            .await
            .map_err(|e| OutboxError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn set_retry_count(&self, id: OutboxId, retry_count: u32) -> Result<(), OutboxError> {
        let pool = self.pool().await?;
        sqlx::query("UPDATE pending_closures SET retry_count = ?2 WHERE id = ?1")
            .bind(id.to_string())
            .bind(i64::from(retry_count))
            .execute(&pool)
            .await
            .map_err(|e| OutboxError::Storage(e.to_string()))?;
        Ok(())
    }
}

/// SQLITE_FULL: the database or the disk holding it is out of space.
fn is_quota_exceeded(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("13") || db.message().contains("database or disk is full")
        }
        _ => false,
    }
}

/// Map a database row into a `PendingClosure`.
fn row_to_closure(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<PendingClosure> {
    let id_str: String = row.try_get("id")?;
    let id = Uuid::parse_str(&id_str)
        .map(OutboxId::from_uuid)
        .context("invalid UUID in pending_closures.id")?;

    let ticket_str: String = row.try_get("ticket_id")?;
    let ticket_id = ticket_str
        .parse::<TicketId>()
        .context("invalid ticket_id in pending_closures")?;

    let data: String = row.try_get("data")?;
    let payload: ClosurePayload =
        serde_json::from_str(&data).context("invalid JSON payload in pending_closures")?;

    let timestamp_str: String = row.try_get("timestamp")?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp_str)
        .map(|dt| dt.with_timezone(&Utc))
        .context("invalid timestamp in pending_closures")?;

    let retry_count: i64 = row.try_get("retry_count")?;
    let retry_count = u32::try_from(retry_count).context("negative retry_count in pending_closures")?;

    Ok(PendingClosure {
        id,
        ticket_id,
        payload,
        timestamp,
        retry_count,
    })
}

/// Resolve the path of the outbox database: `{app_data_dir}/fieldops/outbox.db`.
pub fn default_outbox_path() -> anyhow::Result<PathBuf> {
    let base = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut h| {
                h.push(".local");
                h.push("share");
                h
            })
        })
        .context("failed to resolve OS app data directory - tried data_dir() and home_dir()/.local/share")?;

    let mut path = base;
    path.push("fieldops");
    path.push("outbox.db");
    Ok(path)
}

/// In-memory outbox for tests/dev.
///
/// An optional capacity simulates a device running out of storage quota.
#[derive(Debug, Default)]
pub struct InMemoryOutbox {
    records: RwLock<HashMap<OutboxId, PendingClosure>>,
    capacity: Option<usize>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            capacity: Some(capacity),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert a fully-formed record (e.g. one left over from a previous session).
    pub fn insert(&self, closure: PendingClosure) {
        self.write().insert(closure.id, closure);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<OutboxId, PendingClosure>> {
        self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<OutboxId, PendingClosure>> {
        self.records.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn put(
        &self,
        ticket_id: TicketId,
        payload: ClosurePayload,
    ) -> Result<Option<OutboxId>, OutboxError> {
        let mut records = self.write();
        if self.capacity.is_some_and(|cap| records.len() >= cap) {
            return Ok(None);
        }
        let id = OutboxId::new();
        records.insert(
            id,
            PendingClosure {
                id,
                ticket_id,
                payload,
                timestamp: Utc::now(),
                retry_count: 0,
            },
        );
        Ok(Some(id))
    }

    async fn get_all(&self) -> Result<Vec<PendingClosure>, OutboxError> {
        Ok(self.read().values().cloned().collect())
    }

    async fn remove(&self, id: OutboxId) -> Result<(), OutboxError> {
        self.write().remove(&id);
        Ok(())
    }

    async fn set_retry_count(&self, id: OutboxId, retry_count: u32) -> Result<(), OutboxError> {
        if let Some(record) = self.write().get_mut(&id) {
            record.retry_count = retry_count;
        }
        Ok(())
    }
}
