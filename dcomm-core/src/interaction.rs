//! Per-thread interaction state persisted in SQLite.
//!
//! Schema:
//!
//! ```sql
//! interactions(thread_id TEXT PRIMARY KEY, last_received_time INTEGER,
//!              last_sent_time INTEGER, data BLOB)
//! kvstore(key TEXT PRIMARY KEY, value INTEGER)   -- holds last_cleanup_time
//! ```
//!
//! Times are Unix seconds. Read-modify-write of one thread goes through
//! [`InteractionStore::transact`], which runs inside a SQLite transaction.

use std::path::Path;

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::DcommResult;

/// Interactions idle this long on both sides are deleted by cleanup.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

const LAST_CLEANUP_KEY: &str = "last_cleanup_time";

/// Correlation state for one thread.
#[derive(Debug, Clone, PartialEq)]
pub struct Interaction {
    pub thid: String,
    pub last_received: Option<DateTime<Utc>>,
    pub last_sent: Option<DateTime<Utc>>,
    /// Opaque protocol data, typically a machine snapshot plus peer details.
    pub data: Value,
}

impl Interaction {
    pub fn new(thid: impl Into<String>, data: Value) -> Self {
        Self {
            thid: thid.into(),
            last_received: None,
            last_sent: None,
            data,
        }
    }

    /// Most recent activity in either direction.
    pub fn freshness(&self) -> Option<DateTime<Utc>> {
        self.last_received.max(self.last_sent)
    }
}

fn to_secs(t: Option<DateTime<Utc>>) -> Option<i64> {
    t.map(|t| t.timestamp())
}

fn from_secs(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| Utc.timestamp_opt(s, 0).single())
}

fn initialize_schema(conn: &Connection, now: DateTime<Utc>) -> DcommResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS interactions (
           thread_id TEXT PRIMARY KEY,
           last_received_time INTEGER,
           last_sent_time INTEGER,
           data BLOB
         );
         CREATE TABLE IF NOT EXISTS kvstore (
           key TEXT PRIMARY KEY,
           value INTEGER
         );",
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO kvstore (key, value) VALUES (?1, ?2)",
        params![LAST_CLEANUP_KEY, now.timestamp()],
    )?;
    Ok(())
}

fn read_row(conn: &Connection, thid: &str) -> DcommResult<Option<Interaction>> {
    let row = conn
        .query_row(
            "SELECT last_received_time, last_sent_time, data FROM interactions WHERE thread_id = ?1",
            params![thid],
            |row| {
                Ok((
                    row.get::<_, Option<i64>>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<Vec<u8>>>(2)?,
                ))
            },
        )
        .optional()?;
    let Some((received, sent, blob)) = row else {
        return Ok(None);
    };
    let data = match blob {
        Some(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)?,
        _ => Value::Null,
    };
    Ok(Some(Interaction {
        thid: thid.to_string(),
        last_received: from_secs(received),
        last_sent: from_secs(sent),
        data,
    }))
}

fn write_row(conn: &Connection, interaction: &Interaction) -> DcommResult<()> {
    conn.execute(
        "INSERT INTO interactions (thread_id, last_received_time, last_sent_time, data)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(thread_id) DO UPDATE SET
           last_received_time = excluded.last_received_time,
           last_sent_time = excluded.last_sent_time,
           data = excluded.data",
        params![
            interaction.thid,
            to_secs(interaction.last_received),
            to_secs(interaction.last_sent),
            serde_json::to_vec(&interaction.data)?,
        ],
    )?;
    Ok(())
}

/// SQLite-backed interaction store.
pub struct InteractionStore {
    conn: Mutex<Connection>,
    retention: Duration,
    cleanup_interval: Duration,
}

impl InteractionStore {
    /// Open (creating if needed) a store file.
    pub fn open(path: impl AsRef<Path>) -> DcommResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// A private, non-persistent store.
    pub fn open_in_memory() -> DcommResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> DcommResult<Self> {
        initialize_schema(&conn, Utc::now())?;
        Ok(Self {
            conn: Mutex::new(conn),
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
            cleanup_interval: Duration::hours(24),
        })
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn get(&self, thid: &str) -> DcommResult<Option<Interaction>> {
        read_row(&self.conn.lock(), thid)
    }

    pub fn put(&self, interaction: &Interaction) -> DcommResult<()> {
        write_row(&self.conn.lock(), interaction)
    }

    /// Returns whether a row was removed.
    pub fn delete(&self, thid: &str) -> DcommResult<bool> {
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM interactions WHERE thread_id = ?1", params![thid])?;
        Ok(removed > 0)
    }

    pub fn count(&self) -> DcommResult<usize> {
        let n: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM interactions", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Atomic read-modify-write of one thread.
    ///
    /// `f` sees the current interaction (or `None`) and may replace or clear
    /// it. If `f` fails nothing is written. Leaving `None` deletes the row.
    pub fn transact<R>(
        &self,
        thid: &str,
        f: impl FnOnce(&mut Option<Interaction>) -> DcommResult<R>,
    ) -> DcommResult<R> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut current = read_row(&tx, thid)?;
        let existed = current.is_some();

        // Dropping `tx` on the error path rolls back.
        let result = f(&mut current)?;

        match &current {
            Some(interaction) => {
                let mut interaction = interaction.clone();
                interaction.thid = thid.to_string();
                write_row(&tx, &interaction)?;
            }
            None if existed => {
                tx.execute("DELETE FROM interactions WHERE thread_id = ?1", params![thid])?;
            }
            None => {}
        }
        tx.commit()?;
        Ok(result)
    }

    pub fn last_cleanup_time(&self) -> DcommResult<Option<DateTime<Utc>>> {
        let secs: Option<i64> = self
            .conn
            .lock()
            .query_row(
                "SELECT value FROM kvstore WHERE key = ?1",
                params![LAST_CLEANUP_KEY],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(from_secs(secs))
    }

    /// Delete stale interactions if a cleanup is due (or `force`).
    /// Returns how many rows were removed.
    pub fn cleanup(&self, force: bool) -> DcommResult<usize> {
        self.cleanup_at(Utc::now(), force)
    }

    /// [`InteractionStore::cleanup`] against an explicit clock.
    ///
    /// A row goes only when both timestamps are older than the retention
    /// window; a missing timestamp counts as stale, but a row with neither
    /// timestamp set is kept.
    pub fn cleanup_at(&self, now: DateTime<Utc>, force: bool) -> DcommResult<usize> {
        if !force {
            let due = match self.last_cleanup_time()? {
                Some(last) => now - last >= self.cleanup_interval,
                None => true,
            };
            if !due {
                debug!("Interaction cleanup not due");
                return Ok(0);
            }
        }
        let cutoff = (now - self.retention).timestamp();
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM interactions
             WHERE (last_received_time IS NULL OR last_received_time < ?1)
               AND (last_sent_time IS NULL OR last_sent_time < ?1)
               AND NOT (last_received_time IS NULL AND last_sent_time IS NULL)",
            params![cutoff],
        )?;
        conn.execute(
            "INSERT INTO kvstore (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![LAST_CLEANUP_KEY, now.timestamp()],
        )?;
        if removed > 0 {
            info!(removed, "Cleaned up stale interactions");
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for InteractionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractionStore")
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}
