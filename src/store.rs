// Persistent store for the last known set of connected clients
// SQLite-backed; blocking calls run on tokio's blocking pool

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, Row};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::ClientRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("store connection lock poisoned")]
    Poisoned,
}

/// Read/replace contract the reconciler relies on.
#[async_trait]
pub trait ClientStore: Send + Sync {
    /// All persisted clients with `connected = true`, ordered by identifier.
    async fn fetch_connected(&self) -> Result<Vec<ClientRecord>, StoreError>;

    /// Drop every connected row and insert `snapshot` in one transaction.
    /// Readers see either the old set or the new set, never a mix.
    async fn replace_connected(&self, snapshot: HashMap<u32, ClientRecord>) -> Result<(), StoreError>;
}

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS client_record (
        client_identifier INTEGER NOT NULL,
        status_count INTEGER,
        is_connected BOOLEAN NOT NULL,
        client_host TEXT NOT NULL,
        client_port INTEGER NOT NULL,
        connection_time INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER)),
        PRIMARY KEY (client_identifier, is_connected)
    );
";

fn ensure_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

fn client_from_row(row: &Row<'_>) -> rusqlite::Result<ClientRecord> {
    let host: String = row.get(3)?;
    Ok(ClientRecord {
        identifier: row.get(0)?,
        status_count: row.get::<_, Option<u32>>(1)?.unwrap_or(0),
        connected: row.get(2)?,
        host: host.trim().to_string(),
        port: row.get(4)?,
        last_seen_at: row.get(5)?,
    })
}

/// Errors confined to a single row's values, as opposed to the backend failing.
fn is_row_conversion_error(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::IntegralValueOutOfRange(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::FromSqlConversionFailure(..)
    )
}

/// Rows whose values do not fit a `ClientRecord` (negative identifier, port above
/// 65535, ...) are skipped with a warning; the next replace clears them.
fn select_connected(conn: &Connection) -> Result<Vec<ClientRecord>, StoreError> {
    ensure_schema(conn)?;
    let mut stmt = conn.prepare(
        "SELECT client_identifier, status_count, is_connected, client_host, client_port, connection_time
         FROM client_record
         WHERE is_connected = ?1
         ORDER BY client_identifier",
    )?;
    let rows = stmt.query_map(params![true], |row| {
        let raw_identifier = row.get::<_, i64>(0).ok();
        Ok((raw_identifier, client_from_row(row)))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (raw_identifier, record) = row?;
        match record {
            Ok(record) => records.push(record),
            Err(e) if is_row_conversion_error(&e) => {
                warn!(?raw_identifier, "skipping unreadable client_record row: {}", e);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(records)
}

/// Clear-then-insert inside one transaction. Any failure rolls the whole
/// thing back when `tx` is dropped uncommitted.
fn replace_rows(conn: &mut Connection, records: &[ClientRecord]) -> Result<usize, StoreError> {
    ensure_schema(conn)?;
    let tx = conn.transaction()?;
    let removed = tx.execute("DELETE FROM client_record", [])?;
    {
        let mut insert = tx.prepare(
            "INSERT INTO client_record (client_identifier, is_connected, client_host, client_port, status_count)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for record in records {
            insert.execute(params![
                record.identifier,
                true,
                record.host,
                record.port,
                record.status_count
            ])?;
        }
    }
    tx.commit()?;
    debug!(removed, inserted = records.len(), "client_record replaced");
    Ok(records.len())
}

/// SQLite implementation of [`ClientStore`]
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file and make sure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        info!("client store opened at {}", path.display());
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        ensure_schema(&conn)?;
        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await?
    }

    #[cfg(test)]
    pub(crate) async fn execute_batch(&self, sql: &'static str) -> Result<(), StoreError> {
        self.with_conn(move |conn| conn.execute_batch(sql).map_err(StoreError::from)).await
    }
}

#[async_trait]
impl ClientStore for SqliteStore {
    async fn fetch_connected(&self) -> Result<Vec<ClientRecord>, StoreError> {
        self.with_conn(|conn| select_connected(conn)).await
    }

    async fn replace_connected(&self, snapshot: HashMap<u32, ClientRecord>) -> Result<(), StoreError> {
        let mut records: Vec<ClientRecord> = snapshot.into_values().collect();
        records.sort_by_key(|r| r.identifier);
        self.with_conn(move |conn| replace_rows(conn, &records).map(|_| ())).await
    }
}
