//! Swarmpost Storage -- rusqlite persistence for the client core.
//!
//! Holds swarm membership, received-message dedup records, per-namespace
//! poll cursors, and the lookup records destination routing needs.
//! WAL mode + busy_timeout so a UI process can share the file.
//!
//! Row types are plain data; the client converts to and from protocol types.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: u32, found: u32 },
    #[error("lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StorageError>;

const SCHEMA_VERSION: u32 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS swarm_node (
    swarm_key       TEXT NOT NULL,
    ip              TEXT NOT NULL,
    port            INTEGER NOT NULL,
    ed25519_pubkey  TEXT NOT NULL,
    x25519_pubkey   TEXT NOT NULL,
    PRIMARY KEY (swarm_key, ip, port, ed25519_pubkey)
);

CREATE TABLE IF NOT EXISTS received_message_info (
    swarm_key       TEXT NOT NULL,
    namespace       INTEGER NOT NULL,
    hash            TEXT NOT NULL,
    expiration_ms   INTEGER NOT NULL,
    received_at     TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (swarm_key, namespace, hash)
);
CREATE INDEX IF NOT EXISTS idx_received_expiration
    ON received_message_info (expiration_ms);

CREATE TABLE IF NOT EXISTS poll_cursor (
    swarm_key       TEXT NOT NULL,
    namespace       INTEGER NOT NULL,
    last_hash       TEXT NOT NULL,
    updated_at      TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (swarm_key, namespace)
);

CREATE TABLE IF NOT EXISTS blinded_id_lookup (
    blinded_id          TEXT PRIMARY KEY,
    session_id          TEXT,
    server              TEXT NOT NULL,
    server_public_key   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS open_group (
    server              TEXT NOT NULL,
    room                TEXT NOT NULL,
    public_key          TEXT NOT NULL,
    sequence_number     INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (server, room)
);

INSERT INTO schema_version (version) VALUES (1);
";

/// Row types.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRow {
    pub ip: String,
    pub port: u16,
    pub ed25519_pubkey: String,
    pub x25519_pubkey: String,
}

/// A message hash seen on one namespace of a swarm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedMessageRow {
    pub namespace: i32,
    pub hash: String,
    /// Expiry, ms since epoch. The record may be pruned after this.
    pub expiration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorUpdate {
    pub namespace: i32,
    pub last_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindedIdLookupRow {
    pub blinded_id: String,
    /// Unblinded account id, once known.
    pub session_id: Option<String>,
    pub server: String,
    pub server_public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenGroupRow {
    pub server: String,
    pub room: String,
    pub public_key: String,
    /// Highest message sequence number processed.
    pub sequence_number: i64,
}

/// Storage trait for the client core. No internal retry: failures propagate.
pub trait Storage: Send + Sync {
    // Swarms
    fn read_swarm(&self, swarm_key: &str) -> Result<Vec<NodeRow>>;
    /// Replace the stored swarm wholesale.
    fn write_swarm(&self, swarm_key: &str, nodes: &[NodeRow]) -> Result<()>;
    fn delete_swarm_node(&self, swarm_key: &str, node: &NodeRow) -> Result<bool>;
    fn delete_swarm(&self, swarm_key: &str) -> Result<()>;
    /// Forget every stored swarm (network environment change).
    fn clear_swarms(&self) -> Result<()>;

    // Dedup records and cursors
    /// The subset of `hashes` with no dedup record, in input order.
    fn filter_unseen(&self, swarm_key: &str, namespace: i32, hashes: &[String])
        -> Result<Vec<String>>;
    fn read_cursor(&self, swarm_key: &str, namespace: i32) -> Result<Option<String>>;
    /// Record a finished poll cycle: dedup records and cursor moves land
    /// together or not at all.
    fn commit_poll_cycle(
        &self,
        swarm_key: &str,
        received: &[ReceivedMessageRow],
        cursors: &[CursorUpdate],
    ) -> Result<()>;
    /// Delete dedup records expired at `now_ms`. Returns how many went.
    fn prune_expired_messages(&self, now_ms: i64) -> Result<usize>;

    // Routing lookups
    fn read_blinded_lookup(&self, blinded_id: &str) -> Result<Option<BlindedIdLookupRow>>;
    fn write_blinded_lookup(&self, row: &BlindedIdLookupRow) -> Result<()>;
    fn read_open_group(&self, server: &str, room: &str) -> Result<Option<OpenGroupRow>>;
    fn write_open_group(&self, row: &OpenGroupRow) -> Result<()>;
    fn update_open_group_sequence(&self, server: &str, room: &str, seqno: i64) -> Result<bool>;
}

/// SQLite-backed storage.
/// Connection wrapped in Mutex for Send + Sync (rusqlite Connection is !Sync).
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl SqliteStorage {
    fn db(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Open (or create) the database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        let storage = Self {
            conn: Mutex::new(conn),
            db_path: Some(db_path.to_path_buf()),
        };
        storage.ensure_schema()?;
        Ok(storage)
    }

    /// Private in-memory database (tests, throwaway CLI runs).
    pub fn open_in_memory() -> Result<Self> {
        let storage = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            db_path: None,
        };
        storage.ensure_schema()?;
        Ok(storage)
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.db()?;
        let table_exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get(0),
        )?;

        if !table_exists {
            conn.execute_batch(SCHEMA_V1)?;
            tracing::info!(version = SCHEMA_VERSION, "storage: schema created");
            return Ok(());
        }

        let version: u32 = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?
            .unwrap_or(0);

        if version != SCHEMA_VERSION {
            return Err(StorageError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                found: version,
            });
        }
        Ok(())
    }
}

impl Storage for SqliteStorage {
    fn read_swarm(&self, swarm_key: &str) -> Result<Vec<NodeRow>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT ip, port, ed25519_pubkey, x25519_pubkey
             FROM swarm_node WHERE swarm_key = ?1
             ORDER BY ip, port",
        )?;
        let rows = stmt
            .query_map(params![swarm_key], |row| {
                Ok(NodeRow {
                    ip: row.get(0)?,
                    port: row.get(1)?,
                    ed25519_pubkey: row.get(2)?,
                    x25519_pubkey: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn write_swarm(&self, swarm_key: &str, nodes: &[NodeRow]) -> Result<()> {
        let mut conn = self.db()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM swarm_node WHERE swarm_key = ?1", params![swarm_key])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO swarm_node (swarm_key, ip, port, ed25519_pubkey, x25519_pubkey)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for node in nodes {
                stmt.execute(params![
                    swarm_key,
                    node.ip,
                    node.port,
                    node.ed25519_pubkey,
                    node.x25519_pubkey
                ])?;
            }
        }
        tx.commit()?;
        tracing::debug!(swarm = swarm_key, nodes = nodes.len(), "storage: swarm written");
        Ok(())
    }

    fn delete_swarm_node(&self, swarm_key: &str, node: &NodeRow) -> Result<bool> {
        let conn = self.db()?;
        let changes = conn.execute(
            "DELETE FROM swarm_node
             WHERE swarm_key = ?1 AND ip = ?2 AND port = ?3 AND ed25519_pubkey = ?4",
            params![swarm_key, node.ip, node.port, node.ed25519_pubkey],
        )?;
        Ok(changes > 0)
    }

    fn delete_swarm(&self, swarm_key: &str) -> Result<()> {
        let conn = self.db()?;
        conn.execute("DELETE FROM swarm_node WHERE swarm_key = ?1", params![swarm_key])?;
        Ok(())
    }

    fn clear_swarms(&self) -> Result<()> {
        let conn = self.db()?;
        let removed = conn.execute("DELETE FROM swarm_node", [])?;
        tracing::info!(removed, "storage: all swarms cleared");
        Ok(())
    }

    fn filter_unseen(
        &self,
        swarm_key: &str,
        namespace: i32,
        hashes: &[String],
    ) -> Result<Vec<String>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT COUNT(*) > 0 FROM received_message_info
             WHERE swarm_key = ?1 AND namespace = ?2 AND hash = ?3",
        )?;
        let mut unseen = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let seen: bool = stmt.query_row(params![swarm_key, namespace, hash], |row| row.get(0))?;
            if !seen {
                unseen.push(hash.clone());
            }
        }
        Ok(unseen)
    }

    fn read_cursor(&self, swarm_key: &str, namespace: i32) -> Result<Option<String>> {
        let conn = self.db()?;
        let result = conn
            .query_row(
                "SELECT last_hash FROM poll_cursor WHERE swarm_key = ?1 AND namespace = ?2",
                params![swarm_key, namespace],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(result)
    }

    fn commit_poll_cycle(
        &self,
        swarm_key: &str,
        received: &[ReceivedMessageRow],
        cursors: &[CursorUpdate],
    ) -> Result<()> {
        let mut conn = self.db()?;
        let tx = conn.transaction()?;
        {
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO received_message_info (swarm_key, namespace, hash, expiration_ms)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for row in received {
                insert.execute(params![swarm_key, row.namespace, row.hash, row.expiration_ms])?;
            }

            let mut upsert = tx.prepare(
                "INSERT INTO poll_cursor (swarm_key, namespace, last_hash, updated_at)
                 VALUES (?1, ?2, ?3, datetime('now'))
                 ON CONFLICT(swarm_key, namespace) DO UPDATE SET
                   last_hash = excluded.last_hash,
                   updated_at = datetime('now')",
            )?;
            for cursor in cursors {
                upsert.execute(params![swarm_key, cursor.namespace, cursor.last_hash])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn prune_expired_messages(&self, now_ms: i64) -> Result<usize> {
        let conn = self.db()?;
        let removed = conn.execute(
            "DELETE FROM received_message_info WHERE expiration_ms <= ?1",
            params![now_ms],
        )?;
        if removed > 0 {
            tracing::debug!(removed, "storage: pruned expired dedup records");
        }
        Ok(removed)
    }

    fn read_blinded_lookup(&self, blinded_id: &str) -> Result<Option<BlindedIdLookupRow>> {
        let conn = self.db()?;
        let result = conn
            .query_row(
                "SELECT blinded_id, session_id, server, server_public_key
                 FROM blinded_id_lookup WHERE blinded_id = ?1",
                params![blinded_id],
                |row| {
                    Ok(BlindedIdLookupRow {
                        blinded_id: row.get(0)?,
                        session_id: row.get(1)?,
                        server: row.get(2)?,
                        server_public_key: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    fn write_blinded_lookup(&self, row: &BlindedIdLookupRow) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO blinded_id_lookup (blinded_id, session_id, server, server_public_key)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(blinded_id) DO UPDATE SET
               session_id = excluded.session_id,
               server = excluded.server,
               server_public_key = excluded.server_public_key",
            params![row.blinded_id, row.session_id, row.server, row.server_public_key],
        )?;
        Ok(())
    }

    fn read_open_group(&self, server: &str, room: &str) -> Result<Option<OpenGroupRow>> {
        let conn = self.db()?;
        let result = conn
            .query_row(
                "SELECT server, room, public_key, sequence_number
                 FROM open_group WHERE server = ?1 AND room = ?2",
                params![server, room],
                |row| {
                    Ok(OpenGroupRow {
                        server: row.get(0)?,
                        room: row.get(1)?,
                        public_key: row.get(2)?,
                        sequence_number: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    fn write_open_group(&self, row: &OpenGroupRow) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO open_group (server, room, public_key, sequence_number)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(server, room) DO UPDATE SET
               public_key = excluded.public_key,
               sequence_number = excluded.sequence_number",
            params![row.server, row.room, row.public_key, row.sequence_number],
        )?;
        Ok(())
    }

    fn update_open_group_sequence(&self, server: &str, room: &str, seqno: i64) -> Result<bool> {
        let conn = self.db()?;
        // Never move the cursor backwards.
        let changes = conn.execute(
            "UPDATE open_group SET sequence_number = ?3
             WHERE server = ?1 AND room = ?2 AND sequence_number < ?3",
            params![server, room, seqno],
        )?;
        Ok(changes > 0)
    }
}
