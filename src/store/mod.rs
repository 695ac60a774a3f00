pub mod migrations;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, params};

/// Special database path selecting an in-memory database.
pub const MEMORY_DB: &str = ":memory:";

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Disk(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("schema integrity: missing table {0}")]
    MissingTable(&'static str),

    #[error(
        "bundle hash collision: {bundle_hash} already bound to \
         {existing_service}@{existing_version}"
    )]
    HashCollision {
        bundle_hash: String,
        existing_service: String,
        existing_version: String,
    },
}

#[derive(Debug, Clone)]
pub struct ChatConfigRecord {
    pub chat_id: String,
    pub config_id: String,
    pub config_json: String,
    pub config_hash: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceBundle {
    pub bundle_hash: String,
    pub service_id: String,
    pub version: String,
    pub data_url: String,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct StoreStats {
    pub chats: i64,
    pub snapshots: i64,
    pub bundles: i64,
    pub tracked_messages: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedMessage {
    pub platform: String,
    pub chat_id: String,
    pub message_id: String,
    pub delete_at: i64,
}

/// SQLite-backed persistence shared by the builder, dispatcher, and reaper.
/// One connection in WAL mode behind a mutex; contention is one statement
/// per event.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and bring the schema up to
    /// date. `":memory:"` opens a private in-memory database.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = if path == MEMORY_DB {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Connection::open(path)?
        };

        // WAL is a no-op on in-memory databases; ignore the reported mode.
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        migrations::run(&conn)?;

        // Every table the migrations promise must exist before anyone reads.
        for table in ["migrations", "chat_configs", "snapshots", "service_bundles", "tracked_messages"] {
            if !migrations::table_exists(&conn, table) {
                return Err(StoreError::MissingTable(table));
            }
        }

        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Chat configs ────────────────────────────────────────────────

    pub fn set_chat_config(
        &self,
        chat_id: &str,
        config_id: &str,
        config_json: &str,
        config_hash: &str,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO chat_configs (chat_id, config_id, config_json, config_hash, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(chat_id) DO UPDATE SET
                 config_id = excluded.config_id,
                 config_json = excluded.config_json,
                 config_hash = excluded.config_hash,
                 updated_at = excluded.updated_at",
            params![chat_id, config_id, config_json, config_hash, now_ms()],
        )?;
        Ok(())
    }

    pub fn get_chat_config(&self, chat_id: &str) -> Result<Option<ChatConfigRecord>, StoreError> {
        let record = self
            .conn()
            .query_row(
                "SELECT chat_id, config_id, config_json, config_hash, updated_at
                 FROM chat_configs WHERE chat_id = ?1",
                [chat_id],
                |row| {
                    Ok(ChatConfigRecord {
                        chat_id: row.get(0)?,
                        config_id: row.get(1)?,
                        config_json: row.get(2)?,
                        config_hash: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_chat_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT chat_id FROM chat_configs ORDER BY chat_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Returns whether a row was removed. Snapshots stay: they are a cache
    /// keyed by configuration hash and other chats may share them.
    pub fn delete_chat_config(&self, chat_id: &str) -> Result<bool, StoreError> {
        let removed = self
            .conn()
            .execute("DELETE FROM chat_configs WHERE chat_id = ?1", [chat_id])?;
        Ok(removed > 0)
    }

    /// Distinct configuration hashes currently assigned to any chat.
    pub fn list_config_hashes(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT DISTINCT config_hash FROM chat_configs")?;
        let hashes = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(hashes)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn();
        let count = |table: &str| -> Result<i64, rusqlite::Error> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
        };
        Ok(StoreStats {
            chats: count("chat_configs")?,
            snapshots: count("snapshots")?,
            bundles: count("service_bundles")?,
            tracked_messages: count("tracked_messages")?,
        })
    }

    // ── Snapshots ───────────────────────────────────────────────────

    pub fn save_snapshot(&self, config_hash: &str, snapshot_json: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO snapshots (config_hash, snapshot_json, updated_at)
             VALUES (?1, ?2, ?3)",
            params![config_hash, snapshot_json, now_ms()],
        )?;
        Ok(())
    }

    pub fn load_snapshot(&self, config_hash: &str) -> Result<Option<String>, StoreError> {
        let json = self
            .conn()
            .query_row(
                "SELECT snapshot_json FROM snapshots WHERE config_hash = ?1",
                [config_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json)
    }

    /// Deleting an unknown hash is a no-op success.
    pub fn delete_snapshot(&self, config_hash: &str) -> Result<(), StoreError> {
        self.conn()
            .execute("DELETE FROM snapshots WHERE config_hash = ?1", [config_hash])?;
        Ok(())
    }

    pub fn list_snapshots(&self) -> Result<Vec<(String, String)>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT config_hash, snapshot_json FROM snapshots")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<(String, String)>, _>>()?;
        Ok(rows)
    }

    // ── Service bundles ─────────────────────────────────────────────

    /// Idempotent on `bundle_hash`. A second save with the same hash but a
    /// different service identity is a hash collision and fatal.
    pub fn save_service_bundle(&self, bundle: &ServiceBundle) -> Result<(), StoreError> {
        let conn = self.conn();
        let existing = conn
            .query_row(
                "SELECT service_id, version FROM service_bundles WHERE bundle_hash = ?1",
                [&bundle.bundle_hash],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        if let Some((service_id, version)) = existing {
            if service_id != bundle.service_id || version != bundle.version {
                return Err(StoreError::HashCollision {
                    bundle_hash: bundle.bundle_hash.clone(),
                    existing_service: service_id,
                    existing_version: version,
                });
            }
            return Ok(());
        }

        conn.execute(
            "INSERT INTO service_bundles (bundle_hash, service_id, version, data_url, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                bundle.bundle_hash,
                bundle.service_id,
                bundle.version,
                bundle.data_url,
                now_ms()
            ],
        )?;
        Ok(())
    }

    pub fn get_service_bundle(&self, bundle_hash: &str) -> Result<Option<ServiceBundle>, StoreError> {
        let bundle = self
            .conn()
            .query_row(
                "SELECT bundle_hash, service_id, version, data_url
                 FROM service_bundles WHERE bundle_hash = ?1",
                [bundle_hash],
                |row| {
                    Ok(ServiceBundle {
                        bundle_hash: row.get(0)?,
                        service_id: row.get(1)?,
                        version: row.get(2)?,
                        data_url: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(bundle)
    }

    pub fn list_all_bundle_hashes(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT bundle_hash FROM service_bundles")?;
        let hashes = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(hashes)
    }

    pub fn delete_bundles(&self, hashes: &[String]) -> Result<usize, StoreError> {
        let conn = self.conn();
        let mut deleted = 0;
        for hash in hashes {
            deleted += conn.execute("DELETE FROM service_bundles WHERE bundle_hash = ?1", [hash])?;
        }
        Ok(deleted)
    }

    // ── Tracked messages (TTL reaper durable tier) ──────────────────

    pub fn insert_tracked_message(&self, entry: &TrackedMessage) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO tracked_messages (platform, chat_id, message_id, delete_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![entry.platform, entry.chat_id, entry.message_id, entry.delete_at],
        )?;
        Ok(())
    }

    pub fn expired_tracked_messages(&self, now: i64) -> Result<Vec<TrackedMessage>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT platform, chat_id, message_id, delete_at
             FROM tracked_messages WHERE delete_at <= ?1 ORDER BY delete_at",
        )?;
        let rows = stmt
            .query_map([now], row_to_tracked)?
            .collect::<Result<Vec<TrackedMessage>, _>>()?;
        Ok(rows)
    }

    pub fn all_tracked_messages(&self) -> Result<Vec<TrackedMessage>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT platform, chat_id, message_id, delete_at
             FROM tracked_messages ORDER BY delete_at",
        )?;
        let rows = stmt
            .query_map([], row_to_tracked)?
            .collect::<Result<Vec<TrackedMessage>, _>>()?;
        Ok(rows)
    }

    pub fn remove_tracked_message(&self, entry: &TrackedMessage) -> Result<(), StoreError> {
        self.conn().execute(
            "DELETE FROM tracked_messages
             WHERE platform = ?1 AND chat_id = ?2 AND message_id = ?3",
            params![entry.platform, entry.chat_id, entry.message_id],
        )?;
        Ok(())
    }
}

fn row_to_tracked(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrackedMessage> {
    Ok(TrackedMessage {
        platform: row.get(0)?,
        chat_id: row.get(1)?,
        message_id: row.get(2)?,
        delete_at: row.get(3)?,
    })
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
