use rusqlite::{Connection, OptionalExtension, params};

use super::StoreError;

/// One schema migration. `sql` may contain multiple statements; the runner
/// wraps each migration in its own transaction.
pub struct Migration {
    pub id: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        name: "chat_configs",
        sql: "CREATE TABLE chat_configs (
                  chat_id     TEXT PRIMARY KEY,
                  config_id   TEXT NOT NULL,
                  config_json TEXT NOT NULL,
                  config_hash TEXT NOT NULL,
                  updated_at  INTEGER NOT NULL
              );",
    },
    Migration {
        id: 2,
        name: "snapshots",
        sql: "CREATE TABLE snapshots (
                  config_hash   TEXT PRIMARY KEY,
                  snapshot_json TEXT NOT NULL,
                  updated_at    INTEGER NOT NULL
              );",
    },
    Migration {
        id: 3,
        name: "service_bundles",
        sql: "CREATE TABLE service_bundles (
                  bundle_hash TEXT PRIMARY KEY,
                  service_id  TEXT NOT NULL,
                  version     TEXT NOT NULL,
                  data_url    TEXT NOT NULL,
                  updated_at  INTEGER NOT NULL
              );",
    },
    Migration {
        id: 4,
        name: "tracked_messages",
        sql: "CREATE TABLE tracked_messages (
                  platform   TEXT NOT NULL,
                  chat_id    TEXT NOT NULL,
                  message_id TEXT NOT NULL,
                  delete_at  INTEGER NOT NULL,
                  PRIMARY KEY (platform, chat_id, message_id)
              );
              CREATE INDEX idx_tracked_messages_delete_at
                  ON tracked_messages (delete_at);",
    },
];

/// Apply every migration not yet recorded in the `migrations` table.
/// Each migration runs inside its own transaction; re-running is a no-op.
pub fn run(conn: &Connection) -> Result<usize, StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (
             id         INTEGER PRIMARY KEY,
             name       TEXT NOT NULL,
             applied_at INTEGER NOT NULL
         );",
    )?;

    let mut applied = 0;
    for migration in MIGRATIONS {
        let already: bool = conn
            .query_row(
                "SELECT 1 FROM migrations WHERE id = ?1",
                [migration.id],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if already {
            continue;
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO migrations (id, name, applied_at) VALUES (?1, ?2, ?3)",
            params![
                migration.id,
                migration.name,
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
        tx.commit()?;

        tracing::info!(id = migration.id, name = migration.name, "applied migration");
        applied += 1;
    }

    Ok(applied)
}

/// Check if a table exists in the database.
pub fn table_exists(conn: &Connection, table_name: &str) -> bool {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1",
        [table_name],
        |_| Ok(true),
    )
    .unwrap_or(false)
}
