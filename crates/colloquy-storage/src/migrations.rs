//! Database schema migrations.

use rusqlite::Connection;
use tracing::info;

use colloquy_core::error::ColloquyError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), ColloquyError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| {
        ColloquyError::StorageUnavailable(format!("Failed to create migrations table: {}", e))
    })?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| {
            ColloquyError::StorageUnavailable(format!("Failed to query migration version: {}", e))
        })?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: conversation_history");
    }

    Ok(())
}

/// Version 1: conversation history.
///
/// AUTOINCREMENT keeps ids strictly increasing even after deletes.
fn apply_v1(conn: &Connection) -> Result<(), ColloquyError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS history (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_query  TEXT NOT NULL,
            ai_response TEXT NOT NULL,
            created_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
            query_type  TEXT NOT NULL DEFAULT 'text'
                        CHECK (query_type IN ('text', 'image')),
            image_path  TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_history_created_at
            ON history (created_at DESC);

        INSERT INTO schema_migrations (version, name) VALUES (1, 'conversation_history');
        ",
    )
    .map_err(|e| ColloquyError::StorageUnavailable(format!("Migration v1 failed: {}", e)))
}
