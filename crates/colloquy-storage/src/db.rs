//! Database connection management.
//!
//! Wraps a single rusqlite Connection in a Mutex for thread-safe access.
//! Opening a database also applies pragmas and runs migrations, so a
//! constructed `Database` is always initialized.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::info;

use colloquy_core::error::ColloquyError;

use crate::migrations;

/// Thread-safe SQLite database wrapper.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a database at the given path.
    ///
    /// Fails with `StorageUnavailable` if the file cannot be opened or the
    /// schema cannot be created.
    pub fn new(path: &Path) -> Result<Self, ColloquyError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ColloquyError::StorageUnavailable(format!(
                        "Failed to create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path).map_err(|e| {
            ColloquyError::StorageUnavailable(format!("Failed to open database: {}", e))
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| ColloquyError::StorageUnavailable(format!("Failed to set pragmas: {}", e)))?;

        info!("Database opened at {}", path.display());
        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, ColloquyError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            ColloquyError::StorageUnavailable(format!("Failed to open in-memory db: {}", e))
        })?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, ColloquyError> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Run pending migrations. Safe to call repeatedly.
    pub fn migrate(&self) -> Result<(), ColloquyError> {
        self.with_conn(migrations::run_migrations)
    }

    /// Execute a closure with a reference to the underlying connection.
    ///
    /// The mutex is held for the duration of the closure.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, ColloquyError>
    where
        F: FnOnce(&Connection) -> Result<T, ColloquyError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ColloquyError::StorageUnavailable(format!("Database lock poisoned: {}", e)))?;
        f(&conn)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}
