// src/db/mod.rs

//! Storage layer for awtfdb.
//!
//! This module owns the SQLite connection lifecycle: creating and opening
//! the store, setting its pragmas, running migrations, and providing the
//! transaction/savepoint helpers the domain API and janitor build on.

pub mod models;
pub mod schema;

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Default on-disk location: `${HOME}/awtf.db`.
pub fn default_path() -> Result<PathBuf> {
    let home = std::env::var("HOME")
        .map_err(|_| Error::ConfigFail("HOME environment variable is not set".to_string()))?;
    Ok(PathBuf::from(home).join("awtf.db"))
}

/// Sibling backup path used before running migrations:
/// `${HOME}/.awtf.before-migration.db`.
pub fn backup_path_for(db_path: &Path) -> PathBuf {
    let parent = db_path.parent().unwrap_or_else(|| Path::new("."));
    parent.join(".awtf.before-migration.db")
}

/// A handle over the process's connection to the store. Owns the
/// connection; all entity operations borrow it for the duration of a call.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Create (if missing) and open the store at `db_path`, applying
    /// pragmas and running all pending migrations.
    pub fn create(db_path: &str) -> Result<Self> {
        debug!("creating/opening store at: {}", db_path);

        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::ConfigFail(format!("failed to create store directory: {e}")))?;
            }
        }

        let conn = Connection::open(db_path)?;
        apply_connection_pragmas(&conn)?;

        let mut store = Store { conn };
        store.migrate(db_path)?;

        info!("store ready at {}", db_path);
        Ok(store)
    }

    /// Open an existing store. Fails if the file is not present.
    pub fn open(db_path: &str) -> Result<Self> {
        if !Path::new(db_path).exists() {
            return Err(Error::DatabaseNotFound(db_path.to_string()));
        }

        let conn = Connection::open(db_path)?;
        apply_connection_pragmas(&conn)?;

        let mut store = Store { conn };
        store.migrate(db_path)?;
        Ok(store)
    }

    /// Construct a store over an already-open in-memory or borrowed
    /// connection, running migrations. Used by tests and by callers that
    /// manage the connection's lifetime themselves.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        apply_connection_pragmas(&conn)?;
        let mut store = Store { conn };
        store.migrate(":memory:")?;
        Ok(store)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    fn migrate(&mut self, db_path: &str) -> Result<()> {
        schema::migrate(&mut self.conn, db_path)
    }

    /// Run the store's end-of-process cleanup pragmas. Callers invoke this
    /// before dropping the store at a clean shutdown point.
    pub fn shutdown_pragmas(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA analysis_limit=1000; PRAGMA optimize;")?;
        Ok(())
    }

    /// Run `PRAGMA integrity_check` and return `Ok(())` only if it reports
    /// exactly `"ok"`.
    pub fn integrity_check(&self) -> Result<()> {
        schema::integrity_check(&self.conn)
    }

    /// Run `PRAGMA foreign_key_check` and return `Ok(())` only if it
    /// reports no violations.
    pub fn foreign_key_check(&self) -> Result<()> {
        schema::foreign_key_check(&self.conn)
    }
}

/// Apply the pragmas production opens every connection with. Exposed
/// crate-wide so unit tests build their in-memory connections the same way
/// `Store::create`/`Store::open` do, rather than leaving foreign-key
/// enforcement off by omission.
pub(crate) fn apply_connection_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_create_creates_database() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap().to_string();
        drop(temp_file);

        let store = Store::create(&db_path);
        assert!(store.is_ok());
        assert!(Path::new(&db_path).exists());
    }

    #[test]
    fn test_open_existing_database() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap().to_string();
        drop(temp_file);

        Store::create(&db_path).unwrap();
        let result = Store::open(&db_path);
        assert!(result.is_ok());
    }

    #[test]
    fn test_open_nonexistent_database() {
        let result = Store::open("/nonexistent/path/db.sqlite");
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), Error::DatabaseNotFound(_)));
    }

    #[test]
    fn test_foreign_keys_are_enabled() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap().to_string();
        drop(temp_file);

        let store = Store::create(&db_path).unwrap();
        let fk: i32 = store
            .connection()
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_journal_mode_is_wal_after_migrations() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap().to_string();
        drop(temp_file);

        let store = Store::create(&db_path).unwrap();
        let journal_mode: String = store
            .connection()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");
    }
}
