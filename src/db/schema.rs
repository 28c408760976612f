// src/db/schema.rs

//! Schema definitions and the migration engine for awtfdb.
//!
//! Migrations are an ordered sequence of `(version, name, transactional,
//! sql_or_fn)` steps. Running from the current version copies the store
//! file to a sibling backup under an exclusive transaction, then applies
//! every pending step in order, logging each one to `migration_logs`.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Current schema version. Every migration below must have a contiguous
/// version number ending at this constant.
pub const SCHEMA_VERSION: i32 = 11;

enum MigrationKind {
    Sql(&'static str),
    Func(fn(&mut Connection) -> Result<()>),
}

struct MigrationStep {
    version: i32,
    name: &'static str,
    transactional: bool,
    kind: MigrationKind,
}

impl MigrationStep {
    fn is_functional(&self) -> bool {
        matches!(self.kind, MigrationKind::Func(_))
    }
}

fn steps() -> Vec<MigrationStep> {
    vec![
        MigrationStep {
            version: 1,
            name: "initial schema",
            transactional: true,
            kind: MigrationKind::Sql(MIGRATE_V1_SQL),
        },
        MigrationStep {
            version: 2,
            name: "unique local_path",
            transactional: true,
            kind: MigrationKind::Sql(MIGRATE_V2_SQL),
        },
        MigrationStep {
            version: 3,
            name: "tag implications",
            transactional: true,
            kind: MigrationKind::Sql(MIGRATE_V3_SQL),
        },
        MigrationStep {
            version: 4,
            name: "pools",
            transactional: true,
            kind: MigrationKind::Sql(MIGRATE_V4_SQL),
        },
        MigrationStep {
            version: 5,
            name: "metrics tables",
            transactional: true,
            kind: MigrationKind::Sql(MIGRATE_V5_SQL),
        },
        MigrationStep {
            version: 6,
            name: "tag sources + extended tag_files",
            transactional: true,
            kind: MigrationKind::Sql(MIGRATE_V6_SQL),
        },
        MigrationStep {
            version: 7,
            name: "tag-source metrics",
            transactional: true,
            kind: MigrationKind::Sql(MIGRATE_V7_SQL),
        },
        MigrationStep {
            version: 8,
            name: "id migration: rowid to ulid",
            transactional: true,
            kind: MigrationKind::Func(super::models::migrate_ids_to_ulid),
        },
        MigrationStep {
            version: 9,
            name: "library configuration",
            transactional: true,
            kind: MigrationKind::Sql(MIGRATE_V9_SQL),
        },
        MigrationStep {
            version: 10,
            name: "journal mode wal",
            transactional: false,
            kind: MigrationKind::Sql("PRAGMA journal_mode=WAL;"),
        },
        MigrationStep {
            version: 11,
            name: "secondary indexes",
            transactional: true,
            kind: MigrationKind::Sql(MIGRATE_V11_SQL),
        },
    ]
}

const MIGRATE_V1_SQL: &str = "
CREATE TABLE hashes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    hash_data BLOB NOT NULL UNIQUE CHECK (length(hash_data) = 32)
);

CREATE TABLE tag_cores (
    core_hash INTEGER PRIMARY KEY REFERENCES hashes(id) ON DELETE RESTRICT,
    core_data BLOB NOT NULL
);

CREATE TABLE tag_names (
    tag_text TEXT NOT NULL,
    tag_language TEXT NOT NULL,
    core_hash INTEGER NOT NULL REFERENCES tag_cores(core_hash) ON DELETE RESTRICT,
    PRIMARY KEY (tag_text, tag_language, core_hash)
);

CREATE TABLE files (
    file_hash INTEGER NOT NULL REFERENCES hashes(id) ON DELETE RESTRICT,
    local_path TEXT NOT NULL,
    PRIMARY KEY (file_hash, local_path)
);

CREATE TABLE tag_files (
    file_hash INTEGER NOT NULL REFERENCES hashes(id) ON DELETE CASCADE,
    core_hash INTEGER NOT NULL REFERENCES tag_cores(core_hash) ON DELETE CASCADE,
    PRIMARY KEY (file_hash, core_hash)
);
";

const MIGRATE_V2_SQL: &str = "
CREATE TABLE files_new (
    file_hash INTEGER NOT NULL REFERENCES hashes(id) ON DELETE RESTRICT,
    local_path TEXT NOT NULL UNIQUE,
    PRIMARY KEY (file_hash, local_path)
);
INSERT INTO files_new SELECT file_hash, local_path FROM files;
DROP TABLE files;
ALTER TABLE files_new RENAME TO files;
";

const MIGRATE_V3_SQL: &str = "
CREATE TABLE tag_implications (
    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
    child_tag INTEGER NOT NULL REFERENCES tag_cores(core_hash) ON DELETE RESTRICT,
    parent_tag INTEGER NOT NULL REFERENCES tag_cores(core_hash) ON DELETE RESTRICT,
    UNIQUE (child_tag, parent_tag)
);
";

const MIGRATE_V4_SQL: &str = "
CREATE TABLE pools (
    pool_hash INTEGER PRIMARY KEY REFERENCES hashes(id) ON DELETE RESTRICT,
    pool_core_data BLOB NOT NULL,
    title TEXT NOT NULL
);

CREATE TABLE pool_entries (
    file_hash INTEGER NOT NULL REFERENCES hashes(id) ON DELETE CASCADE,
    pool_hash INTEGER NOT NULL REFERENCES pools(pool_hash) ON DELETE CASCADE,
    entry_index INTEGER NOT NULL,
    PRIMARY KEY (file_hash, pool_hash),
    UNIQUE (pool_hash, entry_index)
);
";

// Metric counters and their time-series backing table are schema-level
// only here: collecting into them is an external-collaborator concern
// (see DESIGN.md), but the tables must exist for later migrations (7, 11)
// to reference.
const MIGRATE_V5_SQL: &str = "
CREATE TABLE metrics_counters (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE metrics_tag_usage_values (
    core_hash INTEGER NOT NULL,
    value INTEGER NOT NULL,
    recorded_at INTEGER NOT NULL
);
";

const MIGRATE_V6_SQL: &str = "
CREATE TABLE tag_sources (
    type INTEGER NOT NULL,
    id INTEGER NOT NULL,
    name TEXT,
    PRIMARY KEY (type, id)
);

INSERT INTO tag_sources (type, id, name) VALUES (0, 0, 'manual insertion');
INSERT INTO tag_sources (type, id, name) VALUES (0, 1, 'tag parenting');

ALTER TABLE tag_files ADD COLUMN tag_source_type INTEGER NOT NULL DEFAULT 0;
ALTER TABLE tag_files ADD COLUMN tag_source_id INTEGER NOT NULL DEFAULT 0;
ALTER TABLE tag_files ADD COLUMN parent_source_id INTEGER REFERENCES tag_implications(row_id);
";

const MIGRATE_V7_SQL: &str = "
CREATE TABLE metrics_tag_source_usage (
    tag_source_type INTEGER NOT NULL,
    tag_source_id INTEGER NOT NULL,
    value INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (tag_source_type, tag_source_id)
);
";

const MIGRATE_V9_SQL: &str = "
CREATE TABLE library_configuration (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const MIGRATE_V11_SQL: &str = "
CREATE INDEX idx_tag_files_file_hash ON tag_files(file_hash);
CREATE INDEX idx_tag_files_core_hash ON tag_files(core_hash);
CREATE INDEX idx_tag_names_core_hash ON tag_names(core_hash);
CREATE INDEX idx_metrics_tag_usage_values_core_hash ON metrics_tag_usage_values(core_hash);
";

fn ensure_migration_logs(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migration_logs (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// Read the highest applied migration version, or 0 for a fresh store.
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    ensure_migration_logs(conn)?;
    let version = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM migration_logs",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);
    Ok(version)
}

fn log_migration(conn: &Connection, version: i32, description: &str) -> Result<()> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    conn.execute(
        "INSERT INTO migration_logs (version, applied_at, description) VALUES (?1, ?2, ?3)",
        rusqlite::params![version, now, description],
    )?;
    Ok(())
}

/// Apply all pending migrations, in order, to bring `conn` up to
/// [`SCHEMA_VERSION`]. `db_path` is the on-disk location backing `conn`
/// (pass `":memory:"` for connections with no backing file to skip the
/// pre-migration backup copy).
pub fn migrate(conn: &mut Connection, db_path: &str) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    info!("current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        info!("schema is up to date");
        return Ok(());
    }

    if db_path != ":memory:" && std::path::Path::new(db_path).exists() {
        backup_before_migrate(conn, db_path)?;
    }

    for step in steps().into_iter().filter(|s| s.version > current_version) {
        debug!("applying migration {}: {}", step.version, step.name);
        apply_step(conn, &step)?;
        log_migration(conn, step.version, step.name)?;
    }

    info!("schema migration complete, now at version {}", SCHEMA_VERSION);

    integrity_check(conn)?;
    foreign_key_check(conn)?;

    Ok(())
}

fn backup_before_migrate(conn: &Connection, db_path: &str) -> Result<()> {
    let backup = super::backup_path_for(std::path::Path::new(db_path));
    conn.execute_batch("BEGIN EXCLUSIVE;")?;
    let copy_result = std::fs::copy(db_path, &backup);
    conn.execute_batch("COMMIT;")?;
    copy_result?;
    Ok(())
}

fn apply_step(conn: &mut Connection, step: &MigrationStep) -> Result<()> {
    if step.is_functional() {
        return apply_functional(conn, step);
    }
    if step.transactional {
        let tx = conn.savepoint()?;
        run_sql_kind(&tx, &step.kind)?;
        tx.commit()?;
        Ok(())
    } else {
        run_sql_kind(conn, &step.kind)
    }
}

fn run_sql_kind(conn: &Connection, kind: &MigrationKind) -> Result<()> {
    match kind {
        MigrationKind::Sql(sql) => {
            conn.execute_batch(sql)?;
            Ok(())
        }
        MigrationKind::Func(_) => unreachable!("functional migrations bypass run_sql_kind"),
    }
}

// Functional migrations (currently only the id migration) need direct
// mutable access to the connection to rebuild several tables in sequence;
// each one manages its own transaction rather than sharing `apply_step`'s
// savepoint wrapper, per the atomicity requirement on the id migration.
fn apply_functional(conn: &mut Connection, step: &MigrationStep) -> Result<()> {
    match step.kind {
        MigrationKind::Func(f) => f(conn),
        MigrationKind::Sql(_) => unreachable!(),
    }
}

/// `PRAGMA integrity_check` must return exactly `"ok"`.
pub fn integrity_check(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA integrity_check")?;
    let rows: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<_>>()?;
    if rows.len() == 1 && rows[0] == "ok" {
        Ok(())
    } else {
        Err(Error::FailedIntegrityCheck(rows.len()))
    }
}

/// `PRAGMA foreign_key_check` must return no rows.
pub fn foreign_key_check(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let count = stmt.query_map([], |_| Ok(()))?.count();
    if count == 0 {
        Ok(())
    } else {
        Err(Error::FailedForeignKeyCheck(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn fresh_conn() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_migrate_creates_all_tables() {
        let mut conn = fresh_conn();
        migrate(&mut conn, ":memory:").unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();

        for expected in [
            "hashes",
            "tag_cores",
            "tag_names",
            "files",
            "tag_files",
            "tag_implications",
            "pools",
            "pool_entries",
            "tag_sources",
            "library_configuration",
            "migration_logs",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing table {expected}");
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let mut conn = fresh_conn();
        migrate(&mut conn, ":memory:").unwrap();
        let version_after_first = get_schema_version(&conn).unwrap();
        migrate(&mut conn, ":memory:").unwrap();
        let version_after_second = get_schema_version(&conn).unwrap();
        assert_eq!(version_after_first, version_after_second);
        assert_eq!(version_after_second, SCHEMA_VERSION);
    }

    #[test]
    fn test_migration_logs_one_row_per_step() {
        let mut conn = fresh_conn();
        migrate(&mut conn, ":memory:").unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM migration_logs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_foreign_key_constraints_hold_after_migration() {
        let mut conn = fresh_conn();
        migrate(&mut conn, ":memory:").unwrap();
        foreign_key_check(&conn).unwrap();
        integrity_check(&conn).unwrap();
    }

    #[test]
    fn test_hashes_id_is_text_after_id_migration() {
        let mut conn = fresh_conn();
        migrate(&mut conn, ":memory:").unwrap();
        let decl_type: String = conn
            .query_row(
                "SELECT type FROM pragma_table_info('hashes') WHERE name = 'id'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(decl_type, "TEXT");
    }
}
