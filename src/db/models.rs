// src/db/models.rs

//! Data models for awtfdb entities.
//!
//! This module defines Rust structs corresponding to the tables created in
//! `schema.rs`, and provides the CRUD operations that sit above raw SQL:
//! hashes, tag cores/names, files, tag sources/implications, pools, and
//! the lazily-loaded library configuration.

use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::{Error, Result};
use crate::hash::{digest, random_pool_core_data, random_tag_core_data};
use crate::id::Id;

/// System tag-source id for manual insertion: `(type=0, id=0)`.
pub const SOURCE_MANUAL: i64 = 0;
/// System tag-source id for tag-tree propagation: `(type=0, id=1)`.
pub const SOURCE_TAG_PARENTING: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagSourceKind {
    System,
    External,
}

impl TagSourceKind {
    pub fn as_i64(self) -> i64 {
        match self {
            TagSourceKind::System => 0,
            TagSourceKind::External => 1,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(TagSourceKind::System),
            1 => Some(TagSourceKind::External),
            _ => None,
        }
    }
}

/// Attribution of a tag-file link: which tag source put it there, and (for
/// inferred links) which `tag_implications` row caused it.
#[derive(Debug, Clone, Copy)]
pub struct TagSourceRef {
    pub kind: TagSourceKind,
    pub id: i64,
    pub parent_source_id: Option<i64>,
}

impl TagSourceRef {
    pub fn manual() -> Self {
        TagSourceRef {
            kind: TagSourceKind::System,
            id: SOURCE_MANUAL,
            parent_source_id: None,
        }
    }

    pub fn tag_parenting(row_id: i64) -> Self {
        TagSourceRef {
            kind: TagSourceKind::System,
            id: SOURCE_TAG_PARENTING,
            parent_source_id: Some(row_id),
        }
    }

    fn validate(&self) -> Result<()> {
        let is_parenting =
            self.kind == TagSourceKind::System && self.id == SOURCE_TAG_PARENTING;
        if is_parenting && self.parent_source_id.is_none() {
            return Err(Error::InconsistentIndex(
                "tag-parenting source requires a parent_source_id".to_string(),
            ));
        }
        if !is_parenting && self.parent_source_id.is_some() {
            return Err(Error::InconsistentIndex(
                "parent_source_id is only valid for the tag-parenting source".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Hash
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hash {
    pub id: String,
    pub hash_data: Vec<u8>,
}

/// Options controlling a hash's generated id.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashOpts {
    /// When set, the new hash's id encodes this millisecond timestamp
    /// (typically a file's mtime) instead of the current time.
    pub file_mtime_ms: Option<u64>,
}

impl Hash {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Hash {
            id: row.get("id")?,
            hash_data: row.get("hash_data")?,
        })
    }

    pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<Hash>> {
        conn.query_row(
            "SELECT id, hash_data FROM hashes WHERE id = ?1",
            params![id],
            Hash::from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn find_by_data(conn: &Connection, hash_data: &[u8]) -> Result<Option<Hash>> {
        conn.query_row(
            "SELECT id, hash_data FROM hashes WHERE hash_data = ?1",
            params![hash_data],
            Hash::from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Return the existing hash for `hash_data`, or insert a new one.
    pub fn fetch_or_create(conn: &Connection, hash_data: &[u8], opts: HashOpts) -> Result<Hash> {
        if let Some(existing) = Hash::find_by_data(conn, hash_data)? {
            return Ok(existing);
        }
        let id = match opts.file_mtime_ms {
            Some(ms) => Id::at(ms),
            None => Id::now(),
        }
        .encode();
        conn.execute(
            "INSERT INTO hashes (id, hash_data) VALUES (?1, ?2)",
            params![id, hash_data],
        )?;
        Ok(Hash {
            id,
            hash_data: hash_data.to_vec(),
        })
    }

    /// `hashes.id` values not referenced by any tag core, file, or pool.
    pub fn find_unused(conn: &Connection) -> Result<Vec<Hash>> {
        let mut stmt = conn.prepare(
            "SELECT id, hash_data FROM hashes
             WHERE id NOT IN (SELECT core_hash FROM tag_cores)
               AND id NOT IN (SELECT file_hash FROM files)
               AND id NOT IN (SELECT pool_hash FROM pools)",
        )?;
        let rows = stmt
            .query_map([], Hash::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete(conn: &Connection, id: &str) -> Result<()> {
        conn.execute("DELETE FROM hashes WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Janitor repair path: overwrite the stored digest for an existing
    /// hash id in place. Authoritative but identity-changing; see
    /// DESIGN.md's note on this open question.
    pub fn repair_hash_data(conn: &Connection, id: &str, new_hash_data: &[u8]) -> Result<()> {
        conn.execute(
            "UPDATE hashes SET hash_data = ?1 WHERE id = ?2",
            params![new_hash_data, id],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Tag core
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagCore {
    pub core_hash: String,
    pub core_data: Vec<u8>,
}

impl TagCore {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(TagCore {
            core_hash: row.get("core_hash")?,
            core_data: row.get("core_data")?,
        })
    }

    pub fn find_by_hash(conn: &Connection, core_hash: &str) -> Result<Option<TagCore>> {
        conn.query_row(
            "SELECT core_hash, core_data FROM tag_cores WHERE core_hash = ?1",
            params![core_hash],
            TagCore::from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Synthesise a brand-new tag core: 128 random bytes, hashed and
    /// inserted as both a `hashes` row and a `tag_cores` row.
    pub fn create(conn: &Connection) -> Result<TagCore> {
        let core_data = random_tag_core_data();
        Self::create_from_data(conn, core_data)
    }

    /// Synthesise a pool core: 64 random bytes, hashed the same way.
    pub fn create_pool_core(conn: &Connection) -> Result<TagCore> {
        let core_data = random_pool_core_data();
        Self::create_from_data(conn, core_data)
    }

    fn create_from_data(conn: &Connection, core_data: Vec<u8>) -> Result<TagCore> {
        let core_hash_bytes = digest(&core_data);
        let hash = Hash::fetch_or_create(conn, &core_hash_bytes, HashOpts::default())?;
        conn.execute(
            "INSERT INTO tag_cores (core_hash, core_data) VALUES (?1, ?2)",
            params![hash.id, core_data],
        )?;
        Ok(TagCore {
            core_hash: hash.id,
            core_data,
        })
    }

    /// `core_hash = blake3_kdf(core_data, AWTFDB_CONTEXT)` must hold;
    /// the janitor's tag-core phase re-derives this and compares against
    /// the stored `hashes.hash_data` for `core_hash`.
    pub fn verify_digest(&self, stored_hash_data: &[u8]) -> bool {
        digest(&self.core_data).as_slice() == stored_hash_data
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<TagCore>> {
        let mut stmt = conn.prepare("SELECT core_hash, core_data FROM tag_cores")?;
        let rows = stmt
            .query_map([], TagCore::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// ---------------------------------------------------------------------
// Tag name
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagName {
    pub tag_text: String,
    pub tag_language: String,
    pub core_hash: String,
}

/// A named tag together with the hash/core it resolves to, as returned by
/// `fetch_named_tag`.
#[derive(Debug, Clone)]
pub struct ResolvedTag {
    pub name: TagName,
    pub core: TagCore,
}

impl TagName {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(TagName {
            tag_text: row.get("tag_text")?,
            tag_language: row.get("tag_language")?,
            core_hash: row.get("core_hash")?,
        })
    }

    /// Create a named tag. Validates `text` against the library's
    /// configured regex (if any), synthesises a new core unless
    /// `maybe_existing_core` is given, then inserts the `(text, language,
    /// core_hash)` row.
    pub fn create_named_tag(
        conn: &Connection,
        library_config: &LibraryConfig,
        text: &str,
        language: &str,
        maybe_existing_core: Option<&str>,
    ) -> Result<TagName> {
        library_config.verify_tag_name(conn, text)?;

        let core_hash = match maybe_existing_core {
            Some(core) => core.to_string(),
            None => TagCore::create(conn)?.core_hash,
        };

        conn.execute(
            "INSERT INTO tag_names (tag_text, tag_language, core_hash) VALUES (?1, ?2, ?3)",
            params![text, language, core_hash],
        )?;

        Ok(TagName {
            tag_text: text.to_string(),
            tag_language: language.to_string(),
            core_hash,
        })
    }

    pub fn fetch_named_tag(
        conn: &Connection,
        text: &str,
        language: &str,
    ) -> Result<Option<ResolvedTag>> {
        let name = conn
            .query_row(
                "SELECT tag_text, tag_language, core_hash FROM tag_names
                 WHERE tag_text = ?1 AND tag_language = ?2",
                params![text, language],
                TagName::from_row,
            )
            .optional()?;

        let Some(name) = name else {
            return Ok(None);
        };
        let core = TagCore::find_by_hash(conn, &name.core_hash)?.ok_or_else(|| {
            Error::InconsistentIndex(format!(
                "tag_names row for {text:?} references missing core {}",
                name.core_hash
            ))
        })?;
        Ok(Some(ResolvedTag { name, core }))
    }

    pub fn fetch_tags_from_core(conn: &Connection, core_hash: &str) -> Result<Vec<TagName>> {
        let mut stmt = conn.prepare(
            "SELECT tag_text, tag_language, core_hash FROM tag_names WHERE core_hash = ?1",
        )?;
        let rows = stmt
            .query_map(params![core_hash], TagName::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<TagName>> {
        let mut stmt = conn.prepare("SELECT tag_text, tag_language, core_hash FROM tag_names")?;
        let rows = stmt
            .query_map([], TagName::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Remove every name sharing `core_hash`, the core itself, and its
    /// backing hash row.
    pub fn delete_all(conn: &Connection, core_hash: &str) -> Result<()> {
        conn.execute(
            "DELETE FROM tag_names WHERE core_hash = ?1",
            params![core_hash],
        )?;
        let cores_deleted = conn.execute(
            "DELETE FROM tag_cores WHERE core_hash = ?1",
            params![core_hash],
        )?;
        let hashes_deleted = conn.execute("DELETE FROM hashes WHERE id = ?1", params![core_hash])?;
        if cores_deleted != 1 || hashes_deleted != 1 {
            return Err(Error::InconsistentIndex(format!(
                "expected exactly one tag_cores and hashes row for {core_hash}, deleted {cores_deleted}/{hashes_deleted}"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub file_hash: String,
    pub local_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct FileCreateOpts {
    /// Encode the file's mtime into the hash's id instead of "now".
    pub use_file_mtime: bool,
}

#[derive(Debug, Clone)]
pub struct TagFileLink {
    pub file_hash: String,
    pub core_hash: String,
    pub tag_source_type: i64,
    pub tag_source_id: i64,
    pub parent_source_id: Option<i64>,
}

impl FileEntry {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(FileEntry {
            file_hash: row.get("file_hash")?,
            local_path: row.get("local_path")?,
        })
    }

    /// Resolve `abs_path` to an absolute path, looking it up by path
    /// first; on a miss, stream-hash the file and insert it.
    pub fn create_from_path(
        conn: &Connection,
        abs_path: &std::path::Path,
        opts: FileCreateOpts,
    ) -> Result<FileEntry> {
        let abs_path = abs_path.canonicalize()?;
        let path_str = abs_path.to_string_lossy().to_string();

        if let Some(existing) = Self::fetch_by_path(conn, &path_str)? {
            return Ok(existing);
        }

        let hash_data = crate::hash::digest_file(&abs_path)?;
        let mtime_ms = if opts.use_file_mtime {
            abs_path
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
        } else {
            None
        };

        let hash = Hash::fetch_or_create(conn, &hash_data, HashOpts { file_mtime_ms: mtime_ms })?;

        conn.execute(
            "INSERT INTO files (file_hash, local_path) VALUES (?1, ?2)",
            params![hash.id, path_str],
        )?;

        Ok(FileEntry {
            file_hash: hash.id,
            local_path: path_str,
        })
    }

    pub fn fetch_by_hash(conn: &Connection, file_hash: &str) -> Result<Option<FileEntry>> {
        conn.query_row(
            "SELECT file_hash, local_path FROM files WHERE file_hash = ?1",
            params![file_hash],
            FileEntry::from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn fetch_by_hash_and_path(
        conn: &Connection,
        file_hash: &str,
        local_path: &str,
    ) -> Result<Option<FileEntry>> {
        conn.query_row(
            "SELECT file_hash, local_path FROM files WHERE file_hash = ?1 AND local_path = ?2",
            params![file_hash, local_path],
            FileEntry::from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn fetch_by_path(conn: &Connection, local_path: &str) -> Result<Option<FileEntry>> {
        conn.query_row(
            "SELECT file_hash, local_path FROM files WHERE local_path = ?1",
            params![local_path],
            FileEntry::from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn fetch_by_raw_hash(conn: &Connection, raw_digest: &[u8]) -> Result<Option<FileEntry>> {
        let Some(hash) = Hash::find_by_data(conn, raw_digest)? else {
            return Ok(None);
        };
        Self::fetch_by_hash(conn, &hash.id)
    }

    /// Insert a tag-file link. A link that already exists is a silent
    /// no-op, matching the underlying PK conflict.
    pub fn add_tag(conn: &Connection, file_hash: &str, core_hash: &str, source: TagSourceRef) -> Result<()> {
        source.validate()?;
        conn.execute(
            "INSERT OR IGNORE INTO tag_files
                (file_hash, core_hash, tag_source_type, tag_source_id, parent_source_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                file_hash,
                core_hash,
                source.kind.as_i64(),
                source.id,
                source.parent_source_id
            ],
        )?;
        Ok(())
    }

    pub fn remove_tag(conn: &Connection, file_hash: &str, core_hash: &str) -> Result<()> {
        conn.execute(
            "DELETE FROM tag_files WHERE file_hash = ?1 AND core_hash = ?2",
            params![file_hash, core_hash],
        )?;
        Ok(())
    }

    pub fn fetch_tags(conn: &Connection, file_hash: &str) -> Result<Vec<TagFileLink>> {
        let mut stmt = conn.prepare(
            "SELECT file_hash, core_hash, tag_source_type, tag_source_id, parent_source_id
             FROM tag_files WHERE file_hash = ?1",
        )?;
        let rows = stmt
            .query_map(params![file_hash], |row| {
                Ok(TagFileLink {
                    file_hash: row.get("file_hash")?,
                    core_hash: row.get("core_hash")?,
                    tag_source_type: row.get("tag_source_type")?,
                    tag_source_id: row.get("tag_source_id")?,
                    parent_source_id: row.get("parent_source_id")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Atomically rename a file's local path.
    pub fn set_local_path(
        conn: &Connection,
        file_hash: &str,
        old_path: &str,
        new_path: &str,
    ) -> Result<()> {
        let updated = conn.execute(
            "UPDATE files SET local_path = ?1 WHERE file_hash = ?2 AND local_path = ?3",
            params![new_path, file_hash, old_path],
        )?;
        if updated == 0 {
            return Err(Error::UnknownFile(format!("{file_hash}:{old_path}")));
        }
        Ok(())
    }

    /// Remove the `files` row; the backing `hashes` row is left for the
    /// janitor's unused-hash sweep to pick up.
    pub fn delete(conn: &Connection, file_hash: &str, local_path: &str) -> Result<()> {
        conn.execute(
            "DELETE FROM files WHERE file_hash = ?1 AND local_path = ?2",
            params![file_hash, local_path],
        )?;
        Ok(())
    }

    /// Every row in `files`. Used by the janitor when no report restricts
    /// which files to revisit.
    pub fn list_all(conn: &Connection) -> Result<Vec<FileEntry>> {
        let mut stmt = conn.prepare("SELECT file_hash, local_path FROM files")?;
        let rows = stmt
            .query_map([], FileEntry::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// How many `files` rows currently reference `file_hash`. A missing
    /// file whose hash is shared by more than one row implies a move
    /// rather than data loss.
    pub fn count_by_hash(conn: &Connection, file_hash: &str) -> Result<i64> {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM files WHERE file_hash = ?1",
            params![file_hash],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Janitor repair path: repoint a file row at a different (already
    /// existing) hash id, used when a recomputed digest matches a hash
    /// that already exists under a different id.
    pub fn repoint_hash(
        conn: &Connection,
        old_file_hash: &str,
        local_path: &str,
        new_file_hash: &str,
    ) -> Result<()> {
        conn.execute(
            "UPDATE files SET file_hash = ?1 WHERE file_hash = ?2 AND local_path = ?3",
            params![new_file_hash, old_file_hash, local_path],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Tag implications
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ImplicationEdge {
    pub row_id: i64,
    pub child_tag: String,
    pub parent_tag: String,
}

impl ImplicationEdge {
    pub fn create(conn: &Connection, child_tag: &str, parent_tag: &str) -> Result<ImplicationEdge> {
        conn.execute(
            "INSERT INTO tag_implications (child_tag, parent_tag) VALUES (?1, ?2)",
            params![child_tag, parent_tag],
        )?;
        let row_id = conn.last_insert_rowid();
        Ok(ImplicationEdge {
            row_id,
            child_tag: child_tag.to_string(),
            parent_tag: parent_tag.to_string(),
        })
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<ImplicationEdge>> {
        let mut stmt = conn.prepare("SELECT row_id, child_tag, parent_tag FROM tag_implications")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ImplicationEdge {
                    row_id: row.get("row_id")?,
                    child_tag: row.get("child_tag")?,
                    parent_tag: row.get("parent_tag")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// ---------------------------------------------------------------------
// Pools
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    pub pool_hash: String,
    pub title: String,
}

impl Pool {
    pub fn create(conn: &Connection, title: &str) -> Result<Pool> {
        let core = TagCore::create_pool_core(conn)?;
        conn.execute(
            "INSERT INTO pools (pool_hash, pool_core_data, title) VALUES (?1, ?2, ?3)",
            params![core.core_hash, core.core_data, title],
        )?;
        Ok(Pool {
            pool_hash: core.core_hash,
            title: title.to_string(),
        })
    }

    /// Append `file_hash` at `max(entry_index) + 1` (0 if the pool is
    /// empty).
    pub fn add_file(conn: &Connection, pool_hash: &str, file_hash: &str) -> Result<()> {
        let next_index: i64 = conn.query_row(
            "SELECT COALESCE(MAX(entry_index), -1) + 1 FROM pool_entries WHERE pool_hash = ?1",
            params![pool_hash],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO pool_entries (file_hash, pool_hash, entry_index) VALUES (?1, ?2, ?3)",
            params![file_hash, pool_hash, next_index],
        )?;
        Ok(())
    }

    /// Insert `file_hash` at position `index`, rewriting the pool's entire
    /// ordering under a savepoint so indices stay dense.
    pub fn add_file_at_index(
        conn: &mut Connection,
        pool_hash: &str,
        file_hash: &str,
        index: usize,
    ) -> Result<()> {
        let tx = conn.savepoint()?;

        let mut ordered = Self::fetch_files_tx(&tx, pool_hash)?;
        let index = index.min(ordered.len());
        ordered.insert(index, file_hash.to_string());

        tx.execute(
            "DELETE FROM pool_entries WHERE pool_hash = ?1",
            params![pool_hash],
        )?;
        for (i, file) in ordered.iter().enumerate() {
            tx.execute(
                "INSERT INTO pool_entries (file_hash, pool_hash, entry_index) VALUES (?1, ?2, ?3)",
                params![file, pool_hash, i as i64],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Remove a file from the pool. Leaves a hole in `entry_index`;
    /// readers always order by `entry_index` rather than relying on
    /// density.
    pub fn remove_file(conn: &Connection, pool_hash: &str, file_hash: &str) -> Result<()> {
        conn.execute(
            "DELETE FROM pool_entries WHERE pool_hash = ?1 AND file_hash = ?2",
            params![pool_hash, file_hash],
        )?;
        Ok(())
    }

    pub fn fetch_files(conn: &Connection, pool_hash: &str) -> Result<Vec<String>> {
        Self::fetch_files_tx(conn, pool_hash)
    }

    fn fetch_files_tx(conn: &Connection, pool_hash: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT file_hash FROM pool_entries WHERE pool_hash = ?1 ORDER BY entry_index ASC",
        )?;
        let rows = stmt
            .query_map(params![pool_hash], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// ---------------------------------------------------------------------
// Tag sources
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSource {
    pub kind: i64,
    pub id: i64,
    pub name: Option<String>,
}

impl TagSource {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(TagSource {
            kind: row.get("type")?,
            id: row.get("id")?,
            name: row.get("name")?,
        })
    }

    /// Allocate a new external tag source (`id = max(id where type=external) + 1`).
    pub fn create(conn: &Connection, name: &str) -> Result<TagSource> {
        let next_id: i64 = conn.query_row(
            "SELECT COALESCE(MAX(id), -1) + 1 FROM tag_sources WHERE type = ?1",
            params![TagSourceKind::External.as_i64()],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO tag_sources (type, id, name) VALUES (?1, ?2, ?3)",
            params![TagSourceKind::External.as_i64(), next_id, name],
        )?;
        Ok(TagSource {
            kind: TagSourceKind::External.as_i64(),
            id: next_id,
            name: Some(name.to_string()),
        })
    }

    pub fn fetch(conn: &Connection, kind: TagSourceKind, id: i64) -> Result<Option<TagSource>> {
        if kind == TagSourceKind::System && id != SOURCE_MANUAL && id != SOURCE_TAG_PARENTING {
            return Err(Error::InconsistentIndex(format!(
                "unknown system tag source id {id}"
            )));
        }
        conn.query_row(
            "SELECT type, id, name FROM tag_sources WHERE type = ?1 AND id = ?2",
            params![kind.as_i64(), id],
            TagSource::from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Only external tag sources may be deleted.
    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute(
            "DELETE FROM tag_sources WHERE type = ?1 AND id = ?2",
            params![TagSourceKind::External.as_i64(), id],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Library configuration
// ---------------------------------------------------------------------

pub const TAG_NAME_REGEX_KEY: &str = "tag_name_regex";

/// Lazily-loaded library configuration. Owns its own compiled-regex
/// cache, version-counter guarded, so distinct handles never share
/// mutable global state.
pub struct LibraryConfig {
    cache: Mutex<Option<(u64, Option<Regex>)>>,
    version: std::sync::atomic::AtomicU64,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LibraryConfig {
    pub fn new() -> Self {
        LibraryConfig {
            cache: Mutex::new(None),
            version: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn get(conn: &Connection, key: &str) -> Result<Option<String>> {
        conn.query_row(
            "SELECT value FROM library_configuration WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    /// Store `key = value`, invalidating the cached compiled regex if
    /// `key` is [`TAG_NAME_REGEX_KEY`].
    pub fn set(&self, conn: &Connection, key: &str, value: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO library_configuration (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        if key == TAG_NAME_REGEX_KEY {
            self.version
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        Ok(())
    }

    fn compiled_tag_name_regex(&self, conn: &Connection) -> Result<Option<Regex>> {
        let current_version = self.version.load(std::sync::atomic::Ordering::SeqCst);
        {
            let cache = self.cache.lock().unwrap();
            if let Some((cached_version, regex)) = cache.as_ref() {
                if *cached_version == current_version {
                    return Ok(regex.clone());
                }
            }
        }

        let pattern = Self::get(conn, TAG_NAME_REGEX_KEY)?;
        let regex = pattern
            .map(|p| {
                Regex::new(&p)
                    .map_err(|e| Error::ConfigFail(format!("invalid tag_name_regex: {e}")))
            })
            .transpose()?;

        *self.cache.lock().unwrap() = Some((current_version, regex.clone()));
        Ok(regex)
    }

    /// Validate `text` against the configured regex (full-span match). A
    /// store with no configured regex accepts anything.
    pub fn verify_tag_name(&self, conn: &Connection, text: &str) -> Result<()> {
        let Some(regex) = self.compiled_tag_name_regex(conn)? else {
            return Ok(());
        };
        match regex.find(text) {
            Some(m) if m.start() == 0 && m.end() == text.len() => Ok(()),
            Some(m) => Err(Error::InvalidTagName {
                text: text.to_string(),
                regex: regex.as_str().to_string(),
                matched: Some(m.as_str().to_string()),
            }),
            None => Err(Error::InvalidTagName {
                text: text.to_string(),
                regex: regex.as_str().to_string(),
                matched: None,
            }),
        }
    }
}

// ---------------------------------------------------------------------
// Migration logs
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MigrationLog {
    pub version: i32,
    pub applied_at: i64,
    pub description: String,
}

impl MigrationLog {
    pub fn list_all(conn: &Connection) -> Result<Vec<MigrationLog>> {
        let mut stmt =
            conn.prepare("SELECT version, applied_at, description FROM migration_logs ORDER BY version")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(MigrationLog {
                    version: row.get("version")?,
                    applied_at: row.get("applied_at")?,
                    description: row.get("description")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// ---------------------------------------------------------------------
// Programmatic id migration (rowid -> ULID)
// ---------------------------------------------------------------------

/// Rewrite `hashes.id` from integer rowids to ULID-style text ids,
/// rebuilding every dependent table so its foreign-key columns carry the
/// new identifiers. Runs as a single transaction: foreign-key checking is
/// suspended for the connection while tables are swapped, and verified
/// before commit rather than relying on per-statement enforcement mid-way.
pub(crate) fn migrate_ids_to_ulid(conn: &mut Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
    let tx = conn.transaction()?;

    let mut id_map: HashMap<i64, String> = HashMap::new();
    {
        let mut stmt = tx.prepare("SELECT id FROM hashes")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let old_id: i64 = row.get(0)?;
            id_map.insert(old_id, Id::now().encode());
        }
    }

    tx.execute_batch(
        "CREATE TABLE hashes_new (
            id TEXT PRIMARY KEY,
            hash_data BLOB NOT NULL UNIQUE CHECK (length(hash_data) = 32)
        );",
    )?;
    {
        let mut stmt = tx.prepare("SELECT id, hash_data FROM hashes")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let old_id: i64 = row.get(0)?;
            let hash_data: Vec<u8> = row.get(1)?;
            tx.execute(
                "INSERT INTO hashes_new (id, hash_data) VALUES (?1, ?2)",
                params![id_map[&old_id], hash_data],
            )?;
        }
    }
    tx.execute_batch("DROP TABLE hashes; ALTER TABLE hashes_new RENAME TO hashes;")?;

    tx.execute_batch(
        "CREATE TABLE tag_cores_new (
            core_hash TEXT PRIMARY KEY REFERENCES hashes(id) ON DELETE RESTRICT,
            core_data BLOB NOT NULL
        );",
    )?;
    {
        let mut stmt = tx.prepare("SELECT core_hash, core_data FROM tag_cores")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let old_core: i64 = row.get(0)?;
            let core_data: Vec<u8> = row.get(1)?;
            tx.execute(
                "INSERT INTO tag_cores_new (core_hash, core_data) VALUES (?1, ?2)",
                params![id_map[&old_core], core_data],
            )?;
        }
    }
    tx.execute_batch("DROP TABLE tag_cores; ALTER TABLE tag_cores_new RENAME TO tag_cores;")?;

    tx.execute_batch(
        "CREATE TABLE tag_names_new (
            tag_text TEXT NOT NULL,
            tag_language TEXT NOT NULL,
            core_hash TEXT NOT NULL REFERENCES tag_cores(core_hash) ON DELETE RESTRICT,
            PRIMARY KEY (tag_text, tag_language, core_hash)
        );",
    )?;
    {
        let mut stmt = tx.prepare("SELECT tag_text, tag_language, core_hash FROM tag_names")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let text: String = row.get(0)?;
            let lang: String = row.get(1)?;
            let old_core: i64 = row.get(2)?;
            tx.execute(
                "INSERT INTO tag_names_new (tag_text, tag_language, core_hash) VALUES (?1, ?2, ?3)",
                params![text, lang, id_map[&old_core]],
            )?;
        }
    }
    tx.execute_batch("DROP TABLE tag_names; ALTER TABLE tag_names_new RENAME TO tag_names;")?;

    tx.execute_batch(
        "CREATE TABLE files_new (
            file_hash TEXT NOT NULL REFERENCES hashes(id) ON DELETE RESTRICT,
            local_path TEXT NOT NULL UNIQUE,
            PRIMARY KEY (file_hash, local_path)
        );",
    )?;
    {
        let mut stmt = tx.prepare("SELECT file_hash, local_path FROM files")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let old_hash: i64 = row.get(0)?;
            let path: String = row.get(1)?;
            tx.execute(
                "INSERT INTO files_new (file_hash, local_path) VALUES (?1, ?2)",
                params![id_map[&old_hash], path],
            )?;
        }
    }
    tx.execute_batch("DROP TABLE files; ALTER TABLE files_new RENAME TO files;")?;

    tx.execute_batch(
        "CREATE TABLE tag_implications_new (
            row_id INTEGER PRIMARY KEY,
            child_tag TEXT NOT NULL REFERENCES tag_cores(core_hash) ON DELETE RESTRICT,
            parent_tag TEXT NOT NULL REFERENCES tag_cores(core_hash) ON DELETE RESTRICT,
            UNIQUE (child_tag, parent_tag)
        );",
    )?;
    {
        let mut stmt = tx.prepare("SELECT row_id, child_tag, parent_tag FROM tag_implications")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let row_id: i64 = row.get(0)?;
            let old_child: i64 = row.get(1)?;
            let old_parent: i64 = row.get(2)?;
            tx.execute(
                "INSERT INTO tag_implications_new (row_id, child_tag, parent_tag) VALUES (?1, ?2, ?3)",
                params![row_id, id_map[&old_child], id_map[&old_parent]],
            )?;
        }
    }
    tx.execute_batch(
        "DROP TABLE tag_implications; ALTER TABLE tag_implications_new RENAME TO tag_implications;",
    )?;

    tx.execute_batch(
        "CREATE TABLE tag_files_new (
            file_hash TEXT NOT NULL REFERENCES hashes(id) ON DELETE CASCADE,
            core_hash TEXT NOT NULL REFERENCES tag_cores(core_hash) ON DELETE CASCADE,
            tag_source_type INTEGER NOT NULL DEFAULT 0,
            tag_source_id INTEGER NOT NULL DEFAULT 0,
            parent_source_id INTEGER REFERENCES tag_implications(row_id),
            PRIMARY KEY (file_hash, core_hash)
        );",
    )?;
    {
        let mut stmt = tx.prepare(
            "SELECT file_hash, core_hash, tag_source_type, tag_source_id, parent_source_id FROM tag_files",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let old_file: i64 = row.get(0)?;
            let old_core: i64 = row.get(1)?;
            let source_type: i64 = row.get(2)?;
            let source_id: i64 = row.get(3)?;
            let parent_source_id: Option<i64> = row.get(4)?;
            tx.execute(
                "INSERT INTO tag_files_new
                    (file_hash, core_hash, tag_source_type, tag_source_id, parent_source_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id_map[&old_file],
                    id_map[&old_core],
                    source_type,
                    source_id,
                    parent_source_id
                ],
            )?;
        }
    }
    tx.execute_batch("DROP TABLE tag_files; ALTER TABLE tag_files_new RENAME TO tag_files;")?;

    tx.execute_batch(
        "CREATE TABLE pools_new (
            pool_hash TEXT PRIMARY KEY REFERENCES hashes(id) ON DELETE RESTRICT,
            pool_core_data BLOB NOT NULL,
            title TEXT NOT NULL
        );",
    )?;
    {
        let mut stmt = tx.prepare("SELECT pool_hash, pool_core_data, title FROM pools")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let old_pool: i64 = row.get(0)?;
            let core_data: Vec<u8> = row.get(1)?;
            let title: String = row.get(2)?;
            tx.execute(
                "INSERT INTO pools_new (pool_hash, pool_core_data, title) VALUES (?1, ?2, ?3)",
                params![id_map[&old_pool], core_data, title],
            )?;
        }
    }
    tx.execute_batch("DROP TABLE pools; ALTER TABLE pools_new RENAME TO pools;")?;

    tx.execute_batch(
        "CREATE TABLE pool_entries_new (
            file_hash TEXT NOT NULL REFERENCES hashes(id) ON DELETE CASCADE,
            pool_hash TEXT NOT NULL REFERENCES pools(pool_hash) ON DELETE CASCADE,
            entry_index INTEGER NOT NULL,
            PRIMARY KEY (file_hash, pool_hash),
            UNIQUE (pool_hash, entry_index)
        );",
    )?;
    {
        let mut stmt = tx.prepare("SELECT file_hash, pool_hash, entry_index FROM pool_entries")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let old_file: i64 = row.get(0)?;
            let old_pool: i64 = row.get(1)?;
            let index: i64 = row.get(2)?;
            tx.execute(
                "INSERT INTO pool_entries_new (file_hash, pool_hash, entry_index) VALUES (?1, ?2, ?3)",
                params![id_map[&old_file], id_map[&old_pool], index],
            )?;
        }
    }
    tx.execute_batch(
        "DROP TABLE pool_entries; ALTER TABLE pool_entries_new RENAME TO pool_entries;",
    )?;

    tx.execute_batch(
        "CREATE TABLE metrics_tag_usage_values_new (
            core_hash TEXT NOT NULL,
            value INTEGER NOT NULL,
            recorded_at INTEGER NOT NULL
        );",
    )?;
    {
        let mut stmt =
            tx.prepare("SELECT core_hash, value, recorded_at FROM metrics_tag_usage_values")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let old_core: i64 = row.get(0)?;
            let value: i64 = row.get(1)?;
            let recorded_at: i64 = row.get(2)?;
            // This table carries no foreign key to tag_cores, so a metrics
            // row can outlive the core it was recorded for. Such rows have
            // no new id to migrate to; drop them rather than writing a
            // core_hash that doesn't identify anything.
            let Some(new_core) = id_map.get(&old_core) else {
                tracing::warn!(
                    "dropping metrics_tag_usage_values row for deleted core {}",
                    old_core
                );
                continue;
            };
            tx.execute(
                "INSERT INTO metrics_tag_usage_values_new (core_hash, value, recorded_at) VALUES (?1, ?2, ?3)",
                params![new_core, value, recorded_at],
            )?;
        }
    }
    tx.execute_batch(
        "DROP TABLE metrics_tag_usage_values; ALTER TABLE metrics_tag_usage_values_new RENAME TO metrics_tag_usage_values;",
    )?;

    let violations = {
        let mut stmt = tx.prepare("PRAGMA foreign_key_check")?;
        stmt.query_map([], |_| Ok(()))?.count()
    };
    if violations > 0 {
        return Err(Error::FailedForeignKeyCheck(violations));
    }

    tx.commit()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn fresh_store() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        crate::db::apply_connection_pragmas(&conn).unwrap();
        super::super::schema::migrate(&mut conn, ":memory:").unwrap();
        conn
    }

    /// Index a throwaway file with distinct content and return its
    /// `FileEntry`, so pool tests exercise real `hashes`/`files` rows
    /// instead of fabricated ids that would trip `pool_entries`' foreign
    /// key under the foreign-key-enforced connection `fresh_store` now
    /// builds.
    fn index_temp_file(conn: &Connection, contents: &[u8]) -> FileEntry {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        tmp.write_all(contents).unwrap();
        tmp.flush().unwrap();
        FileEntry::create_from_path(conn, tmp.path(), FileCreateOpts::default()).unwrap()
    }

    #[test]
    fn test_hash_fetch_or_create_is_idempotent() {
        let conn = fresh_store();
        let data = digest(b"hello");
        let a = Hash::fetch_or_create(&conn, &data, HashOpts::default()).unwrap();
        let b = Hash::fetch_or_create(&conn, &data, HashOpts::default()).unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_create_and_fetch_named_tag() {
        let conn = fresh_store();
        let config = LibraryConfig::new();
        let tag = TagName::create_named_tag(&conn, &config, "test_tag", "en", None).unwrap();
        let fetched = TagName::fetch_named_tag(&conn, "test_tag", "en").unwrap().unwrap();
        assert_eq!(fetched.core.core_hash, tag.core_hash);

        TagName::create_named_tag(&conn, &config, "another_test_tag", "en", Some(&tag.core_hash))
            .unwrap();
        let names = TagName::fetch_tags_from_core(&conn, &tag.core_hash).unwrap();
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn test_create_tag_and_file_link_roundtrip() {
        let conn = fresh_store();
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        tmp.write_all(b"awooga").unwrap();
        tmp.flush().unwrap();

        let config = LibraryConfig::new();
        let tag = TagName::create_named_tag(&conn, &config, "example", "en", None).unwrap();
        let file = FileEntry::create_from_path(&conn, tmp.path(), FileCreateOpts::default()).unwrap();

        FileEntry::add_tag(&conn, &file.file_hash, &tag.core_hash, TagSourceRef::manual()).unwrap();
        let tags = FileEntry::fetch_tags(&conn, &file.file_hash).unwrap();
        assert!(tags.iter().any(|t| t.core_hash == tag.core_hash));

        FileEntry::remove_tag(&conn, &file.file_hash, &tag.core_hash).unwrap();
        let tags_after = FileEntry::fetch_tags(&conn, &file.file_hash).unwrap();
        assert!(!tags_after.iter().any(|t| t.core_hash == tag.core_hash));
    }

    #[test]
    fn test_pool_ordering() {
        let conn = fresh_store();
        let pool = Pool::create(&conn, "my pool").unwrap();
        let f1 = index_temp_file(&conn, b"pool file one");
        let f2 = index_temp_file(&conn, b"pool file two");
        let f3 = index_temp_file(&conn, b"pool file three");

        Pool::add_file(&conn, &pool.pool_hash, &f3.file_hash).unwrap();
        Pool::add_file(&conn, &pool.pool_hash, &f1.file_hash).unwrap();
        Pool::add_file(&conn, &pool.pool_hash, &f2.file_hash).unwrap();
        assert_eq!(
            Pool::fetch_files(&conn, &pool.pool_hash).unwrap(),
            vec![f3.file_hash.clone(), f1.file_hash.clone(), f2.file_hash.clone()]
        );

        Pool::remove_file(&conn, &pool.pool_hash, &f1.file_hash).unwrap();
        assert_eq!(
            Pool::fetch_files(&conn, &pool.pool_hash).unwrap(),
            vec![f3.file_hash.clone(), f2.file_hash.clone()]
        );
    }

    #[test]
    fn test_pool_add_file_at_index() {
        let mut conn = fresh_store();
        let pool = Pool::create(&conn, "my pool").unwrap();
        let f1 = index_temp_file(&conn, b"pool file one");
        let f2 = index_temp_file(&conn, b"pool file two");
        let f3 = index_temp_file(&conn, b"pool file three");

        Pool::add_file(&conn, &pool.pool_hash, &f3.file_hash).unwrap();
        Pool::add_file(&conn, &pool.pool_hash, &f2.file_hash).unwrap();
        Pool::add_file_at_index(&mut conn, &pool.pool_hash, &f1.file_hash, 0).unwrap();
        assert_eq!(
            Pool::fetch_files(&conn, &pool.pool_hash).unwrap(),
            vec![f1.file_hash.clone(), f3.file_hash.clone(), f2.file_hash.clone()]
        );
    }

    #[test]
    fn test_regex_guard_rejects_and_accepts() {
        let conn = fresh_store();
        let config = LibraryConfig::new();
        config.set(&conn, TAG_NAME_REGEX_KEY, "[a-zA-Z0-9_]+").unwrap();

        let err = TagName::create_named_tag(&conn, &config, "my test tag", "en", None).unwrap_err();
        match err {
            Error::InvalidTagName { matched, .. } => assert_eq!(matched.as_deref(), Some("my")),
            other => panic!("expected InvalidTagName, got {other:?}"),
        }

        TagName::create_named_tag(&conn, &config, "correct_tag_source", "en", None).unwrap();
    }

    #[test]
    fn test_tag_source_allocation() {
        let conn = fresh_store();
        let a = TagSource::create(&conn, "importer-a").unwrap();
        let b = TagSource::create(&conn, "importer-b").unwrap();
        assert_eq!(b.id, a.id + 1);

        let manual = TagSource::fetch(&conn, TagSourceKind::System, SOURCE_MANUAL)
            .unwrap()
            .unwrap();
        assert_eq!(manual.name.as_deref(), Some("manual insertion"));
    }

    #[test]
    fn test_delete_all_named_tag() {
        let conn = fresh_store();
        let config = LibraryConfig::new();
        let tag = TagName::create_named_tag(&conn, &config, "to_delete", "en", None).unwrap();
        TagName::delete_all(&conn, &tag.core_hash).unwrap();
        assert!(TagName::fetch_named_tag(&conn, "to_delete", "en").unwrap().is_none());
        assert!(TagCore::find_by_hash(&conn, &tag.core_hash).unwrap().is_none());
    }
}
