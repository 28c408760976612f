// src/janitor.rs

//! The offline consistency auditor: validates hashes, tag-core digests,
//! unused hashes, and tag-name regex compliance, with an optional repair
//! mode. Produces a JSON [`Report`] that can be saved and reloaded so a
//! later run only revisits the rows that were previously flagged.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::models::{FileEntry, Hash, LibraryConfig, TagCore, TagName};
use crate::db::schema;
use crate::error::{Error, Result};
use crate::hash::digest_file;

/// A report older than this is rejected rather than trusted as current.
const REPORT_MAX_AGE_SECS: i64 = 3600;

#[derive(Debug, Clone, Default)]
pub struct JanitorOptions {
    /// Recompute file content hashes (subject to `only`/`hash_files_smaller_than`).
    pub full: bool,
    /// Restrict the `full` re-hash to paths under these prefixes. Empty means no restriction.
    pub only: Vec<String>,
    /// Skip re-hashing files at or above this byte size.
    pub hash_files_smaller_than: Option<u64>,
    /// Apply fixes for repairable problems instead of only reporting them.
    pub repair: bool,
    /// Skip `PRAGMA integrity_check` / `PRAGMA foreign_key_check`.
    pub skip_db: bool,
    /// Skip the tag-core digest-verification phase.
    pub skip_tag_cores: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CounterPair {
    pub total: u64,
    pub unrepairable: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Counters {
    pub file_not_found: CounterPair,
    pub incorrect_hash_files: CounterPair,
    pub incorrect_hash_cores: CounterPair,
    pub unused_hash: CounterPair,
    pub invalid_tag_name: CounterPair,
}

impl Counters {
    fn problem_count(&self) -> u64 {
        self.file_not_found.total
            + self.incorrect_hash_files.total
            + self.incorrect_hash_cores.total
            + self.unused_hash.total
            + self.invalid_tag_name.total
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileProblem {
    pub file_hash: String,
    pub local_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashProblem {
    pub id: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub version: u32,
    pub counters: Counters,
    pub timestamp: i64,
    pub files_not_found: Vec<FileProblem>,
    pub incorrect_hashes: Vec<HashProblem>,
}

impl Report {
    fn new() -> Self {
        Report {
            version: 1,
            counters: Counters::default(),
            timestamp: now_unix(),
            files_not_found: Vec::new(),
            incorrect_hashes: Vec::new(),
        }
    }

    /// Total problems found, across every phase.
    pub fn problem_count(&self) -> u64 {
        self.counters.problem_count()
    }

    /// Write the report as JSON to a fresh path under `/tmp`, in the
    /// `awtfdb-janitor_XXXXXXXXX` naming convention.
    pub fn write_to_tmp(&self) -> Result<PathBuf> {
        let suffix: String = {
            let mut rng = rand::thread_rng();
            (0..12)
                .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
                .collect()
        };
        let path = PathBuf::from(format!("/tmp/awtfdb-janitor_{suffix}"));
        let file = std::fs::File::create(&path)?;
        serde_json::to_writer_pretty(file, self)
            .map_err(|e| Error::ConfigFail(format!("failed to write report: {e}")))?;
        Ok(path)
    }

    /// Load a previously-written report, rejecting it if its timestamp is
    /// more than an hour old.
    pub fn load(path: &Path) -> Result<Report> {
        let bytes = std::fs::read(path)?;
        let report: Report =
            serde_json::from_slice(&bytes).map_err(|e| Error::ConfigFail(format!("invalid report: {e}")))?;
        if now_unix() - report.timestamp > REPORT_MAX_AGE_SECS {
            return Err(Error::ManualInterventionRequired(format!(
                "report at {} is older than one hour, rerun without --from-report",
                path.display()
            )));
        }
        Ok(report)
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Run every audit phase, returning the accumulated report. `from_report`
/// restricts the file phase to previously-flagged rows (see
/// [`check_files`]'s doc-comment for the staleness tradeoff this implies).
///
/// Under `--repair`, the whole run executes inside a savepoint: hitting an
/// unrepairable problem aborts with the spec's dedicated error kind and
/// rolls back every repair already applied earlier in the same run, per
/// spec.md §5 ("the outermost transaction's failure must leave the store
/// byte-identical to its pre-call state"). Without `--repair` nothing is
/// mutated, so the audit runs directly against `conn`.
pub fn run(
    conn: &mut Connection,
    library_config: &LibraryConfig,
    options: &JanitorOptions,
    from_report: Option<&Report>,
) -> Result<Report> {
    if options.repair {
        let savepoint = conn.savepoint()?;
        let report = run_phases(&savepoint, library_config, options, from_report)?;
        savepoint.commit()?;
        Ok(report)
    } else {
        run_phases(conn, library_config, options, from_report)
    }
}

fn run_phases(
    conn: &Connection,
    library_config: &LibraryConfig,
    options: &JanitorOptions,
    from_report: Option<&Report>,
) -> Result<Report> {
    let mut report = Report::new();

    if !options.skip_db {
        info!("janitor: running integrity_check");
        schema::integrity_check(conn)?;
        info!("janitor: running foreign_key_check");
        schema::foreign_key_check(conn)?;
    }

    check_files(conn, options, from_report, &mut report)?;

    if !options.skip_tag_cores {
        check_tag_cores(conn, &mut report)?;
    }

    check_unused_hashes(conn, options, &mut report)?;
    check_tag_names(conn, library_config, options, &mut report)?;

    Ok(report)
}

/// Parse a `--hash-files-smaller-than` argument: a bare byte count, or a
/// count suffixed with `K`/`M`/`G` (binary multiples), per spec.md §6.
pub fn parse_byte_amount(text: &str) -> Result<u64> {
    let trimmed = text.trim();
    let (digits, multiplier) = match trimmed.as_bytes().last() {
        Some(b'K') | Some(b'k') => (&trimmed[..trimmed.len() - 1], 1024u64),
        Some(b'M') | Some(b'm') => (&trimmed[..trimmed.len() - 1], 1024u64 * 1024),
        Some(b'G') | Some(b'g') => (&trimmed[..trimmed.len() - 1], 1024u64 * 1024 * 1024),
        _ => (trimmed, 1u64),
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| Error::InvalidByteAmount(text.to_string()))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::InvalidByteAmount(text.to_string()))
}

/// Files phase: verify every tracked file still exists at its recorded
/// path, and (with `--full`) that its content still hashes to the stored
/// digest.
///
/// When `from_report` is set, only the rows it lists are rechecked — files
/// that broke *since* the report was generated are silently missed. This
/// is the documented staleness tradeoff of from-report mode (spec.md §9);
/// it is preserved rather than worked around.
fn check_files(
    conn: &Connection,
    options: &JanitorOptions,
    from_report: Option<&Report>,
    report: &mut Report,
) -> Result<()> {
    let targets: Vec<FileEntry> = match from_report {
        Some(r) => r
            .files_not_found
            .iter()
            .map(|p| FileEntry {
                file_hash: p.file_hash.clone(),
                local_path: p.local_path.clone(),
            })
            .collect(),
        None => FileEntry::list_all(conn)?,
    };

    for file in &targets {
        let path = Path::new(&file.local_path);

        if !path.exists() {
            let sharing = FileEntry::count_by_hash(conn, &file.file_hash)?;
            report.counters.file_not_found.total += 1;
            if sharing > 1 {
                debug!(
                    "file {} missing but hash {} still tracked elsewhere, treating as a move",
                    file.local_path, file.file_hash
                );
                if options.repair {
                    FileEntry::delete(conn, &file.file_hash, &file.local_path)?;
                }
            } else {
                warn!(
                    "file {} missing and is the sole reference to hash {}: manual intervention required",
                    file.local_path, file.file_hash
                );
                if options.repair {
                    return Err(Error::ManualInterventionRequired(format!(
                        "file {} is missing and is the sole reference to hash {}",
                        file.local_path, file.file_hash
                    )));
                }
                report.counters.file_not_found.unrepairable += 1;
                report.files_not_found.push(FileProblem {
                    file_hash: file.file_hash.clone(),
                    local_path: file.local_path.clone(),
                });
            }
            continue;
        }

        if !options.full {
            continue;
        }
        if !options.only.is_empty() && !options.only.iter().any(|p| file.local_path.starts_with(p)) {
            continue;
        }
        if let Some(limit) = options.hash_files_smaller_than {
            if let Ok(metadata) = path.metadata() {
                if metadata.len() >= limit {
                    continue;
                }
            }
        }

        let computed = digest_file(path)?;
        let Some(stored) = Hash::find_by_id(conn, &file.file_hash)? else {
            return Err(Error::InconsistentIndex(format!(
                "files row references missing hash {}",
                file.file_hash
            )));
        };
        if computed.as_slice() == stored.hash_data.as_slice() {
            continue;
        }

        report.counters.incorrect_hash_files.total += 1;
        report.incorrect_hashes.push(HashProblem {
            id: file.file_hash.clone(),
            detail: format!("content hash mismatch for {}", file.local_path),
        });

        if options.repair {
            repair_file_hash_mismatch(conn, file, &computed)?;
        }
    }

    Ok(())
}

/// Repair a content-hash mismatch for an existing file row.
///
/// Open question (spec.md §9): when no collision exists, this updates
/// `hashes.hash_data` for the file's *current* hash id in place rather
/// than inserting a fresh hash and repointing references. That silently
/// changes what the row's content address means for every other
/// reference to it; treated as authoritative per spec, flagged here.
fn repair_file_hash_mismatch(conn: &Connection, file: &FileEntry, computed: &[u8; 32]) -> Result<()> {
    if let Some(existing) = Hash::find_by_data(conn, computed)? {
        FileEntry::repoint_hash(conn, &file.file_hash, &file.local_path, &existing.id)
    } else {
        warn!(
            "repairing hash {} in place for {} (no existing hash matches the new content)",
            file.file_hash, file.local_path
        );
        Hash::repair_hash_data(conn, &file.file_hash, computed)
    }
}

/// Tag-core phase: recompute `digest(core_data)` for every core and
/// compare against the stored digest. A mismatch is unrepairable — the
/// random bytes that justify a core's identity cannot be reconstructed.
fn check_tag_cores(conn: &Connection, report: &mut Report) -> Result<()> {
    for core in TagCore::list_all(conn)? {
        let Some(stored) = Hash::find_by_id(conn, &core.core_hash)? else {
            return Err(Error::InconsistentIndex(format!(
                "tag_cores row references missing hash {}",
                core.core_hash
            )));
        };
        if !core.verify_digest(&stored.hash_data) {
            report.counters.incorrect_hash_cores.total += 1;
            report.counters.incorrect_hash_cores.unrepairable += 1;
            report.incorrect_hashes.push(HashProblem {
                id: core.core_hash.clone(),
                detail: "tag core digest mismatch".to_string(),
            });
        }
    }
    Ok(())
}

/// Unused-hash phase: any `hashes` row not referenced by a tag core, file,
/// or pool is a repair candidate for straightforward deletion.
fn check_unused_hashes(conn: &Connection, options: &JanitorOptions, report: &mut Report) -> Result<()> {
    for hash in Hash::find_unused(conn)? {
        report.counters.unused_hash.total += 1;
        if options.repair {
            Hash::delete(conn, &hash.id)?;
        }
    }
    Ok(())
}

/// Tag-name phase: verify every name still matches the configured regex.
/// A mismatch is unrepairable — there's no principled way to auto-correct
/// free text into compliance.
fn check_tag_names(
    conn: &Connection,
    library_config: &LibraryConfig,
    options: &JanitorOptions,
    report: &mut Report,
) -> Result<()> {
    for name in TagName::list_all(conn)? {
        if library_config.verify_tag_name(conn, &name.tag_text).is_err() {
            if options.repair {
                return Err(Error::UnrepairableTagName(name.tag_text));
            }
            report.counters.invalid_tag_name.total += 1;
            report.counters.invalid_tag_name.unrepairable += 1;
        }
    }
    Ok(())
}
