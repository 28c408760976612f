// src/error.rs

use thiserror::Error;

/// Core error types for awtfdb
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store could not be opened or configured
    #[error("failed to configure store: {0}")]
    ConfigFail(String),

    /// Database not found at the given path
    #[error("database not found at path: {0}")]
    DatabaseNotFound(String),

    /// `PRAGMA integrity_check` returned something other than "ok"
    #[error("integrity check failed: {0} problem row(s)")]
    FailedIntegrityCheck(usize),

    /// `PRAGMA foreign_key_check` returned at least one row
    #[error("foreign key check failed: {0} violation(s)")]
    FailedForeignKeyCheck(usize),

    /// A tag name does not fully match the configured `tag_name_regex`
    #[error("invalid tag name {text:?}: does not fully match {regex:?} (matched {matched:?})")]
    InvalidTagName {
        text: String,
        regex: String,
        matched: Option<String>,
    },

    /// A query referenced a tag that does not exist
    #[error("unknown tag: {0}")]
    UnknownTag(String),

    /// A query referenced a file hash that does not exist
    #[error("unknown file: {0}")]
    UnknownFile(String),

    /// A janitor `--hash-files-smaller-than` argument could not be parsed
    #[error("invalid byte amount: {0:?}")]
    InvalidByteAmount(String),

    /// A `hash:` term in a query did not carry a well-formed 64-hex-char digest
    #[error("invalid hash-scoped tag at character {offset}: {text:?}")]
    InvalidHashScopedTag { offset: usize, text: String },

    /// No grammar production matched at the given offset while parsing a query
    #[error("unexpected character at position {offset}")]
    UnexpectedCharacter { offset: usize },

    /// A janitor repair cannot proceed safely and needs an operator's attention
    #[error("manual intervention required: {0}")]
    ManualInterventionRequired(String),

    /// A tag name fails regex validation and cannot be repaired automatically
    #[error("unrepairable tag name: {0:?}")]
    UnrepairableTagName(String),

    /// `files` references a hash absent from `hashes`, or vice versa
    #[error("inconsistent index: {0}")]
    InconsistentIndex(String),
}

/// Result type alias using awtfdb's Error type
pub type Result<T> = std::result::Result<T, Error>;
