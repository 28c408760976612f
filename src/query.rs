// src/query.rs

//! The tag-query mini-language: a small left-to-right scanner that
//! translates a query string into a parameterised SQL statement against
//! `tag_files`.
//!
//! The grammar is `query = term (op term)*`, where `op` is one of `or`
//! (` | `), `and` (a single space) or `not` (` -`), and `term` is either a
//! bare tag (`[a-zA-Z0-9_\-:;&*()]+`) or a double-quoted raw tag. Tokens are
//! matched against a fixed priority of regexes at each scan position.

use std::sync::LazyLock;

use regex::Regex;
use rusqlite::Connection;
use rusqlite::types::Value;

use crate::db::models::{FileEntry, Hash, TagName};
use crate::error::{Error, Result};

static OR_OP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*\|\s*").unwrap());
static NOT_OP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s+-").unwrap());
static AND_OP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s+").unwrap());
static RAW_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new("^\"([^\"]*)\"").unwrap());
static BARE_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_\-:;&*()]+").unwrap());
static HEX_64: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{64}$").unwrap());
static LOW_TAGS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^system:low_tags:(\d+)$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    Or,
    And,
    Not,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    Tag(String),
    RawTag(String),
    HashScoped(Vec<u8>),
    LowTags(u64),
    Random,
}

/// An argument a compiled query still needs resolved before it can be
/// bound: a tag's text (resolved to a core id) or a file's raw digest
/// (resolved to a hash id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryArg {
    TagText(String),
    RawFileHash(Vec<u8>),
}

/// A compiled query: the SQL text plus the positional arguments it still
/// needs resolved (by the caller, via [`resolve_and_execute`] or by hand).
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub sql: String,
    pub arguments: Vec<QueryArg>,
}

/// Parse `text` and translate it into a [`CompiledQuery`].
pub fn compile(text: &str) -> Result<CompiledQuery> {
    let tokens = parse(text)?;
    Ok(translate(&tokens))
}

fn parse(text: &str) -> Result<Vec<(Option<Op>, Term)>> {
    let mut tokens = Vec::new();
    let mut pos = 0usize;

    if text.trim().is_empty() {
        return Ok(tokens);
    }

    let (first_term, next) = parse_term(text, pos)?;
    tokens.push((None, first_term));
    pos = next;

    while pos < text.len() {
        let rest = &text[pos..];
        let (op, op_len) = if let Some(m) = OR_OP.find(rest) {
            (Op::Or, m.end())
        } else if let Some(m) = NOT_OP.find(rest) {
            (Op::Not, m.end())
        } else if let Some(m) = AND_OP.find(rest) {
            (Op::And, m.end())
        } else {
            return Err(Error::UnexpectedCharacter { offset: pos });
        };
        pos += op_len;

        let (term, next) = parse_term(text, pos)?;
        tokens.push((Some(op), term));
        pos = next;
    }

    Ok(tokens)
}

fn parse_term(text: &str, pos: usize) -> Result<(Term, usize)> {
    let rest = &text[pos..];
    if rest.starts_with('"') {
        return match RAW_TAG.captures(rest) {
            Some(caps) => {
                let whole = caps.get(0).unwrap();
                let inner = caps.get(1).unwrap().as_str().to_string();
                Ok((Term::RawTag(inner), pos + whole.end()))
            }
            None => Err(Error::UnexpectedCharacter { offset: pos }),
        };
    }

    let Some(m) = BARE_TAG.find(rest) else {
        return Err(Error::UnexpectedCharacter { offset: pos });
    };
    let token = m.as_str();
    let end = pos + m.end();

    if let Some(hex) = token.strip_prefix("hash:") {
        if hex.len() == 64 && HEX_64.is_match(hex) {
            let bytes = hex_decode(hex);
            return Ok((Term::HashScoped(bytes), end));
        }
        return Err(Error::InvalidHashScopedTag {
            offset: end,
            text: hex.to_string(),
        });
    }

    if token == "system:random" {
        return Ok((Term::Random, end));
    }

    if let Some(caps) = LOW_TAGS.captures(token) {
        let n: u64 = caps[1].parse().unwrap_or(0);
        return Ok((Term::LowTags(n), end));
    }

    Ok((Term::Tag(token.to_string()), end))
}

fn hex_decode(hex: &str) -> Vec<u8> {
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap_or(0))
        .collect()
}

fn translate(tokens: &[(Option<Op>, Term)]) -> CompiledQuery {
    let mut sql = String::from("select distinct file_hash from tag_files");
    let mut arguments = Vec::new();

    if tokens.is_empty() {
        return CompiledQuery { sql, arguments };
    }

    sql.push_str(" where");
    let mut have_expr_in_current_select = false;

    for (op, term) in tokens {
        match op {
            None => {}
            Some(Op::Or) => sql.push_str(" or"),
            Some(Op::And) => {
                sql.push_str(" intersect select file_hash from tag_files where");
                have_expr_in_current_select = false;
            }
            Some(Op::Not) => {
                if !have_expr_in_current_select {
                    sql.push_str(" true");
                }
                sql.push_str(" except select file_hash from tag_files where");
                have_expr_in_current_select = false;
            }
        }

        let fragment = match term {
            Term::Tag(text) | Term::RawTag(text) => {
                arguments.push(QueryArg::TagText(text.clone()));
                " core_hash = ?".to_string()
            }
            Term::HashScoped(bytes) => {
                arguments.push(QueryArg::RawFileHash(bytes.clone()));
                " file_hash = ?".to_string()
            }
            Term::LowTags(n) => format!(
                " (select count(*) from tag_files tf2 where tf2.file_hash = tag_files.file_hash) < {n}"
            ),
            Term::Random => {
                " core_hash = (select core_hash from tag_names order by random() limit 1)".to_string()
            }
        };
        sql.push_str(&fragment);
        have_expr_in_current_select = true;
    }

    CompiledQuery { sql, arguments }
}

/// Resolve a compiled query's arguments against the store and execute it,
/// returning the matching file hash ids. Tag texts that don't resolve to a
/// known tag are a hard error; raw file hashes that don't resolve bind a
/// placeholder so the query returns zero rows rather than failing.
pub fn resolve_and_execute(conn: &Connection, query_text: &str) -> Result<Vec<String>> {
    let compiled = compile(query_text)?;
    let mut bound = Vec::with_capacity(compiled.arguments.len());

    for arg in &compiled.arguments {
        match arg {
            QueryArg::TagText(text) => {
                let resolved = TagName::fetch_named_tag(conn, text, "en")?
                    .ok_or_else(|| Error::UnknownTag(text.clone()))?;
                bound.push(Value::Text(resolved.core.core_hash));
            }
            QueryArg::RawFileHash(digest) => match Hash::find_by_data(conn, digest)? {
                Some(hash) => bound.push(Value::Text(hash.id)),
                None => bound.push(Value::Text(String::new())),
            },
        }
    }

    let mut stmt = conn.prepare(&compiled.sql)?;
    let params = rusqlite::params_from_iter(bound.iter());
    let rows = stmt
        .query_map(params, |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Convenience wrapper resolving a query directly to [`FileEntry`] rows.
/// Files whose hash has no associated `files` row (shouldn't happen under
/// normal operation) are silently skipped.
pub fn resolve_and_execute_files(conn: &Connection, query_text: &str) -> Result<Vec<FileEntry>> {
    let hashes = resolve_and_execute(conn, query_text)?;
    let mut files = Vec::with_capacity(hashes.len());
    for hash in hashes {
        if let Some(file) = FileEntry::fetch_by_hash(conn, &hash)? {
            files.push(file);
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_and_or_mix() {
        let compiled = compile(r#"a b | "cd"|e"#).unwrap();
        assert_eq!(
            compiled.sql,
            "select distinct file_hash from tag_files where core_hash = ? \
             intersect select file_hash from tag_files where core_hash = ? \
             or core_hash = ? or core_hash = ?"
        );
        assert_eq!(
            compiled.arguments,
            vec![
                QueryArg::TagText("a".to_string()),
                QueryArg::TagText("b".to_string()),
                QueryArg::TagText("cd".to_string()),
                QueryArg::TagText("e".to_string()),
            ]
        );
    }

    #[test]
    fn test_compile_hash_scoped_tag() {
        let hex = "a".repeat(64);
        let compiled = compile(&format!("hash:{hex}")).unwrap();
        assert_eq!(
            compiled.sql,
            "select distinct file_hash from tag_files where file_hash = ?"
        );
        assert_eq!(compiled.arguments, vec![QueryArg::RawFileHash(vec![0xaa; 32])]);
    }

    #[test]
    fn test_compile_empty_query() {
        let compiled = compile("").unwrap();
        assert_eq!(compiled.sql, "select distinct file_hash from tag_files");
        assert!(compiled.arguments.is_empty());
    }

    #[test]
    fn test_unterminated_raw_tag_errors_at_quote() {
        let err = compile(r#"a "cd"#).unwrap_err();
        assert!(matches!(err, Error::UnexpectedCharacter { offset: 2 }));
    }

    #[test]
    fn test_malformed_hash_scoped_tag() {
        let err = compile("asd hash:AaaAAaaAaaA").unwrap_err();
        match err {
            Error::InvalidHashScopedTag { offset, text } => {
                assert_eq!(offset, 20);
                assert_eq!(text, "AaaAAaaAaaA");
            }
            other => panic!("expected InvalidHashScopedTag, got {other:?}"),
        }
    }

    #[test]
    fn test_not_operator_emits_except() {
        let compiled = compile("a -b").unwrap();
        assert_eq!(
            compiled.sql,
            "select distinct file_hash from tag_files where core_hash = ? \
             except select file_hash from tag_files where core_hash = ?"
        );
    }

    #[test]
    fn test_system_low_tags_fragment() {
        let compiled = compile("system:low_tags:3").unwrap();
        assert!(compiled.sql.contains("< 3"));
        assert!(compiled.arguments.is_empty());
    }

    #[test]
    fn test_system_random_fragment() {
        let compiled = compile("system:random").unwrap();
        assert!(compiled.sql.contains("order by random() limit 1"));
        assert!(compiled.arguments.is_empty());
    }
}
