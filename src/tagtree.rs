// src/tagtree.rs

//! Tag-tree propagation: materialises parent-tag implications onto files
//! until a fixed point is reached.

use std::collections::{HashMap, HashSet};

use rusqlite::Connection;
use tracing::debug;

use crate::db::models::{FileEntry, ImplicationEdge, TagSourceRef};
use crate::error::Result;

/// In-memory view of `tag_implications`, indexed by child tag for O(1)
/// expansion during the fixed-point loop.
struct ImplicationMap {
    by_child: HashMap<String, Vec<(String, i64)>>,
}

impl ImplicationMap {
    fn load(conn: &Connection) -> Result<Self> {
        let mut by_child: HashMap<String, Vec<(String, i64)>> = HashMap::new();
        for edge in ImplicationEdge::list_all(conn)? {
            by_child
                .entry(edge.child_tag)
                .or_default()
                .push((edge.parent_tag, edge.row_id));
        }
        Ok(ImplicationMap { by_child })
    }

    fn parents_of(&self, tag: &str) -> &[(String, i64)] {
        self.by_child.get(tag).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Run tag-tree propagation over every file in the store.
pub fn process_tag_tree(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("SELECT DISTINCT file_hash FROM tag_files")?;
    let files: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    drop(stmt);
    process_tag_tree_for(conn, &files)
}

/// Run tag-tree propagation over an explicit list of files. Useful when a
/// caller just tagged a handful of files and doesn't want to rescan the
/// whole store.
pub fn process_tag_tree_for(conn: &Connection, files: &[String]) -> Result<()> {
    let map = ImplicationMap::load(conn)?;

    for file_hash in files {
        let current_tags: HashSet<String> = FileEntry::fetch_tags(conn, file_hash)?
            .into_iter()
            .map(|link| link.core_hash)
            .collect();

        // working set keyed by (parent_tag, row_id): the edge that would
        // justify materialising `parent_tag` on this file.
        let mut working_set: HashMap<String, i64> = HashMap::new();

        loop {
            let before = working_set.len();

            let frontier: Vec<String> = current_tags
                .iter()
                .cloned()
                .chain(working_set.keys().cloned())
                .collect();

            for tag in &frontier {
                for (parent, row_id) in map.parents_of(tag) {
                    working_set.entry(parent.clone()).or_insert(*row_id);
                }
            }

            if working_set.len() == before {
                break;
            }
        }

        for (parent_tag, row_id) in &working_set {
            if current_tags.contains(parent_tag) {
                continue;
            }
            debug!(
                "propagating tag {} onto {} via implication {}",
                parent_tag, file_hash, row_id
            );
            FileEntry::add_tag(
                conn,
                file_hash,
                parent_tag,
                TagSourceRef::tag_parenting(*row_id),
            )?;
        }
    }

    Ok(())
}
