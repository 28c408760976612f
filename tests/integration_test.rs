// tests/integration_test.rs

//! Integration tests for awtfdb.
//!
//! These tests verify end-to-end functionality across modules: store
//! lifecycle, the domain API, tag-tree propagation, the query compiler, and
//! the janitor, wired together the way a real caller would use them.

use std::io::Write;

use awtfdb::db::models::{
    FileCreateOpts, ImplicationEdge, LibraryConfig, Pool, TagName, TagSourceRef,
};
use awtfdb::db::Store;
use awtfdb::janitor::{self, JanitorOptions};
use awtfdb::query;
use awtfdb::tagtree;
use tempfile::NamedTempFile;

#[test]
fn test_store_lifecycle() {
    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file.path().to_str().unwrap().to_string();
    drop(temp_file);

    let store = Store::create(&db_path).expect("store creation should succeed");
    assert!(std::path::Path::new(&db_path).exists());

    let value: i32 = store
        .connection()
        .query_row("SELECT 1", [], |row| row.get(0))
        .unwrap();
    assert_eq!(value, 1);

    store.shutdown_pragmas().unwrap();
    drop(store);

    let reopened = Store::open(&db_path);
    assert!(reopened.is_ok(), "reopening an existing store should succeed");
}

#[test]
fn test_store_creates_parent_directories() {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir
        .path()
        .join("nested/path/to/awtf.db")
        .to_str()
        .unwrap()
        .to_string();

    let result = Store::create(&db_path);
    assert!(result.is_ok(), "should create parent directories");
    assert!(std::path::Path::new(&db_path).exists());
}

#[test]
fn test_store_pragmas_are_set() {
    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file.path().to_str().unwrap().to_string();
    drop(temp_file);

    let store = Store::create(&db_path).unwrap();

    let foreign_keys: i32 = store
        .connection()
        .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
        .unwrap();
    assert_eq!(foreign_keys, 1, "foreign keys should be enabled");

    let journal_mode: String = store
        .connection()
        .query_row("PRAGMA journal_mode", [], |row| row.get(0))
        .unwrap();
    assert_eq!(journal_mode.to_lowercase(), "wal");
}

#[test]
fn test_index_tag_query_and_propagate_end_to_end() {
    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file.path().to_str().unwrap().to_string();
    drop(temp_file);
    let mut store = Store::create(&db_path).unwrap();
    let conn = store.connection();
    let config = LibraryConfig::new();

    let mut photo = tempfile::NamedTempFile::new().unwrap();
    photo.write_all(b"a cat photo").unwrap();
    photo.flush().unwrap();

    let file = awtfdb::db::models::FileEntry::create_from_path(
        conn,
        photo.path(),
        FileCreateOpts::default(),
    )
    .unwrap();

    let cat = TagName::create_named_tag(conn, &config, "cat", "en", None).unwrap();
    let animal = TagName::create_named_tag(conn, &config, "animal", "en", None).unwrap();
    ImplicationEdge::create(conn, &cat.core_hash, &animal.core_hash).unwrap();

    awtfdb::db::models::FileEntry::add_tag(conn, &file.file_hash, &cat.core_hash, TagSourceRef::manual())
        .unwrap();

    tagtree::process_tag_tree(conn).unwrap();

    let tags = awtfdb::db::models::FileEntry::fetch_tags(conn, &file.file_hash).unwrap();
    assert!(tags.iter().any(|t| t.core_hash == cat.core_hash));
    assert!(tags.iter().any(|t| t.core_hash == animal.core_hash));

    let matches = query::resolve_and_execute_files(conn, "animal").unwrap();
    assert!(matches.iter().any(|f| f.file_hash == file.file_hash));

    let none = query::resolve_and_execute_files(conn, "animal -cat").unwrap();
    assert!(none.is_empty());

    let report = janitor::run(store.connection_mut(), &config, &JanitorOptions::default(), None).unwrap();
    assert_eq!(report.problem_count(), 0);
}

#[test]
fn test_pool_ordering_across_add_and_remove() {
    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file.path().to_str().unwrap().to_string();
    drop(temp_file);
    let mut store = Store::create(&db_path).unwrap();

    // Pool entries reference `hashes(id)` with foreign keys enforced, so
    // entries must be real indexed files, not fabricated id strings.
    let index = |store: &Store, contents: &[u8]| {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(contents).unwrap();
        tmp.flush().unwrap();
        awtfdb::db::models::FileEntry::create_from_path(
            store.connection(),
            tmp.path(),
            FileCreateOpts::default(),
        )
        .unwrap()
    };
    let f1 = index(&store, b"pool file one");
    let f2 = index(&store, b"pool file two");
    let f3 = index(&store, b"pool file three");

    let pool = Pool::create(store.connection(), "favorites").unwrap();
    Pool::add_file(store.connection(), &pool.pool_hash, &f3.file_hash).unwrap();
    Pool::add_file(store.connection(), &pool.pool_hash, &f1.file_hash).unwrap();
    Pool::add_file(store.connection(), &pool.pool_hash, &f2.file_hash).unwrap();
    assert_eq!(
        Pool::fetch_files(store.connection(), &pool.pool_hash).unwrap(),
        vec![f3.file_hash.clone(), f1.file_hash.clone(), f2.file_hash.clone()]
    );

    Pool::remove_file(store.connection(), &pool.pool_hash, &f1.file_hash).unwrap();
    assert_eq!(
        Pool::fetch_files(store.connection(), &pool.pool_hash).unwrap(),
        vec![f3.file_hash.clone(), f2.file_hash.clone()]
    );

    Pool::add_file_at_index(store.connection_mut(), &pool.pool_hash, &f1.file_hash, 0).unwrap();
    assert_eq!(
        Pool::fetch_files(store.connection(), &pool.pool_hash).unwrap(),
        vec![f1.file_hash.clone(), f3.file_hash.clone(), f2.file_hash.clone()]
    );
}
