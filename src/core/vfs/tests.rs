//! Integration tests for the web SQLite VFS

use crate::core::config::VfsConfig;
use crate::core::error::VfsError;
use crate::core::fetcher::MemoryFetcher;
use crate::core::vfs::{register_vfs_with, registered_vfs, unregister_vfs, WebVfs};
use crate::{database_uri, open_connection};
use libsqlite3_sys as ffi;
use rusqlite::{Connection, OpenFlags};
use std::sync::Arc;
use tempfile::TempDir;

// Global lock to ensure VFS tests run serially (VFS registration is global in SQLite)
use std::sync::Mutex as StdMutex;
static VFS_TEST_LOCK: StdMutex<()> = StdMutex::new(());

const URL: &str = "https://db.example.com/fixtures/items.db";
const ROWS: i64 = 500;

/// Unregisters on drop so a failing test cannot leak its VFS into the next
struct Registered(Arc<WebVfs>);

impl Drop for Registered {
    fn drop(&mut self) {
        let _ = unregister_vfs();
    }
}

fn test_config() -> VfsConfig {
    VfsConfig {
        cache_bytes: 256 * 4096,
        page_size: 4096,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        ..VfsConfig::default()
    }
}

fn build_database(rows: i64) -> Vec<u8> {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("items.db");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "PRAGMA page_size = 4096;
         CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL, score INTEGER NOT NULL);",
    )
    .unwrap();
    conn.execute_batch("BEGIN").unwrap();
    for i in 0..rows {
        conn.execute(
            "INSERT INTO items (id, name, score) VALUES (?1, ?2, ?3)",
            rusqlite::params![i, format!("item-{:05}-{}", i, "x".repeat(40)), i * 3],
        )
        .unwrap();
    }
    conn.execute_batch("COMMIT").unwrap();
    drop(conn);

    std::fs::read(&path).unwrap()
}

fn register(config: VfsConfig) -> (Arc<MemoryFetcher>, Registered) {
    let fetcher = Arc::new(MemoryFetcher::new());
    fetcher.insert(URL, build_database(ROWS));
    let vfs = register_vfs_with(config, fetcher.clone()).unwrap();
    (fetcher, Registered(vfs))
}

fn count_items(conn: &Connection) -> i64 {
    conn.query_row("SELECT count(*) FROM items", [], |row| row.get(0))
        .unwrap()
}

#[test]
fn test_vfs_query_remote_database() {
    let _lock = VFS_TEST_LOCK.lock(); // Serialize VFS tests
    let (_fetcher, registered) = register(test_config());

    let conn = open_connection(URL, "web", false).unwrap();
    assert_eq!(count_items(&conn), ROWS);

    let total: i64 = conn
        .query_row("SELECT sum(score) FROM items", [], |row| row.get(0))
        .unwrap();
    assert_eq!(total, 3 * ROWS * (ROWS - 1) / 2);

    let name: String = conn
        .query_row("SELECT name FROM items WHERE id = 42", [], |row| row.get(0))
        .unwrap();
    assert!(name.starts_with("item-00042-"));

    assert_eq!(registered.0.open_files(), 1);
    drop(conn);
    assert_eq!(registered.0.open_files(), 0);
}

#[test]
fn test_vfs_registration_is_idempotent() {
    let _lock = VFS_TEST_LOCK.lock(); // Serialize VFS tests
    let (_fetcher, registered) = register(test_config());

    let again = register_vfs_with(test_config(), Arc::new(MemoryFetcher::new())).unwrap();
    assert!(Arc::ptr_eq(&registered.0, &again));
    assert!(registered_vfs().is_some());

    unregister_vfs().unwrap();
    assert!(registered_vfs().is_none());
    // Unregistering twice is fine
    unregister_vfs().unwrap();
}

#[test]
fn test_vfs_unregister_refused_while_open() {
    let _lock = VFS_TEST_LOCK.lock(); // Serialize VFS tests
    let (_fetcher, _registered) = register(test_config());

    let conn = open_connection(URL, "web", false).unwrap();
    assert_eq!(
        unregister_vfs(),
        Err(VfsError::Registration(ffi::SQLITE_BUSY))
    );

    drop(conn);
    unregister_vfs().unwrap();
}

#[test]
fn test_vfs_missing_database() {
    let _lock = VFS_TEST_LOCK.lock(); // Serialize VFS tests
    let (_fetcher, _registered) = register(test_config());

    let uri = database_uri("https://db.example.com/missing.db", "web", true);
    let result = Connection::open_with_flags(
        &uri,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
    )
    .and_then(|conn| conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0)));

    match result {
        Err(rusqlite::Error::SqliteFailure(err, _)) => {
            assert_eq!(err.code, rusqlite::ErrorCode::CannotOpen);
        }
        other => panic!("expected CANTOPEN, got {:?}", other),
    }
}

#[test]
fn test_vfs_read_only_rejects_writes() {
    let _lock = VFS_TEST_LOCK.lock(); // Serialize VFS tests
    let (_fetcher, _registered) = register(test_config());

    let conn = open_connection(URL, "web", false).unwrap();
    let result = conn.execute("DELETE FROM items WHERE id < 10", []);
    assert!(result.is_err());
    assert_eq!(count_items(&conn), ROWS);
}

#[test]
fn test_vfs_concurrent_connections_share_cache() {
    let _lock = VFS_TEST_LOCK.lock(); // Serialize VFS tests
    let (fetcher, registered) = register(test_config());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            std::thread::spawn(|| {
                let conn = open_connection(URL, "web", false).unwrap();
                (count_items(&conn), conn)
            })
        })
        .collect();
    let threads: Vec<_> = handles
        .into_iter()
        .map(|thread| thread.join().unwrap())
        .collect();

    for (count, _) in &threads {
        assert_eq!(*count, ROWS);
    }

    // Cache is large enough that no page is fetched twice
    let stats = registered.0.cache().stats();
    let pages = build_database(ROWS).len() as u64 / 4096;
    assert!(fetcher.fetch_count() <= pages);
    assert!(stats.hits > 0);
    assert_eq!(stats.evictions, 0);
    drop(threads);
}

#[test]
fn test_vfs_overlay_writes_stay_local() {
    let _lock = VFS_TEST_LOCK.lock(); // Serialize VFS tests
    let config = VfsConfig {
        overlay: true,
        ..test_config()
    };
    let (fetcher, _registered) = register(config);

    {
        let conn = open_connection(URL, "web", true).unwrap();
        conn.execute(
            "INSERT INTO items (id, name, score) VALUES (?1, ?2, ?3)",
            rusqlite::params![ROWS, "local-only", 0],
        )
        .unwrap();
        conn.execute("UPDATE items SET score = -1 WHERE id < 5", [])
            .unwrap();

        assert_eq!(count_items(&conn), ROWS + 1);
        let negative: i64 = conn
            .query_row("SELECT count(*) FROM items WHERE score < 0", [], |row| row.get(0))
            .unwrap();
        assert_eq!(negative, 5);
    }

    // Overlay dies with the last handle; the remote object never changed
    let conn = open_connection(URL, "web", true).unwrap();
    assert_eq!(count_items(&conn), ROWS);
    assert!(fetcher.size_request_count() >= 2);
}

#[test]
fn test_vfs_writable_connection_keeps_journal_in_memory() {
    let _lock = VFS_TEST_LOCK.lock(); // Serialize VFS tests
    let config = VfsConfig {
        overlay: true,
        ..test_config()
    };
    let (_fetcher, _registered) = register(config);

    let conn = open_connection(URL, "web", true).unwrap();
    let mode: String = conn
        .query_row("PRAGMA journal_mode", [], |row| row.get(0))
        .unwrap();
    assert_eq!(mode.to_ascii_lowercase(), "memory");

    conn.execute("DELETE FROM items WHERE id < 10", []).unwrap();
    assert_eq!(count_items(&conn), ROWS - 10);
    assert!(!std::path::Path::new("/__web__-journal").exists());
}
