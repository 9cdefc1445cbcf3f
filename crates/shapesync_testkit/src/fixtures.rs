//! Test fixtures and database helpers.
//!
//! Provides convenience functions for setting up test databases
//! and inspecting what the engine wrote.

use shapesync_protocol::{row, Row, Value};
use shapesync_storage::sql::quote_ident;
use shapesync_storage::{Executor, Params, SqliteAdapter};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Schema of the `todo` table most tests sync into.
///
/// `task` is `NOT NULL` so a test can force a flush to fail.
pub const TODO_SCHEMA: &str = "CREATE TABLE todo (
    id INTEGER PRIMARY KEY,
    task TEXT NOT NULL,
    done INTEGER NOT NULL DEFAULT 0
)";

/// Schema of the `app_user` table used by multi-shape tests.
pub const USER_SCHEMA: &str = "CREATE TABLE app_user (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL
)";

/// A test database with automatic cleanup.
pub struct TestDatabase {
    /// The database instance.
    pub db: SqliteAdapter,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// Creates a new in-memory test database.
    pub fn memory() -> Self {
        Self {
            db: SqliteAdapter::open_in_memory().expect("Failed to open in-memory database"),
            _temp_dir: None,
        }
    }

    /// Creates a new file-based test database.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = SqliteAdapter::open(temp_dir.path().join("test.db"))
            .expect("Failed to open file database");
        Self {
            db,
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the database path if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir.as_ref().map(|d| d.path().join("test.db"))
    }

    /// Runs schema statements.
    pub fn with_schema(self, sql: &str) -> Self {
        self.db.exec(sql).expect("Failed to create schema");
        self
    }

    /// Takes the adapter out, for handing to an engine.
    ///
    /// # Panics
    ///
    /// Panics for file-based databases, whose directory would be removed.
    /// Use [`TempStore`] when the file has to outlive the adapter.
    pub fn into_inner(self) -> SqliteAdapter {
        assert!(
            self._temp_dir.is_none(),
            "file-based test databases must stay alive; use TempStore"
        );
        self.db
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = SqliteAdapter;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

impl std::ops::DerefMut for TestDatabase {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.db
    }
}

/// A database file in a temporary directory that can be opened repeatedly.
///
/// Used to simulate a process restart: open, sync, close the engine, then
/// open again and resume.
pub struct TempStore {
    dir: TempDir,
}

impl TempStore {
    /// Creates an empty store directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Path of the database file.
    pub fn path(&self) -> PathBuf {
        self.dir.path().join("store.db")
    }

    /// Directory holding the database file.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Opens a new connection to the database file.
    pub fn open(&self) -> SqliteAdapter {
        SqliteAdapter::open(self.path()).expect("Failed to open store")
    }
}

impl Default for TempStore {
    fn default() -> Self {
        Self::new()
    }
}

/// An in-memory database with the `todo` table.
pub fn todo_db() -> SqliteAdapter {
    TestDatabase::memory().with_schema(TODO_SCHEMA).into_inner()
}

/// Runs a test with a temporary in-memory database.
///
/// # Example
///
/// ```rust
/// use shapesync_testkit::{count_rows, with_temp_db, TODO_SCHEMA};
/// use shapesync_storage::Executor;
///
/// with_temp_db(|db| {
///     db.exec(TODO_SCHEMA).unwrap();
///     assert_eq!(count_rows(db, "todo"), 0);
/// });
/// ```
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&mut SqliteAdapter) -> R,
{
    let mut db = TestDatabase::memory();
    f(&mut db)
}

/// Counts the rows of `table`.
pub fn count_rows(db: &dyn Executor, table: &str) -> i64 {
    let sql = format!("SELECT COUNT(*) AS n FROM {}", quote_ident(table));
    db.get(&sql, Params::None)
        .expect("Failed to count rows")
        .and_then(|r| r.get("n").and_then(Value::as_i64))
        .unwrap_or(0)
}

/// Returns every row of `table`, ordered by `order_by`.
pub fn select_all(db: &dyn Executor, table: &str, order_by: &str) -> Vec<Row> {
    let sql = format!(
        "SELECT * FROM {} ORDER BY {}",
        quote_ident(table),
        quote_ident(order_by)
    );
    db.all(&sql, Params::None).expect("Failed to select rows")
}

/// A `todo` row.
pub fn todo(id: i64, task: &str) -> Row {
    row([("id", Value::from(id)), ("task", Value::from(task))])
}

/// The ids in `table`, ascending.
pub fn ids(db: &dyn Executor, table: &str) -> Vec<i64> {
    select_all(db, table, "id")
        .iter()
        .filter_map(|r| r.get("id").and_then(Value::as_i64))
        .collect()
}
