//! Storage adapter trait definitions.

use crate::error::{StorageError, StorageResult};
use shapesync_protocol::{Row, Value};

/// Parameters bound to a prepared statement.
#[derive(Debug, Clone, Copy, Default)]
pub enum Params<'a> {
    /// No parameters.
    #[default]
    None,
    /// Values bound to `?1, ?2, ...` in order.
    Positional(&'a [Value]),
    /// Values bound by placeholder name, including its prefix (`:id`, `$id`).
    Named(&'a [(&'a str, Value)]),
}

impl<'a> Params<'a> {
    /// Positional parameters.
    pub fn positional(values: &'a [Value]) -> Self {
        Params::Positional(values)
    }

    /// Named parameters.
    pub fn named(values: &'a [(&'a str, Value)]) -> Self {
        Params::Named(values)
    }

    /// Number of supplied parameters.
    pub fn len(&self) -> usize {
        match self {
            Params::None => 0,
            Params::Positional(v) => v.len(),
            Params::Named(v) => v.len(),
        }
    }

    /// Returns true if no parameters are supplied.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'a> From<&'a [Value]> for Params<'a> {
    fn from(values: &'a [Value]) -> Self {
        Params::Positional(values)
    }
}

impl<'a> From<&'a Vec<Value>> for Params<'a> {
    fn from(values: &'a Vec<Value>) -> Self {
        Params::Positional(values)
    }
}

impl<'a, const N: usize> From<&'a [Value; N]> for Params<'a> {
    fn from(values: &'a [Value; N]) -> Self {
        Params::Positional(values)
    }
}

/// A prepared statement.
pub trait Statement {
    /// Executes the statement and returns the number of changed rows.
    fn run(&mut self, params: Params<'_>) -> StorageResult<usize>;

    /// Executes the statement and returns the first result row, if any.
    fn get(&mut self, params: Params<'_>) -> StorageResult<Option<Row>>;

    /// Executes the statement and returns every result row.
    fn all(&mut self, params: Params<'_>) -> StorageResult<Vec<Row>>;
}

/// Something statements can be executed against: an open connection or a
/// transaction scope.
///
/// The `run`, `get` and `all` shortcuts prepare the statement and execute it
/// once.
pub trait Executor {
    /// Executes one or more `;`-separated statements without parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails. Statements before the
    /// failing one stay applied unless the caller is inside a transaction.
    fn exec(&self, sql: &str) -> StorageResult<()>;

    /// Prepares a statement for repeated execution.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement text is invalid.
    fn prepare<'a>(&'a self, sql: &str) -> StorageResult<Box<dyn Statement + 'a>>;

    /// Prepares and runs a statement.
    fn run(&self, sql: &str, params: Params<'_>) -> StorageResult<usize> {
        self.prepare(sql)?.run(params)
    }

    /// Prepares a statement and returns its first row.
    fn get(&self, sql: &str, params: Params<'_>) -> StorageResult<Option<Row>> {
        self.prepare(sql)?.get(params)
    }

    /// Prepares a statement and returns all rows.
    fn all(&self, sql: &str, params: Params<'_>) -> StorageResult<Vec<Row>> {
        self.prepare(sql)?.all(params)
    }
}

/// A handle to the embedded database.
///
/// # Invariants
///
/// - `transaction` commits only when `f` returns `Ok`
/// - any `Err` from `f` rolls back every statement `f` executed, and the
///   error is returned unchanged
/// - a panic inside `f` also rolls back (the transaction guard rolls back
///   when dropped)
/// - adapters are `Send` so they can live behind an async mutex
///
/// # Implementors
///
/// - [`super::SqliteAdapter`] - SQLite through `rusqlite`
pub trait StorageAdapter: Executor + Send + 'static {
    /// Runs `f` inside a transaction.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, or a storage error converted into `E` if
    /// the transaction cannot be opened or committed.
    fn transaction<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&dyn Executor) -> Result<T, E>,
        E: From<StorageError>;

    /// Releases the database handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be closed cleanly.
    fn close(self) -> StorageResult<()>
    where
        Self: Sized;
}
