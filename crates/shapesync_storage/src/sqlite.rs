//! SQLite storage adapter.

use crate::adapter::{Executor, Params, Statement, StorageAdapter};
use crate::error::{StorageError, StorageResult};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{CachedStatement, Connection};
use shapesync_protocol::{Row, Value};
use std::path::Path;

/// A storage adapter over a single SQLite connection.
///
/// Statements are prepared through the connection's statement cache, so the
/// applier's repeated `INSERT`/`UPDATE` text is compiled once per shape.
///
/// # Example
///
/// ```rust
/// use shapesync_storage::{Executor, Params, SqliteAdapter, StorageAdapter, StorageError};
/// use shapesync_protocol::Value;
///
/// let mut db = SqliteAdapter::open_in_memory().unwrap();
/// db.exec("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)").unwrap();
/// db.transaction(|tx| {
///     tx.run("INSERT INTO t (id, name) VALUES (?1, ?2)", Params::from(&[Value::from(1), Value::from("a")]))?;
///     Ok::<_, StorageError>(())
/// })
/// .unwrap();
/// assert_eq!(db.all("SELECT * FROM t", Params::None).unwrap().len(), 1);
/// ```
#[derive(Debug)]
pub struct SqliteAdapter {
    conn: Connection,
}

impl SqliteAdapter {
    /// Opens (or creates) a database file.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Ok(Self::from_connection(Connection::open(path)?))
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> StorageResult<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    /// Wraps an existing connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl Executor for SqliteAdapter {
    fn exec(&self, sql: &str) -> StorageResult<()> {
        self.conn.exec(sql)
    }

    fn prepare<'a>(&'a self, sql: &str) -> StorageResult<Box<dyn Statement + 'a>> {
        Executor::prepare(&self.conn, sql)
    }
}

impl StorageAdapter for SqliteAdapter {
    fn transaction<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&dyn Executor) -> Result<T, E>,
        E: From<StorageError>,
    {
        let tx = self.conn.transaction().map_err(StorageError::from)?;
        match f(&*tx) {
            Ok(value) => {
                tx.commit().map_err(StorageError::from)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::warn!(error = %rollback_err, "rollback failed");
                }
                Err(e)
            }
        }
    }

    fn close(self) -> StorageResult<()> {
        self.conn.close().map_err(|(_, e)| StorageError::from(e))
    }
}

// Transactions deref to `Connection`, so this also serves as the
// transaction-scoped executor.
impl Executor for Connection {
    fn exec(&self, sql: &str) -> StorageResult<()> {
        self.execute_batch(sql)?;
        Ok(())
    }

    fn prepare<'a>(&'a self, sql: &str) -> StorageResult<Box<dyn Statement + 'a>> {
        let stmt = self.prepare_cached(sql)?;
        Ok(Box::new(SqliteStatement { stmt }))
    }
}

struct SqliteStatement<'conn> {
    stmt: CachedStatement<'conn>,
}

impl SqliteStatement<'_> {
    fn bind(&mut self, params: Params<'_>) -> StorageResult<()> {
        match params {
            Params::None => {
                let expected = self.stmt.parameter_count();
                if expected != 0 {
                    return Err(StorageError::ParameterCount {
                        expected,
                        actual: 0,
                    });
                }
            }
            Params::Positional(values) => {
                let expected = self.stmt.parameter_count();
                if expected != values.len() {
                    return Err(StorageError::ParameterCount {
                        expected,
                        actual: values.len(),
                    });
                }
                for (i, value) in values.iter().enumerate() {
                    self.stmt.raw_bind_parameter(i + 1, to_sql(value))?;
                }
            }
            Params::Named(values) => {
                for (name, value) in values {
                    let index = self
                        .stmt
                        .parameter_index(name)?
                        .ok_or_else(|| StorageError::UnknownParameter((*name).to_owned()))?;
                    self.stmt.raw_bind_parameter(index, to_sql(value))?;
                }
            }
        }
        Ok(())
    }

    fn collect(&mut self, limit: Option<usize>) -> StorageResult<Vec<Row>> {
        let names: Vec<String> = self
            .stmt
            .column_names()
            .into_iter()
            .map(str::to_owned)
            .collect();

        let mut out = Vec::new();
        let mut rows = self.stmt.raw_query();
        while let Some(row) = rows.next()? {
            let mut record = Row::new();
            for (i, name) in names.iter().enumerate() {
                record.insert(name.clone(), from_sql(row.get_ref(i)?));
            }
            out.push(record);
            if limit.is_some_and(|l| out.len() >= l) {
                break;
            }
        }
        Ok(out)
    }
}

impl Statement for SqliteStatement<'_> {
    fn run(&mut self, params: Params<'_>) -> StorageResult<usize> {
        self.bind(params)?;
        Ok(self.stmt.raw_execute()?)
    }

    fn get(&mut self, params: Params<'_>) -> StorageResult<Option<Row>> {
        self.bind(params)?;
        Ok(self.collect(Some(1))?.into_iter().next())
    }

    fn all(&mut self, params: Params<'_>) -> StorageResult<Vec<Row>> {
        self.bind(params)?;
        self.collect(None)
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Real(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}
