//! Applies change messages to a bound table.
//!
//! Every message becomes at most one parameterized statement, executed on
//! the transaction-scoped executor of the current flush:
//!
//! - insert: `INSERT INTO t (c1, c2) VALUES (?1, ?2)`
//! - update: `UPDATE t SET c = ?1 WHERE pk = ?2`, key columns excluded from
//!   `SET`; an update with nothing left to set is a no-op
//! - delete: `DELETE FROM t WHERE pk = ?1`

use crate::error::{ApplyError, SyncError, SyncResult};
use shapesync_protocol::{ChangeMessage, Operation, Row, Value};
use shapesync_storage::sql::{placeholders, qualified_table, quote_ident};
use shapesync_storage::{Executor, Params};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// SQLite's schema for the main database.
const DEFAULT_SCHEMA: &str = "main";

/// Builds the destination row of a message.
pub type RowMapper = Arc<dyn Fn(&ChangeMessage) -> Row + Send + Sync>;

/// Runs in place of `DELETE FROM <table>` when a shape must be refetched.
pub type RefetchHook = Arc<dyn Fn(&dyn Executor) -> SyncResult<()> + Send + Sync>;

/// How message columns map to table columns.
#[derive(Clone)]
pub enum ColumnMapping {
    /// Renames source columns (`source → destination`); unmapped columns
    /// keep their name.
    Static(BTreeMap<String, String>),
    /// Computes the full destination row from the message.
    Dynamic(RowMapper),
}

impl ColumnMapping {
    /// Builds a static mapping from `(source, destination)` pairs.
    pub fn rename<I, S, D>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, D)>,
        S: Into<String>,
        D: Into<String>,
    {
        ColumnMapping::Static(
            pairs
                .into_iter()
                .map(|(s, d)| (s.into(), d.into()))
                .collect(),
        )
    }

    /// Builds a dynamic mapping.
    pub fn dynamic(f: impl Fn(&ChangeMessage) -> Row + Send + Sync + 'static) -> Self {
        ColumnMapping::Dynamic(Arc::new(f))
    }

    /// Resolves the destination row of a message.
    pub fn resolve(&self, message: &ChangeMessage) -> Row {
        match self {
            ColumnMapping::Dynamic(f) => f(message),
            ColumnMapping::Static(mapping) => message
                .value
                .iter()
                .map(|(column, value)| {
                    let dest = mapping.get(column).unwrap_or(column);
                    (dest.clone(), value.clone())
                })
                .collect(),
        }
    }
}

impl fmt::Debug for ColumnMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnMapping::Static(mapping) => f.debug_tuple("Static").field(mapping).finish(),
            ColumnMapping::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// The table a shape writes into.
#[derive(Clone)]
pub struct TableBinding {
    /// Target table.
    pub table: String,
    /// Optional schema of the target table.
    pub schema: Option<String>,
    /// Primary-key columns, in order.
    pub primary_key: Vec<String>,
    /// Optional column remapping.
    pub map_columns: Option<ColumnMapping>,
    /// Optional replacement for the truncate on `must-refetch`.
    pub on_must_refetch: Option<RefetchHook>,
}

impl TableBinding {
    /// Creates a binding without remapping.
    pub fn new<I, S>(table: impl Into<String>, primary_key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table: table.into(),
            schema: None,
            primary_key: primary_key.into_iter().map(Into::into).collect(),
            map_columns: None,
            on_must_refetch: None,
        }
    }

    /// Sets the table schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Sets the column remapping.
    pub fn with_map_columns(mut self, mapping: ColumnMapping) -> Self {
        self.map_columns = Some(mapping);
        self
    }

    /// Sets the refetch hook.
    pub fn with_on_must_refetch(
        mut self,
        hook: impl Fn(&dyn Executor) -> SyncResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_must_refetch = Some(Arc::new(hook));
        self
    }

    /// The quoted, schema-qualified table name used in statements.
    pub fn qualified_name(&self) -> String {
        qualified_table(self.schema.as_deref(), &self.table)
    }

    /// The name the table is registered under while bound.
    ///
    /// `main` is the default schema, so `main.todo` and `todo` name the
    /// same table.
    pub fn registry_name(&self) -> String {
        match self.schema.as_deref() {
            Some(schema) if schema != DEFAULT_SCHEMA => format!("{schema}.{}", self.table),
            _ => self.table.clone(),
        }
    }

    /// Resolves the destination row of a message.
    pub fn resolve_row(&self, message: &ChangeMessage) -> Row {
        match &self.map_columns {
            Some(mapping) => mapping.resolve(message),
            None => message.value.clone(),
        }
    }

    pub(crate) fn validate(&self) -> SyncResult<()> {
        if self.table.is_empty() {
            return Err(SyncError::InvalidOptions(
                "table name must not be empty".into(),
            ));
        }
        if self.primary_key.is_empty() {
            return Err(SyncError::InvalidOptions(format!(
                "primary key of table {} must not be empty",
                self.table
            )));
        }
        Ok(())
    }

    /// Empties the table for a refetch.
    pub(crate) fn truncate(&self, tx: &dyn Executor) -> SyncResult<()> {
        match &self.on_must_refetch {
            Some(hook) => hook(tx),
            None => {
                tx.exec(&format!("DELETE FROM {};", self.qualified_name()))?;
                Ok(())
            }
        }
    }
}

impl fmt::Debug for TableBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableBinding")
            .field("table", &self.table)
            .field("schema", &self.schema)
            .field("primary_key", &self.primary_key)
            .field("map_columns", &self.map_columns)
            .field("on_must_refetch", &self.on_must_refetch.is_some())
            .finish()
    }
}

/// What applying one message did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// One statement was executed.
    Executed,
    /// The message needed no statement (an update of key columns only).
    NoOp,
    /// The operation is not understood and was ignored.
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
enum Plan {
    Statement { sql: String, params: Vec<Value> },
    NoOp,
    Skip,
}

/// Applies one change message inside an open transaction.
///
/// # Errors
///
/// Returns [`ApplyError`] when the row lacks a key column or an insert has
/// no columns, and a storage error when the statement fails. Either aborts
/// the enclosing flush.
pub fn apply_message(
    tx: &dyn Executor,
    binding: &TableBinding,
    message: &ChangeMessage,
) -> SyncResult<Applied> {
    match plan(binding, message)? {
        Plan::Statement { sql, params } => {
            tx.run(&sql, Params::from(&params))?;
            Ok(Applied::Executed)
        }
        Plan::NoOp => Ok(Applied::NoOp),
        Plan::Skip => {
            tracing::warn!(
                table = %binding.table,
                key = %message.key,
                operation = %message.operation,
                "skipping change message with unknown operation"
            );
            Ok(Applied::Skipped)
        }
    }
}

fn plan(binding: &TableBinding, message: &ChangeMessage) -> Result<Plan, ApplyError> {
    let table = binding.qualified_name();
    let mut row = binding.resolve_row(message);

    match &message.operation {
        Operation::Insert => {
            if row.is_empty() {
                return Err(ApplyError::EmptyRow {
                    table: binding.table.clone(),
                });
            }
            let columns: Vec<String> = row.keys().map(|c| quote_ident(c)).collect();
            let sql = format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                columns.join(", "),
                placeholders(1, columns.len())
            );
            Ok(Plan::Statement {
                sql,
                params: row.into_values().collect(),
            })
        }
        Operation::Update => {
            let keys = take_keys(binding, &mut row)?;
            if row.is_empty() {
                return Ok(Plan::NoOp);
            }
            let set: Vec<String> = row
                .keys()
                .enumerate()
                .map(|(i, c)| format!("{} = ?{}", quote_ident(c), i + 1))
                .collect();
            let sql = format!(
                "UPDATE {table} SET {} WHERE {}",
                set.join(", "),
                key_predicate(binding, set.len() + 1)
            );
            let mut params: Vec<Value> = row.into_values().collect();
            params.extend(keys);
            Ok(Plan::Statement { sql, params })
        }
        Operation::Delete => {
            let keys = take_keys(binding, &mut row)?;
            let sql = format!("DELETE FROM {table} WHERE {}", key_predicate(binding, 1));
            Ok(Plan::Statement { sql, params: keys })
        }
        Operation::Unknown(_) => Ok(Plan::Skip),
    }
}

// Removes the key columns from `row`, returning their values in key order.
fn take_keys(binding: &TableBinding, row: &mut Row) -> Result<Vec<Value>, ApplyError> {
    binding
        .primary_key
        .iter()
        .map(|column| {
            row.remove(column).ok_or_else(|| ApplyError::MissingPrimaryKey {
                table: binding.table.clone(),
                column: column.clone(),
            })
        })
        .collect()
}

fn key_predicate(binding: &TableBinding, first: usize) -> String {
    binding
        .primary_key
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ?{}", quote_ident(c), first + i))
        .collect::<Vec<_>>()
        .join(" AND ")
}
