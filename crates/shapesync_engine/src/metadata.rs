//! Persisted subscription state.
//!
//! Two metadata tables live next to the synced data, named after the
//! engine's metadata schema prefix:
//!
//! - `<schema>_shape_subscriptions_metadata (shape_key, handle, "offset")`
//!   holds the position of single-shape subscriptions
//! - `<schema>_subscriptions_metadata (key, shape_metadata, last_lsn)` holds
//!   the per-shape positions of a multi-shape subscription as JSON, plus the
//!   highest LSN applied so far as a decimal string
//!
//! State rows are written inside the flush transaction that applies the data
//! they describe, so a crash can never leave them ahead of the table.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use shapesync_protocol::{Offset, Row, Value};
use shapesync_storage::sql::quote_ident;
use shapesync_storage::{Executor, Params};
use std::collections::BTreeMap;

/// The resume position of one shape stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeSubscriptionState {
    /// Server-assigned shape handle.
    pub handle: String,
    /// Offset of the last flushed message.
    pub offset: Offset,
}

impl ShapeSubscriptionState {
    /// Creates a position.
    pub fn new(handle: impl Into<String>, offset: impl Into<Offset>) -> Self {
        Self {
            handle: handle.into(),
            offset: offset.into(),
        }
    }
}

/// Persisted state of a multi-shape subscription.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubscriptionState {
    /// Subscription key.
    pub key: String,
    /// Position of every shape in the group, by shape name.
    pub shape_metadata: BTreeMap<String, ShapeSubscriptionState>,
    /// Highest LSN applied for this subscription.
    pub last_lsn: u64,
}

/// Where a subscription's position is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StateKey {
    /// Single-shape table, by shape key.
    Shape(String),
    /// Multi-shape table, by subscription key.
    Subscription(String),
}

impl StateKey {
    pub(crate) fn as_str(&self) -> &str {
        match self {
            StateKey::Shape(k) | StateKey::Subscription(k) => k,
        }
    }
}

/// Reads and writes the metadata tables of one schema prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStore {
    shapes_table: String,
    subscriptions_table: String,
}

impl SubscriptionStore {
    /// Creates a store for the given metadata schema prefix.
    pub fn new(schema: &str) -> Self {
        Self {
            shapes_table: quote_ident(&format!("{schema}_shape_subscriptions_metadata")),
            subscriptions_table: quote_ident(&format!("{schema}_subscriptions_metadata")),
        }
    }

    /// Creates both metadata tables if they do not exist.
    pub fn migrate(&self, db: &dyn Executor) -> SyncResult<()> {
        db.exec(&format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                 shape_key TEXT PRIMARY KEY, \
                 handle TEXT NOT NULL, \
                 \"offset\" TEXT NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS {} (\
                 key TEXT PRIMARY KEY, \
                 shape_metadata BLOB NOT NULL, \
                 last_lsn TEXT NOT NULL\
             );",
            self.shapes_table, self.subscriptions_table
        ))?;
        Ok(())
    }

    /// Loads the state of a multi-shape subscription.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Consistency`] if more than one row matches the
    /// key, and [`SyncError::Metadata`] if the row cannot be decoded.
    pub fn get(&self, db: &dyn Executor, key: &str) -> SyncResult<Option<SubscriptionState>> {
        let rows = db.all(
            &format!(
                "SELECT key, shape_metadata, last_lsn FROM {} WHERE key = ?1",
                self.subscriptions_table
            ),
            Params::from(&[Value::from(key)]),
        )?;
        let Some(row) = single_row(key, rows)? else {
            return Ok(None);
        };

        let shape_metadata = match row.get("shape_metadata") {
            Some(Value::Text(json)) => serde_json::from_str(json),
            Some(Value::Blob(json)) => serde_json::from_slice(json),
            other => {
                return Err(SyncError::Metadata(format!(
                    "shape_metadata for {key} is {}",
                    other.map_or("missing", Value::type_name)
                )))
            }
        }
        .map_err(|e| SyncError::Metadata(format!("shape_metadata for {key}: {e}")))?;

        Ok(Some(SubscriptionState {
            key: key.to_owned(),
            shape_metadata,
            last_lsn: parse_last_lsn(key, row.get("last_lsn"))?,
        }))
    }

    /// Inserts or replaces the state of a multi-shape subscription.
    pub fn update(
        &self,
        db: &dyn Executor,
        key: &str,
        shape_metadata: &BTreeMap<String, ShapeSubscriptionState>,
        last_lsn: u64,
    ) -> SyncResult<()> {
        let json = serde_json::to_string(shape_metadata)
            .map_err(|e| SyncError::Metadata(e.to_string()))?;
        db.run(
            &format!(
                "INSERT INTO {} (key, shape_metadata, last_lsn) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(key) DO UPDATE SET \
                 shape_metadata = excluded.shape_metadata, last_lsn = excluded.last_lsn",
                self.subscriptions_table
            ),
            Params::from(&[
                Value::from(key),
                Value::Text(json),
                Value::Text(last_lsn.to_string()),
            ]),
        )?;
        Ok(())
    }

    /// Removes the state of a multi-shape subscription.
    pub fn delete(&self, db: &dyn Executor, key: &str) -> SyncResult<()> {
        db.run(
            &format!("DELETE FROM {} WHERE key = ?1", self.subscriptions_table),
            Params::from(&[Value::from(key)]),
        )?;
        Ok(())
    }

    /// Loads the position of a single-shape subscription.
    pub fn get_shape(
        &self,
        db: &dyn Executor,
        shape_key: &str,
    ) -> SyncResult<Option<ShapeSubscriptionState>> {
        let rows = db.all(
            &format!(
                "SELECT handle, \"offset\" FROM {} WHERE shape_key = ?1",
                self.shapes_table
            ),
            Params::from(&[Value::from(shape_key)]),
        )?;
        let Some(row) = single_row(shape_key, rows)? else {
            return Ok(None);
        };
        let text = |column: &str| {
            row.get(column)
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| SyncError::Metadata(format!("{column} for {shape_key} is not text")))
        };
        Ok(Some(ShapeSubscriptionState {
            handle: text("handle")?,
            offset: Offset::new(text("offset")?),
        }))
    }

    /// Inserts or replaces the position of a single-shape subscription.
    pub fn update_shape(
        &self,
        db: &dyn Executor,
        shape_key: &str,
        state: &ShapeSubscriptionState,
    ) -> SyncResult<()> {
        db.run(
            &format!(
                "INSERT INTO {} (shape_key, handle, \"offset\") VALUES (?1, ?2, ?3) \
                 ON CONFLICT(shape_key) DO UPDATE SET \
                 handle = excluded.handle, \"offset\" = excluded.\"offset\"",
                self.shapes_table
            ),
            Params::from(&[
                Value::from(shape_key),
                Value::from(state.handle.as_str()),
                Value::from(state.offset.as_str()),
            ]),
        )?;
        Ok(())
    }

    /// Removes the position of a single-shape subscription.
    pub fn delete_shape(&self, db: &dyn Executor, shape_key: &str) -> SyncResult<()> {
        db.run(
            &format!("DELETE FROM {} WHERE shape_key = ?1", self.shapes_table),
            Params::from(&[Value::from(shape_key)]),
        )?;
        Ok(())
    }

    pub(crate) fn delete_key(&self, db: &dyn Executor, key: &StateKey) -> SyncResult<()> {
        match key {
            StateKey::Shape(k) => self.delete_shape(db, k),
            StateKey::Subscription(k) => self.delete(db, k),
        }
    }
}

fn single_row(key: &str, mut rows: Vec<Row>) -> SyncResult<Option<Row>> {
    if rows.len() > 1 {
        return Err(SyncError::Consistency {
            key: key.to_owned(),
            rows: rows.len(),
        });
    }
    Ok(rows.pop())
}

fn parse_last_lsn(key: &str, value: Option<&Value>) -> SyncResult<u64> {
    match value {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Text(s)) if s.trim().is_empty() => Ok(0),
        Some(Value::Text(s)) => s
            .trim()
            .parse()
            .map_err(|_| SyncError::Metadata(format!("last_lsn for {key} is {s:?}"))),
        Some(Value::Integer(n)) => u64::try_from(*n)
            .map_err(|_| SyncError::Metadata(format!("last_lsn for {key} is {n}"))),
        Some(other) => Err(SyncError::Metadata(format!(
            "last_lsn for {key} is {}",
            other.type_name()
        ))),
    }
}
