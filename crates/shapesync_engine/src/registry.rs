//! Which tables have an active binding.

use crate::error::{SyncError, SyncResult};
use std::collections::HashMap;
use uuid::Uuid;

/// Maps bound table names to the subscription writing them.
///
/// Lives inside the engine's store mutex, so claims and releases are
/// serialized with every storage access.
#[derive(Debug, Default)]
pub(crate) struct TableRegistry {
    tables: HashMap<String, Uuid>,
}

impl TableRegistry {
    /// Claims every table for `owner`, or none of them.
    pub(crate) fn claim_all(&mut self, tables: &[String], owner: Uuid) -> SyncResult<()> {
        if let Some(table) = tables.iter().find(|t| self.tables.contains_key(*t)) {
            return Err(SyncError::AlreadySyncing {
                table: table.clone(),
            });
        }
        for table in tables {
            self.tables.insert(table.clone(), owner);
        }
        Ok(())
    }

    /// Releases every table held by `owner`.
    pub(crate) fn release(&mut self, owner: Uuid) -> usize {
        let before = self.tables.len();
        self.tables.retain(|_, id| *id != owner);
        before - self.tables.len()
    }

    pub(crate) fn is_bound(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }
}
