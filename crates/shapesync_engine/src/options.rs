//! Options for binding shapes to tables.

use crate::applier::{ColumnMapping, TableBinding};
use crate::config::{CommitGranularity, CommitPolicy};
use crate::error::{SyncError, SyncResult};
use crate::stream::ShapeOptions;
use shapesync_storage::Executor;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Called once when a new subscription first reaches `up-to-date`.
pub type InitialSyncHook = Arc<dyn Fn() + Send + Sync>;

/// Binds one shape to one table.
///
/// # Example
///
/// ```rust
/// use shapesync_engine::{CommitGranularity, ShapeOptions, ShapeParams, SyncShapeToTableOptions};
/// use std::time::Duration;
///
/// let options = SyncShapeToTableOptions::new(
///     ShapeOptions::new("http://localhost:3000/v1/shape", ShapeParams::new("todo")),
///     "todo",
///     ["id"],
/// )
/// .with_shape_key("todos")
/// .with_commit_granularity(CommitGranularity::Batch(100))
/// .with_commit_throttle(Duration::from_millis(250));
/// assert_eq!(options.shape_key.as_deref(), Some("todos"));
/// ```
#[derive(Clone)]
pub struct SyncShapeToTableOptions {
    /// The shape to stream.
    pub shape: ShapeOptions,
    /// The table to write.
    pub binding: TableBinding,
    /// Resume identity; `None` always starts from a fresh snapshot.
    pub shape_key: Option<String>,
    /// When to flush.
    pub policy: CommitPolicy,
    /// Fires once after the first up-to-date flush of a new subscription.
    pub on_initial_sync: Option<InitialSyncHook>,
    /// Caller cancellation; cancelling it ends the subscription.
    pub cancel: Option<CancellationToken>,
}

impl SyncShapeToTableOptions {
    /// Creates options for a table with the given primary key.
    pub fn new<I, S>(shape: ShapeOptions, table: impl Into<String>, primary_key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            shape,
            binding: TableBinding::new(table, primary_key),
            shape_key: None,
            policy: CommitPolicy::default(),
            on_initial_sync: None,
            cancel: None,
        }
    }

    /// Sets the table schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.binding = self.binding.with_schema(schema);
        self
    }

    /// Sets the column remapping.
    pub fn with_map_columns(mut self, mapping: ColumnMapping) -> Self {
        self.binding = self.binding.with_map_columns(mapping);
        self
    }

    /// Persists the stream position under `key`.
    pub fn with_shape_key(mut self, key: impl Into<String>) -> Self {
        self.shape_key = Some(key.into());
        self
    }

    /// Sets the commit granularity.
    pub fn with_commit_granularity(mut self, granularity: CommitGranularity) -> Self {
        self.policy.granularity = granularity;
        self
    }

    /// Sets the commit throttle window.
    pub fn with_commit_throttle(mut self, throttle: Duration) -> Self {
        self.policy.throttle = Some(throttle);
        self
    }

    /// Sets the initial sync hook.
    pub fn with_on_initial_sync(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_initial_sync = Some(Arc::new(hook));
        self
    }

    /// Replaces the truncate on `must-refetch`.
    pub fn with_on_must_refetch(
        mut self,
        hook: impl Fn(&dyn Executor) -> SyncResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.binding = self.binding.with_on_must_refetch(hook);
        self
    }

    /// Ends the subscription when `token` is cancelled.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub(crate) fn validate(&self) -> SyncResult<()> {
        self.binding.validate()?;
        self.policy.validate()
    }
}

impl fmt::Debug for SyncShapeToTableOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncShapeToTableOptions")
            .field("shape", &self.shape)
            .field("binding", &self.binding)
            .field("shape_key", &self.shape_key)
            .field("policy", &self.policy)
            .field("on_initial_sync", &self.on_initial_sync.is_some())
            .finish()
    }
}

/// One shape of a multi-shape subscription and the table it writes.
#[derive(Debug, Clone)]
pub struct ShapeBinding {
    /// The shape to stream.
    pub shape: ShapeOptions,
    /// The table to write.
    pub binding: TableBinding,
}

impl ShapeBinding {
    /// Creates a binding.
    pub fn new(shape: ShapeOptions, binding: TableBinding) -> Self {
        Self { shape, binding }
    }
}

/// Binds several named shapes, each to its own table, under one key.
#[derive(Clone)]
pub struct SyncShapesToTablesOptions {
    /// Resume identity of the group; `None` always starts fresh.
    pub key: Option<String>,
    /// Shapes by name.
    pub shapes: BTreeMap<String, ShapeBinding>,
    /// When to flush.
    pub policy: CommitPolicy,
    /// Fires once after the first up-to-date flush of a new subscription.
    pub on_initial_sync: Option<InitialSyncHook>,
    /// Caller cancellation; cancelling it ends the subscription.
    pub cancel: Option<CancellationToken>,
}

impl SyncShapesToTablesOptions {
    /// Creates options persisted under `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::unkeyed()
        }
    }

    /// Creates options without persistence.
    pub fn unkeyed() -> Self {
        Self {
            key: None,
            shapes: BTreeMap::new(),
            policy: CommitPolicy::default(),
            on_initial_sync: None,
            cancel: None,
        }
    }

    /// Adds a shape.
    pub fn with_shape(
        mut self,
        name: impl Into<String>,
        shape: ShapeOptions,
        binding: TableBinding,
    ) -> Self {
        self.shapes
            .insert(name.into(), ShapeBinding::new(shape, binding));
        self
    }

    /// Sets the commit granularity.
    pub fn with_commit_granularity(mut self, granularity: CommitGranularity) -> Self {
        self.policy.granularity = granularity;
        self
    }

    /// Sets the commit throttle window.
    pub fn with_commit_throttle(mut self, throttle: Duration) -> Self {
        self.policy.throttle = Some(throttle);
        self
    }

    /// Sets the initial sync hook.
    pub fn with_on_initial_sync(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_initial_sync = Some(Arc::new(hook));
        self
    }

    /// Ends the subscription when `token` is cancelled.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub(crate) fn validate(&self) -> SyncResult<()> {
        if self.shapes.is_empty() {
            return Err(SyncError::InvalidOptions(
                "at least one shape is required".into(),
            ));
        }
        let mut tables = BTreeSet::new();
        for shape in self.shapes.values() {
            shape.binding.validate()?;
            if !tables.insert(shape.binding.registry_name()) {
                return Err(SyncError::InvalidOptions(format!(
                    "table {} is bound to more than one shape",
                    shape.binding.registry_name()
                )));
            }
        }
        self.policy.validate()
    }
}

impl fmt::Debug for SyncShapesToTablesOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncShapesToTablesOptions")
            .field("key", &self.key)
            .field("shapes", &self.shapes)
            .field("policy", &self.policy)
            .field("on_initial_sync", &self.on_initial_sync.is_some())
            .finish()
    }
}
