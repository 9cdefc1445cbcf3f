//! # ShapeSync Engine
//!
//! Applies shape streams to local SQLite tables, transactionally and
//! resumably.
//!
//! This crate provides:
//! - The sync engine binding shapes to tables ([`SyncEngine`])
//! - Commit coordination with granularity and throttle policies
//! - Persisted subscription state for exact resumption after restart
//! - Atomic multi-shape subscriptions spanning several tables
//! - The shape stream contract implemented by transports
//!
//! ## Architecture
//!
//! ```text
//! shape stream ──► bounded channel ──► coordinator task
//!                                           │ flush
//!                                           ▼
//!                    store mutex ──► storage transaction
//!                                     ├─ truncate (must-refetch)
//!                                     ├─ apply messages in order
//!                                     └─ persist {handle, offset}
//! ```
//!
//! ## Key Invariants
//!
//! - A table is written by at most one subscription at a time
//! - A flush applies all of its messages or none of them
//! - Persisted positions are written in the same transaction as the data
//! - Messages are applied in arrival order
//! - `on_initial_sync` fires at most once, only for new subscriptions

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod config;
mod coordinator;
mod engine;
mod error;
mod metadata;
mod mutex;
mod options;
mod registry;
mod stream;
mod subscription;

pub use applier::{apply_message, Applied, ColumnMapping, RefetchHook, RowMapper, TableBinding};
pub use config::{
    CommitGranularity, CommitPolicy, EngineConfig, DEFAULT_CHANNEL_CAPACITY,
    DEFAULT_METADATA_SCHEMA,
};
pub use coordinator::ListenerId;
pub use engine::SyncEngine;
pub use error::{ApplyError, SyncError, SyncResult, TransportError};
pub use metadata::{ShapeSubscriptionState, SubscriptionState, SubscriptionStore};
pub use mutex::StoreMutex;
pub use options::{InitialSyncHook, ShapeBinding, SyncShapeToTableOptions, SyncShapesToTablesOptions};
pub use stream::{
    BatchSink, ShapeOptions, ShapeParams, ShapeStream, ShapeStreamOptions, ShapeStreamProvider,
    StreamBatch,
};
pub use subscription::{MultiShapeSubscription, ShapeSubscription};
