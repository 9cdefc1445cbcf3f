//! # ShapeSync Storage
//!
//! Storage adapter contract and the SQLite adapter for ShapeSync.
//!
//! The sync engine never talks to a database driver directly. It depends on
//! the minimal capability described by [`StorageAdapter`]:
//!
//! - execute raw statements ([`Executor::exec`])
//! - prepare statements and `run`/`get`/`all` them with positional or named
//!   parameters ([`Executor::prepare`], [`Params`])
//! - run a function inside an atomic transaction that always rolls back on
//!   failure ([`StorageAdapter::transaction`])
//!
//! ## Available Adapters
//!
//! - [`SqliteAdapter`] - SQLite through `rusqlite`

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod error;
pub mod sql;
mod sqlite;

pub use adapter::{Executor, Params, Statement, StorageAdapter};
pub use error::{StorageError, StorageResult};
pub use sqlite::SqliteAdapter;
