//! # ShapeSync Testkit
//!
//! Test utilities for ShapeSync.
//!
//! This crate provides:
//! - Test fixtures and database helpers
//! - A storage adapter wrapper that counts transactions and statements
//! - Scripted shape streams driven from the test body
//! - Property-based test generators using proptest
//! - Polling helpers and tracing setup for async tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shapesync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn syncs_todos() {
//!     init_tracing();
//!     let db = todo_db();
//!     let provider = ScriptedProvider::new();
//!     let engine = SyncEngine::new(db, provider.clone(), EngineConfig::default());
//!     // ... subscribe, then feed batches through provider.feeder_for("todo")
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod probe;
pub mod stream;
pub mod wait;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::probe::*;
    pub use crate::stream::*;
    pub use crate::wait::*;
    pub use crate::init_tracing;
}

pub use fixtures::*;
pub use generators::*;
pub use probe::*;
pub use stream::*;
pub use wait::*;

/// Installs a test-friendly tracing subscriber.
///
/// The filter comes from `RUST_LOG` and defaults to `warn`. Calling this
/// more than once is harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
