//! An adapter wrapper that counts what the engine does to storage.
//!
//! Commit granularity and the no-op update path are only observable through
//! the number of transactions and statements, so integration tests wrap
//! their database in a [`ProbeAdapter`] and read its [`ProbeStats`].

use shapesync_protocol::Row;
use shapesync_storage::{Executor, Params, Statement, StorageAdapter, StorageError, StorageResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counters shared between a [`ProbeAdapter`] and the test.
#[derive(Debug, Default)]
pub struct ProbeStats {
    transactions: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    statements: AtomicUsize,
}

impl ProbeStats {
    /// Transactions opened.
    pub fn transactions(&self) -> usize {
        self.transactions.load(Ordering::SeqCst)
    }

    /// Transactions committed.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Transactions rolled back.
    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    /// Statements executed inside transactions.
    pub fn statements(&self) -> usize {
        self.statements.load(Ordering::SeqCst)
    }

    fn count_statement(&self) {
        self.statements.fetch_add(1, Ordering::SeqCst);
    }
}

/// Wraps a storage adapter and counts transactions and statements.
///
/// Only statements executed inside a transaction are counted, so setup and
/// inspection through the adapter itself does not disturb the numbers.
pub struct ProbeAdapter<A> {
    inner: A,
    stats: Arc<ProbeStats>,
}

impl<A: StorageAdapter> ProbeAdapter<A> {
    /// Wraps `inner`.
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            stats: Arc::new(ProbeStats::default()),
        }
    }

    /// The counters, shared with the adapter.
    pub fn stats(&self) -> Arc<ProbeStats> {
        Arc::clone(&self.stats)
    }

    /// The wrapped adapter.
    pub fn inner(&self) -> &A {
        &self.inner
    }
}

impl<A: StorageAdapter> Executor for ProbeAdapter<A> {
    fn exec(&self, sql: &str) -> StorageResult<()> {
        self.inner.exec(sql)
    }

    fn prepare<'a>(&'a self, sql: &str) -> StorageResult<Box<dyn Statement + 'a>> {
        self.inner.prepare(sql)
    }
}

impl<A: StorageAdapter> StorageAdapter for ProbeAdapter<A> {
    fn transaction<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&dyn Executor) -> Result<T, E>,
        E: From<StorageError>,
    {
        let stats = Arc::clone(&self.stats);
        stats.transactions.fetch_add(1, Ordering::SeqCst);
        let result = self.inner.transaction(|tx| {
            f(&CountingExecutor {
                inner: tx,
                stats: &stats,
            })
        });
        match &result {
            Ok(_) => stats.commits.fetch_add(1, Ordering::SeqCst),
            Err(_) => stats.rollbacks.fetch_add(1, Ordering::SeqCst),
        };
        result
    }

    fn close(self) -> StorageResult<()> {
        self.inner.close()
    }
}

struct CountingExecutor<'e> {
    inner: &'e dyn Executor,
    stats: &'e ProbeStats,
}

impl Executor for CountingExecutor<'_> {
    fn exec(&self, sql: &str) -> StorageResult<()> {
        self.stats.count_statement();
        self.inner.exec(sql)
    }

    fn prepare<'a>(&'a self, sql: &str) -> StorageResult<Box<dyn Statement + 'a>> {
        let inner = self.inner.prepare(sql)?;
        Ok(Box::new(CountingStatement {
            inner,
            stats: self.stats,
        }))
    }
}

struct CountingStatement<'a> {
    inner: Box<dyn Statement + 'a>,
    stats: &'a ProbeStats,
}

impl Statement for CountingStatement<'_> {
    fn run(&mut self, params: Params<'_>) -> StorageResult<usize> {
        self.stats.count_statement();
        self.inner.run(params)
    }

    fn get(&mut self, params: Params<'_>) -> StorageResult<Option<Row>> {
        self.stats.count_statement();
        self.inner.get(params)
    }

    fn all(&mut self, params: Params<'_>) -> StorageResult<Vec<Row>> {
        self.stats.count_statement();
        self.inner.all(params)
    }
}
