//! Scripted shape streams.
//!
//! [`ScriptedProvider`] opens in-process streams that deliver whatever the
//! test feeds them. Each stream behaves like a server-backed one as far as
//! the engine can tell: it reports a handle, tracks `up-to-date`, assigns
//! a fresh handle on `must-refetch` and stops delivering once unsubscribed
//! or cancelled.

use parking_lot::Mutex;
use shapesync_engine::{
    BatchSink, ShapeStream, ShapeStreamOptions, ShapeStreamProvider, StreamBatch, SyncError,
    SyncResult, TransportError,
};
use shapesync_protocol::{Message, Offset};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Opens [`ScriptedStream`]s and records the options they were opened with.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    inner: Arc<ProviderInner>,
}

#[derive(Default)]
struct ProviderInner {
    opened: Mutex<Vec<ShapeStreamOptions>>,
    streams: Mutex<HashMap<String, Arc<StreamState>>>,
    failing: Mutex<Vec<String>>,
    handles: Arc<AtomicU64>,
}

impl ScriptedProvider {
    /// Creates a provider with no streams.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `open` fail for shapes on `table`.
    pub fn fail_table(&self, table: impl Into<String>) {
        self.inner.failing.lock().push(table.into());
    }

    /// Options of every stream opened so far, in order.
    pub fn opened(&self) -> Vec<ShapeStreamOptions> {
        self.inner.opened.lock().clone()
    }

    /// Options of the most recent stream opened for `table`.
    pub fn last_opened(&self, table: &str) -> Option<ShapeStreamOptions> {
        self.inner
            .opened
            .lock()
            .iter()
            .rev()
            .find(|o| o.params.table == table)
            .cloned()
    }

    /// Returns a feeder for the most recent stream opened for `table`.
    ///
    /// # Panics
    ///
    /// Panics if no stream was opened for `table`.
    pub fn feeder_for(&self, table: &str) -> StreamFeeder {
        let state = self
            .inner
            .streams
            .lock()
            .get(table)
            .cloned()
            .unwrap_or_else(|| panic!("no stream opened for table {table}"));
        StreamFeeder { state }
    }
}

fn next_handle(counter: &AtomicU64) -> String {
    format!("handle-{}", counter.fetch_add(1, Ordering::SeqCst) + 1)
}

impl ShapeStreamProvider for ScriptedProvider {
    fn open(&self, options: ShapeStreamOptions) -> SyncResult<Arc<dyn ShapeStream>> {
        let table = options.params.table.clone();
        if self.inner.failing.lock().contains(&table) {
            return Err(SyncError::Transport(TransportError::fatal(format!(
                "cannot open shape on {table}"
            ))));
        }

        let handle = options
            .handle
            .clone()
            .unwrap_or_else(|| next_handle(&self.inner.handles));
        let state = Arc::new(StreamState {
            handles: Arc::clone(&self.inner.handles),
            handle: Mutex::new(Some(handle)),
            offset: AtomicU64::new(0),
            up_to_date: AtomicBool::new(false),
            unsubscribed: AtomicBool::new(false),
            sinks: Mutex::new(Vec::new()),
            cancel: options.cancel.clone(),
        });
        self.inner
            .streams
            .lock()
            .insert(table, Arc::clone(&state));
        self.inner.opened.lock().push(options);
        Ok(Arc::new(ScriptedStream { state }))
    }
}

struct StreamState {
    handles: Arc<AtomicU64>,
    handle: Mutex<Option<String>>,
    offset: AtomicU64,
    up_to_date: AtomicBool,
    unsubscribed: AtomicBool,
    sinks: Mutex<Vec<BatchSink>>,
    cancel: CancellationToken,
}

impl StreamState {
    fn is_detached(&self) -> bool {
        self.unsubscribed.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }

    fn next_offset(&self) -> Offset {
        let n = self.offset.fetch_add(1, Ordering::SeqCst) + 1;
        Offset::new(format!("{n}_0"))
    }
}

/// A stream that delivers batches fed through a [`StreamFeeder`].
pub struct ScriptedStream {
    state: Arc<StreamState>,
}

impl ShapeStream for ScriptedStream {
    fn subscribe(&self, sink: BatchSink) -> SyncResult<()> {
        if self.state.is_detached() {
            return Err(SyncError::Cancelled);
        }
        self.state.sinks.lock().push(sink);
        Ok(())
    }

    fn shape_handle(&self) -> Option<String> {
        self.state.handle.lock().clone()
    }

    fn is_up_to_date(&self) -> bool {
        self.state.up_to_date.load(Ordering::SeqCst)
    }

    fn unsubscribe_all(&self) {
        self.state.unsubscribed.store(true, Ordering::SeqCst);
        self.state.sinks.lock().clear();
    }
}

/// Drives one scripted stream from a test.
#[derive(Clone)]
pub struct StreamFeeder {
    state: Arc<StreamState>,
}

impl StreamFeeder {
    /// Delivers `messages` as one batch to every subscriber.
    ///
    /// The batch carries the stream position after it: the offset of the
    /// last change message that has one, otherwise a generated offset. A
    /// `must-refetch` in the batch moves the stream to a fresh handle, the
    /// way a server does. Returns the number of sinks that accepted the
    /// batch; zero once the subscription has ended.
    pub async fn feed(&self, messages: Vec<Message>) -> usize {
        if self.state.is_detached() {
            return 0;
        }

        if messages.iter().any(Message::is_must_refetch) {
            let handle = next_handle(&self.state.handles);
            *self.state.handle.lock() = Some(handle);
        }
        if let Some(last) = messages.last() {
            let up_to_date = last.is_up_to_date();
            self.state.up_to_date.store(up_to_date, Ordering::SeqCst);
        }

        let offset = messages
            .iter()
            .rev()
            .find_map(|m| match m {
                Message::Change(change) => change.offset.clone(),
                Message::Control(_) => None,
            })
            .unwrap_or_else(|| self.state.next_offset());
        let mut batch = StreamBatch::new(messages);
        if let Some(handle) = self.state.handle.lock().clone() {
            batch = batch.with_position(handle, offset);
        }

        let sinks: Vec<BatchSink> = self.state.sinks.lock().clone();
        let mut delivered = 0;
        for sink in sinks {
            if sink.send(batch.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Reports a transport error to every subscriber.
    pub async fn fail(&self, error: TransportError) -> usize {
        let sinks: Vec<BatchSink> = self.state.sinks.lock().clone();
        let mut delivered = 0;
        for sink in sinks {
            if sink.fail(error.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Replaces the handle the stream reports.
    pub fn set_handle(&self, handle: impl Into<String>) {
        *self.state.handle.lock() = Some(handle.into());
    }

    /// The handle the stream currently reports.
    pub fn handle(&self) -> Option<String> {
        self.state.handle.lock().clone()
    }

    /// Returns true once the engine has detached the stream.
    pub fn is_unsubscribed(&self) -> bool {
        self.state.unsubscribed.load(Ordering::SeqCst)
    }

    /// Returns true once the stream's cancellation token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancel.is_cancelled()
    }
}
