//! Commit coordination for one subscription.
//!
//! A [`Coordinator`] owns everything a subscription has received but not yet
//! written: the pending change messages of every shape in the group, the set
//! of shapes waiting for a truncate, and the last known stream position of
//! each shape. It runs as one task that consumes the subscription channel
//! and decides when to flush.
//!
//! A flush is one storage transaction:
//!
//! 1. truncate every shape pending a refetch (or run its refetch hook), then
//!    delete the persisted state of the subscription
//! 2. apply the pending messages in arrival order
//! 3. persist the new `{handle, offset}` of every shape, if all are known
//!
//! Any error rolls the whole transaction back. The batch is discarded and
//! reported; the persisted position does not move. It stays put for the
//! rest of the subscription, so a restart resumes from before the failed
//! batch. Only a refetch of every shape in the group lifts the hold.

use crate::applier::{apply_message, TableBinding};
use crate::config::CommitPolicy;
use crate::engine::StoreState;
use crate::error::{SyncError, SyncResult};
use crate::metadata::{ShapeSubscriptionState, StateKey, SubscriptionStore};
use crate::mutex::StoreMutex;
use crate::options::InitialSyncHook;
use crate::stream::{ShapeEvent, ShapeStream, StreamBatch};
use parking_lot::Mutex;
use shapesync_protocol::{ChangeMessage, ControlKind, Message, Offset};
use shapesync_storage::{Executor, StorageAdapter};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type UpToDateCallback = Arc<dyn Fn() + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&SyncError) + Send + Sync>;

/// Identifies a listener registered on a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Callbacks registered through a subscription's `subscribe`.
#[derive(Default)]
pub(crate) struct Listeners {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, UpToDateCallback, ErrorCallback)>>,
}

impl Listeners {
    pub(crate) fn add(&self, on_up_to_date: UpToDateCallback, on_error: ErrorCallback) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, on_up_to_date, on_error));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry, _, _)| *entry != id);
        entries.len() != before
    }

    fn notify_up_to_date(&self) {
        let callbacks: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(_, f, _)| Arc::clone(f))
            .collect();
        for f in callbacks {
            f();
        }
    }

    fn notify_error(&self, error: &SyncError) -> usize {
        let callbacks: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(_, _, f)| Arc::clone(f))
            .collect();
        for f in &callbacks {
            f(error);
        }
        callbacks.len()
    }
}

/// One shape of a subscription group.
pub(crate) struct ShapeSlot {
    name: String,
    binding: TableBinding,
    stream: Arc<dyn ShapeStream>,
    handle: Option<String>,
    offset: Option<Offset>,
    up_to_date: bool,
}

impl ShapeSlot {
    pub(crate) fn new(
        name: impl Into<String>,
        binding: TableBinding,
        stream: Arc<dyn ShapeStream>,
        resume: Option<ShapeSubscriptionState>,
    ) -> Self {
        let (handle, offset) = match resume {
            Some(state) => (Some(state.handle), Some(state.offset)),
            None => (None, None),
        };
        Self {
            name: name.into(),
            binding,
            stream,
            handle,
            offset,
            up_to_date: false,
        }
    }

    fn adopt(&mut self, handle: Option<&String>, offset: Option<&Offset>) {
        if let Some(handle) = handle {
            self.handle = Some(handle.clone());
        }
        if let Some(offset) = offset {
            self.offset = Some(offset.clone());
        }
    }

    fn position(&self) -> Option<ShapeSubscriptionState> {
        match (&self.handle, &self.offset) {
            (Some(handle), Some(offset)) => {
                Some(ShapeSubscriptionState::new(handle.clone(), offset.clone()))
            }
            _ => None,
        }
    }
}

/// Consumes one subscription's channel and flushes it to storage.
pub(crate) struct Coordinator<A: StorageAdapter> {
    id: Uuid,
    store: Arc<StoreMutex<StoreState<A>>>,
    metadata: SubscriptionStore,
    policy: CommitPolicy,
    shapes: Vec<ShapeSlot>,
    persist: Option<StateKey>,
    pending: Vec<(usize, ChangeMessage)>,
    truncate: BTreeSet<usize>,
    last_lsn: u64,
    positions_held: bool,
    last_flush_at: Option<Instant>,
    deferred_until: Option<Instant>,
    on_initial_sync: Option<InitialSyncHook>,
    listeners: Arc<Listeners>,
}

impl<A: StorageAdapter> Coordinator<A> {
    pub(crate) fn new(
        id: Uuid,
        store: Arc<StoreMutex<StoreState<A>>>,
        metadata: SubscriptionStore,
        policy: CommitPolicy,
        shapes: Vec<ShapeSlot>,
        listeners: Arc<Listeners>,
    ) -> Self {
        Self {
            id,
            store,
            metadata,
            policy,
            shapes,
            persist: None,
            pending: Vec::new(),
            truncate: BTreeSet::new(),
            last_lsn: 0,
            positions_held: false,
            last_flush_at: None,
            deferred_until: None,
            on_initial_sync: None,
            listeners,
        }
    }

    /// Persists positions under `key`, starting from a previously stored LSN.
    pub(crate) fn persist_to(mut self, key: Option<StateKey>, last_lsn: u64) -> Self {
        self.persist = key;
        self.last_lsn = last_lsn;
        self
    }

    /// Fires `hook` after the first successful up-to-date flush.
    pub(crate) fn with_initial_sync(mut self, hook: Option<InitialSyncHook>) -> Self {
        self.on_initial_sync = hook;
        self
    }

    /// Consumes events until cancelled or every sender is gone, then
    /// releases the subscription's tables.
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<ShapeEvent>, cancel: CancellationToken) {
        tracing::info!(
            subscription = %self.id,
            shapes = self.shapes.len(),
            persisted = self.persist.as_ref().map(StateKey::as_str),
            "subscription started"
        );

        loop {
            let deferred = self.deferred_until;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep_until(deferred) => {
                    self.flush().await;
                }
                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }

        rx.close();
        if !self.pending.is_empty() {
            tracing::debug!(
                subscription = %self.id,
                messages = self.pending.len(),
                "dropping unflushed messages"
            );
        }
        let released = self.store.acquire().await.tables.release(self.id);
        tracing::info!(subscription = %self.id, tables = released, "subscription stopped");
    }

    async fn handle_event(&mut self, event: ShapeEvent) {
        match event {
            ShapeEvent::Batch { shape, batch } => {
                let Some(index) = self.shapes.iter().position(|s| s.name == shape) else {
                    tracing::warn!(subscription = %self.id, shape = %shape, "batch for unknown shape");
                    return;
                };
                let reached_up_to_date = self.handle_batch(index, batch).await;
                if reached_up_to_date && self.shapes.iter().all(|s| s.up_to_date) {
                    self.listeners.notify_up_to_date();
                }
            }
            ShapeEvent::Error { shape, error } => {
                let error = SyncError::Transport(error);
                if self.listeners.notify_error(&error) == 0 {
                    tracing::warn!(
                        subscription = %self.id,
                        shape = %shape,
                        error = %error,
                        "shape stream error"
                    );
                }
            }
        }
    }

    /// Returns true if the batch carried an `up-to-date` message.
    async fn handle_batch(&mut self, index: usize, batch: StreamBatch) -> bool {
        let StreamBatch {
            messages,
            handle,
            offset,
        } = batch;
        tracing::debug!(
            subscription = %self.id,
            shape = %self.shapes[index].name,
            messages = messages.len(),
            "batch received"
        );
        self.shapes[index].adopt(handle.as_ref(), None);

        let mut reached_up_to_date = false;
        for message in messages {
            match message {
                Message::Change(change) => self.push_change(index, change).await,
                Message::Control(control) => match control.kind {
                    ControlKind::MustRefetch => self.must_refetch(index),
                    ControlKind::UpToDate => {
                        reached_up_to_date = true;
                        let slot = &mut self.shapes[index];
                        slot.adopt(handle.as_ref(), offset.as_ref());
                        slot.up_to_date = true;
                        if self.shapes.iter().all(|s| s.up_to_date) {
                            self.group_up_to_date().await;
                        }
                    }
                    ControlKind::Other(kind) => {
                        tracing::trace!(subscription = %self.id, kind = %kind, "ignoring control message");
                    }
                },
            }
        }

        self.shapes[index].adopt(handle.as_ref(), offset.as_ref());
        reached_up_to_date
    }

    async fn push_change(&mut self, index: usize, change: ChangeMessage) {
        let slot = &mut self.shapes[index];
        if let Some(offset) = &change.offset {
            slot.offset = Some(offset.clone());
        }
        slot.up_to_date = false;
        self.pending.push((index, change));

        if let Some(threshold) = self.policy.granularity.threshold() {
            if self.pending.len() >= threshold {
                self.request_flush(false).await;
            }
        }
    }

    fn must_refetch(&mut self, index: usize) {
        let before = self.pending.len();
        self.pending.retain(|(shape, _)| *shape != index);
        self.truncate.insert(index);

        let slot = &mut self.shapes[index];
        slot.handle = None;
        slot.offset = None;
        slot.up_to_date = false;
        tracing::info!(
            subscription = %self.id,
            shape = %slot.name,
            table = %slot.binding.table,
            dropped = before - self.pending.len(),
            "shape must be refetched"
        );
    }

    async fn group_up_to_date(&mut self) {
        if self.request_flush(true).await {
            if let Some(hook) = self.on_initial_sync.take() {
                tracing::info!(subscription = %self.id, "initial sync complete");
                hook();
            }
        }
    }

    /// Flushes now, or defers to the end of the throttle window.
    ///
    /// A forced request resets the window and always flushes. Returns true
    /// if a flush ran and succeeded (or there was nothing to flush).
    async fn request_flush(&mut self, force: bool) -> bool {
        if force {
            self.last_flush_at = None;
        }
        if let (Some(window), Some(last)) = (self.policy.throttle, self.last_flush_at) {
            let due = last + window;
            if Instant::now() < due {
                if self.deferred_until.is_none() {
                    tracing::debug!(subscription = %self.id, "flush deferred by throttle");
                }
                self.deferred_until = Some(due);
                return false;
            }
        }
        self.flush().await
    }

    async fn flush(&mut self) -> bool {
        self.deferred_until = None;
        if self.pending.is_empty() && self.truncate.is_empty() {
            return true;
        }

        let messages = std::mem::take(&mut self.pending);
        let truncate = std::mem::take(&mut self.truncate);
        self.last_flush_at = Some(Instant::now());

        let result = {
            let mut state = self.store.acquire().await;
            match state.adapter.as_mut() {
                Some(adapter) => adapter.transaction(|tx| self.write(tx, &messages, &truncate)),
                None => Err(SyncError::Closed),
            }
        };

        let flushed = match result {
            Ok(last_lsn) => {
                self.last_lsn = last_lsn;
                if self.positions_held && truncate.len() == self.shapes.len() {
                    tracing::info!(subscription = %self.id, "refetch complete, persisting positions again");
                    self.positions_held = false;
                }
                tracing::debug!(
                    subscription = %self.id,
                    messages = messages.len(),
                    truncated = truncate.len(),
                    last_lsn,
                    "flushed batch"
                );
                true
            }
            Err(error) => {
                tracing::error!(
                    subscription = %self.id,
                    messages = messages.len(),
                    error = %error,
                    "flush failed, batch discarded"
                );
                // The tables still hold pre-refetch rows.
                self.truncate.extend(truncate);
                if self.persist.is_some() && !self.positions_held {
                    tracing::warn!(
                        subscription = %self.id,
                        "holding persisted position until the subscription restarts"
                    );
                    self.positions_held = true;
                }
                self.listeners.notify_error(&error);
                false
            }
        };

        tokio::task::yield_now().await;
        flushed
    }

    fn write(
        &self,
        tx: &dyn Executor,
        messages: &[(usize, ChangeMessage)],
        truncate: &BTreeSet<usize>,
    ) -> SyncResult<u64> {
        for &index in truncate {
            self.shapes[index].binding.truncate(tx)?;
        }
        if !truncate.is_empty() {
            if let Some(key) = &self.persist {
                self.metadata.delete_key(tx, key)?;
            }
        }

        let mut last_lsn = self.last_lsn;
        for (index, message) in messages {
            apply_message(tx, &self.shapes[*index].binding, message)?;
            if let Some(lsn) = message.lsn {
                last_lsn = last_lsn.max(lsn);
            }
        }

        if let Some(key) = &self.persist {
            let refetched_all = truncate.len() == self.shapes.len();
            if !self.positions_held || refetched_all {
                self.persist_positions(tx, key, last_lsn)?;
            }
        }
        Ok(last_lsn)
    }

    fn persist_positions(&self, tx: &dyn Executor, key: &StateKey, last_lsn: u64) -> SyncResult<()> {
        let mut positions = BTreeMap::new();
        for slot in &self.shapes {
            let Some(position) = slot.position() else {
                tracing::warn!(
                    subscription = %self.id,
                    shape = %slot.name,
                    "stream position unknown, subscription state not persisted"
                );
                return Ok(());
            };
            positions.insert(slot.name.clone(), position);
        }

        match key {
            StateKey::Shape(shape_key) => {
                if let Some(position) = positions.values().next() {
                    self.metadata.update_shape(tx, shape_key, position)?;
                }
            }
            StateKey::Subscription(key) => self.metadata.update(tx, key, &positions, last_lsn)?,
        }
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommitGranularity;
    use shapesync_protocol::{row, Value};
    use shapesync_storage::{Params, SqliteAdapter};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Idle;

    impl ShapeStream for Idle {
        fn subscribe(&self, _sink: crate::stream::BatchSink) -> SyncResult<()> {
            Ok(())
        }

        fn shape_handle(&self) -> Option<String> {
            None
        }

        fn is_up_to_date(&self) -> bool {
            true
        }

        fn unsubscribe_all(&self) {}
    }

    type Store = Arc<StoreMutex<StoreState<SqliteAdapter>>>;

    fn store() -> Store {
        let db = SqliteAdapter::open_in_memory().unwrap();
        db.exec("CREATE TABLE todo (id INTEGER PRIMARY KEY, task TEXT)")
            .unwrap();
        db.exec("CREATE TABLE note (id INTEGER PRIMARY KEY, body TEXT NOT NULL)")
            .unwrap();
        SubscriptionStore::new("electric").migrate(&db).unwrap();
        Arc::new(StoreMutex::new(StoreState::new(db)))
    }

    fn coordinator(store: &Store, policy: CommitPolicy) -> Coordinator<SqliteAdapter> {
        let slot = ShapeSlot::new("todo", TableBinding::new("todo", ["id"]), Arc::new(Idle), None);
        Coordinator::new(
            Uuid::new_v4(),
            Arc::clone(store),
            SubscriptionStore::new("electric"),
            policy,
            vec![slot],
            Arc::new(Listeners::default()),
        )
    }

    async fn count(store: &Store, table: &str) -> i64 {
        let state = store.acquire().await;
        let db = state.adapter.as_ref().unwrap();
        db.get(&format!("SELECT COUNT(*) AS n FROM {table}"), Params::None)
            .unwrap()
            .unwrap()["n"]
            .as_i64()
            .unwrap()
    }

    fn insert(id: i64) -> Message {
        ChangeMessage::insert(id.to_string(), row([("id", Value::from(id)), ("task", "t".into())]))
            .with_offset(format!("{id}_0"))
            .into()
    }

    async fn feed(c: &mut Coordinator<SqliteAdapter>, messages: Vec<Message>) {
        c.handle_event(ShapeEvent::Batch {
            shape: "todo".into(),
            batch: StreamBatch::new(messages).with_position("h1", "99_0"),
        })
        .await;
    }

    #[tokio::test]
    async fn batch_granularity_flushes_every_n() {
        let store = store();
        let mut c = coordinator(&store, CommitPolicy::new(CommitGranularity::Batch(5)));

        feed(&mut c, (1..=5).map(insert).collect()).await;
        assert_eq!(count(&store, "todo").await, 5);

        feed(&mut c, (6..=7).map(insert).collect()).await;
        assert_eq!(count(&store, "todo").await, 5);

        feed(&mut c, vec![Message::up_to_date()]).await;
        assert_eq!(count(&store, "todo").await, 7);
    }

    #[tokio::test]
    async fn must_refetch_truncates_and_drops_pending() {
        let store = store();
        let mut c = coordinator(&store, CommitPolicy::default());

        feed(&mut c, vec![insert(1), Message::up_to_date()]).await;
        assert_eq!(count(&store, "todo").await, 1);

        feed(
            &mut c,
            vec![insert(2), Message::must_refetch(), insert(3), Message::up_to_date()],
        )
        .await;
        let state = store.acquire().await;
        let rows = state
            .adapter
            .as_ref()
            .unwrap()
            .all("SELECT id FROM todo", Params::None)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], Value::Integer(3));
    }

    #[tokio::test]
    async fn throttle_defers_until_up_to_date() {
        let store = store();
        let policy = CommitPolicy::new(CommitGranularity::Operation).with_throttle(Duration::from_secs(3600));
        let mut c = coordinator(&store, policy);

        feed(&mut c, vec![insert(1)]).await;
        assert_eq!(count(&store, "todo").await, 1);

        feed(&mut c, vec![insert(2), insert(3)]).await;
        assert_eq!(count(&store, "todo").await, 1);
        assert!(c.deferred_until.is_some());

        feed(&mut c, vec![Message::up_to_date()]).await;
        assert_eq!(count(&store, "todo").await, 3);
        assert!(c.deferred_until.is_none());
    }

    #[tokio::test]
    async fn failed_flush_is_reported_and_discarded() {
        let store = store();
        let listeners = Arc::new(Listeners::default());
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        listeners.add(
            Arc::new(|| {}),
            Arc::new(move |_: &SyncError| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let slot = ShapeSlot::new("todo", TableBinding::new("todo", ["id"]), Arc::new(Idle), None);
        let mut c = Coordinator::new(
            Uuid::new_v4(),
            Arc::clone(&store),
            SubscriptionStore::new("electric"),
            CommitPolicy::default(),
            vec![slot],
            listeners,
        )
        .persist_to(Some(StateKey::Shape("todo".into())), 0);

        // Duplicate primary key inside one batch.
        feed(&mut c, vec![insert(1), insert(1), Message::up_to_date()]).await;
        assert_eq!(count(&store, "todo").await, 0);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(c.pending.is_empty());

        let state = store.acquire().await;
        let persisted = SubscriptionStore::new("electric")
            .get_shape(state.adapter.as_ref().unwrap(), "todo")
            .unwrap();
        assert!(persisted.is_none());
    }

    async fn feed_at(c: &mut Coordinator<SqliteAdapter>, messages: Vec<Message>, offset: &str) {
        c.handle_event(ShapeEvent::Batch {
            shape: "todo".into(),
            batch: StreamBatch::new(messages).with_position("h1", offset),
        })
        .await;
    }

    async fn persisted_shape(store: &Store) -> Option<ShapeSubscriptionState> {
        let state = store.acquire().await;
        SubscriptionStore::new("electric")
            .get_shape(state.adapter.as_ref().unwrap(), "todo")
            .unwrap()
    }

    #[tokio::test]
    async fn failed_flush_holds_persisted_position() {
        let store = store();
        let mut c = coordinator(&store, CommitPolicy::default())
            .persist_to(Some(StateKey::Shape("todo".into())), 0);

        feed_at(&mut c, vec![insert(1), Message::up_to_date()], "1_0").await;
        assert_eq!(persisted_shape(&store).await, Some(ShapeSubscriptionState::new("h1", "1_0")));

        // Row 1 already exists, so this flush fails.
        feed_at(&mut c, vec![insert(1), Message::up_to_date()], "2_0").await;
        feed_at(&mut c, vec![insert(3), Message::up_to_date()], "3_0").await;
        assert_eq!(count(&store, "todo").await, 2);
        assert_eq!(persisted_shape(&store).await, Some(ShapeSubscriptionState::new("h1", "1_0")));

        // A full refetch starts over, so positions are persisted again.
        feed_at(
            &mut c,
            vec![Message::must_refetch(), insert(4), Message::up_to_date()],
            "0_0",
        )
        .await;
        assert_eq!(count(&store, "todo").await, 1);
        assert_eq!(persisted_shape(&store).await, Some(ShapeSubscriptionState::new("h1", "0_0")));
    }

    #[tokio::test]
    async fn up_to_date_listeners_fire_once_per_up_to_date() {
        let store = store();
        let listeners = Arc::new(Listeners::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        listeners.add(
            Arc::new(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(|_: &SyncError| {}),
        );
        let slot = ShapeSlot::new("todo", TableBinding::new("todo", ["id"]), Arc::new(Idle), None);
        let mut c = Coordinator::new(
            Uuid::new_v4(),
            Arc::clone(&store),
            SubscriptionStore::new("electric"),
            CommitPolicy::default(),
            vec![slot],
            listeners,
        );

        // The stream already reports up-to-date, but this batch does not
        // carry the message.
        feed(&mut c, vec![insert(1)]).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        feed(&mut c, vec![Message::up_to_date()]).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        feed(&mut c, vec![Message::up_to_date(), insert(2)]).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persists_positions_and_lsn() {
        let store = store();
        let todo = ShapeSlot::new("todos", TableBinding::new("todo", ["id"]), Arc::new(Idle), None);
        let note = ShapeSlot::new("notes", TableBinding::new("note", ["id"]), Arc::new(Idle), None);
        let mut c = Coordinator::new(
            Uuid::new_v4(),
            Arc::clone(&store),
            SubscriptionStore::new("electric"),
            CommitPolicy::default(),
            vec![todo, note],
            Arc::new(Listeners::default()),
        )
        .persist_to(Some(StateKey::Subscription("group".into())), 3);

        let todo_insert = ChangeMessage::insert("1", row([("id", Value::from(1)), ("task", "a".into())]))
            .with_lsn(10);
        c.handle_event(ShapeEvent::Batch {
            shape: "todos".into(),
            batch: StreamBatch::new(vec![todo_insert.into(), Message::up_to_date()])
                .with_position("ht", "10_0"),
        })
        .await;
        // Only one shape is up to date, nothing is written yet.
        assert_eq!(count(&store, "todo").await, 0);

        let note_insert = ChangeMessage::insert("1", row([("id", Value::from(1)), ("body", "b".into())]))
            .with_lsn(8);
        c.handle_event(ShapeEvent::Batch {
            shape: "notes".into(),
            batch: StreamBatch::new(vec![note_insert.into(), Message::up_to_date()])
                .with_position("hn", "8_0"),
        })
        .await;
        assert_eq!(count(&store, "todo").await, 1);
        assert_eq!(count(&store, "note").await, 1);

        let state = store.acquire().await;
        let persisted = SubscriptionStore::new("electric")
            .get(state.adapter.as_ref().unwrap(), "group")
            .unwrap()
            .unwrap();
        assert_eq!(persisted.last_lsn, 10);
        assert_eq!(persisted.shape_metadata["todos"], ShapeSubscriptionState::new("ht", "10_0"));
        assert_eq!(persisted.shape_metadata["notes"], ShapeSubscriptionState::new("hn", "8_0"));
    }

    #[tokio::test]
    async fn initial_sync_fires_once() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let mut c = coordinator(&store, CommitPolicy::default()).with_initial_sync(Some(Arc::new(
            move || {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        )));

        feed(&mut c, vec![insert(1), Message::up_to_date()]).await;
        feed(&mut c, vec![insert(2), Message::up_to_date()]).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_releases_tables_on_cancel() {
        let store = store();
        let c = coordinator(&store, CommitPolicy::default());
        let id = c.id;
        store
            .acquire()
            .await
            .tables
            .claim_all(&["todo".to_owned()], id)
            .unwrap();

        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(c.run(rx, cancel.clone()));
        tx.send(ShapeEvent::Batch {
            shape: "todo".into(),
            batch: StreamBatch::new(vec![insert(1), Message::up_to_date()]),
        })
        .await
        .unwrap();

        cancel.cancel();
        task.await.unwrap();
        assert!(!store.acquire().await.tables.is_bound("todo"));
    }
}
