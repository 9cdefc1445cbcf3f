//! Handles to running subscriptions.

use crate::coordinator::{ListenerId, Listeners};
use crate::error::SyncError;
use crate::stream::ShapeStream;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of one subscription's consumer task and streams.
pub(crate) struct SubscriptionControl {
    id: Uuid,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Cancelled when the consumer task exits, however it exits.
    exited: CancellationToken,
    streams: Vec<(String, Arc<dyn ShapeStream>)>,
    listeners: Arc<Listeners>,
}

impl SubscriptionControl {
    /// Spawns `consumer` and returns the control for it.
    pub(crate) fn spawn(
        id: Uuid,
        cancel: CancellationToken,
        consumer: impl Future<Output = ()> + Send + 'static,
        streams: Vec<(String, Arc<dyn ShapeStream>)>,
        listeners: Arc<Listeners>,
    ) -> Self {
        let exited = CancellationToken::new();
        let guard = exited.clone().drop_guard();
        let task = tokio::spawn(async move {
            let _exited = guard;
            consumer.await;
        });
        Self {
            id,
            cancel,
            task: Mutex::new(Some(task)),
            exited,
            streams,
            listeners,
        }
    }

    /// Detaches the streams, stops the consumer and waits for it to exit.
    ///
    /// A flush in progress completes first. Safe to call more than once,
    /// and concurrently; every caller waits for the exit.
    pub(crate) async fn shutdown(&self) {
        for (_, stream) in &self.streams {
            stream.unsubscribe_all();
        }
        self.cancel.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(subscription = %self.id, error = %e, "subscription task failed");
            }
        }
        self.exited.cancelled().await;
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.exited.is_cancelled()
    }

    fn is_up_to_date(&self) -> bool {
        self.streams.iter().all(|(_, s)| s.is_up_to_date())
    }

    fn subscribe(
        &self,
        on_up_to_date: impl Fn() + Send + Sync + 'static,
        on_error: impl Fn(&SyncError) + Send + Sync + 'static,
    ) -> ListenerId {
        self.listeners.add(Arc::new(on_up_to_date), Arc::new(on_error))
    }
}

/// A running single-shape subscription.
pub struct ShapeSubscription {
    control: Arc<SubscriptionControl>,
}

impl ShapeSubscription {
    pub(crate) fn new(control: Arc<SubscriptionControl>) -> Self {
        Self { control }
    }

    /// Unique id of the subscription, as used in logs.
    pub fn id(&self) -> Uuid {
        self.control.id
    }

    /// Stops the subscription and frees its table.
    ///
    /// Returns once the consumer task has exited; a flush in progress
    /// completes first.
    pub async fn unsubscribe(&self) {
        self.control.shutdown().await;
    }

    /// Returns true until the subscription ends.
    pub fn is_active(&self) -> bool {
        !self.control.is_finished()
    }

    /// Returns true if the stream has caught up with the server.
    pub fn is_up_to_date(&self) -> bool {
        self.control.is_up_to_date()
    }

    /// The current server-assigned shape handle.
    pub fn shape_handle(&self) -> Option<String> {
        self.control
            .streams
            .first()
            .and_then(|(_, stream)| stream.shape_handle())
    }

    /// Registers callbacks fired whenever a delivered batch leaves the stream
    /// up to date, and for every stream or flush error.
    pub fn subscribe(
        &self,
        on_up_to_date: impl Fn() + Send + Sync + 'static,
        on_error: impl Fn(&SyncError) + Send + Sync + 'static,
    ) -> ListenerId {
        self.control.subscribe(on_up_to_date, on_error)
    }

    /// Removes callbacks registered with [`ShapeSubscription::subscribe`].
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.control.listeners.remove(id)
    }
}

impl std::fmt::Debug for ShapeSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShapeSubscription")
            .field("id", &self.control.id)
            .finish()
    }
}

/// A running multi-shape subscription.
pub struct MultiShapeSubscription {
    control: Arc<SubscriptionControl>,
}

impl MultiShapeSubscription {
    pub(crate) fn new(control: Arc<SubscriptionControl>) -> Self {
        Self { control }
    }

    /// Unique id of the subscription, as used in logs.
    pub fn id(&self) -> Uuid {
        self.control.id
    }

    /// Stops every stream of the group and frees the tables.
    pub async fn unsubscribe(&self) {
        self.control.shutdown().await;
    }

    /// Returns true until the subscription ends.
    pub fn is_active(&self) -> bool {
        !self.control.is_finished()
    }

    /// Returns true if every stream of the group has caught up.
    pub fn is_up_to_date(&self) -> bool {
        self.control.is_up_to_date()
    }

    /// The current handle of every shape, by shape name.
    pub fn shape_handles(&self) -> BTreeMap<String, Option<String>> {
        self.control
            .streams
            .iter()
            .map(|(name, stream)| (name.clone(), stream.shape_handle()))
            .collect()
    }

    /// Registers callbacks fired whenever a delivered batch leaves every
    /// stream up to date, and for every stream or flush error.
    pub fn subscribe(
        &self,
        on_up_to_date: impl Fn() + Send + Sync + 'static,
        on_error: impl Fn(&SyncError) + Send + Sync + 'static,
    ) -> ListenerId {
        self.control.subscribe(on_up_to_date, on_error)
    }

    /// Removes callbacks registered with [`MultiShapeSubscription::subscribe`].
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.control.listeners.remove(id)
    }
}

impl std::fmt::Debug for MultiShapeSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiShapeSubscription")
            .field("id", &self.control.id)
            .field("shapes", &self.control.streams.len())
            .finish()
    }
}
