//! The sync engine.

use crate::config::{CommitPolicy, EngineConfig};
use crate::coordinator::{Coordinator, Listeners, ShapeSlot};
use crate::error::{SyncError, SyncResult};
use crate::metadata::{ShapeSubscriptionState, StateKey, SubscriptionState, SubscriptionStore};
use crate::mutex::StoreMutex;
use crate::options::{InitialSyncHook, SyncShapeToTableOptions, SyncShapesToTablesOptions};
use crate::registry::TableRegistry;
use crate::stream::{BatchSink, ShapeOptions, ShapeStream, ShapeStreamOptions, ShapeStreamProvider};
use crate::subscription::{MultiShapeSubscription, ShapeSubscription, SubscriptionControl};
use parking_lot::Mutex;
use shapesync_storage::StorageAdapter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything guarded by the engine's store mutex.
pub(crate) struct StoreState<A> {
    /// `None` once the engine is closed.
    pub(crate) adapter: Option<A>,
    pub(crate) tables: TableRegistry,
    pub(crate) migrated: bool,
}

impl<A> StoreState<A> {
    pub(crate) fn new(adapter: A) -> Self {
        Self {
            adapter: Some(adapter),
            tables: TableRegistry::default(),
            migrated: false,
        }
    }
}

/// Binds shape streams to local tables.
///
/// The engine owns the storage adapter. Every access to it (flushes,
/// metadata reads, [`SyncEngine::run_exclusive`]) is serialized through one
/// FIFO mutex, and a table can be bound by at most one subscription at a
/// time.
///
/// # Example
///
/// ```rust,ignore
/// use shapesync_engine::{EngineConfig, ShapeOptions, ShapeParams, SyncEngine, SyncShapeToTableOptions};
/// use shapesync_storage::SqliteAdapter;
///
/// let engine = SyncEngine::new(SqliteAdapter::open("local.db")?, provider, EngineConfig::default());
/// let todos = engine
///     .sync_shape_to_table(
///         SyncShapeToTableOptions::new(
///             ShapeOptions::new("http://localhost:3000/v1/shape", ShapeParams::new("todo")),
///             "todo",
///             ["id"],
///         )
///         .with_shape_key("todos"),
///     )
///     .await?;
/// // ...
/// todos.unsubscribe().await;
/// engine.close().await?;
/// ```
pub struct SyncEngine<A: StorageAdapter, P: ShapeStreamProvider> {
    config: EngineConfig,
    store: Arc<StoreMutex<StoreState<A>>>,
    metadata: SubscriptionStore,
    provider: Arc<P>,
    subscriptions: Mutex<Vec<Arc<SubscriptionControl>>>,
}

impl<A: StorageAdapter, P: ShapeStreamProvider> SyncEngine<A, P> {
    /// Creates an engine over `adapter`, opening streams through `provider`.
    pub fn new(adapter: A, provider: P, config: EngineConfig) -> Self {
        Self {
            metadata: SubscriptionStore::new(&config.metadata_schema),
            config,
            store: Arc::new(StoreMutex::new(StoreState::new(adapter))),
            provider: Arc::new(provider),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Gets the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Gets the stream provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Creates the metadata tables if needed.
    pub async fn init_metadata_tables(&self) -> SyncResult<()> {
        self.with_adapter(|_| Ok(())).await
    }

    /// Runs `f` with exclusive access to the storage adapter.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Closed`] after [`SyncEngine::close`].
    pub async fn run_exclusive<T>(&self, f: impl FnOnce(&mut A) -> T) -> SyncResult<T> {
        let mut state = self.store.acquire().await;
        let adapter = state.adapter.as_mut().ok_or(SyncError::Closed)?;
        Ok(f(adapter))
    }

    /// Loads the persisted state of a multi-shape subscription.
    pub async fn subscription_state(&self, key: &str) -> SyncResult<Option<SubscriptionState>> {
        let metadata = &self.metadata;
        self.with_adapter(|db| metadata.get(&*db, key)).await
    }

    /// Loads the persisted position of a single-shape subscription.
    pub async fn shape_state(&self, shape_key: &str) -> SyncResult<Option<ShapeSubscriptionState>> {
        let metadata = &self.metadata;
        self.with_adapter(|db| metadata.get_shape(&*db, shape_key))
            .await
    }

    /// Deletes the persisted state of a multi-shape subscription, so the
    /// next subscription under `key` starts from a fresh snapshot.
    pub async fn delete_subscription(&self, key: &str) -> SyncResult<()> {
        let metadata = &self.metadata;
        self.with_adapter(|db| db.transaction(|tx| metadata.delete(tx, key)))
            .await?;
        tracing::info!(key, "deleted subscription state");
        Ok(())
    }

    /// Deletes the persisted position of a single-shape subscription.
    pub async fn delete_shape_subscription(&self, shape_key: &str) -> SyncResult<()> {
        let metadata = &self.metadata;
        self.with_adapter(|db| db.transaction(|tx| metadata.delete_shape(tx, shape_key)))
            .await?;
        tracing::info!(shape_key, "deleted shape subscription state");
        Ok(())
    }

    /// Returns true if `table` (`schema.table` when qualified) is bound.
    pub async fn is_table_synced(&self, table: &str) -> bool {
        self.store.acquire().await.tables.is_bound(table)
    }

    /// Streams one shape into one table.
    ///
    /// Resumes from the position persisted under the shape key, if any;
    /// otherwise the stream starts from a fresh snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::AlreadySyncing`] if the table is already bound,
    /// [`SyncError::InvalidOptions`] for an empty primary key or a zero
    /// batch size, and any error from reading metadata or opening the
    /// stream. A failed call leaves no binding behind.
    pub async fn sync_shape_to_table(
        &self,
        options: SyncShapeToTableOptions,
    ) -> SyncResult<ShapeSubscription> {
        options.validate()?;
        let SyncShapeToTableOptions {
            shape,
            binding,
            shape_key,
            policy,
            on_initial_sync,
            cancel,
        } = options;

        let id = Uuid::new_v4();
        let tables = [binding.registry_name()];
        let metadata = &self.metadata;
        let persisted = self
            .claim(id, &tables, |db| match &shape_key {
                Some(k) => metadata.get_shape(db, k),
                None => Ok(None),
            })
            .await?;

        let cancel = child_token(cancel.as_ref());
        let slot_name = binding.table.clone();
        let stream = match self.open_stream(id, &slot_name, &shape, persisted.as_ref(), &cancel) {
            Ok(stream) => stream,
            Err(e) => {
                self.release(id).await;
                return Err(e);
            }
        };

        let is_new = persisted.is_none();
        let slots = vec![ShapeSlot::new(
            slot_name.clone(),
            binding,
            Arc::clone(&stream),
            persisted,
        )];
        let control = self
            .start(
                id,
                slots,
                vec![(slot_name, stream)],
                policy,
                shape_key.map(StateKey::Shape),
                0,
                on_initial_sync.filter(|_| is_new),
                cancel,
            )
            .await?;
        Ok(ShapeSubscription::new(control))
    }

    /// Streams several shapes into their tables, committing them together.
    ///
    /// All tables are claimed at once: if any is already bound, nothing is
    /// bound and [`SyncError::AlreadySyncing`] is returned.
    pub async fn sync_shapes_to_tables(
        &self,
        options: SyncShapesToTablesOptions,
    ) -> SyncResult<MultiShapeSubscription> {
        options.validate()?;
        let SyncShapesToTablesOptions {
            key,
            shapes,
            policy,
            on_initial_sync,
            cancel,
        } = options;

        let id = Uuid::new_v4();
        let tables: Vec<String> = shapes
            .values()
            .map(|s| s.binding.registry_name())
            .collect();
        let metadata = &self.metadata;
        let persisted = self
            .claim(id, &tables, |db| match &key {
                Some(k) => metadata.get(db, k),
                None => Ok(None),
            })
            .await?;

        let cancel = child_token(cancel.as_ref());
        let mut slots = Vec::with_capacity(shapes.len());
        let mut streams: Vec<(String, Arc<dyn ShapeStream>)> = Vec::with_capacity(shapes.len());
        for (name, shape) in shapes {
            let resume = persisted
                .as_ref()
                .and_then(|state| state.shape_metadata.get(&name))
                .cloned();
            let stream = match self.open_stream(id, &name, &shape.shape, resume.as_ref(), &cancel) {
                Ok(stream) => stream,
                Err(e) => {
                    for (_, opened) in &streams {
                        opened.unsubscribe_all();
                    }
                    cancel.cancel();
                    self.release(id).await;
                    return Err(e);
                }
            };
            slots.push(ShapeSlot::new(
                name.clone(),
                shape.binding,
                Arc::clone(&stream),
                resume,
            ));
            streams.push((name, stream));
        }

        let is_new = persisted.is_none();
        let last_lsn = persisted.map_or(0, |state| state.last_lsn);
        let control = self
            .start(
                id,
                slots,
                streams,
                policy,
                key.map(StateKey::Subscription),
                last_lsn,
                on_initial_sync.filter(|_| is_new),
                cancel,
            )
            .await?;
        Ok(MultiShapeSubscription::new(control))
    }

    /// Stops every subscription, then closes the storage adapter.
    ///
    /// Later operations fail with [`SyncError::Closed`].
    pub async fn close(&self) -> SyncResult<()> {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in &subscriptions {
            subscription.shutdown().await;
        }

        let adapter = self.store.acquire().await.adapter.take();
        match adapter {
            Some(adapter) => {
                adapter.close()?;
                tracing::info!(subscriptions = subscriptions.len(), "sync engine closed");
                Ok(())
            }
            None => Err(SyncError::Closed),
        }
    }

    /// Runs `f` on the adapter after making sure the metadata tables exist.
    async fn with_adapter<T>(&self, f: impl FnOnce(&mut A) -> SyncResult<T>) -> SyncResult<T> {
        let mut guard = self.store.acquire().await;
        f(self.ready(&mut guard)?)
    }

    /// Returns the open adapter, creating the metadata tables on first use.
    fn ready<'a>(&self, state: &'a mut StoreState<A>) -> SyncResult<&'a mut A> {
        let adapter = state.adapter.as_mut().ok_or(SyncError::Closed)?;
        if !state.migrated {
            self.metadata.migrate(&*adapter)?;
            state.migrated = true;
            tracing::info!(schema = %self.config.metadata_schema, "metadata tables ready");
        }
        Ok(adapter)
    }

    /// Claims `tables` for `id` and loads persisted state, atomically.
    async fn claim<T>(
        &self,
        id: Uuid,
        tables: &[String],
        load: impl FnOnce(&A) -> SyncResult<T>,
    ) -> SyncResult<T> {
        let mut guard = self.store.acquire().await;
        let state = &mut *guard;
        let loaded = load(self.ready(state)?)?;
        state.tables.claim_all(tables, id)?;
        Ok(loaded)
    }

    async fn release(&self, id: Uuid) {
        self.store.acquire().await.tables.release(id);
    }

    fn open_stream(
        &self,
        id: Uuid,
        name: &str,
        shape: &ShapeOptions,
        resume: Option<&ShapeSubscriptionState>,
        cancel: &CancellationToken,
    ) -> SyncResult<Arc<dyn ShapeStream>> {
        match resume {
            Some(state) => tracing::debug!(
                subscription = %id,
                shape = name,
                handle = %state.handle,
                offset = %state.offset,
                "resuming shape"
            ),
            None => tracing::debug!(subscription = %id, shape = name, "starting shape from snapshot"),
        }
        self.provider.open(ShapeStreamOptions {
            url: shape.url.clone(),
            params: shape.params.clone(),
            handle: resume.map(|s| s.handle.clone()),
            offset: resume.map(|s| s.offset.clone()),
            cancel: cancel.clone(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn start(
        &self,
        id: Uuid,
        slots: Vec<ShapeSlot>,
        streams: Vec<(String, Arc<dyn ShapeStream>)>,
        policy: CommitPolicy,
        persist: Option<StateKey>,
        last_lsn: u64,
        on_initial_sync: Option<InitialSyncHook>,
        cancel: CancellationToken,
    ) -> SyncResult<Arc<SubscriptionControl>> {
        let listeners = Arc::new(Listeners::default());
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let coordinator = Coordinator::new(
            id,
            Arc::clone(&self.store),
            self.metadata.clone(),
            policy,
            slots,
            Arc::clone(&listeners),
        )
        .persist_to(persist, last_lsn)
        .with_initial_sync(on_initial_sync);
        let consumer = coordinator.run(rx, cancel.clone());

        let control = Arc::new(SubscriptionControl::spawn(
            id,
            cancel,
            consumer,
            streams.clone(),
            listeners,
        ));
        for (name, stream) in &streams {
            if let Err(e) = stream.subscribe(BatchSink::new(name.clone(), tx.clone())) {
                control.shutdown().await;
                return Err(e);
            }
        }

        let mut subscriptions = self.subscriptions.lock();
        subscriptions.retain(|s| !s.is_finished());
        subscriptions.push(Arc::clone(&control));
        tracing::info!(subscription = %id, shapes = streams.len(), "subscribed");
        Ok(control)
    }
}

fn child_token(parent: Option<&CancellationToken>) -> CancellationToken {
    parent.map_or_else(CancellationToken::new, CancellationToken::child_token)
}
