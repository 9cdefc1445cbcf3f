//! Integration tests for the sync engine against SQLite and scripted
//! shape streams.

use parking_lot::Mutex;
use shapesync_engine::{
    CommitGranularity, EngineConfig, ShapeOptions, ShapeParams, ShapeSubscriptionState,
    SyncEngine, SyncError, SyncShapeToTableOptions, SyncShapesToTablesOptions, TableBinding,
    TransportError,
};
use shapesync_protocol::{row, ChangeMessage, Message, Value};
use shapesync_storage::{Executor, SqliteAdapter};
use shapesync_testkit::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Engine = SyncEngine<ProbeAdapter<SqliteAdapter>, ScriptedProvider>;

const URL: &str = "http://localhost:3000/v1/shape";

fn setup_with(db: SqliteAdapter) -> (Engine, ScriptedProvider, Arc<ProbeStats>) {
    init_tracing();
    let db = ProbeAdapter::new(db);
    let stats = db.stats();
    let provider = ScriptedProvider::new();
    let engine = SyncEngine::new(db, provider.clone(), EngineConfig::default());
    (engine, provider, stats)
}

fn engine_on(db: SqliteAdapter, provider: &ScriptedProvider) -> Engine {
    SyncEngine::new(ProbeAdapter::new(db), provider.clone(), EngineConfig::default())
}

fn setup() -> (Engine, ScriptedProvider, Arc<ProbeStats>) {
    setup_with(todo_db())
}

fn create_schema(db: &SqliteAdapter) {
    db.exec(TODO_SCHEMA).unwrap();
    db.exec(USER_SCHEMA).unwrap();
}

fn shape(table: &str) -> ShapeOptions {
    ShapeOptions::new(URL, ShapeParams::new(table))
}

fn todo_options() -> SyncShapeToTableOptions {
    SyncShapeToTableOptions::new(shape("todo"), "todo", ["id"])
}

fn key(table: &str, id: i64) -> String {
    format!("\"public\".\"{table}\"/\"{id}\"")
}

fn insert(id: i64, task: &str) -> Message {
    ChangeMessage::insert(key("todo", id), todo(id, task)).into()
}

async fn count(engine: &Engine, table: &str) -> i64 {
    engine
        .run_exclusive(|db| count_rows(&*db, table))
        .await
        .unwrap()
}

async fn todo_ids(engine: &Engine) -> Vec<i64> {
    engine.run_exclusive(|db| ids(&*db, "todo")).await.unwrap()
}

async fn wait_rows(engine: &Engine, table: &str, expected: i64) {
    wait_until_async(&format!("{expected} rows in {table}"), move || async move {
        count(engine, table).await == expected
    })
    .await;
}

#[tokio::test]
async fn applies_inserts_updates_and_deletes() {
    let (engine, provider, _) = setup();
    let sub = engine.sync_shape_to_table(todo_options()).await.unwrap();
    let feeder = provider.feeder_for("todo");

    feeder
        .feed(vec![insert(1, "write tests"), insert(2, "ship it"), Message::up_to_date()])
        .await;
    wait_rows(&engine, "todo", 2).await;

    feeder
        .feed(vec![
            ChangeMessage::update(
                key("todo", 1),
                row([("id", Value::from(1)), ("done", Value::from(true))]),
            )
            .into(),
            ChangeMessage::delete(key("todo", 2), row([("id", Value::from(2))])).into(),
            Message::up_to_date(),
        ])
        .await;
    wait_rows(&engine, "todo", 1).await;

    let rows = engine
        .run_exclusive(|db| select_all(&*db, "todo", "id"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["task"], Value::from("write tests"));
    assert_eq!(rows[0]["done"], Value::Integer(1));
    assert!(sub.is_up_to_date());
    assert_eq!(sub.shape_handle().as_deref(), Some("handle-1"));

    sub.unsubscribe().await;
    assert!(feeder.is_unsubscribed());
}

#[tokio::test]
async fn up_to_date_granularity_commits_once_per_sync() {
    let (engine, provider, stats) = setup();
    let sub = engine.sync_shape_to_table(todo_options()).await.unwrap();
    let feeder = provider.feeder_for("todo");

    feeder.feed(vec![insert(1, "a"), insert(2, "b")]).await;
    feeder.feed(vec![insert(3, "c"), Message::up_to_date()]).await;
    wait_until("first commit", || stats.commits() == 1).await;

    assert_eq!(count(&engine, "todo").await, 3);
    assert_eq!(stats.transactions(), 1);
    sub.unsubscribe().await;
}

#[tokio::test]
async fn batch_granularity_commits_every_n_messages() {
    let (engine, provider, stats) = setup();
    let sub = engine
        .sync_shape_to_table(todo_options().with_commit_granularity(CommitGranularity::Batch(5)))
        .await
        .unwrap();
    let feeder = provider.feeder_for("todo");

    feeder
        .feed((1..=7).map(|id| insert(id, "task")).collect())
        .await;
    wait_until("batch of five", || stats.commits() == 1).await;
    assert_eq!(count(&engine, "todo").await, 5);

    feeder.feed(vec![Message::up_to_date()]).await;
    wait_until("remaining two", || stats.commits() == 2).await;
    assert_eq!(count(&engine, "todo").await, 7);
    assert_eq!(stats.transactions(), 2);
    sub.unsubscribe().await;
}

#[tokio::test]
async fn operation_granularity_commits_every_message() {
    let (engine, provider, stats) = setup();
    let sub = engine
        .sync_shape_to_table(todo_options().with_commit_granularity(CommitGranularity::Operation))
        .await
        .unwrap();
    provider
        .feeder_for("todo")
        .feed(vec![insert(1, "a"), insert(2, "b"), insert(3, "c")])
        .await;
    wait_until("three commits", || stats.commits() == 3).await;
    assert_eq!(todo_ids(&engine).await, vec![1, 2, 3]);
    sub.unsubscribe().await;
}

#[tokio::test]
async fn key_only_update_executes_nothing() {
    let (engine, provider, stats) = setup();
    let sub = engine.sync_shape_to_table(todo_options()).await.unwrap();
    let feeder = provider.feeder_for("todo");

    feeder.feed(vec![insert(1, "a"), Message::up_to_date()]).await;
    wait_until("insert committed", || stats.commits() == 1).await;
    let before = stats.statements();
    assert_eq!(before, 1);

    feeder
        .feed(vec![
            ChangeMessage::update(key("todo", 1), row([("id", Value::from(1))])).into(),
            Message::up_to_date(),
        ])
        .await;
    wait_until("no-op committed", || stats.commits() == 2).await;
    assert_eq!(stats.statements(), before);
    sub.unsubscribe().await;
}

#[tokio::test]
async fn commit_throttle_defers_until_window_or_up_to_date() {
    let (engine, provider, stats) = setup();
    let sub = engine
        .sync_shape_to_table(
            todo_options()
                .with_commit_granularity(CommitGranularity::Operation)
                .with_commit_throttle(Duration::from_millis(150)),
        )
        .await
        .unwrap();
    let feeder = provider.feeder_for("todo");

    feeder.feed(vec![insert(1, "a")]).await;
    wait_until("first commit", || stats.commits() == 1).await;

    feeder.feed(vec![insert(2, "b")]).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(count(&engine, "todo").await, 1);

    // The deferred flush runs when the window ends.
    wait_rows(&engine, "todo", 2).await;
    assert_eq!(stats.commits(), 2);

    // up-to-date flushes at once, whatever the window.
    feeder.feed(vec![insert(3, "c"), Message::up_to_date()]).await;
    wait_until("forced commit", || stats.commits() == 3).await;
    assert_eq!(todo_ids(&engine).await, vec![1, 2, 3]);
    sub.unsubscribe().await;
}

#[tokio::test]
async fn resumes_from_exact_position_after_restart() {
    init_tracing();
    let store = TempStore::new();
    let db = store.open();
    create_schema(&db);
    let initial_syncs = Arc::new(AtomicUsize::new(0));

    {
        let provider = ScriptedProvider::new();
        let engine = engine_on(db, &provider);
        let counter = Arc::clone(&initial_syncs);
        let _sub = engine
            .sync_shape_to_table(
                todo_options()
                    .with_shape_key("todos")
                    .with_on_initial_sync(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .await
            .unwrap();
        let feeder = provider.feeder_for("todo");
        feeder
            .feed(vec![
                ChangeMessage::insert(key("todo", 1), todo(1, "a"))
                    .with_offset("5_0")
                    .into(),
                Message::up_to_date(),
            ])
            .await;
        wait_until("initial sync", || initial_syncs.load(Ordering::SeqCst) == 1).await;
        assert_eq!(
            engine.shape_state("todos").await.unwrap(),
            Some(ShapeSubscriptionState::new("handle-1", "5_0"))
        );
        engine.close().await.unwrap();
    }

    let provider = ScriptedProvider::new();
    let engine = engine_on(store.open(), &provider);
    let counter = Arc::clone(&initial_syncs);
    let sub = engine
        .sync_shape_to_table(
            todo_options()
                .with_shape_key("todos")
                .with_on_initial_sync(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .await
        .unwrap();

    let opened = provider.last_opened("todo").unwrap();
    assert_eq!(opened.handle.as_deref(), Some("handle-1"));
    assert_eq!(opened.offset.as_ref().map(|o| o.as_str()), Some("5_0"));
    assert_eq!(sub.shape_handle().as_deref(), Some("handle-1"));

    let feeder = provider.feeder_for("todo");
    feeder
        .feed(vec![
            ChangeMessage::insert(key("todo", 2), todo(2, "b"))
                .with_offset("6_0")
                .into(),
            Message::up_to_date(),
        ])
        .await;
    wait_until_async("resumed rows", || async {
        todo_ids(&engine).await == vec![1, 2]
    })
    .await;
    // A resumed subscription never reports an initial sync.
    assert_eq!(initial_syncs.load(Ordering::SeqCst), 1);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn failed_flush_is_redelivered_after_restart() {
    init_tracing();
    let store = TempStore::new();
    let db = store.open();
    create_schema(&db);

    {
        let provider = ScriptedProvider::new();
        let engine = engine_on(db, &provider);
        let sub = engine
            .sync_shape_to_table(todo_options().with_shape_key("todos"))
            .await
            .unwrap();
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        sub.subscribe(
            || {},
            move |_: &SyncError| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        );
        let feeder = provider.feeder_for("todo");

        feeder
            .feed(vec![
                ChangeMessage::insert(key("todo", 1), todo(1, "a"))
                    .with_offset("1_0")
                    .into(),
                Message::up_to_date(),
            ])
            .await;
        wait_rows(&engine, "todo", 1).await;

        feeder
            .feed(vec![
                ChangeMessage::insert(
                    key("todo", 2),
                    row([("id", Value::from(2)), ("task", Value::Null)]),
                )
                .with_offset("2_0")
                .into(),
                Message::up_to_date(),
            ])
            .await;
        wait_until("flush error", || errors.load(Ordering::SeqCst) == 1).await;

        feeder
            .feed(vec![
                ChangeMessage::insert(key("todo", 3), todo(3, "c"))
                    .with_offset("3_0")
                    .into(),
                Message::up_to_date(),
            ])
            .await;
        wait_rows(&engine, "todo", 2).await;

        assert_eq!(
            engine.shape_state("todos").await.unwrap(),
            Some(ShapeSubscriptionState::new("handle-1", "1_0"))
        );
        engine.close().await.unwrap();
    }

    let provider = ScriptedProvider::new();
    let engine = engine_on(store.open(), &provider);
    let sub = engine
        .sync_shape_to_table(todo_options().with_shape_key("todos"))
        .await
        .unwrap();
    let opened = provider.last_opened("todo").unwrap();
    assert_eq!(opened.offset.as_ref().map(|o| o.as_str()), Some("1_0"));
    sub.unsubscribe().await;
    engine.close().await.unwrap();
}

#[tokio::test]
async fn must_refetch_truncates_and_restarts_from_new_handle() {
    let (engine, provider, _) = setup();
    let sub = engine
        .sync_shape_to_table(todo_options().with_shape_key("todos"))
        .await
        .unwrap();
    let feeder = provider.feeder_for("todo");

    feeder
        .feed(vec![
            ChangeMessage::insert(key("todo", 1), todo(1, "stale"))
                .with_offset("1_0")
                .into(),
            Message::up_to_date(),
        ])
        .await;
    wait_rows(&engine, "todo", 1).await;

    feeder
        .feed(vec![
            ChangeMessage::insert(key("todo", 2), todo(2, "dropped"))
                .with_offset("2_0")
                .into(),
            Message::must_refetch(),
            ChangeMessage::insert(key("todo", 3), todo(3, "fresh"))
                .with_offset("0_0")
                .into(),
            Message::up_to_date(),
        ])
        .await;
    wait_until_async("refetched rows", || async { todo_ids(&engine).await == vec![3] }).await;

    assert_eq!(
        engine.shape_state("todos").await.unwrap(),
        Some(ShapeSubscriptionState::new("handle-2", "0_0"))
    );
    assert_eq!(sub.shape_handle().as_deref(), Some("handle-2"));
    sub.unsubscribe().await;
}

#[tokio::test]
async fn refetch_hook_replaces_truncate() {
    let (engine, provider, _) = setup();
    let sub = engine
        .sync_shape_to_table(todo_options().with_on_must_refetch(|tx| {
            tx.exec("DELETE FROM todo WHERE done = 0")?;
            Ok(())
        }))
        .await
        .unwrap();
    let feeder = provider.feeder_for("todo");

    feeder
        .feed(vec![
            insert(1, "open"),
            ChangeMessage::insert(
                key("todo", 2),
                row([
                    ("id", Value::from(2)),
                    ("task", Value::from("finished")),
                    ("done", Value::from(true)),
                ]),
            )
            .into(),
            Message::up_to_date(),
        ])
        .await;
    wait_rows(&engine, "todo", 2).await;

    feeder
        .feed(vec![Message::must_refetch(), Message::up_to_date()])
        .await;
    wait_until_async("hook ran", || async { todo_ids(&engine).await == vec![2] }).await;
    sub.unsubscribe().await;
}

#[tokio::test]
async fn tables_are_exclusive_until_released() {
    let db = TestDatabase::memory()
        .with_schema(TODO_SCHEMA)
        .with_schema(USER_SCHEMA)
        .into_inner();
    let (engine, _provider, _) = setup_with(db);

    let first = engine.sync_shape_to_table(todo_options()).await.unwrap();
    let err = engine.sync_shape_to_table(todo_options()).await.unwrap_err();
    assert!(matches!(err, SyncError::AlreadySyncing { ref table } if table == "todo"));

    // A group touching a bound table binds nothing.
    let group = SyncShapesToTablesOptions::new("group")
        .with_shape("users", shape("app_user"), TableBinding::new("app_user", ["id"]))
        .with_shape("todos", shape("todo"), TableBinding::new("todo", ["id"]));
    assert!(matches!(
        engine.sync_shapes_to_tables(group.clone()).await,
        Err(SyncError::AlreadySyncing { .. })
    ));
    assert!(!engine.is_table_synced("app_user").await);

    first.unsubscribe().await;
    assert!(!engine.is_table_synced("todo").await);

    let multi = engine.sync_shapes_to_tables(group).await.unwrap();
    assert!(engine.is_table_synced("todo").await);
    assert!(engine.is_table_synced("app_user").await);
    multi.unsubscribe().await;
}

#[tokio::test]
async fn failed_open_leaves_no_binding() {
    let (engine, provider, _) = setup();
    provider.fail_table("todo");
    let err = engine.sync_shape_to_table(todo_options()).await.unwrap_err();
    assert!(matches!(err, SyncError::Transport(_)));
    assert!(!engine.is_table_synced("todo").await);
}

fn user(id: i64, name: Value) -> Message {
    ChangeMessage::insert(
        key("app_user", id),
        row([("id", Value::from(id)), ("name", name)]),
    )
    .into()
}

fn group_options() -> SyncShapesToTablesOptions {
    SyncShapesToTablesOptions::new("group")
        .with_shape("todos", shape("todo"), TableBinding::new("todo", ["id"]))
        .with_shape("users", shape("app_user"), TableBinding::new("app_user", ["id"]))
}

#[tokio::test]
async fn multi_shape_commits_atomically() {
    let db = TestDatabase::memory()
        .with_schema(TODO_SCHEMA)
        .with_schema(USER_SCHEMA)
        .into_inner();
    let (engine, provider, stats) = setup_with(db);
    let errors = Arc::new(Mutex::new(Vec::<String>::new()));

    let sub = engine.sync_shapes_to_tables(group_options()).await.unwrap();
    let sink = Arc::clone(&errors);
    sub.subscribe(|| {}, move |e: &SyncError| sink.lock().push(e.to_string()));
    let todos = provider.feeder_for("todo");
    let users = provider.feeder_for("app_user");

    users
        .feed(vec![ChangeMessage::insert(
            key("app_user", 1),
            row([("id", Value::from(1)), ("name", Value::from("ada"))]),
        )
        .with_lsn(12)
        .with_offset("12_0")
        .into()])
        .await;
    todos
        .feed(vec![
            ChangeMessage::insert(key("todo", 1), todo(1, "a"))
                .with_lsn(10)
                .with_offset("10_0")
                .into(),
            Message::up_to_date(),
        ])
        .await;
    // Only one shape is up to date: nothing is written yet.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(stats.transactions(), 0);

    users.feed(vec![Message::up_to_date()]).await;
    wait_until("group commit", || stats.commits() == 1).await;
    assert_eq!(count(&engine, "todo").await, 1);
    assert_eq!(count(&engine, "app_user").await, 1);
    assert!(sub.is_up_to_date());

    let state = engine.subscription_state("group").await.unwrap().unwrap();
    assert_eq!(state.last_lsn, 12);
    assert_eq!(state.shape_metadata.len(), 2);
    assert_eq!(state.shape_metadata["todos"].offset.as_str(), "10_0");
    let handles = sub.shape_handles();
    assert_eq!(
        state.shape_metadata["users"].handle,
        handles["users"].clone().unwrap()
    );

    // A NOT NULL violation in one table rolls back the other.
    users.feed(vec![user(2, Value::from("grace"))]).await;
    todos
        .feed(vec![
            ChangeMessage::insert(
                key("todo", 2),
                row([("id", Value::from(2)), ("task", Value::Null)]),
            )
            .into(),
            Message::up_to_date(),
        ])
        .await;
    users.feed(vec![Message::up_to_date()]).await;
    wait_until("rollback", || stats.rollbacks() == 1).await;
    wait_until("error reported", || errors.lock().len() == 1).await;

    assert_eq!(count(&engine, "app_user").await, 1);
    assert_eq!(count(&engine, "todo").await, 1);
    assert_eq!(engine.subscription_state("group").await.unwrap(), Some(state));
    assert!(sub.is_active());
    sub.unsubscribe().await;
}

#[tokio::test]
async fn multi_shape_resumes_each_shape() {
    init_tracing();
    let store = TempStore::new();
    let db = store.open();
    create_schema(&db);
    let provider = ScriptedProvider::new();
    let engine = engine_on(db, &provider);

    let sub = engine.sync_shapes_to_tables(group_options()).await.unwrap();
    provider
        .feeder_for("app_user")
        .feed(vec![user(1, Value::from("ada")), Message::up_to_date()])
        .await;
    provider
        .feeder_for("todo")
        .feed(vec![insert(1, "a"), Message::up_to_date()])
        .await;
    wait_until_async("group state", || async {
        engine.subscription_state("group").await.unwrap().is_some()
    })
    .await;
    let handles = sub.shape_handles();
    engine.close().await.unwrap();
    assert!(!sub.is_active());

    let provider = ScriptedProvider::new();
    let engine = engine_on(store.open(), &provider);
    let sub = engine.sync_shapes_to_tables(group_options()).await.unwrap();
    assert_eq!(sub.shape_handles(), handles);
    for table in ["todo", "app_user"] {
        assert!(provider.last_opened(table).unwrap().is_resuming());
    }

    engine.delete_subscription("group").await.unwrap();
    assert!(engine.subscription_state("group").await.unwrap().is_none());
    engine.close().await.unwrap();
}

#[tokio::test]
async fn initial_sync_fires_once() {
    let (engine, provider, _) = setup();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let sub = engine
        .sync_shape_to_table(todo_options().with_on_initial_sync(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();
    let feeder = provider.feeder_for("todo");

    feeder.feed(vec![insert(1, "a"), Message::up_to_date()]).await;
    wait_until("initial sync", || fired.load(Ordering::SeqCst) == 1).await;
    feeder.feed(vec![insert(2, "b"), Message::up_to_date()]).await;
    wait_rows(&engine, "todo", 2).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    sub.unsubscribe().await;
}

#[tokio::test]
async fn listeners_see_up_to_date_and_transport_errors() {
    let (engine, provider, _) = setup();
    let sub = engine.sync_shape_to_table(todo_options()).await.unwrap();
    let up_to_date = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(Mutex::new(Vec::<bool>::new()));

    let ups = Arc::clone(&up_to_date);
    let errs = Arc::clone(&errors);
    let listener = sub.subscribe(
        move || {
            ups.fetch_add(1, Ordering::SeqCst);
        },
        move |e: &SyncError| errs.lock().push(e.is_retryable()),
    );
    let feeder = provider.feeder_for("todo");

    feeder.feed(vec![insert(1, "a")]).await;
    feeder.feed(vec![Message::up_to_date()]).await;
    wait_until("up-to-date notification", || up_to_date.load(Ordering::SeqCst) == 1).await;
    // One up-to-date message notifies exactly once.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(up_to_date.load(Ordering::SeqCst), 1);

    feeder.fail(TransportError::retryable("connection reset")).await;
    wait_until("error notification", || errors.lock().len() == 1).await;
    assert!(errors.lock()[0]);

    assert!(sub.remove_listener(listener));
    feeder.fail(TransportError::fatal("gone")).await;
    feeder.feed(vec![insert(2, "b"), Message::up_to_date()]).await;
    wait_rows(&engine, "todo", 2).await;
    assert_eq!(errors.lock().len(), 1);
    assert_eq!(up_to_date.load(Ordering::SeqCst), 1);
    sub.unsubscribe().await;
}

#[tokio::test]
async fn concurrent_unsubscribes_both_wait_for_exit() {
    let (engine, provider, _) = setup();
    let sub = engine.sync_shape_to_table(todo_options()).await.unwrap();
    provider
        .feeder_for("todo")
        .feed(vec![insert(1, "a"), Message::up_to_date()])
        .await;

    let (first, second) = tokio::join!(
        async {
            sub.unsubscribe().await;
            sub.is_active()
        },
        async {
            sub.unsubscribe().await;
            sub.is_active()
        },
    );
    assert!(!first);
    assert!(!second);

    // The table is free as soon as either call returns.
    let again = engine.sync_shape_to_table(todo_options()).await.unwrap();
    again.unsubscribe().await;
}

#[tokio::test]
async fn external_cancellation_ends_subscription() {
    let (engine, provider, _) = setup();
    let token = CancellationToken::new();
    let sub = engine
        .sync_shape_to_table(todo_options().with_cancel(token.clone()))
        .await
        .unwrap();
    let feeder = provider.feeder_for("todo");

    token.cancel();
    wait_until("subscription ended", || !sub.is_active()).await;
    assert!(feeder.is_cancelled());
    assert_eq!(feeder.feed(vec![insert(1, "a")]).await, 0);
    wait_until_async("table released", || async {
        !engine.is_table_synced("todo").await
    })
    .await;
    assert_eq!(count(&engine, "todo").await, 0);
}

#[tokio::test]
async fn close_stops_subscriptions_and_rejects_later_calls() {
    let (engine, provider, stats) = setup();
    let sub = engine.sync_shape_to_table(todo_options()).await.unwrap();
    let feeder = provider.feeder_for("todo");
    feeder.feed(vec![insert(1, "a"), Message::up_to_date()]).await;
    wait_until("commit", || stats.commits() == 1).await;

    engine.close().await.unwrap();
    assert!(!sub.is_active());
    assert!(feeder.is_unsubscribed());

    assert!(matches!(
        engine.sync_shape_to_table(todo_options()).await,
        Err(SyncError::Closed)
    ));
    assert!(matches!(engine.shape_state("todos").await, Err(SyncError::Closed)));
    assert!(matches!(engine.close().await, Err(SyncError::Closed)));
}

#[tokio::test]
async fn messages_apply_in_arrival_order() {
    let (engine, provider, _) = setup();
    let sub = engine.sync_shape_to_table(todo_options()).await.unwrap();
    let feeder = provider.feeder_for("todo");

    // Insert then delete then re-insert the same key within one flush.
    feeder
        .feed(vec![
            insert(1, "first"),
            ChangeMessage::delete(key("todo", 1), row([("id", Value::from(1))])).into(),
            insert(1, "second"),
            Message::up_to_date(),
        ])
        .await;
    wait_rows(&engine, "todo", 1).await;
    let rows = engine
        .run_exclusive(|db| select_all(&*db, "todo", "id"))
        .await
        .unwrap();
    assert_eq!(rows[0]["task"], Value::from("second"));
    sub.unsubscribe().await;
}
