//! Property-based test generators using proptest.
//!
//! Provides strategies for generating rows and change messages that a
//! SQLite table can store.

use proptest::prelude::*;
use shapesync_protocol::{ChangeMessage, Message, Operation, Row, Value};
use std::collections::BTreeMap;

/// Strategy for generating storable column values.
///
/// Reals are finite: SQLite stores NaN as NULL.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        (-1.0e12f64..1.0e12).prop_map(Value::Real),
        "[a-zA-Z0-9 _-]{0,24}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..32).prop_map(Value::Blob),
    ]
}

/// Strategy for generating valid column names.
///
/// Names start with `c_` so they never collide with `id`.
pub fn column_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("c_[a-z0-9_]{1,15}").expect("Invalid regex")
}

/// Strategy for generating a row with an integer `id` and extra columns.
pub fn row_strategy(id: i64) -> impl Strategy<Value = Row> {
    prop::collection::btree_map(column_name_strategy(), value_strategy(), 0..6).prop_map(
        move |mut columns: BTreeMap<String, Value>| {
            columns.insert("id".into(), Value::Integer(id));
            columns
        },
    )
}

/// Strategy for generating a change message for the row with `id`.
pub fn change_message_strategy(id: i64) -> impl Strategy<Value = ChangeMessage> {
    (
        prop_oneof![
            Just(Operation::Insert),
            Just(Operation::Update),
            Just(Operation::Delete),
        ],
        row_strategy(id),
    )
        .prop_map(move |(operation, value)| {
            ChangeMessage::new(operation, format!("\"public\".\"todo\"/\"{id}\""), value)
        })
}

/// Strategy for generating `todo` inserts with distinct ids and ascending
/// offsets.
pub fn todo_inserts_strategy(max: usize) -> impl Strategy<Value = Vec<Message>> {
    prop::collection::btree_set(1i64..10_000, 1..=max.max(1)).prop_flat_map(|ids| {
        let tasks = prop::collection::vec("[a-z ]{1,16}", ids.len());
        (Just(ids), tasks).prop_map(|(ids, tasks)| {
            ids.into_iter()
                .zip(tasks)
                .enumerate()
                .map(|(i, (id, task))| {
                    let value = [
                        ("id".to_owned(), Value::Integer(id)),
                        ("task".to_owned(), Value::Text(task)),
                    ]
                    .into_iter()
                    .collect();
                    Message::Change(
                        ChangeMessage::insert(format!("\"public\".\"todo\"/\"{id}\""), value)
                            .with_offset(format!("{}_{i}", i + 1)),
                    )
                })
                .collect()
        })
    })
}
