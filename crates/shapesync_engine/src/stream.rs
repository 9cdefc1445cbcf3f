//! Shape stream abstraction.
//!
//! The engine does not fetch shape logs itself. A [`ShapeStreamProvider`]
//! opens one [`ShapeStream`] per shape, and the stream pushes decoded
//! batches into the subscription's bounded channel through a
//! [`BatchSink`]. A full channel back-pressures the stream.

use crate::error::{SyncError, SyncResult, TransportError};
use shapesync_protocol::{parse_batch, Message, Offset};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Selection parameters of a shape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShapeParams {
    /// Remote table the shape is defined on.
    pub table: String,
    /// Row filter.
    pub where_clause: Option<String>,
    /// Column selection.
    pub columns: Option<Vec<String>>,
    /// Any other parameter understood by the server.
    pub extra: BTreeMap<String, String>,
}

impl ShapeParams {
    /// Selects every row of a table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    /// Sets the row filter.
    pub fn with_where(mut self, clause: impl Into<String>) -> Self {
        self.where_clause = Some(clause.into());
        self
    }

    /// Sets the column selection.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Adds a server parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }
}

/// Where a shape lives and what it selects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShapeOptions {
    /// Shape endpoint.
    pub url: String,
    /// Selection parameters.
    pub params: ShapeParams,
}

impl ShapeOptions {
    /// Creates shape options.
    pub fn new(url: impl Into<String>, params: ShapeParams) -> Self {
        Self {
            url: url.into(),
            params,
        }
    }
}

/// Everything a provider needs to open a stream.
#[derive(Debug, Clone)]
pub struct ShapeStreamOptions {
    /// Shape endpoint.
    pub url: String,
    /// Selection parameters.
    pub params: ShapeParams,
    /// Persisted handle to resume from; `None` requests a fresh snapshot.
    pub handle: Option<String>,
    /// Persisted offset to resume from.
    pub offset: Option<Offset>,
    /// Cancelled when the subscription ends.
    pub cancel: CancellationToken,
}

impl ShapeStreamOptions {
    /// Returns true if the stream resumes from a persisted position.
    pub fn is_resuming(&self) -> bool {
        self.handle.is_some()
    }
}

/// Messages delivered together by a stream, with the stream position after
/// them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamBatch {
    /// Messages, in log order.
    pub messages: Vec<Message>,
    /// Shape handle of the stream after the batch.
    pub handle: Option<String>,
    /// Offset of the stream after the batch.
    pub offset: Option<Offset>,
}

impl StreamBatch {
    /// Creates a batch without position information.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Decodes a batch from the JSON array returned by a shape log request.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        Ok(Self::new(parse_batch(json)?))
    }

    /// Sets the stream position after the batch.
    pub fn with_position(mut self, handle: impl Into<String>, offset: impl Into<Offset>) -> Self {
        self.handle = Some(handle.into());
        self.offset = Some(offset.into());
        self
    }
}

/// What streams push into a subscription's channel.
#[derive(Debug)]
pub(crate) enum ShapeEvent {
    Batch { shape: String, batch: StreamBatch },
    Error { shape: String, error: TransportError },
}

/// The sending side of a subscription's channel, bound to one shape.
#[derive(Debug, Clone)]
pub struct BatchSink {
    shape: String,
    tx: mpsc::Sender<ShapeEvent>,
}

impl BatchSink {
    pub(crate) fn new(shape: impl Into<String>, tx: mpsc::Sender<ShapeEvent>) -> Self {
        Self {
            shape: shape.into(),
            tx,
        }
    }

    /// Name of the shape this sink delivers for.
    pub fn shape(&self) -> &str {
        &self.shape
    }

    /// Delivers a batch, waiting while the channel is full.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Cancelled`] once the subscription has ended.
    pub async fn send(&self, batch: StreamBatch) -> SyncResult<()> {
        self.tx
            .send(ShapeEvent::Batch {
                shape: self.shape.clone(),
                batch,
            })
            .await
            .map_err(|_| SyncError::Cancelled)
    }

    /// Reports a transport error to the subscription's error listeners.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Cancelled`] once the subscription has ended.
    pub async fn fail(&self, error: TransportError) -> SyncResult<()> {
        self.tx
            .send(ShapeEvent::Error {
                shape: self.shape.clone(),
                error,
            })
            .await
            .map_err(|_| SyncError::Cancelled)
    }

    /// Returns true once the subscription has stopped consuming.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A live stream of one shape's change log.
///
/// # Implementors
///
/// Implementations own the transport (long polling, server-sent events,
/// a test script) and must:
///
/// - deliver batches in log order through the sink given to `subscribe`
/// - stop delivering once `unsubscribe_all` is called or the
///   cancellation token of their [`ShapeStreamOptions`] fires
pub trait ShapeStream: Send + Sync {
    /// Starts delivering batches into `sink`.
    fn subscribe(&self, sink: BatchSink) -> SyncResult<()>;

    /// The server-assigned handle, once known.
    fn shape_handle(&self) -> Option<String>;

    /// Returns true if the last delivered batch ended with `up-to-date`.
    fn is_up_to_date(&self) -> bool;

    /// Detaches every sink.
    fn unsubscribe_all(&self);
}

/// Opens shape streams.
pub trait ShapeStreamProvider: Send + Sync + 'static {
    /// Opens a stream for one shape.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be created.
    fn open(&self, options: ShapeStreamOptions) -> SyncResult<Arc<dyn ShapeStream>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use shapesync_protocol::Operation;

    #[test]
    fn shape_params_builder() {
        let params = ShapeParams::new("todo")
            .with_where("done = false")
            .with_columns(["id", "task"])
            .with_param("replica", "full");
        assert_eq!(params.table, "todo");
        assert_eq!(params.where_clause.as_deref(), Some("done = false"));
        assert_eq!(params.columns.as_ref().map(Vec::len), Some(2));
        assert_eq!(params.extra["replica"], "full");
    }

    #[test]
    fn batch_from_json() {
        let batch = StreamBatch::from_json(
            r#"[
                {"headers": {"operation": "insert", "lsn": "7"}, "key": "\"public\".\"todo\"/\"1\"",
                 "value": {"id": 1, "task": "a"}, "offset": "7_0"},
                {"headers": {"control": "up-to-date", "global_last_seen_lsn": "7"}}
            ]"#,
        )
        .unwrap()
        .with_position("h1", "7_0");

        assert_eq!(batch.messages.len(), 2);
        assert!(matches!(&batch.messages[0], Message::Change(c) if c.operation == Operation::Insert));
        assert!(batch.messages[1].is_up_to_date());
        assert_eq!(batch.handle.as_deref(), Some("h1"));
        assert_eq!(batch.offset, Some(Offset::new("7_0")));

        assert!(matches!(
            StreamBatch::from_json("{"),
            Err(SyncError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn sink_reports_closed_channel() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = BatchSink::new("todos", tx);
        sink.send(StreamBatch::new(vec![Message::up_to_date()]))
            .await
            .unwrap();
        match rx.recv().await {
            Some(ShapeEvent::Batch { shape, batch }) => {
                assert_eq!(shape, "todos");
                assert_eq!(batch.messages.len(), 1);
            }
            other => panic!("unexpected event {other:?}"),
        }

        drop(rx);
        assert!(sink.is_closed());
        assert!(matches!(
            sink.fail(TransportError::fatal("gone")).await,
            Err(SyncError::Cancelled)
        ));
    }
}
