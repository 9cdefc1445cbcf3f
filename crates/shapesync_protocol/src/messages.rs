//! Shape stream messages and their JSON wire decoding.

use crate::error::{ProtocolError, ProtocolResult};
use crate::operation::Operation;
use crate::value::Row;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position within a shape's change log.
///
/// Offsets are opaque to the client apart from two well-known values. They
/// are persisted verbatim and handed back to the stream on resume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Offset(String);

impl Offset {
    /// Offset requesting the log from the very beginning (full snapshot).
    pub const BEFORE_ALL: &'static str = "-1";

    /// Creates an offset from its string form.
    pub fn new(offset: impl Into<String>) -> Self {
        Self(offset.into())
    }

    /// The offset that starts a shape from scratch.
    pub fn before_all() -> Self {
        Self(Self::BEFORE_ALL.to_owned())
    }

    /// Returns true if this offset starts from scratch.
    pub fn is_before_all(&self) -> bool {
        self.0 == Self::BEFORE_ALL
    }

    /// Returns the offset string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the log sequence number prefix of a `<lsn>_<op>` offset.
    pub fn lsn(&self) -> Option<u64> {
        self.0.split_once('_').and_then(|(lsn, _)| lsn.parse().ok())
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Offset {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Offset {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A single row mutation delivered by a shape stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeMessage {
    /// Opaque row identity token assigned by the stream.
    pub key: String,
    /// The kind of mutation.
    pub operation: Operation,
    /// Column values of the row.
    pub value: Row,
    /// Previous column values (only sent for updates with full replica mode).
    pub old_value: Option<Row>,
    /// Log position of this message, when the stream reports one.
    pub offset: Option<Offset>,
    /// Global ordering token of the transaction that produced the change.
    pub lsn: Option<u64>,
    /// Name of the shape this message belongs to, in multi-shape groups.
    pub shape: Option<String>,
}

impl ChangeMessage {
    /// Creates a change message with the given operation.
    pub fn new(operation: Operation, key: impl Into<String>, value: Row) -> Self {
        Self {
            key: key.into(),
            operation,
            value,
            old_value: None,
            offset: None,
            lsn: None,
            shape: None,
        }
    }

    /// Creates an insert message.
    pub fn insert(key: impl Into<String>, value: Row) -> Self {
        Self::new(Operation::Insert, key, value)
    }

    /// Creates an update message.
    pub fn update(key: impl Into<String>, value: Row) -> Self {
        Self::new(Operation::Update, key, value)
    }

    /// Creates a delete message.
    pub fn delete(key: impl Into<String>, value: Row) -> Self {
        Self::new(Operation::Delete, key, value)
    }

    /// Sets the message offset.
    pub fn with_offset(mut self, offset: impl Into<Offset>) -> Self {
        self.offset = Some(offset.into());
        self
    }

    /// Sets the message LSN.
    pub fn with_lsn(mut self, lsn: u64) -> Self {
        self.lsn = Some(lsn);
        self
    }

    /// Tags the message with a shape name.
    pub fn with_shape(mut self, shape: impl Into<String>) -> Self {
        self.shape = Some(shape.into());
        self
    }
}

/// Kind of control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlKind {
    /// The stream has delivered everything available right now.
    UpToDate,
    /// The server invalidated all data previously sent for the shape.
    MustRefetch,
    /// Any other control message (`snapshot-end`, `subset-end`, ...).
    Other(String),
}

impl ControlKind {
    /// Parses the wire name of a control message.
    pub fn from_name(name: &str) -> Self {
        match name {
            "up-to-date" => ControlKind::UpToDate,
            "must-refetch" => ControlKind::MustRefetch,
            other => ControlKind::Other(other.to_owned()),
        }
    }

    /// Returns the wire name.
    pub fn as_str(&self) -> &str {
        match self {
            ControlKind::UpToDate => "up-to-date",
            ControlKind::MustRefetch => "must-refetch",
            ControlKind::Other(name) => name,
        }
    }
}

/// A control message delivered by a shape stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    /// The control signal.
    pub kind: ControlKind,
    /// Highest LSN the server had seen when sending `up-to-date`.
    pub global_last_seen_lsn: Option<u64>,
    /// Name of the shape this message belongs to, in multi-shape groups.
    pub shape: Option<String>,
}

impl ControlMessage {
    /// Creates a control message of the given kind.
    pub fn new(kind: ControlKind) -> Self {
        Self {
            kind,
            global_last_seen_lsn: None,
            shape: None,
        }
    }
}

/// A message delivered by a shape stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A row mutation.
    Change(ChangeMessage),
    /// A control signal.
    Control(ControlMessage),
}

impl Message {
    /// An `up-to-date` control message.
    pub fn up_to_date() -> Self {
        Message::Control(ControlMessage::new(ControlKind::UpToDate))
    }

    /// A `must-refetch` control message.
    pub fn must_refetch() -> Self {
        Message::Control(ControlMessage::new(ControlKind::MustRefetch))
    }

    /// Returns the shape tag, if any.
    pub fn shape(&self) -> Option<&str> {
        match self {
            Message::Change(m) => m.shape.as_deref(),
            Message::Control(m) => m.shape.as_deref(),
        }
    }

    /// Tags the message with a shape name.
    pub fn with_shape(self, shape: impl Into<String>) -> Self {
        let shape = Some(shape.into());
        match self {
            Message::Change(mut m) => {
                m.shape = shape;
                Message::Change(m)
            }
            Message::Control(mut m) => {
                m.shape = shape;
                Message::Control(m)
            }
        }
    }

    /// Returns true for an `up-to-date` control message.
    pub fn is_up_to_date(&self) -> bool {
        matches!(self, Message::Control(c) if c.kind == ControlKind::UpToDate)
    }

    /// Returns true for a `must-refetch` control message.
    pub fn is_must_refetch(&self) -> bool {
        matches!(self, Message::Control(c) if c.kind == ControlKind::MustRefetch)
    }

    /// Decodes one message from its JSON wire form.
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let wire: WireMessage = serde_json::from_str(json)?;
        wire.try_into()
    }

    /// Decodes one message from an already parsed JSON value.
    pub fn from_json_value(json: serde_json::Value) -> ProtocolResult<Self> {
        let wire: WireMessage = serde_json::from_value(json)?;
        wire.try_into()
    }
}

impl From<ChangeMessage> for Message {
    fn from(m: ChangeMessage) -> Self {
        Message::Change(m)
    }
}

impl From<ControlMessage> for Message {
    fn from(m: ControlMessage) -> Self {
        Message::Control(m)
    }
}

/// Decodes a JSON array of messages, as returned by one shape log request.
pub fn parse_batch(json: &str) -> ProtocolResult<Vec<Message>> {
    let wire: Vec<WireMessage> = serde_json::from_str(json)?;
    wire.into_iter().map(Message::try_from).collect()
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    headers: WireHeaders,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<Row>,
    #[serde(default)]
    old_value: Option<Row>,
    #[serde(default)]
    offset: Option<Offset>,
}

#[derive(Debug, Deserialize)]
struct WireHeaders {
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    control: Option<String>,
    #[serde(default)]
    lsn: Option<serde_json::Value>,
    #[serde(default)]
    global_last_seen_lsn: Option<serde_json::Value>,
}

impl TryFrom<WireMessage> for Message {
    type Error = ProtocolError;

    fn try_from(wire: WireMessage) -> ProtocolResult<Self> {
        let WireMessage {
            headers,
            key,
            value,
            old_value,
            offset,
        } = wire;

        if let Some(operation) = headers.operation {
            let key = key.ok_or(ProtocolError::MissingField("key"))?;
            let value = value.ok_or(ProtocolError::MissingField("value"))?;
            return Ok(Message::Change(ChangeMessage {
                key,
                operation: Operation::from_name(&operation),
                value,
                old_value,
                offset,
                lsn: headers.lsn.as_ref().map(parse_lsn).transpose()?,
                shape: None,
            }));
        }

        if let Some(control) = headers.control {
            return Ok(Message::Control(ControlMessage {
                kind: ControlKind::from_name(&control),
                global_last_seen_lsn: headers
                    .global_last_seen_lsn
                    .as_ref()
                    .map(parse_lsn)
                    .transpose()?,
                shape: None,
            }));
        }

        Err(ProtocolError::MissingField("headers.operation or headers.control"))
    }
}

/// LSNs travel as decimal strings to survive JavaScript number precision,
/// but plain numbers are accepted too.
fn parse_lsn(raw: &serde_json::Value) -> ProtocolResult<u64> {
    match raw {
        serde_json::Value::String(s) => s
            .parse()
            .map_err(|_| ProtocolError::InvalidLsn(s.clone())),
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| ProtocolError::InvalidLsn(n.to_string())),
        other => Err(ProtocolError::InvalidLsn(other.to_string())),
    }
}
