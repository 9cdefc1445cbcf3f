//! # ShapeSync Protocol
//!
//! Message types for shape streams.
//!
//! This crate provides:
//! - [`Value`] and [`Row`] for column data
//! - [`ChangeMessage`] / [`ControlMessage`] as delivered by a shape stream
//! - [`Offset`] log positions
//! - JSON wire decoding ([`Message::from_json`], [`parse_batch`])
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;
mod operation;
mod value;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::{parse_batch, ChangeMessage, ControlKind, ControlMessage, Message, Offset};
pub use operation::Operation;
pub use value::{row, Row, Value};
