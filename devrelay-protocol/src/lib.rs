//! # devrelay-protocol
//!
//! Inbound wire format for devrelay.
//!
//! Devices write a continuous stream of JSON objects to a TCP socket, with no
//! framing beyond JSON's own structure. This crate provides:
//! - The [`DeviceRecord`] data model
//! - A push-style [`RecordDecoder`] that turns arbitrary byte chunks into records
//! - Error types describing why a stream could not be decoded

pub mod codec;
pub mod error;
pub mod record;

pub use codec::RecordDecoder;
pub use error::{DecodeErrorKind, ProtocolError};
pub use record::DeviceRecord;

/// Default TCP port devices connect to.
pub const DEFAULT_PORT: u16 = 9000;

/// Initial capacity of a decoder's receive buffer.
pub const INITIAL_BUFFER_CAPACITY: usize = 8192;
