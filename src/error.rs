//! Error taxonomy for the connection engine.
//!
//! Mirrors the three-way split in the spec: a `ConnectionError` is fatal to
//! the whole connection, a `StreamError` resets one stream and leaves the
//! rest alone, and an `ApplicationError` is something the request handler's
//! error handler gets a chance to turn into a response body.

use bytes::Bytes;
use num_derive::{FromPrimitive, ToPrimitive};

use crate::types::StreamId;

/// https://httpwg.org/specs/rfc7540.html#ErrorCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum Reason {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
}

/// Fatal to the whole connection: GOAWAY is emitted, both sides torn down
/// after the write side flushes.
#[derive(thiserror::Error, Debug, Clone)]
#[error("connection error: {code:?}: {}", String::from_utf8_lossy(debug_data))]
pub struct ConnectionError {
    pub code: Reason,
    pub debug_data: Bytes,
}

impl ConnectionError {
    pub fn new(code: Reason, debug: impl Into<String>) -> Self {
        Self {
            code,
            debug_data: Bytes::from(debug.into()),
        }
    }

    pub fn protocol_error(debug: impl Into<String>) -> Self {
        Self::new(Reason::ProtocolError, debug)
    }

    pub fn flow_control_error(debug: impl Into<String>) -> Self {
        Self::new(Reason::FlowControlError, debug)
    }

    pub fn compression_error(debug: impl Into<String>) -> Self {
        Self::new(Reason::CompressionError, debug)
    }

    pub fn internal_error(debug: impl Into<String>) -> Self {
        Self::new(Reason::InternalError, debug)
    }
}

/// Fatal to a single stream: RST_STREAM is emitted, other streams are
/// unaffected.
#[derive(thiserror::Error, Debug, Clone, Copy)]
#[error("stream {id} error: {code:?}")]
pub struct StreamError {
    pub id: StreamId,
    pub code: Reason,
}

impl StreamError {
    pub fn new(id: StreamId, code: Reason) -> Self {
        Self { id, code }
    }
}

/// An error that terminates a request without necessarily being a protocol
/// violation — routed through the user's error handler, which synthesizes a
/// response body, rather than straight to GOAWAY/RST_STREAM.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ApplicationError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

/// Unifies the two fatal error kinds so that dispatch code can `?` through a
/// single type and let `Connection::report_error` sort out which one it is.
#[derive(thiserror::Error, Debug, Clone)]
pub enum DispatchError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl DispatchError {
    pub fn protocol_error(debug: impl Into<String>) -> Self {
        ConnectionError::protocol_error(debug).into()
    }

    pub fn stream_closed(id: StreamId) -> Self {
        StreamError::new(id, Reason::StreamClosed).into()
    }
}
