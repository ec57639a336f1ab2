//! Frame data types.
//!
//! Bit-level parsing and serialization of these shapes onto the wire is an
//! external collaborator's job (the frame reader/writer named in the spec);
//! this module only defines the decoded representation the connection
//! engine dispatches on and the frames it hands back to the writer.

use bitflags::bitflags;
use bytes::Bytes;
use num_derive::{FromPrimitive, ToPrimitive};

use crate::error::Reason;
use crate::settings::SettingsParameter;
use crate::types::StreamId;

/// https://httpwg.org/specs/rfc7540.html#FrameTypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    ResetStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

bitflags! {
    /// https://httpwg.org/specs/rfc7540.html#DATA
    #[repr(transparent)]
    pub struct DataFlags: u8 {
        const END_STREAM = 0x1;
        const PADDED = 0x8;
    }

    /// https://httpwg.org/specs/rfc7540.html#HEADERS
    #[repr(transparent)]
    pub struct HeadersFlags: u8 {
        const END_STREAM = 0x1;
        const END_HEADERS = 0x4;
        const PADDED = 0x8;
        const PRIORITY = 0x20;
    }

    /// https://httpwg.org/specs/rfc7540.html#SETTINGS
    #[repr(transparent)]
    pub struct SettingsFlags: u8 {
        const ACK = 0x1;
    }

    /// https://httpwg.org/specs/rfc7540.html#PUSH_PROMISE
    #[repr(transparent)]
    pub struct PushPromiseFlags: u8 {
        const END_HEADERS = 0x4;
        const PADDED = 0x8;
    }

    /// https://httpwg.org/specs/rfc7540.html#PING
    #[repr(transparent)]
    pub struct PingFlags: u8 {
        const ACK = 0x1;
    }

    /// https://httpwg.org/specs/rfc7540.html#CONTINUATION
    #[repr(transparent)]
    pub struct ContinuationFlags: u8 {
        const END_HEADERS = 0x4;
    }
}

/// A dependency declared by a HEADERS or PRIORITY frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub dependency: StreamId,
    pub exclusive: bool,
    pub weight: u8,
}

impl Default for Priority {
    fn default() -> Self {
        // RFC 7540 section 5.3.5: default weight is 16, no dependency.
        Self {
            dependency: 0,
            exclusive: false,
            weight: 16,
        }
    }
}

/// One already-decoded HTTP/2 frame: the unit the connection engine
/// dispatches on, and the unit it emits to the frame writer.
#[derive(Debug, Clone)]
pub enum Frame {
    Data {
        stream: StreamId,
        flags: DataFlags,
        data: Bytes,
    },
    Headers {
        stream: StreamId,
        flags: HeadersFlags,
        priority: Option<Priority>,
        fragment: Bytes,
    },
    Priority {
        stream: StreamId,
        priority: Priority,
    },
    ResetStream {
        stream: StreamId,
        error: Reason,
    },
    Settings {
        flags: SettingsFlags,
        params: Vec<(SettingsParameter, u32)>,
    },
    PushPromise {
        stream: StreamId,
        flags: PushPromiseFlags,
        promised_stream: StreamId,
        fragment: Bytes,
    },
    Ping {
        flags: PingFlags,
        data: [u8; 8],
    },
    GoAway {
        last_stream: StreamId,
        error: Reason,
        debug: Bytes,
    },
    WindowUpdate {
        stream: StreamId,
        increment: u32,
    },
    Continuation {
        stream: StreamId,
        end_headers: bool,
        fragment: Bytes,
    },
    /// A frame type this endpoint does not recognize. Silently ignored per
    /// spec.md section 4.4.10.
    Unknown { stream: StreamId },
}

impl Frame {
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Data { stream, .. }
            | Frame::Headers { stream, .. }
            | Frame::Priority { stream, .. }
            | Frame::ResetStream { stream, .. }
            | Frame::PushPromise { stream, .. }
            | Frame::WindowUpdate { stream, .. }
            | Frame::Continuation { stream, .. }
            | Frame::Unknown { stream, .. } => *stream,
            Frame::Settings { .. } | Frame::Ping { .. } => 0,
        }
    }

    #[must_use]
    pub fn frame_type(&self) -> Option<FrameType> {
        match self {
            Frame::Data { .. } => Some(FrameType::Data),
            Frame::Headers { .. } => Some(FrameType::Headers),
            Frame::Priority { .. } => Some(FrameType::Priority),
            Frame::ResetStream { .. } => Some(FrameType::ResetStream),
            Frame::Settings { .. } => Some(FrameType::Settings),
            Frame::PushPromise { .. } => Some(FrameType::PushPromise),
            Frame::Ping { .. } => Some(FrameType::Ping),
            Frame::GoAway { .. } => Some(FrameType::GoAway),
            Frame::WindowUpdate { .. } => Some(FrameType::WindowUpdate),
            Frame::Continuation { .. } => Some(FrameType::Continuation),
            Frame::Unknown { .. } => None,
        }
    }
}
