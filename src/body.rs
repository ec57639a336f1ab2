//! The body buffer: a single-producer, single-consumer byte conduit with a
//! one-shot EOF notification, used on both the request-body (inbound) and
//! response-body (outbound) side of a stream.

use bytes::{Bytes, BytesMut};
use derivative::Derivative;
use log::trace;

use crate::frame::{DataFlags, Frame};
use crate::types::StreamId;

/// The pair of callbacks `schedule_read` hands out: one fires on EOF with no
/// further bytes, the other fires with the bytes that arrived.
type OnEof = Box<dyn FnOnce()>;
type OnRead = Box<dyn FnOnce(Bytes)>;

#[derive(Default)]
struct PendingRead {
    on_eof: Option<OnEof>,
    on_read: Option<OnRead>,
}

/// SPSC byte conduit. Writers call `write_*`/`close_writer`; the single
/// reader calls `schedule_read` once and gets called back when bytes or EOF
/// show up. `transfer_to_writer` is the outbound-specific drain used by the
/// scheduler's flush path to turn buffered bytes into DATA frames.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct BodyBuffer {
    buffer: BytesMut,
    closed: bool,
    #[derivative(Debug = "ignore")]
    pending_read: Option<PendingRead>,
    /// Bytes already handed to the writer but not yet confirmed flushed;
    /// kept so that two `transfer_to_writer` calls issued before a flush
    /// completes don't double-count the same bytes as still-pending.
    buffered_bytes: usize,
    /// Latches true once the final empty END_STREAM DATA frame has been
    /// emitted, so `transfer_to_writer` never emits it twice.
    final_frame_sent: bool,
    #[derivative(Debug = "ignore")]
    ready_to_write: Box<dyn FnMut()>,
}

impl BodyBuffer {
    #[must_use]
    pub fn new(capacity: usize, ready_to_write: Box<dyn FnMut()>) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            closed: false,
            pending_read: None,
            buffered_bytes: 0,
            final_frame_sent: false,
            ready_to_write,
        }
    }

    pub fn write_bigstring(&mut self, bytes: impl Into<Bytes>) {
        if self.closed {
            return;
        }
        let bytes = bytes.into();
        trace!("body buffer: writing {} bytes", bytes.len());
        self.buffer.extend_from_slice(&bytes);
        self.dispatch_pending_read();
        (self.ready_to_write)();
    }

    pub fn write_string(&mut self, s: impl AsRef<str>) {
        self.write_bigstring(Bytes::copy_from_slice(s.as_ref().as_bytes()));
    }

    pub fn write_char(&mut self, c: char) {
        let mut buf = [0u8; 4];
        self.write_bigstring(Bytes::copy_from_slice(c.encode_utf8(&mut buf).as_bytes()));
    }

    /// Same as `write_bigstring`, named separately to match the teacher's
    /// split between an eager write and one explicitly meant to be queued
    /// for the next scheduler flush.
    pub fn schedule_bigstring(&mut self, bytes: impl Into<Bytes>) {
        self.write_bigstring(bytes);
    }

    /// Idempotent.
    pub fn close_writer(&mut self) {
        if self.closed {
            return;
        }
        trace!("body buffer: closed");
        self.closed = true;
        self.dispatch_pending_read();
        (self.ready_to_write)();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[must_use]
    pub fn has_pending_output(&self) -> bool {
        !self.buffer.is_empty() || (self.closed && !self.final_frame_sent)
    }

    /// Registers a one-shot callback pair. If data is already buffered or
    /// EOF has already been observed, dispatches immediately. Calling this
    /// while a read is already pending is a programming error.
    pub fn schedule_read(&mut self, on_eof: OnEof, on_read: OnRead) {
        assert!(
            self.pending_read.is_none(),
            "schedule_read called while a read was already pending"
        );
        self.pending_read = Some(PendingRead {
            on_eof: Some(on_eof),
            on_read: Some(on_read),
        });
        self.dispatch_pending_read();
    }

    fn dispatch_pending_read(&mut self) {
        if !self.buffer.is_empty() {
            if let Some(mut pending) = self.pending_read.take() {
                let bytes = self.buffer.split().freeze();
                if let Some(on_read) = pending.on_read.take() {
                    on_read(bytes);
                }
            }
            return;
        }
        if self.closed {
            if let Some(mut pending) = self.pending_read.take() {
                if let Some(on_eof) = pending.on_eof.take() {
                    on_eof();
                }
            }
        }
    }

    /// Drains up to `max_bytes` of pending output into DATA frames bounded
    /// by `max_frame_size`, via `emit`. When the buffer is closed and empty,
    /// emits exactly one empty END_STREAM DATA frame (guaranteed exactly
    /// once by `final_frame_sent`), even at zero `max_bytes`.
    pub fn transfer_to_writer(
        &mut self,
        stream: StreamId,
        max_frame_size: usize,
        max_bytes: usize,
        mut emit: impl FnMut(Frame),
    ) -> usize {
        let mut written = 0;
        while written < max_bytes && !self.buffer.is_empty() {
            let chunk_len = max_frame_size.min(max_bytes - written).min(self.buffer.len());
            if chunk_len == 0 {
                break;
            }
            let chunk = self.buffer.split_to(chunk_len).freeze();
            written += chunk_len;
            self.buffered_bytes += chunk_len;
            emit(Frame::Data {
                stream,
                flags: DataFlags::empty(),
                data: chunk,
            });
        }

        if self.closed && self.buffer.is_empty() && !self.final_frame_sent {
            self.final_frame_sent = true;
            emit(Frame::Data {
                stream,
                flags: DataFlags::END_STREAM,
                data: Bytes::new(),
            });
        }

        written
    }

    /// Called by the writer once bytes handed out by `transfer_to_writer`
    /// have actually been flushed to the wire, so repeated transfers before
    /// a flush completes don't double count.
    pub fn acknowledge_flushed(&mut self, n: usize) {
        self.buffered_bytes = self.buffered_bytes.saturating_sub(n);
    }

    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn buffer() -> BodyBuffer {
        BodyBuffer::new(1024, Box::new(|| {}))
    }

    #[test]
    fn schedule_read_dispatches_immediately_when_buffered() {
        let mut buf = buffer();
        buf.write_string("hello");
        let seen = Rc::new(RefCell::new(None));
        let seen2 = seen.clone();
        buf.schedule_read(
            Box::new(|| panic!("eof should not fire")),
            Box::new(move |bytes| *seen2.borrow_mut() = Some(bytes)),
        );
        assert_eq!(seen.borrow().as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn schedule_read_fires_on_later_write() {
        let mut buf = buffer();
        let seen = Rc::new(RefCell::new(None));
        let seen2 = seen.clone();
        buf.schedule_read(
            Box::new(|| panic!("eof should not fire")),
            Box::new(move |bytes| *seen2.borrow_mut() = Some(bytes)),
        );
        assert!(seen.borrow().is_none());
        buf.write_string("later");
        assert_eq!(seen.borrow().as_deref(), Some(&b"later"[..]));
    }

    #[test]
    fn schedule_read_fires_eof_on_close_with_no_data() {
        let mut buf = buffer();
        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();
        buf.schedule_read(Box::new(move || *fired2.borrow_mut() = true), Box::new(|_| {}));
        buf.close_writer();
        assert!(*fired.borrow());
    }

    #[test]
    fn final_data_frame_emitted_exactly_once() {
        let mut buf = buffer();
        buf.close_writer();
        let mut frames = Vec::new();
        buf.transfer_to_writer(1, 16_384, 0, |f| frames.push(f));
        buf.transfer_to_writer(1, 16_384, 0, |f| frames.push(f));
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::Data { ref flags, .. } if flags.contains(DataFlags::END_STREAM)));
    }

    #[test]
    fn transfer_splits_into_frame_sized_chunks() {
        let mut buf = buffer();
        buf.write_bigstring(Bytes::from(vec![0u8; 100]));
        let mut frames = Vec::new();
        let written = buf.transfer_to_writer(1, 30, 100, |f| frames.push(f));
        assert_eq!(written, 100);
        assert_eq!(frames.len(), 4); // 30, 30, 30, 10
    }
}
