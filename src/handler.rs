//! Application-facing surface: the opaque request handler and the default
//! error handler, plus the narrow "stream descriptor" handle each gets.
//!
//! The request handler needs to mutate the very connection that is in the
//! middle of calling it. Rather than give `StreamHandle` itself `Rc`/
//! `RefCell` bookkeeping, the handler is stored as `Option<Box<dyn
//! FnMut(..)>>` and `take()`n out for the duration of the call (spec.md
//! section 9's "lazy self-reference" note). `ResponseWriter` is the one
//! exception: it holds a cloned `Rc<RefCell<BodyBuffer>>` on purpose, since
//! its whole point is to outlive that borrowed call.

use std::cell::RefCell;
use std::rc::Rc;

use derive_more::Display;
use log::warn;

use crate::body::BodyBuffer;
use crate::connection::Connection;
use crate::error::{ApplicationError, Reason};
use crate::types::{Headers, StreamId};

pub type RequestHandler = Box<dyn FnMut(StreamHandle<'_>)>;
pub type ErrorHandler = Box<dyn FnMut(StreamErrorContext<'_>)>;

/// Handed to the request handler once a request's headers (and, if present,
/// an already-EOF body) are ready. Borrows the connection for the duration
/// of the call only.
pub struct StreamHandle<'conn> {
    pub(crate) id: StreamId,
    pub(crate) conn: &'conn mut Connection,
}

impl<'conn> StreamHandle<'conn> {
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    #[must_use]
    pub fn request_headers(&self) -> Option<&Headers> {
        self.conn
            .scheduler
            .get_node(self.id)
            .and_then(|s| s.active())
            .and_then(|a| a.request_headers.as_ref())
    }

    /// Schedules a one-shot read of the request body, per `BodyBuffer::schedule_read`.
    pub fn read_body(&mut self, on_eof: Box<dyn FnOnce()>, on_read: Box<dyn FnOnce(bytes::Bytes)>) {
        if let Some(active) = self.conn.scheduler.find(self.id).active_mut() {
            active.request_body.borrow_mut().schedule_read(on_eof, on_read);
        }
    }

    /// Writes response headers. Does not by itself end the stream; call
    /// `write_body`/`close_body` or pass `end_stream = true` for an
    /// empty response.
    pub fn write_response_headers(&mut self, headers: Headers, end_stream: bool) {
        let id = self.id;
        self.conn.send_response_headers(id, headers, end_stream);
    }

    pub fn write_body(&mut self, bytes: impl Into<bytes::Bytes>) {
        if let Some(active) = self.conn.scheduler.find(self.id).active_mut() {
            active.response_body.borrow_mut().write_bigstring(bytes.into());
        }
    }

    pub fn close_body(&mut self) {
        if let Some(active) = self.conn.scheduler.find(self.id).active_mut() {
            active.response_body.borrow_mut().close_writer();
        }
    }

    /// spec.md section 4.4.12: fails with a `StreamError`-shaped signal
    /// rather than panicking, since push being disabled or ids running out
    /// is routine, not a bug.
    pub fn create_push_stream(&mut self, request_headers: Headers) -> Result<StreamHandle<'_>, PushError> {
        let id = self.conn.create_push_stream(request_headers)?;
        Ok(StreamHandle { id, conn: self.conn })
    }

    /// A handle to this stream's response body that outlives the
    /// synchronous handler call, for deferred or streamed responses:
    /// `write_response_headers` first, stash the `ResponseWriter`, then
    /// write/close it later once the body is actually ready. `None` if the
    /// stream has already closed.
    #[must_use]
    pub fn response_writer(&mut self) -> Option<ResponseWriter> {
        self.conn.scheduler.get_node(self.id)?.response_body_handle().map(|body| ResponseWriter { body })
    }
}

/// A response-body writer independent of `StreamHandle`'s borrow on the
/// connection, so application code can hold onto it past the request
/// handler's return and write the body as it becomes available. Every
/// write goes straight through the `BodyBuffer`'s own wakeup hook
/// (`ActiveStream::new`), so the driver's writer wakes up without needing
/// any further plumbing back through `Connection`.
#[derive(Clone)]
pub struct ResponseWriter {
    body: Rc<RefCell<BodyBuffer>>,
}

impl ResponseWriter {
    pub fn write_body(&self, bytes: impl Into<bytes::Bytes>) {
        self.body.borrow_mut().write_bigstring(bytes.into());
    }

    pub fn write_string(&self, body: impl AsRef<str>) {
        self.body.borrow_mut().write_string(body);
    }

    pub fn close(&self) {
        self.body.borrow_mut().close_writer();
    }
}

/// Why `create_push_stream` declined, per spec.md section 4.4.12.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    #[display(fmt = "the peer has disabled server push")]
    Disabled,
    #[display(fmt = "push stream ids are exhausted")]
    StreamIdsExhausted,
}

/// Handed to the error handler: the stream the error happened on (if any),
/// the error itself, and the means to write a response for it.
pub struct StreamErrorContext<'conn> {
    pub(crate) id: Option<StreamId>,
    pub(crate) error: ApplicationError,
    pub(crate) conn: &'conn mut Connection,
}

impl StreamErrorContext<'_> {
    #[must_use]
    pub fn error(&self) -> &ApplicationError {
        &self.error
    }

    #[must_use]
    pub fn stream_id(&self) -> Option<StreamId> {
        self.id
    }

    /// Writes a response with the given headers and UTF-8 body, then ends
    /// the stream.
    pub fn write_response(&mut self, headers: Headers, body: impl AsRef<str>) {
        let Some(id) = self.id else {
            warn!("error handler invoked with no stream to respond on");
            return;
        };
        self.conn.send_response_headers(id, headers, false);
        if let Some(active) = self.conn.scheduler.find(id).active_mut() {
            active.response_body.borrow_mut().write_string(body);
            active.response_body.borrow_mut().close_writer();
        }
    }
}

/// Writes `:status`, the error message as a plain-text body, then closes.
#[must_use]
pub fn default_error_handler() -> ErrorHandler {
    Box::new(|mut ctx| {
        let status = match ctx.error() {
            ApplicationError::BadRequest(_) => "400",
            ApplicationError::InternalServerError(_) => "500",
        };
        let message = ctx.error().to_string();
        ctx.write_response(vec![(":status".to_owned(), status.to_owned())], message);
    })
}

/// The wire error code that accompanies an `ApplicationError`'s resulting
/// RST_STREAM, per spec.md section 7's propagation policy.
#[must_use]
pub fn application_error_reason(error: &ApplicationError) -> Reason {
    match error {
        ApplicationError::BadRequest(_) => Reason::ProtocolError,
        ApplicationError::InternalServerError(_) => Reason::InternalError,
    }
}
