//! Per-stream protocol state, following the lattice in spec.md section 3:
//! Idle -> Reserved(local|remote) | Open -> HalfClosed -> Closed.
//!
//! Grounded on `Atte-http2::stream.rs`'s `StreamState`/`transition_state`
//! shape (an enum the connection matches on to decide whether a frame is
//! legal), generalized from a client's request/response pairing to a
//! server's: one `ActiveStream` owns the inbound (request) and outbound
//! (response) body buffers for as long as the stream has either one open.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, trace};

use crate::body::BodyBuffer;
use crate::error::Reason;
use crate::frame::Frame;
use crate::io::WriterWakeup;
use crate::types::{Headers, StreamId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Both directions reached END_STREAM normally.
    Finished,
    /// We sent RST_STREAM.
    ResetByUs(Reason),
    /// The peer sent RST_STREAM.
    ResetByThem(Reason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateKind {
    Idle,
    Reserved(Side),
    Open,
    HalfClosed(Side),
    Closed(CloseReason),
}

/// The request/response plumbing a stream owns for as long as it's anything
/// but Idle/Closed: the decoded request headers (once seen), and the two
/// body conduits. `request_body` is the side the connection engine writes
/// into as DATA frames arrive; `response_body` is what the scheduler drains
/// on flush.
pub struct ActiveStream {
    pub request_headers: Option<Headers>,
    pub request_body: Rc<RefCell<BodyBuffer>>,
    pub response_body: Rc<RefCell<BodyBuffer>>,
    pub response_headers_sent: bool,
    pub trailers: Option<Headers>,
    /// Declared via a `content-length` request header, if present; checked
    /// against `received_body_bytes` at END_STREAM per spec.md section
    /// 4.4.2's content-length mismatch scenario.
    pub declared_content_length: Option<u64>,
    pub received_body_bytes: u64,
}

pub struct Stream {
    id: StreamId,
    state: StateKind,
    active: Option<ActiveStream>,
    /// Fired exactly once, the moment the stream transitions into `Closed`,
    /// however that happens (`finish` or `reset`). The connection attaches
    /// a closure here to decrement its live-stream counter, per spec.md
    /// section 4.2's `Stream::create(..., on_close)`.
    on_close: Option<Box<dyn FnOnce()>>,
}

impl Stream {
    #[must_use]
    pub fn new(id: StreamId) -> Self {
        Self { id, state: StateKind::Idle, active: None, on_close: None }
    }

    #[must_use]
    pub fn reserved(id: StreamId, side: Side, active: ActiveStream) -> Self {
        Self { id, state: StateKind::Reserved(side), active: Some(active), on_close: None }
    }

    /// Registers the callback to run exactly once when this stream closes.
    /// Replaces any previously registered callback; the connection calls
    /// this right after a stream is counted against
    /// `MaxConcurrentStreams`, so the matching decrement always happens.
    pub fn set_on_close(&mut self, on_close: Box<dyn FnOnce()>) {
        self.on_close = Some(on_close);
    }

    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(self.state, StateKind::Idle)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.state, StateKind::Closed(_))
    }

    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self.state {
            StateKind::Closed(reason) => Some(reason),
            _ => None,
        }
    }

    #[must_use]
    pub fn active(&self) -> Option<&ActiveStream> {
        self.active.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut ActiveStream> {
        self.active.as_mut()
    }

    /// Opens a stream for a HEADERS frame that both creates and (possibly)
    /// ends it in one shot, per spec.md section 4.4.2.
    pub fn open(&mut self, active: ActiveStream) {
        assert!(self.is_idle() || matches!(self.state, StateKind::Reserved(_)));
        self.active = Some(active);
        self.state = StateKind::Open;
        trace!("stream {}: -> Open", self.id);
    }

    /// Records that our side has sent END_STREAM.
    pub fn half_close_local(&mut self) {
        match self.state {
            StateKind::Open => {
                self.state = StateKind::HalfClosed(Side::Local);
                trace!("stream {}: -> HalfClosed(Local)", self.id);
            }
            StateKind::HalfClosed(Side::Remote) => self.finish(),
            _ => {}
        }
    }

    /// Records that the peer has sent END_STREAM.
    pub fn half_close_remote(&mut self) {
        match self.state {
            StateKind::Open => {
                self.state = StateKind::HalfClosed(Side::Remote);
                trace!("stream {}: -> HalfClosed(Remote)", self.id);
            }
            StateKind::HalfClosed(Side::Local) => self.finish(),
            _ => {}
        }
    }

    fn finish(&mut self) {
        self.state = StateKind::Closed(CloseReason::Finished);
        debug!("stream {}: -> Closed(Finished)", self.id);
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }

    pub fn reset(&mut self, by: Side, code: Reason) {
        self.state = StateKind::Closed(match by {
            Side::Local => CloseReason::ResetByUs(code),
            Side::Remote => CloseReason::ResetByThem(code),
        });
        if let Some(active) = &mut self.active {
            active.request_body.borrow_mut().close_writer();
            active.response_body.borrow_mut().close_writer();
        }
        debug!("stream {}: -> Closed({by:?} reset, {code:?})", self.id);
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }

    /// Whether the local side may still send DATA/HEADERS on this stream.
    #[must_use]
    pub fn can_send(&self) -> bool {
        matches!(
            self.state,
            StateKind::Open | StateKind::HalfClosed(Side::Remote) | StateKind::Reserved(Side::Local)
        )
    }

    /// Whether the peer may still send DATA/HEADERS on this stream.
    #[must_use]
    pub fn can_receive(&self) -> bool {
        matches!(
            self.state,
            StateKind::Open | StateKind::HalfClosed(Side::Local) | StateKind::Reserved(Side::Remote)
        )
    }

    /// Delivers a block of trailing headers (a HEADERS frame with
    /// END_STREAM after the body), closing the request body with them
    /// attached rather than as ordinary headers.
    pub fn deliver_trailer_headers(&mut self, trailers: Headers) {
        if let Some(active) = &mut self.active {
            active.trailers = Some(trailers);
            active.request_body.borrow_mut().close_writer();
        }
        self.half_close_remote();
    }

    /// Whether the scheduler still needs to visit this stream to drain
    /// output (pending response bytes, or a final frame not yet sent).
    #[must_use]
    pub fn requires_output(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.response_body.borrow().has_pending_output())
    }

    /// Drains the response body into DATA frames, as described by
    /// `BodyBuffer::transfer_to_writer`.
    pub fn flush_write_body(
        &mut self,
        max_frame_size: usize,
        max_bytes: usize,
        emit: &mut dyn FnMut(Frame),
    ) -> usize {
        let Some(active) = &mut self.active else {
            return 0;
        };
        active.response_body.borrow_mut().transfer_to_writer(self.id, max_frame_size, max_bytes, emit)
    }

    /// A cloned handle to this stream's response body, independent of any
    /// borrow on the stream itself — used to build a `ResponseWriter` that
    /// outlives the synchronous request-handler call.
    #[must_use]
    pub fn response_body_handle(&self) -> Option<Rc<RefCell<BodyBuffer>>> {
        self.active.as_ref().map(|a| Rc::clone(&a.response_body))
    }

    /// Records inbound DATA bytes against the declared content-length, per
    /// spec.md section 4.4.2's mismatch check; returns false if the running
    /// total has already exceeded what was declared.
    pub fn accept_body_bytes(&mut self, n: u64) -> bool {
        let Some(active) = &mut self.active else {
            return true;
        };
        active.received_body_bytes += n;
        active
            .declared_content_length
            .map_or(true, |declared| active.received_body_bytes <= declared)
    }

    /// Checked at END_STREAM: the declared and received totals must match
    /// exactly, not just "received <= declared".
    #[must_use]
    pub fn content_length_satisfied(&self) -> bool {
        self.active.as_ref().map_or(true, |active| {
            active
                .declared_content_length
                .map_or(true, |declared| declared == active.received_body_bytes)
        })
    }
}

impl ActiveStream {
    /// `wakeup` is fired whenever the response body gets new bytes to write
    /// or is closed, so the driver's writer wakes up even if it was parked
    /// (spec.md section 9's two-phase construction note). The request body
    /// has no such hook: it's only ever drained synchronously from inside
    /// `Connection::dispatch`, never from an external wakeup.
    #[must_use]
    pub fn new(
        request_body_capacity: usize,
        response_body_capacity: usize,
        wakeup: Rc<RefCell<WriterWakeup>>,
    ) -> Self {
        let response_wakeup = Rc::clone(&wakeup);
        Self {
            request_headers: None,
            request_body: Rc::new(RefCell::new(BodyBuffer::new(request_body_capacity, Box::new(|| {})))),
            response_body: Rc::new(RefCell::new(BodyBuffer::new(
                response_body_capacity,
                Box::new(move || response_wakeup.borrow_mut().fire()),
            ))),
            response_headers_sent: false,
            trailers: None,
            declared_content_length: None,
            received_body_bytes: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active() -> ActiveStream {
        ActiveStream::new(1024, 1024, Rc::new(RefCell::new(WriterWakeup::new())))
    }

    #[test]
    fn open_then_mutual_end_stream_closes() {
        let mut s = Stream::new(1);
        s.open(active());
        s.half_close_remote();
        assert!(!s.is_closed());
        s.half_close_local();
        assert!(s.is_closed());
        assert_eq!(s.close_reason(), Some(CloseReason::Finished));
    }

    #[test]
    fn reset_is_idempotent_with_state() {
        let mut s = Stream::new(3);
        s.open(active());
        s.reset(Side::Local, Reason::Cancel);
        assert_eq!(s.close_reason(), Some(CloseReason::ResetByUs(Reason::Cancel)));
    }

    #[test]
    fn content_length_mismatch_is_detected() {
        let mut s = Stream::new(5);
        let mut a = active();
        a.declared_content_length = Some(10);
        s.open(a);
        assert!(s.accept_body_bytes(5));
        assert!(!s.content_length_satisfied());
        assert!(!s.accept_body_bytes(10));
    }
}
