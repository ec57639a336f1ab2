//! The connection engine: the top-level demultiplexer. Owns the preface,
//! the settings negotiation, the frame dispatch table, error reporting, and
//! stream lifecycle. Driven entirely from the outside via the operations in
//! `io.rs` — see spec.md section 4.4 for the dispatch rules this mirrors.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use log::{debug, error, warn};

use crate::config::Config;
use crate::error::{ApplicationError, ConnectionError, DispatchError, Reason, StreamError};
use crate::frame::{DataFlags, Frame, HeadersFlags, Priority, SettingsFlags};
use crate::handler::{
    application_error_reason, default_error_handler, ErrorHandler, PushError, RequestHandler,
    StreamErrorContext, StreamHandle,
};
use crate::hpack::{DecodeError, HeaderBlockParser, HpackContexts};
use crate::io::{ReadOperation, WriteOperation, WriteResult, WriterWakeup};
use crate::scheduler::Scheduler;
use crate::settings::{Settings, SettingsParameter};
use crate::stream::{ActiveStream, Side, Stream};
use crate::types::{is_client_initiated, Headers, StreamId};

/// What the external frame reader hands the engine: feed raw bytes in,
/// pull decoded frames out. Framing errors surface as `ConnectionError`,
/// per spec.md section 1's "surfaces framing errors".
pub trait FrameDecoder {
    fn feed(&mut self, bytes: &[u8]) -> usize;
    fn feed_eof(&mut self, bytes: &[u8]) -> usize;
    fn poll(&mut self) -> Result<Option<Frame>, ConnectionError>;
}

/// What the external frame writer does with a decoded frame: turn it back
/// into bytes for the wire.
pub trait FrameEncoder {
    fn encode(&mut self, frame: &Frame) -> Vec<u8>;
}

struct PendingHeaderBlock {
    stream: StreamId,
    trailers: bool,
    parser: HeaderBlockParser,
}

pub struct Connection {
    config: Config,
    pub(crate) scheduler: Scheduler,
    hpack: HpackContexts,
    settings: Settings,
    /// Count of client-initiated streams currently counted against
    /// `MaxConcurrentStreams`; shared with each stream's `on_close` so the
    /// decrement happens wherever the stream actually closes, not just on
    /// the paths this module happens to reach.
    current_client_streams: Rc<Cell<u32>>,
    max_client_stream_id: StreamId,
    max_pushed_stream_id: StreamId,
    receiving_headers_for_stream: Option<StreamId>,
    pending_header_block: Option<PendingHeaderBlock>,
    did_send_go_away: bool,
    peer_sent_go_away: bool,
    reader_closed: bool,
    writer_closed: bool,
    outbound: VecDeque<Frame>,
    wakeup: Rc<RefCell<WriterWakeup>>,
    decoder: Box<dyn FrameDecoder>,
    encoder: Box<dyn FrameEncoder>,
    request_handler: Option<RequestHandler>,
    error_handler: Option<ErrorHandler>,
}

impl Connection {
    #[must_use]
    pub fn new(
        config: Config,
        decoder: Box<dyn FrameDecoder>,
        encoder: Box<dyn FrameEncoder>,
        request_handler: RequestHandler,
        error_handler: Option<ErrorHandler>,
    ) -> Self {
        let mut settings = Settings::default();
        settings.local[SettingsParameter::EnablePush] = u32::from(config.enable_server_push);
        settings.local[SettingsParameter::MaxConcurrentStreams] =
            config.max_concurrent_streams.unwrap_or(u32::MAX);
        settings.local[SettingsParameter::InitialWindowSize] = config.initial_window_size;
        settings.local[SettingsParameter::MaxFrameSize] = config.read_buffer_size as u32;

        let mut conn = Self {
            scheduler: Scheduler::new(i64::from(config.initial_window_size)),
            hpack: HpackContexts::new(),
            current_client_streams: Rc::new(Cell::new(0)),
            max_client_stream_id: 0,
            max_pushed_stream_id: 0,
            receiving_headers_for_stream: None,
            pending_header_block: None,
            did_send_go_away: false,
            peer_sent_go_away: false,
            reader_closed: false,
            writer_closed: false,
            outbound: VecDeque::new(),
            wakeup: Rc::new(RefCell::new(WriterWakeup::new())),
            decoder,
            encoder,
            request_handler: Some(request_handler),
            error_handler: Some(error_handler.unwrap_or_else(default_error_handler)),
            config,
            settings,
        };
        conn.send_preface_settings();
        conn
    }

    /// spec.md section 4.5: our half of the preface. Emits SETTINGS (only
    /// non-empty if something differs from the RFC defaults) and, if the
    /// configured initial window exceeds the default, a connection-level
    /// WINDOW_UPDATE closing the gap.
    fn send_preface_settings(&mut self) {
        let mut params = Vec::new();
        for (param, value) in self.settings.local.iter() {
            if *value != crate::settings::DEFAULTS[param] {
                params.push((param, *value));
            }
        }
        self.outbound.push_back(Frame::Settings { flags: SettingsFlags::empty(), params });
        self.settings.unacked_sent += 1;

        if self.config.initial_window_size > 65_535 {
            let gap = self.config.initial_window_size - 65_535;
            self.outbound.push_back(Frame::WindowUpdate { stream: 0, increment: gap });
            self.scheduler.add_connection_inflow(i64::from(gap));
        }
    }

    fn is_below_watermark(&self, id: StreamId) -> bool {
        if is_client_initiated(id) {
            id <= self.max_client_stream_id
        } else {
            id <= self.max_pushed_stream_id
        }
    }

    // ---- dispatch ---------------------------------------------------

    /// spec.md section 4.4: the header-continuation gate, then dispatch by
    /// frame type.
    pub fn dispatch(&mut self, frame: Frame) {
        if let Some(expected) = self.receiving_headers_for_stream {
            let is_continuation_for_expected =
                matches!(&frame, Frame::Continuation { stream, .. } if *stream == expected);
            if !is_continuation_for_expected {
                self.report_connection_error(ConnectionError::protocol_error(
                    "HEADERS or PUSH_PROMISE without the END_HEADERS flag set must be followed by a CONTINUATION frame for the same stream",
                ));
                return;
            }
        }

        let result = match frame {
            Frame::Headers { stream, flags, priority, fragment } => {
                self.handle_headers(stream, flags, priority, fragment)
            }
            Frame::Data { stream, flags, data } => self.handle_data(stream, flags, data),
            Frame::Priority { stream, priority } => self.handle_priority(stream, priority),
            Frame::ResetStream { stream, error } => self.handle_reset_stream(stream, error),
            Frame::Settings { flags, params } => self.handle_settings(flags, params),
            Frame::Ping { flags, data } => self.handle_ping(flags, data),
            Frame::GoAway { .. } => self.handle_goaway(),
            Frame::WindowUpdate { stream, increment } => self.handle_window_update(stream, increment),
            Frame::Continuation { stream, end_headers, fragment } => {
                self.handle_continuation(stream, end_headers, fragment)
            }
            Frame::PushPromise { .. } | Frame::Unknown { .. } => Ok(()),
        };

        if let Err(err) = result {
            self.report_dispatch_error(err);
        }
    }

    fn report_dispatch_error(&mut self, err: DispatchError) {
        match err {
            DispatchError::Connection(e) => self.report_connection_error(e),
            DispatchError::Stream(e) => self.report_stream_error(e),
        }
    }

    // ---- 4.4.1 HEADERS ------------------------------------------------

    fn handle_headers(
        &mut self,
        stream: StreamId,
        flags: HeadersFlags,
        priority: Option<Priority>,
        fragment: bytes::Bytes,
    ) -> Result<(), DispatchError> {
        if !is_client_initiated(stream) {
            return Err(ConnectionError::protocol_error("HEADERS on a non-client-initiated stream").into());
        }
        if let Some(p) = &priority {
            if p.dependency == stream {
                return Err(StreamError::new(stream, Reason::ProtocolError).into());
            }
        }

        // An Idle entry can already exist here: a PRIORITY frame primes one
        // before any HEADERS arrives (RFC 7540 section 5.3.4), and the
        // lattice in spec.md section 3 allows Idle -> Open. Route that case
        // through "opening", not through the can_receive() check below,
        // which deliberately excludes Idle.
        let trailers = if self.scheduler.contains(stream) && !self.scheduler.find(stream).is_idle() {
            let node = self.scheduler.find(stream);
            if !node.can_receive() {
                return match node.close_reason() {
                    Some(crate::stream::CloseReason::ResetByThem(_)) | None => {
                        Err(StreamError::new(stream, Reason::StreamClosed).into())
                    }
                    _ => Err(ConnectionError::new(Reason::StreamClosed, "HEADERS on a Reserved or Closed stream").into()),
                };
            }
            node.active().is_some_and(|a| a.request_headers.is_some())
        } else {
            if stream <= self.max_client_stream_id {
                return Err(ConnectionError::protocol_error("HEADERS reopened an already-used stream id").into());
            }
            let active = ActiveStream::new(
                self.config.request_body_buffer_size,
                self.config.response_body_buffer_size,
                Rc::clone(&self.wakeup),
            );
            if self.scheduler.contains(stream) {
                self.scheduler.find(stream).open(active);
                if let Some(p) = priority {
                    self.scheduler.reprioritize_stream(stream, p);
                }
            } else {
                let mut node = Stream::new(stream);
                node.open(active);
                self.scheduler.add(node, priority, i64::from(self.settings.local[SettingsParameter::InitialWindowSize]));
            }
            false
        };

        if trailers && !flags.contains(HeadersFlags::END_STREAM) {
            self.report_application_error(stream, ApplicationError::BadRequest("trailers HEADERS must set END_STREAM".into()));
            return Ok(());
        }

        let block_length = fragment.len();
        let end_headers = flags.contains(HeadersFlags::END_HEADERS);
        let mut parser = HeaderBlockParser::new(block_length, end_headers);
        parser.feed(&fragment);

        if end_headers {
            self.finalize_header_block(stream, trailers, flags.contains(HeadersFlags::END_STREAM), parser)
        } else {
            self.receiving_headers_for_stream = Some(stream);
            self.pending_header_block = Some(PendingHeaderBlock { stream, trailers, parser });
            Ok(())
        }
    }

    fn finalize_header_block(
        &mut self,
        stream: StreamId,
        trailers: bool,
        end_stream: bool,
        parser: HeaderBlockParser,
    ) -> Result<(), DispatchError> {
        let headers = match parser.finish(&mut self.hpack.decoder) {
            Ok(h) => h,
            Err(DecodeError::InvalidHeader(_)) => {
                return Err(ConnectionError::compression_error("failed to decode a HPACK header block").into());
            }
        };

        if trailers {
            if headers.iter().any(|(k, _)| k.starts_with(':')) {
                self.report_application_error(stream, ApplicationError::BadRequest("pseudo-headers are forbidden in trailers".into()));
                return Ok(());
            }
            self.scheduler.find(stream).deliver_trailer_headers(headers);
            return Ok(());
        }

        self.max_client_stream_id = stream;

        if self.current_client_streams.get() + 1 > self.settings.local[SettingsParameter::MaxConcurrentStreams] {
            let reason = if self.settings.unacked_sent > 0 {
                Reason::RefusedStream
            } else {
                Reason::ProtocolError
            };
            return Err(StreamError::new(stream, reason).into());
        }

        let method = find_header(&headers, ":method");
        let path = find_header(&headers, ":path");
        let scheme = find_header(&headers, ":scheme");
        if method.is_none() || path.is_none() || scheme.is_none() {
            self.report_application_error(stream, ApplicationError::BadRequest("missing required pseudo-headers".into()));
            return Ok(());
        }

        let declared_length = find_header(&headers, "content-length").and_then(|v| v.parse::<u64>().ok());
        if end_stream && declared_length.map_or(false, |n| n != 0) {
            self.report_application_error(stream, ApplicationError::BadRequest("content-length must be 0 for an END_STREAM request".into()));
            return Ok(());
        }

        self.current_client_streams.set(self.current_client_streams.get() + 1);
        let counter = Rc::clone(&self.current_client_streams);
        self.scheduler.find(stream).set_on_close(Box::new(move || {
            counter.set(counter.get().saturating_sub(1));
        }));
        if let Some(active) = self.scheduler.find(stream).active_mut() {
            active.request_headers = Some(headers);
            active.declared_content_length = declared_length;
        }

        if end_stream {
            if let Some(active) = self.scheduler.find(stream).active_mut() {
                active.request_body.borrow_mut().close_writer();
            }
            self.scheduler.find(stream).half_close_remote();
        }

        self.invoke_request_handler(stream);
        Ok(())
    }

    // ---- 4.4.9 CONTINUATION --------------------------------------------

    fn handle_continuation(&mut self, stream: StreamId, end_headers: bool, fragment: bytes::Bytes) -> Result<(), DispatchError> {
        if !is_client_initiated(stream) {
            return Err(ConnectionError::protocol_error("CONTINUATION on a non-client-initiated stream").into());
        }
        let Some(pending) = &mut self.pending_header_block else {
            return Err(ConnectionError::protocol_error("CONTINUATION with no headers block in progress").into());
        };
        if pending.stream != stream {
            return Err(ConnectionError::protocol_error("CONTINUATION for a different stream than expected").into());
        }
        pending.parser.feed(&fragment);

        if end_headers {
            let pending = self.pending_header_block.take().expect("checked above");
            self.receiving_headers_for_stream = None;
            self.finalize_header_block(pending.stream, pending.trailers, false, pending.parser)
        } else {
            Ok(())
        }
    }

    // ---- 4.4.2 DATA -----------------------------------------------------

    fn handle_data(&mut self, stream: StreamId, flags: DataFlags, data: bytes::Bytes) -> Result<(), DispatchError> {
        if !is_client_initiated(stream) {
            return Err(ConnectionError::protocol_error("DATA on a non-client-initiated stream").into());
        }
        let payload_length = data.len() as i64;
        self.scheduler.deduct_connection_inflow(payload_length);

        if !self.scheduler.contains(stream) {
            if self.is_below_watermark(stream) {
                return Ok(());
            }
            return Err(ConnectionError::protocol_error("DATA on an unknown stream").into());
        }

        if self.scheduler.find(stream).is_idle() {
            return Err(ConnectionError::protocol_error("DATA on an Idle stream").into());
        }

        if let Some(reason) = self.scheduler.find(stream).close_reason() {
            return match reason {
                crate::stream::CloseReason::ResetByUs(Reason::NoError) => {
                    self.return_connection_flow(payload_length);
                    Ok(())
                }
                _ => {
                    self.return_connection_flow(payload_length);
                    Err(StreamError::new(stream, Reason::StreamClosed).into())
                }
            };
        }

        if !self.scheduler.allowed_to_receive(stream, payload_length) {
            // The bytes were physically received and already debited from the
            // connection window above; the stream is about to die but the
            // connection isn't, so that credit comes back via WINDOW_UPDATE
            // before the RST_STREAM, per spec.md section 5's ordering rule 5.
            self.return_connection_flow(payload_length);
            return Err(StreamError::new(stream, Reason::FlowControlError).into());
        }
        self.scheduler.deduct_inflow(stream, payload_length);

        let exceeded = !self.scheduler.find(stream).accept_body_bytes(payload_length as u64);
        if exceeded {
            self.return_connection_flow(payload_length);
            self.report_application_error(stream, ApplicationError::BadRequest("content-length exceeded by DATA payload".into()));
            return Ok(());
        }

        let end_stream = flags.contains(DataFlags::END_STREAM);
        self.outbound.push_back(Frame::WindowUpdate { stream: 0, increment: payload_length as u32 });
        self.outbound.push_back(Frame::WindowUpdate { stream, increment: payload_length as u32 });
        self.scheduler.add_connection_inflow(payload_length);
        self.scheduler.add_inflow(stream, payload_length);

        if let Some(active) = self.scheduler.find(stream).active_mut() {
            if !data.is_empty() {
                active.request_body.borrow_mut().write_bigstring(data);
            }
            if end_stream {
                active.request_body.borrow_mut().close_writer();
            }
        }
        if end_stream {
            self.scheduler.find(stream).half_close_remote();
        }
        Ok(())
    }

    fn return_connection_flow(&mut self, n: i64) {
        self.scheduler.add_connection_inflow(n);
        self.outbound.push_back(Frame::WindowUpdate { stream: 0, increment: n as u32 });
    }

    // ---- 4.4.3 PRIORITY -------------------------------------------------

    fn handle_priority(&mut self, stream: StreamId, priority: Priority) -> Result<(), DispatchError> {
        if !is_client_initiated(stream) {
            return Err(ConnectionError::protocol_error("PRIORITY on a non-client-initiated stream").into());
        }
        if Scheduler::is_self_dependent(&priority, stream) {
            return Err(StreamError::new(stream, Reason::ProtocolError).into());
        }
        if self.scheduler.contains(stream) {
            self.scheduler.reprioritize_stream(stream, priority);
        } else if !self.is_below_watermark(stream) {
            self.scheduler.add(Stream::new(stream), Some(priority), i64::from(self.settings.local[SettingsParameter::InitialWindowSize]));
        }
        Ok(())
    }

    // ---- 4.4.4 RST_STREAM -----------------------------------------------

    fn handle_reset_stream(&mut self, stream: StreamId, error: Reason) -> Result<(), DispatchError> {
        if !is_client_initiated(stream) {
            return Err(ConnectionError::protocol_error("RST_STREAM on a non-client-initiated stream").into());
        }
        if !self.scheduler.contains(stream) {
            if self.is_below_watermark(stream) {
                return Ok(());
            }
            return Err(ConnectionError::protocol_error("RST_STREAM on an Idle stream").into());
        }
        let node = self.scheduler.find(stream);
        node.reset(Side::Remote, error);
        let reason = node.close_reason().expect("just reset");
        self.scheduler.mark_for_removal(stream, reason);
        Ok(())
    }

    // ---- 4.4.5 SETTINGS ---------------------------------------------------

    fn handle_settings(&mut self, flags: SettingsFlags, params: Vec<(SettingsParameter, u32)>) -> Result<(), DispatchError> {
        if flags.contains(SettingsFlags::ACK) {
            self.settings.unacked_sent -= 1;
            if self.settings.unacked_sent < 0 {
                return Err(ConnectionError::protocol_error("Received SETTINGS with ACK but no ACK was pending").into());
            }
            return Ok(());
        }

        Settings::validate(&params)?;
        self.settings.apply(&params, &mut self.scheduler, &mut self.hpack, &mut |_id, _value| {
            // MAX_FRAME_SIZE changes take effect on the next flush; no
            // per-stream bookkeeping is kept beyond the shared settings
            // table (see the open question in spec.md section 9).
        })?;
        self.outbound.push_back(Frame::Settings { flags: SettingsFlags::ACK, params: Vec::new() });
        self.settings.unacked_sent += 1;
        Ok(())
    }

    // ---- 4.4.6 PING -------------------------------------------------------

    fn handle_ping(&mut self, flags: crate::frame::PingFlags, data: [u8; 8]) -> Result<(), DispatchError> {
        if flags.contains(crate::frame::PingFlags::ACK) {
            return Ok(());
        }
        self.outbound.push_front(Frame::Ping { flags: crate::frame::PingFlags::ACK, data });
        Ok(())
    }

    // ---- 4.4.7 GOAWAY -------------------------------------------------------

    fn handle_goaway(&mut self) -> Result<(), DispatchError> {
        debug!("connection: received GOAWAY, beginning orderly shutdown");
        self.reader_closed = true;
        self.peer_sent_go_away = true;
        self.wakeup.borrow_mut().fire();
        Ok(())
    }

    // ---- 4.4.8 WINDOW_UPDATE ------------------------------------------------

    fn handle_window_update(&mut self, stream: StreamId, increment: u32) -> Result<(), DispatchError> {
        if increment == 0 {
            return Ok(());
        }
        if stream == 0 {
            if !self.scheduler.add_connection_flow(i64::from(increment)) {
                return Err(ConnectionError::flow_control_error("connection-level WINDOW_UPDATE overflowed 2^31-1").into());
            }
            self.wakeup.borrow_mut().fire();
            return Ok(());
        }

        if !self.scheduler.contains(stream) {
            if self.is_below_watermark(stream) {
                return Ok(());
            }
            return Err(ConnectionError::protocol_error("WINDOW_UPDATE on an unknown stream").into());
        }
        if self.scheduler.find(stream).is_idle() {
            return Err(ConnectionError::protocol_error("WINDOW_UPDATE on an Idle stream").into());
        }
        if self.scheduler.find(stream).is_closed() {
            return Ok(());
        }
        let was_non_positive = self.scheduler.stream_flow(stream) <= 0;
        if !self.scheduler.add_flow(stream, i64::from(increment)) {
            return Err(StreamError::new(stream, Reason::FlowControlError).into());
        }
        if was_non_positive && self.scheduler.stream_flow(stream) > 0 {
            self.wakeup.borrow_mut().fire();
        }
        Ok(())
    }

    // ---- 4.4.11 error reporting --------------------------------------------

    fn report_connection_error(&mut self, err: ConnectionError) {
        error!("connection error: {err}");
        if self.did_send_go_away {
            return;
        }
        self.outbound.push_front(Frame::GoAway {
            last_stream: self.max_client_stream_id,
            error: err.code,
            debug: err.debug_data,
        });
        self.did_send_go_away = true;
        self.wakeup.borrow_mut().fire();
    }

    fn report_stream_error(&mut self, err: StreamError) {
        warn!("stream error: {err}");
        if self.scheduler.contains(err.id) {
            let node = self.scheduler.find(err.id);
            node.reset(Side::Local, err.code);
            let reason = node.close_reason().expect("just reset");
            self.outbound.push_back(Frame::ResetStream { stream: err.id, error: err.code });
            self.scheduler.mark_for_removal(err.id, reason);
        } else if self.is_below_watermark(err.id) {
            self.outbound.push_back(Frame::ResetStream { stream: err.id, error: err.code });
        }
        self.wakeup.borrow_mut().fire();
    }

    /// Routes an `ApplicationError` through the user error handler so it
    /// can synthesize a response body, then resets the stream with the
    /// error's associated wire code, per spec.md section 7.
    fn report_application_error(&mut self, stream: StreamId, err: ApplicationError) {
        let reason = application_error_reason(&err);
        let mut handler = self.error_handler.take().expect("error handler missing");
        handler(StreamErrorContext { id: Some(stream), error: err, conn: self });
        self.error_handler = Some(handler);
        self.report_stream_error(StreamError::new(stream, reason));
    }

    // ---- 4.4.12 push promise ------------------------------------------------

    pub(crate) fn create_push_stream(&mut self, request_headers: Headers) -> Result<StreamId, PushError> {
        if !self.settings.remote_enable_push() {
            return Err(PushError::Disabled);
        }
        if i64::from(self.max_pushed_stream_id) + 2 > i64::from(crate::types::U31_MAX.get()) {
            self.outbound.push_back(Frame::GoAway {
                last_stream: self.max_client_stream_id,
                error: Reason::NoError,
                debug: bytes::Bytes::new(),
            });
            return Err(PushError::StreamIdsExhausted);
        }
        self.max_pushed_stream_id += 2;
        let id = self.max_pushed_stream_id;
        let mut active = ActiveStream::new(
            self.config.request_body_buffer_size,
            self.config.response_body_buffer_size,
            Rc::clone(&self.wakeup),
        );
        active.request_headers = Some(request_headers);
        active.request_body.borrow_mut().close_writer();
        let node = Stream::reserved(id, Side::Local, active);
        self.scheduler.add(node, None, i64::from(self.settings.local[SettingsParameter::InitialWindowSize]));
        Ok(id)
    }

    // ---- invocation of application code -------------------------------------

    fn invoke_request_handler(&mut self, stream: StreamId) {
        let mut handler = self.request_handler.take().expect("request handler missing");
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handler(StreamHandle { id: stream, conn: self });
        }));
        self.request_handler = Some(handler);
        if let Err(payload) = result {
            let err = panic_as_error(payload);
            self.report_connection_error(ConnectionError::internal_error(err.to_string()));
        }
    }

    pub(crate) fn send_response_headers(&mut self, stream: StreamId, headers: Headers, end_stream: bool) {
        let fragment = self.hpack.encode(&headers);
        let mut flags = HeadersFlags::END_HEADERS;
        if end_stream {
            flags |= HeadersFlags::END_STREAM;
        }
        self.outbound.push_back(Frame::Headers { stream, flags, priority: None, fragment });
        if let Some(active) = self.scheduler.find(stream).active_mut() {
            active.response_headers_sent = true;
        }
        if end_stream {
            self.scheduler.find(stream).half_close_local();
        }
    }

    // ---- driver-facing surface (spec.md section 6) --------------------------

    #[must_use]
    pub fn next_read_operation(&self) -> ReadOperation {
        if self.reader_closed {
            ReadOperation::Close
        } else {
            ReadOperation::Read
        }
    }

    pub fn read(&mut self, bytes: &[u8]) -> usize {
        let consumed = self.decoder.feed(bytes);
        self.drain_decoder();
        consumed
    }

    pub fn read_eof(&mut self, bytes: &[u8]) -> usize {
        let consumed = self.decoder.feed_eof(bytes);
        self.drain_decoder();
        self.reader_closed = true;
        consumed
    }

    fn drain_decoder(&mut self) {
        loop {
            match self.decoder.poll() {
                Ok(Some(frame)) => self.dispatch(frame),
                Ok(None) => break,
                Err(err) => {
                    self.report_connection_error(err);
                    break;
                }
            }
        }
    }

    #[must_use]
    pub fn next_write_operation(&mut self) -> WriteOperation {
        if self.outbound.is_empty() {
            let max_frame_size = self.settings.remote_max_frame_size();
            let watermarks = (self.max_client_stream_id, self.max_pushed_stream_id);
            let outbound = &mut self.outbound;
            self.scheduler.flush(max_frame_size, watermarks, |frame| outbound.push_back(frame));
        }

        if self.peer_sent_go_away && self.outbound.is_empty() && self.scheduler.live_stream_count() == 0 {
            self.writer_closed = true;
        }

        if let Some(frame) = self.outbound.pop_front() {
            let is_goaway = matches!(frame, Frame::GoAway { .. });
            let bytes = self.encoder.encode(&frame);
            if is_goaway && self.outbound.is_empty() && self.scheduler.live_stream_count() == 0 {
                self.writer_closed = true;
            }
            WriteOperation::Write(bytes)
        } else if self.writer_closed {
            WriteOperation::Close
        } else {
            WriteOperation::Yield
        }
    }

    pub fn report_write_result(&mut self, result: WriteResult) {
        match result {
            WriteResult::Written(_) => {}
            WriteResult::Closed => {
                self.writer_closed = true;
                self.wakeup.borrow_mut().close();
            }
        }
    }

    pub fn yield_writer(&mut self, k: Box<dyn FnMut()>) {
        self.wakeup.borrow_mut().register(k);
    }
}

fn find_header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
}

/// Turns a caught request-handler panic into an opaque `anyhow::Error`, the
/// one seam in this crate (per spec.md section 7's "runtime exception ...
/// becomes ConnectionError(InternalError)") that genuinely doesn't want a
/// typed error: the payload could be anything the handler chose to panic
/// with.
fn panic_as_error(payload: Box<dyn std::any::Any + Send>) -> anyhow::Error {
    if let Some(s) = payload.downcast_ref::<&str>() {
        anyhow::anyhow!("{s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        anyhow::anyhow!("{s}")
    } else {
        anyhow::anyhow!("request handler panicked")
    }
}
