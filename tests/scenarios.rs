//! End-to-end scenarios driven entirely through the public API, with mock
//! frame reader/writer halves standing in for the external frame codec.
//! Frames are queued/recorded directly rather than round-tripped through
//! real byte framing, since that framing is an external collaborator this
//! crate doesn't own.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;
use h2engine::{
    Config, Connection, ConnectionError, DataFlags, Frame, FrameDecoder, FrameEncoder,
    HeadersFlags, PingFlags, Priority, Reason, SettingsFlags, WriteOperation, WriteResult,
};

struct MockDecoder {
    queue: Rc<RefCell<VecDeque<Frame>>>,
}

impl FrameDecoder for MockDecoder {
    fn feed(&mut self, bytes: &[u8]) -> usize {
        bytes.len()
    }

    fn feed_eof(&mut self, bytes: &[u8]) -> usize {
        bytes.len()
    }

    fn poll(&mut self) -> Result<Option<Frame>, ConnectionError> {
        Ok(self.queue.borrow_mut().pop_front())
    }
}

struct MockEncoder {
    sent: Rc<RefCell<Vec<Frame>>>,
}

impl FrameEncoder for MockEncoder {
    fn encode(&mut self, frame: &Frame) -> Vec<u8> {
        self.sent.borrow_mut().push(frame.clone());
        Vec::new()
    }
}

struct Harness {
    conn: Connection,
    incoming: Rc<RefCell<VecDeque<Frame>>>,
    outgoing: Rc<RefCell<Vec<Frame>>>,
}

impl Harness {
    fn new(config: Config, request_handler: h2engine::RequestHandler) -> Self {
        let incoming = Rc::new(RefCell::new(VecDeque::new()));
        let outgoing = Rc::new(RefCell::new(Vec::new()));
        let decoder = Box::new(MockDecoder { queue: incoming.clone() });
        let encoder = Box::new(MockEncoder { sent: outgoing.clone() });
        let conn = Connection::new(config, decoder, encoder, request_handler, None);
        Self { conn, incoming, outgoing }
    }

    fn feed(&mut self, frame: Frame) {
        self.incoming.borrow_mut().push_back(frame);
        self.conn.read(&[]);
    }

    /// Drains every queued outbound frame (flushing the scheduler first).
    fn drain_outbound(&mut self) -> Vec<Frame> {
        loop {
            match self.conn.next_write_operation() {
                WriteOperation::Write(bytes) => {
                    self.conn.report_write_result(WriteResult::Written(bytes.len()));
                }
                WriteOperation::Yield | WriteOperation::Close => break,
            }
        }
        self.outgoing.borrow_mut().drain(..).collect()
    }
}

fn encode_headers(pairs: &[(&str, &str)]) -> Bytes {
    let mut encoder = hpack::Encoder::new();
    Bytes::from(encoder.encode(pairs.iter().map(|(k, v)| (k.as_bytes(), v.as_bytes()))))
}

fn headers_frame(stream: u32, pairs: &[(&str, &str)], end_stream: bool) -> Frame {
    let mut flags = HeadersFlags::END_HEADERS;
    if end_stream {
        flags |= HeadersFlags::END_STREAM;
    }
    Frame::Headers { stream, flags, priority: None, fragment: encode_headers(pairs) }
}

#[test]
fn get_with_empty_body_invokes_handler_once() {
    let invoked = Rc::new(RefCell::new(0));
    let invoked2 = invoked.clone();
    let mut harness = Harness::new(
        Config::default(),
        Box::new(move |mut handle: h2engine::StreamHandle<'_>| {
            *invoked2.borrow_mut() += 1;
            handle.write_response_headers(vec![(":status".to_owned(), "200".to_owned())], true);
        }),
    );

    harness.feed(headers_frame(1, &[(":method", "GET"), (":path", "/"), (":scheme", "https")], true));

    assert_eq!(*invoked.borrow(), 1);
    let sent = harness.drain_outbound();
    assert!(sent.iter().any(|f| matches!(f, Frame::Settings { .. })));
}

#[test]
fn concurrent_stream_limit_resets_the_new_stream() {
    let mut config = Config::default();
    config.max_concurrent_streams = Some(1);
    let mut harness = Harness::new(config, Box::new(|_handle| {}));
    harness.drain_outbound();

    harness.feed(headers_frame(1, &[(":method", "GET"), (":path", "/"), (":scheme", "https")], false));
    harness.feed(headers_frame(3, &[(":method", "GET"), (":path", "/"), (":scheme", "https")], true));

    let sent = harness.drain_outbound();
    // The preface SETTINGS is never ACKed by this harness, so the limit
    // check takes the "still negotiating" branch (RefusedStream), not
    // ProtocolError.
    assert!(sent.iter().any(
        |f| matches!(f, Frame::ResetStream { stream: 3, error: Reason::RefusedStream })
    ));
}

#[test]
fn content_length_mismatch_resets_with_protocol_error() {
    let mut harness = Harness::new(Config::default(), Box::new(|_handle| {}));
    harness.drain_outbound();

    harness.feed(headers_frame(
        5,
        &[(":method", "POST"), (":path", "/"), (":scheme", "https"), ("content-length", "5")],
        false,
    ));
    harness.feed(Frame::Data { stream: 5, flags: DataFlags::END_STREAM, data: Bytes::from(vec![0u8; 7]) });

    let sent = harness.drain_outbound();
    assert!(sent.iter().any(
        |f| matches!(f, Frame::ResetStream { stream: 5, error: Reason::ProtocolError })
    ));
}

#[test]
fn self_dependent_priority_is_rejected() {
    let mut harness = Harness::new(Config::default(), Box::new(|_handle| {}));
    harness.drain_outbound();

    harness.feed(Frame::Priority { stream: 7, priority: Priority { dependency: 7, exclusive: false, weight: 16 } });

    let sent = harness.drain_outbound();
    assert!(sent.iter().any(
        |f| matches!(f, Frame::ResetStream { stream: 7, error: Reason::ProtocolError })
    ));
}

#[test]
fn continuation_interleaving_tears_down_the_connection() {
    let mut harness = Harness::new(Config::default(), Box::new(|_handle| {}));
    harness.drain_outbound();

    harness.feed(Frame::Headers {
        stream: 1,
        flags: HeadersFlags::empty(),
        priority: None,
        fragment: encode_headers(&[(":method", "GET"), (":path", "/"), (":scheme", "https")]),
    });
    harness.feed(Frame::Ping { flags: PingFlags::empty(), data: [0; 8] });

    let sent = harness.drain_outbound();
    assert!(sent.iter().any(|f| matches!(f, Frame::GoAway { error: Reason::ProtocolError, .. })));
}

#[test]
fn flow_control_violation_resets_stream_and_returns_connection_credit() {
    let mut config = Config::default();
    config.initial_window_size = 100;
    let mut harness = Harness::new(config, Box::new(|_handle| {}));
    harness.drain_outbound();

    harness.feed(headers_frame(1, &[(":method", "POST"), (":path", "/"), (":scheme", "https")], false));
    harness.drain_outbound();
    harness.feed(Frame::Data { stream: 1, flags: DataFlags::empty(), data: Bytes::from(vec![0u8; 150]) });

    let sent = harness.drain_outbound();
    assert!(sent.iter().any(
        |f| matches!(f, Frame::ResetStream { stream: 1, error: Reason::FlowControlError })
    ));
    assert!(sent.iter().any(
        |f| matches!(f, Frame::WindowUpdate { stream: 0, increment: 150 })
    ));
}

#[test]
fn settings_ack_round_trip_restores_unacked_count() {
    let mut harness = Harness::new(Config::default(), Box::new(|_handle| {}));
    let sent = harness.drain_outbound();
    assert!(sent.iter().any(|f| matches!(f, Frame::Settings { flags, .. } if !flags.contains(SettingsFlags::ACK))));

    harness.feed(Frame::Settings { flags: SettingsFlags::ACK, params: Vec::new() });
    // A second, unmatched ACK must now be a connection error.
    harness.feed(Frame::Settings { flags: SettingsFlags::ACK, params: Vec::new() });
    let sent = harness.drain_outbound();
    assert!(sent.iter().any(|f| matches!(f, Frame::GoAway { .. })));
}
