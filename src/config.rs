//! Tunables for a connection, with RFC 7540-matching defaults.

#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Size hint for the buffer the driver should read into before calling
    /// back with bytes (spec.md section 1's "read buffer size").
    pub read_buffer_size: usize,
    /// SETTINGS_MAX_CONCURRENT_STREAMS we advertise to the peer. `None`
    /// leaves it unset (unlimited), matching RFC 7540 section 6.5.2's
    /// default.
    pub max_concurrent_streams: Option<u32>,
    /// SETTINGS_INITIAL_WINDOW_SIZE we advertise to the peer.
    pub initial_window_size: u32,
    /// Capacity of each stream's inbound (request) body buffer.
    pub request_body_buffer_size: usize,
    /// Capacity of each stream's outbound (response) body buffer.
    pub response_body_buffer_size: usize,
    /// Whether PUSH_PROMISE creation is available to application code at
    /// all, independent of the peer's own SETTINGS_ENABLE_PUSH.
    pub enable_server_push: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_buffer_size: 16_384,
            max_concurrent_streams: None,
            initial_window_size: 65_535,
            request_body_buffer_size: 65_536,
            response_body_buffer_size: 65_536,
            enable_server_push: true,
        }
    }
}
