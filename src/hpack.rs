//! Adapter over the external HPACK codec.
//!
//! HPACK's header-table state and Huffman coding are out of scope for this
//! crate (spec.md section 1); this module only owns the parts that *are*
//! the connection engine's job: accumulating a header block fragment across
//! HEADERS/PUSH_PROMISE + CONTINUATION* and finalizing it through the
//! shared decoder exactly once END_HEADERS is observed.

use bytes::{Bytes, BytesMut};
use log::trace;

use crate::types::Headers;

/// The connection-wide HPACK contexts, one per direction, shared across all
/// streams (spec.md section 3, "the two HPACK contexts").
pub struct HpackContexts {
    pub encoder: hpack::Encoder<'static>,
    pub decoder: hpack::Decoder<'static>,
}

impl HpackContexts {
    #[must_use]
    pub fn new() -> Self {
        Self {
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::new(),
        }
    }

    pub fn set_encoder_table_size(&mut self, size: usize) {
        self.encoder.set_max_table_size(size);
    }

    #[must_use]
    pub fn encode(&mut self, headers: &Headers) -> Bytes {
        Bytes::from(
            self.encoder
                .encode(headers.iter().map(|(k, v)| (k.as_bytes(), v.as_bytes()))),
        )
    }
}

impl Default for HpackContexts {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulates a header block across a HEADERS/PUSH_PROMISE frame and any
/// CONTINUATION frames that follow it, per spec.md section 4.4.1's
/// `handle_headers_block`.
///
/// The initial buffer capacity is `headers_block_length` when END_HEADERS
/// is already set on the opening frame, or `2 * headers_block_length`
/// otherwise (continuation is expected to roughly double the block).
pub struct HeaderBlockParser {
    buffer: BytesMut,
    finished: bool,
}

impl HeaderBlockParser {
    #[must_use]
    pub fn new(headers_block_length: usize, end_headers: bool) -> Self {
        let capacity = if end_headers {
            headers_block_length
        } else {
            headers_block_length * 2
        };
        Self {
            buffer: BytesMut::with_capacity(capacity),
            finished: false,
        }
    }

    pub fn feed(&mut self, fragment: &[u8]) {
        trace!("hpack: feeding {} bytes into header block", fragment.len());
        self.buffer.extend_from_slice(fragment);
    }

    /// Finalizes the block through the shared decoder. Returns the decoded
    /// header list on success, or `DecodeError` (mapped by the caller to
    /// `ConnectionError::compression_error` per spec.md section 4.4.1).
    pub fn finish(mut self, decoder: &mut hpack::Decoder<'_>) -> Result<Headers, DecodeError> {
        self.finished = true;
        let mut headers = Headers::new();
        decoder
            .decode_with_cb(&self.buffer, |key, value| {
                headers.push((
                    String::from_utf8_lossy(&key).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                ));
            })
            .map_err(DecodeError::InvalidHeader)?;
        Ok(headers)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("invalid HPACK header block: {0:?}")]
    InvalidHeader(hpack::decoder::DecoderError),
}
