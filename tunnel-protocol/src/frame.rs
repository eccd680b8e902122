//! # TCP Data-Channel Frame Codec
//!
//! Wire layout of a data frame:
//!
//! ```text
//! [4-byte big-endian payload-length][36-byte ExternalConnId ASCII][N-byte data]
//! ```
//!
//! where `payload-length = 36 + N`. A single auth frame (fixed 38 bytes,
//! no length prefix) precedes any data frames on a freshly opened socket.

use crate::error::ProtocolError;
use crate::ids::{AgentId, ExternalConnId, ID_WIRE_LEN};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

/// Total length of the authentication frame: 2 marker bytes + 36 ASCII id bytes.
pub const AUTH_FRAME_LEN: usize = 2 + ID_WIRE_LEN;

/// First two bytes of the authentication frame, distinguishing it from a
/// length-prefixed data frame and from an HTTP/WebSocket request.
pub const AUTH_FRAME_PREFIX: [u8; 2] = [0xFD, 0x01];

/// Status byte replied by the receiver of an auth frame on acceptance.
pub const AUTH_ACCEPT: u8 = 0x01;
/// Status byte replied by the receiver of an auth frame on rejection.
pub const AUTH_REJECT: u8 = 0x00;

/// Builds the 38-byte authentication frame for `agent_id`.
pub fn encode_auth_frame(agent_id: &AgentId) -> [u8; AUTH_FRAME_LEN] {
    let mut buf = [0u8; AUTH_FRAME_LEN];
    buf[..2].copy_from_slice(&AUTH_FRAME_PREFIX);
    buf[2..].copy_from_slice(&agent_id.to_wire_bytes());
    buf
}

/// Parses a buffer known to be exactly [`AUTH_FRAME_LEN`] bytes as an auth
/// frame, returning the carried [`AgentId`]. Returns `None` if the prefix
/// or the id encoding don't match.
pub fn parse_auth_frame(bytes: &[u8]) -> Option<AgentId> {
    if bytes.len() != AUTH_FRAME_LEN || bytes[..2] != AUTH_FRAME_PREFIX {
        return None;
    }
    AgentId::from_wire_bytes(&bytes[2..])
}

/// Encodes a single data frame: length prefix, connection id, payload.
pub fn encode_data_frame(conn_id_wire: &[u8; ID_WIRE_LEN], payload: &[u8]) -> Bytes {
    let len = (ID_WIRE_LEN + payload.len()) as u32;
    let mut buf = BytesMut::with_capacity(4 + ID_WIRE_LEN + payload.len());
    buf.put_u32(len);
    buf.put_slice(conn_id_wire);
    buf.put_slice(payload);
    buf.freeze()
}

/// Stateful, byte-fed parser for the data-channel frame stream.
///
/// Feed arbitrarily-sized chunks with [`FrameParser::feed`] and drain
/// completed frames with [`FrameParser::next_frame`] until it returns
/// `Ok(None)`. A partial frame is never emitted, and `reset()` discards
/// all buffered bytes and any partial state.
#[derive(Default)]
pub struct FrameParser {
    buf: BytesMut,
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Appends bytes read off the socket. Amortized O(1) per byte: `BytesMut`
    /// grows its backing allocation geometrically, so this never degrades to
    /// quadratic behavior under a stream of small adversarial writes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Clears all buffered bytes and any partial frame in progress.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Returns the next complete frame, if one is buffered. The returned
    /// payload is an owned, reference-counted slice of the internal buffer
    /// (via `Bytes`) — cheap to clone, safe to retain past the next call.
    pub fn next_frame(&mut self) -> Result<Option<(ExternalConnId, Bytes)>, ProtocolError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(self.buf[..4].try_into().unwrap()) as usize;
        if len < ID_WIRE_LEN {
            return Err(ProtocolError::MalformedMessage(format!(
                "data frame length {len} shorter than id width {ID_WIRE_LEN}"
            )));
        }
        if self.buf.len() < 4 + len {
            // Partial frame: wait for more bytes.
            return Ok(None);
        }

        self.buf.advance(4);
        let mut frame = self.buf.split_to(len);
        let id_bytes = frame.split_to(ID_WIRE_LEN);
        let conn_id = ExternalConnId::from_wire_bytes(&id_bytes).ok_or_else(|| {
            ProtocolError::MalformedMessage("data frame carried an invalid connection id".into())
        })?;
        Ok(Some((conn_id, frame.freeze())))
    }
}

/// Caches the 36-byte ASCII encoding of each live [`ExternalConnId`] so
/// hot-path frame encoding never re-derives it. Evict entries when the
/// connection is torn down.
#[derive(Default)]
pub struct ConnIdEncodingCache {
    entries: HashMap<ExternalConnId, [u8; ID_WIRE_LEN]>,
}

impl ConnIdEncodingCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn encode(&mut self, conn_id: ExternalConnId) -> [u8; ID_WIRE_LEN] {
        *self
            .entries
            .entry(conn_id)
            .or_insert_with(|| conn_id.to_wire_bytes())
    }

    pub fn evict(&mut self, conn_id: &ExternalConnId) {
        self.entries.remove(conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(conn_id: &ExternalConnId, payload: &[u8]) -> Bytes {
        encode_data_frame(&conn_id.to_wire_bytes(), payload)
    }

    #[test]
    fn auth_frame_round_trips() {
        let agent = AgentId::new();
        let encoded = encode_auth_frame(&agent);
        assert_eq!(encoded.len(), AUTH_FRAME_LEN);
        assert_eq!(parse_auth_frame(&encoded), Some(agent));
    }

    #[test]
    fn rejects_non_auth_prefix() {
        let mut bytes = [0u8; AUTH_FRAME_LEN];
        bytes[0] = b'G';
        bytes[1] = b'E';
        assert_eq!(parse_auth_frame(&bytes), None);
    }

    #[test]
    fn parses_single_frame_fed_whole() {
        let conn_id = ExternalConnId::new();
        let encoded = frame_bytes(&conn_id, b"hello");
        let mut parser = FrameParser::new();
        parser.feed(&encoded);
        let (id, payload) = parser.next_frame().unwrap().unwrap();
        assert_eq!(id, conn_id);
        assert_eq!(&payload[..], b"hello");
        assert!(parser.next_frame().unwrap().is_none());
    }

    #[test]
    fn empty_payload_frame_is_valid() {
        let conn_id = ExternalConnId::new();
        let encoded = frame_bytes(&conn_id, b"");
        let mut parser = FrameParser::new();
        parser.feed(&encoded);
        let (id, payload) = parser.next_frame().unwrap().unwrap();
        assert_eq!(id, conn_id);
        assert!(payload.is_empty());
    }

    #[test]
    fn handles_arbitrary_chunking_across_multiple_frames() {
        let a = ExternalConnId::new();
        let b = ExternalConnId::new();
        let mut whole = BytesMut::new();
        whole.extend_from_slice(&frame_bytes(&a, b"first connection payload"));
        whole.extend_from_slice(&frame_bytes(&b, b"second"));
        whole.extend_from_slice(&frame_bytes(&a, b""));
        let whole = whole.freeze();

        // Feed in pathologically small, uneven chunks.
        let mut parser = FrameParser::new();
        let mut out = Vec::new();
        for chunk in whole.chunks(3) {
            parser.feed(chunk);
            while let Some(frame) = parser.next_frame().unwrap() {
                out.push(frame);
            }
        }

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].0, a);
        assert_eq!(&out[0].1[..], b"first connection payload");
        assert_eq!(out[1].0, b);
        assert_eq!(&out[1].1[..], b"second");
        assert_eq!(out[2].0, a);
        assert!(out[2].1.is_empty());
    }

    #[test]
    fn partial_frame_is_never_emitted() {
        let conn_id = ExternalConnId::new();
        let encoded = frame_bytes(&conn_id, b"payload bytes here");
        let mut parser = FrameParser::new();
        parser.feed(&encoded[..encoded.len() - 1]);
        assert!(parser.next_frame().unwrap().is_none());
        parser.feed(&encoded[encoded.len() - 1..]);
        assert!(parser.next_frame().unwrap().is_some());
    }

    #[test]
    fn reset_clears_partial_state() {
        let conn_id = ExternalConnId::new();
        let encoded = frame_bytes(&conn_id, b"abc");
        let mut parser = FrameParser::new();
        parser.feed(&encoded[..5]);
        parser.reset();
        parser.feed(&encoded);
        let (id, payload) = parser.next_frame().unwrap().unwrap();
        assert_eq!(id, conn_id);
        assert_eq!(&payload[..], b"abc");
    }

    #[test]
    fn conn_id_cache_encodes_once_and_evicts() {
        let mut cache = ConnIdEncodingCache::new();
        let conn_id = ExternalConnId::new();
        let first = cache.encode(conn_id);
        let second = cache.encode(conn_id);
        assert_eq!(first, second);
        cache.evict(&conn_id);
        assert_eq!(cache.entries.len(), 0);
    }
}
