//! # UDP Data-Channel Frames
//!
//! Three datagram shapes, distinguished by the first byte(s):
//!
//! - Data:      `[36-byte ExternalConnId][N-byte data]` (first byte != `0xFD`)
//! - Register:  `[0xFD 0x02][36-byte AgentId]`
//! - Keep-alive:`[0xFD 0x03][36-byte AgentId]`
//!
//! A datagram matching none of these shapes (by length and first byte) is
//! silently dropped by the caller — `decode_udp_frame` returns `None`.

use crate::ids::{AgentId, ExternalConnId, ID_WIRE_LEN};
use bytes::{BufMut, Bytes, BytesMut};

const CONTROL_MARKER: u8 = 0xFD;
const REGISTER_TAG: u8 = 0x02;
const KEEP_ALIVE_TAG: u8 = 0x03;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpFrame {
    Data {
        conn_id: ExternalConnId,
        payload: Bytes,
    },
    Register {
        agent_id: AgentId,
    },
    KeepAlive {
        agent_id: AgentId,
    },
}

/// Decodes a raw UDP payload into one of the three known shapes. Returns
/// `None` for anything shorter than a valid shape or with an unrecognized
/// control tag; such datagrams are dropped without logging an error (a
/// `trace`/`debug` note at the call site is sufficient).
pub fn decode_udp_frame(bytes: &[u8]) -> Option<UdpFrame> {
    if bytes.first() == Some(&CONTROL_MARKER) {
        if bytes.len() != 2 + ID_WIRE_LEN {
            return None;
        }
        let agent_id = AgentId::from_wire_bytes(&bytes[2..])?;
        return match bytes[1] {
            REGISTER_TAG => Some(UdpFrame::Register { agent_id }),
            KEEP_ALIVE_TAG => Some(UdpFrame::KeepAlive { agent_id }),
            _ => None,
        };
    }

    if bytes.len() < ID_WIRE_LEN {
        return None;
    }
    let conn_id = ExternalConnId::from_wire_bytes(&bytes[..ID_WIRE_LEN])?;
    Some(UdpFrame::Data {
        conn_id,
        payload: Bytes::copy_from_slice(&bytes[ID_WIRE_LEN..]),
    })
}

pub fn encode_register_frame(agent_id: &AgentId) -> [u8; 2 + ID_WIRE_LEN] {
    let mut buf = [0u8; 2 + ID_WIRE_LEN];
    buf[0] = CONTROL_MARKER;
    buf[1] = REGISTER_TAG;
    buf[2..].copy_from_slice(&agent_id.to_wire_bytes());
    buf
}

pub fn encode_keep_alive_frame(agent_id: &AgentId) -> [u8; 2 + ID_WIRE_LEN] {
    let mut buf = [0u8; 2 + ID_WIRE_LEN];
    buf[0] = CONTROL_MARKER;
    buf[1] = KEEP_ALIVE_TAG;
    buf[2..].copy_from_slice(&agent_id.to_wire_bytes());
    buf
}

pub fn encode_data_frame(conn_id_wire: &[u8; ID_WIRE_LEN], payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ID_WIRE_LEN + payload.len());
    buf.put_slice(conn_id_wire);
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_register_frame() {
        let agent = AgentId::new();
        let encoded = encode_register_frame(&agent);
        assert_eq!(decode_udp_frame(&encoded), Some(UdpFrame::Register { agent_id: agent }));
    }

    #[test]
    fn decodes_keep_alive_frame() {
        let agent = AgentId::new();
        let encoded = encode_keep_alive_frame(&agent);
        assert_eq!(
            decode_udp_frame(&encoded),
            Some(UdpFrame::KeepAlive { agent_id: agent })
        );
    }

    #[test]
    fn decodes_data_frame() {
        let conn_id = ExternalConnId::new();
        let encoded = encode_data_frame(&conn_id.to_wire_bytes(), b"hello udp tunnel");
        match decode_udp_frame(&encoded) {
            Some(UdpFrame::Data { conn_id: got, payload }) => {
                assert_eq!(got, conn_id);
                assert_eq!(&payload[..], b"hello udp tunnel");
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn drops_short_datagrams() {
        assert_eq!(decode_udp_frame(b"short"), None);
        assert_eq!(decode_udp_frame(&[0xFD, 0x02]), None);
    }

    #[test]
    fn drops_unknown_control_tag() {
        let agent = AgentId::new();
        let mut encoded = encode_register_frame(&agent);
        encoded[1] = 0x09;
        assert_eq!(decode_udp_frame(&encoded), None);
    }
}
