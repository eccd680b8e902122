//! # Control Channel Messages
//!
//! Every control message is JSON with the shape
//! `{ "type": <string>, "id": <string>, "payload": <object> }`. `id`
//! correlates a request with its response. The message set is closed and
//! small, so it is expressed as a tagged variant ([`ControlBody`]) with one
//! payload struct per [`MessageType`], not an open dynamic map — see
//! `RawEnvelope` below for the hand-rolled (de)serialization that keeps the
//! wire shape exactly as specified instead of relying on serde's adjacently
//! tagged representation, which cannot also carry a sibling `id` field.

use crate::error::ProtocolError;
use crate::ids::RequestId;
use serde::{Deserialize, Serialize};

/// The `type` discriminant of a control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Auth,
    AuthResp,
    Register,
    RegisterResp,
    Unregister,
    Heartbeat,
    HeartbeatResp,
    NewConnection,
    ConnectionClose,
    ConnectionError,
}

impl MessageType {
    fn as_wire_str(self) -> &'static str {
        match self {
            Self::Auth => "AUTH",
            Self::AuthResp => "AUTH_RESP",
            Self::Register => "REGISTER",
            Self::RegisterResp => "REGISTER_RESP",
            Self::Unregister => "UNREGISTER",
            Self::Heartbeat => "HEARTBEAT",
            Self::HeartbeatResp => "HEARTBEAT_RESP",
            Self::NewConnection => "NEW_CONNECTION",
            Self::ConnectionClose => "CONNECTION_CLOSE",
            Self::ConnectionError => "CONNECTION_ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRespPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub remote_port: u16,
    pub local_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRespPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterPayload {
    pub remote_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRespPayload {
    pub timestamp: u64,
}

/// The transport family of a bridged external connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnProtocol {
    Http,
    Websocket,
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConnectionPayload {
    pub connection_id: String,
    pub protocol: ConnProtocol,
    pub remote_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionClosePayload {
    pub connection_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionErrorPayload {
    pub connection_id: String,
    pub error: String,
}

/// One handler per variant — the full, closed set of messages exchanged
/// over the control channel.
#[derive(Debug, Clone)]
pub enum ControlBody {
    Auth(AuthPayload),
    AuthResp(AuthRespPayload),
    Register(RegisterPayload),
    RegisterResp(RegisterRespPayload),
    Unregister(UnregisterPayload),
    Heartbeat(HeartbeatPayload),
    HeartbeatResp(HeartbeatRespPayload),
    NewConnection(NewConnectionPayload),
    ConnectionClose(ConnectionClosePayload),
    ConnectionError(ConnectionErrorPayload),
}

impl ControlBody {
    fn message_type(&self) -> MessageType {
        match self {
            Self::Auth(_) => MessageType::Auth,
            Self::AuthResp(_) => MessageType::AuthResp,
            Self::Register(_) => MessageType::Register,
            Self::RegisterResp(_) => MessageType::RegisterResp,
            Self::Unregister(_) => MessageType::Unregister,
            Self::Heartbeat(_) => MessageType::Heartbeat,
            Self::HeartbeatResp(_) => MessageType::HeartbeatResp,
            Self::NewConnection(_) => MessageType::NewConnection,
            Self::ConnectionClose(_) => MessageType::ConnectionClose,
            Self::ConnectionError(_) => MessageType::ConnectionError,
        }
    }
}

/// A complete control message: the request/response-correlating `id`
/// plus its tagged body.
#[derive(Debug, Clone)]
pub struct ControlMessage {
    pub id: RequestId,
    pub body: ControlBody,
}

impl ControlMessage {
    pub fn new(id: RequestId, body: ControlBody) -> Self {
        Self { id, body }
    }

    /// Convenience constructor for messages that do not correlate with a
    /// prior request (e.g. a server-initiated `NEW_CONNECTION`).
    pub fn unsolicited(body: ControlBody) -> Self {
        Self::new(RequestId::new(), body)
    }

    pub fn to_json(&self) -> String {
        let payload = serialize_payload(&self.body);
        let raw = RawEnvelope {
            kind: self.body.message_type().as_wire_str().to_string(),
            id: self.id,
            payload,
        };
        // A `RawEnvelope` of our own construction always serializes.
        serde_json::to_string(&raw).expect("control envelope always serializes")
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(text)
            .map_err(|e| ProtocolError::MalformedMessage(e.to_string()))?;
        let body = deserialize_payload(&raw.kind, raw.payload)?;
        Ok(Self { id: raw.id, body })
    }
}

#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    id: RequestId,
    #[serde(default)]
    payload: serde_json::Value,
}

fn serialize_payload(body: &ControlBody) -> serde_json::Value {
    match body {
        ControlBody::Auth(p) => serde_json::to_value(p),
        ControlBody::AuthResp(p) => serde_json::to_value(p),
        ControlBody::Register(p) => serde_json::to_value(p),
        ControlBody::RegisterResp(p) => serde_json::to_value(p),
        ControlBody::Unregister(p) => serde_json::to_value(p),
        ControlBody::Heartbeat(p) => serde_json::to_value(p),
        ControlBody::HeartbeatResp(p) => serde_json::to_value(p),
        ControlBody::NewConnection(p) => serde_json::to_value(p),
        ControlBody::ConnectionClose(p) => serde_json::to_value(p),
        ControlBody::ConnectionError(p) => serde_json::to_value(p),
    }
    .expect("control payload always serializes to a JSON object")
}

fn deserialize_payload(
    kind: &str,
    payload: serde_json::Value,
) -> Result<ControlBody, ProtocolError> {
    let malformed = |e: serde_json::Error| ProtocolError::MalformedMessage(e.to_string());
    Ok(match kind {
        "AUTH" => ControlBody::Auth(serde_json::from_value(payload).map_err(malformed)?),
        "AUTH_RESP" => ControlBody::AuthResp(serde_json::from_value(payload).map_err(malformed)?),
        "REGISTER" => ControlBody::Register(serde_json::from_value(payload).map_err(malformed)?),
        "REGISTER_RESP" => {
            ControlBody::RegisterResp(serde_json::from_value(payload).map_err(malformed)?)
        }
        "UNREGISTER" => {
            ControlBody::Unregister(serde_json::from_value(payload).map_err(malformed)?)
        }
        "HEARTBEAT" => ControlBody::Heartbeat(serde_json::from_value(payload).map_err(malformed)?),
        "HEARTBEAT_RESP" => {
            ControlBody::HeartbeatResp(serde_json::from_value(payload).map_err(malformed)?)
        }
        "NEW_CONNECTION" => {
            ControlBody::NewConnection(serde_json::from_value(payload).map_err(malformed)?)
        }
        "CONNECTION_CLOSE" => {
            ControlBody::ConnectionClose(serde_json::from_value(payload).map_err(malformed)?)
        }
        "CONNECTION_ERROR" => {
            ControlBody::ConnectionError(serde_json::from_value(payload).map_err(malformed)?)
        }
        other => return Err(ProtocolError::UnknownMessageType(other.to_string())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_register_through_json() {
        let msg = ControlMessage::unsolicited(ControlBody::Register(RegisterPayload {
            remote_port: 29080,
            local_port: 29100,
            local_host: None,
        }));
        let id = msg.id;
        let json = msg.to_json();
        assert!(json.contains("\"type\":\"REGISTER\""));
        assert!(json.contains("\"remotePort\":29080"));

        let parsed = ControlMessage::from_json(&json).unwrap();
        assert_eq!(parsed.id, id);
        match parsed.body {
            ControlBody::Register(p) => {
                assert_eq!(p.remote_port, 29080);
                assert_eq!(p.local_port, 29100);
                assert!(p.local_host.is_none());
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_type() {
        let text = r#"{"type":"BOGUS","id":"3fa85f64-5717-4562-b3fc-2c963f66afa6","payload":{}}"#;
        match ControlMessage::from_json(text) {
            Err(ProtocolError::UnknownMessageType(t)) => assert_eq!(t, "BOGUS"),
            other => panic!("expected UnknownMessageType, got {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_json() {
        match ControlMessage::from_json("not json") {
            Err(ProtocolError::MalformedMessage(_)) => {}
            other => panic!("expected MalformedMessage, got {other:?}"),
        }
    }

    #[test]
    fn rejects_missing_required_field() {
        let text = r#"{"type":"AUTH","id":"3fa85f64-5717-4562-b3fc-2c963f66afa6","payload":{}}"#;
        match ControlMessage::from_json(text) {
            Err(ProtocolError::MalformedMessage(_)) => {}
            other => panic!("expected MalformedMessage, got {other:?}"),
        }
    }
}
