//! # Opaque Identifiers
//!
//! `AgentId`, `ExternalConnId` and `RequestId` are UUID-v4 values. On the
//! wire they are always the 36-byte ASCII (hyphenated) rendering of the
//! UUID, never the compact 16-byte binary form — frame and datagram
//! layouts in [`crate::frame`] and [`crate::udp`] reserve exactly 36 bytes
//! for them. Callers only ever compare them for equality and hash them;
//! the macro below derives nothing beyond that.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The fixed wire width of any of these identifiers: a hyphenated UUID
/// rendered as ASCII (`8-4-4-4-12` hex groups plus four hyphens).
pub const ID_WIRE_LEN: usize = 36;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Allocates a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Renders the canonical 36-byte ASCII wire form.
            pub fn to_wire_bytes(&self) -> [u8; ID_WIRE_LEN] {
                let mut buf = [0u8; ID_WIRE_LEN];
                // `Uuid::hyphenated` always writes exactly 36 ASCII bytes.
                self.0.as_hyphenated().encode_lower(&mut buf);
                buf
            }

            /// Parses the canonical 36-byte ASCII wire form. Returns `None`
            /// if `bytes` is not a valid hyphenated UUID.
            pub fn from_wire_bytes(bytes: &[u8]) -> Option<Self> {
                if bytes.len() != ID_WIRE_LEN {
                    return None;
                }
                let s = std::str::from_utf8(bytes).ok()?;
                Uuid::parse_str(s).ok().map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.as_hyphenated())
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

opaque_id!(AgentId);
opaque_id!(ExternalConnId);
opaque_id!(RequestId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_wire_bytes() {
        let id = ExternalConnId::new();
        let wire = id.to_wire_bytes();
        assert_eq!(wire.len(), ID_WIRE_LEN);
        assert_eq!(ExternalConnId::from_wire_bytes(&wire), Some(id));
    }

    #[test]
    fn rejects_wrong_length() {
        assert_eq!(AgentId::from_wire_bytes(b"too-short"), None);
    }

    #[test]
    fn display_and_parse_agree() {
        let id = RequestId::new();
        let s = id.to_string();
        assert_eq!(s.len(), ID_WIRE_LEN);
        assert_eq!(s.parse::<RequestId>().unwrap(), id);
    }
}
