//! The lace wire envelope.
//!
//! Every message on the wire is one JSON object:
//!
//! ```text
//! {"type": "needpeer", "id": ["<node id>", [x, y]], "stamp": 1234,
//!  "clock": "<base64>", "src": ["10.0.0.1", 6966], ...type-specific fields}
//! ```
//!
//! `stamp` is a fresh random 128-bit nonce per message and is only used for
//! duplicate suppression. The causal clock travels separately in `clock`.

use crate::coord::Coord;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

/// Globally unique identity of a node, fixed for the process lifetime.
///
/// The ordering is used as the mutual-exclusion tie-breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build an id from raw bytes (deterministic ids for tests and simulations).
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Build an id whose ordering follows `n`.
    #[must_use]
    pub const fn from_u128(n: u128) -> Self {
        Self(Uuid::from_u128(n))
    }

    /// First eight hex digits, for log lines.
    #[must_use]
    pub fn short(&self) -> String {
        let mut s = self.0.simple().to_string();
        s.truncate(8);
        s
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// A socket address encoded as `[host, port]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WireAddr(pub IpAddr, pub u16);

impl From<SocketAddr> for WireAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.ip(), addr.port())
    }
}

impl From<WireAddr> for SocketAddr {
    fn from(addr: WireAddr) -> Self {
        SocketAddr::new(addr.0, addr.1)
    }
}

/// Sub-type of a mutual-exclusion message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaekawaKind {
    /// Ask a voter for its grant.
    Request,
    /// A voter's grant.
    Grant,
    /// A voter asks its grantee whether it would give the grant back.
    Inquire,
    /// The grantee gives the grant back.
    Yield,
    /// A voter tells a requester it is not first in line.
    Fail,
    /// The lock holder is done.
    Release,
}

impl MaekawaKind {
    /// Static name for log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Grant => "grant",
            Self::Inquire => "inquire",
            Self::Yield => "yield",
            Self::Fail => "fail",
            Self::Release => "release",
        }
    }
}

/// The closed set of message kinds, tagged by the envelope's `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Body {
    /// Join request (no `value`) or the greeter's answer carrying the
    /// assigned coordinate and the greeter's view of `lace_max`.
    Hello {
        /// Coordinate assigned to the joiner.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Coord>,
        /// Lace max after the assignment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        newlm: Option<Coord>,
    },
    /// A freshly joined member announces its coordinate. Flooded.
    #[serde(rename = "needpeer")]
    NeedPeer,
    /// Answer to `needpeer` from a compatible member.
    #[serde(rename = "newpeer")]
    NewPeer {
        /// Sender's lace max.
        newlm: Coord,
    },
    /// Lace max advanced. Flooded.
    #[serde(rename = "newlm")]
    NewLaceMax {
        /// The new lace max.
        newlm: Coord,
    },
    /// Duplicate coordinate detected; the receiver must rejoin.
    Recon,
    /// Application payload for everybody. Flooded.
    Data {
        /// Opaque payload.
        data: serde_json::Value,
    },
    /// Application payload for one peer (also used for replies).
    #[serde(rename = "oncedata")]
    OnceData {
        /// Opaque payload.
        data: serde_json::Value,
    },
    /// Mutual-exclusion traffic.
    Maekawa {
        /// Sub-type.
        maekawa: MaekawaKind,
        /// Sequence number of the request this message is about.
        seq: u64,
    },
    /// Liveness check, answered with `pong`.
    Ping,
    /// Liveness answer.
    Pong,
    /// The sender is leaving.
    Bye,
    /// Any `type` this build does not know.
    #[serde(other)]
    Unknown,
}

impl Body {
    /// Static name for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::NeedPeer => "needpeer",
            Self::NewPeer { .. } => "newpeer",
            Self::NewLaceMax { .. } => "newlm",
            Self::Recon => "recon",
            Self::Data { .. } => "data",
            Self::OnceData { .. } => "oncedata",
            Self::Maekawa { maekawa, .. } => maekawa.as_str(),
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Bye => "bye",
            Self::Unknown => "unknown",
        }
    }

    /// True for kinds that are relayed hop by hop, so the sender id says
    /// nothing about the link the message arrived on. Unknown kinds count
    /// as relayed.
    pub fn is_flooded(&self) -> bool {
        matches!(
            self,
            Self::NeedPeer | Self::NewLaceMax { .. } | Self::Data { .. } | Self::Unknown
        )
    }
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message kind and its fields.
    #[serde(flatten)]
    pub body: Body,
    /// Sender identity and coordinate.
    pub id: (NodeId, Coord),
    /// Duplicate-suppression nonce. Full 128 bits, as other implementations
    /// draw it from a random UUID.
    pub stamp: u128,
    /// Sender's causal clock, base64 encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<String>,
    /// Address replies should go to, when it differs from the packet source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<WireAddr>,
}

impl Envelope {
    /// Create an envelope with a fresh nonce.
    pub fn new(body: Body, sender: NodeId, coord: Coord) -> Self {
        Self {
            body,
            id: (sender, coord),
            stamp: rand::random(),
            clock: None,
            src: None,
        }
    }

    /// Sender id.
    #[inline]
    pub fn sender(&self) -> NodeId {
        self.id.0
    }

    /// Sender coordinate at the time of sending.
    #[inline]
    pub fn sender_coord(&self) -> Coord {
        self.id.1
    }

    /// Serialise to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sender() -> NodeId {
        NodeId::from_u128(0xabc)
    }

    #[test]
    fn test_maekawa_wire_shape() {
        let env = Envelope::new(
            Body::Maekawa {
                maekawa: MaekawaKind::Inquire,
                seq: 42,
            },
            sender(),
            Coord::new(2, 1),
        );
        let value: serde_json::Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "maekawa");
        assert_eq!(value["maekawa"], "inquire");
        assert_eq!(value["seq"], 42);
        assert_eq!(value["id"][1], json!([2, 1]));
        assert!(value.get("clock").is_none());
        assert!(value.get("src").is_none());
    }

    #[test]
    fn test_parse_foreign_message() {
        let raw = json!({
            "type": "newlm",
            "id": [NodeId::from_u128(7), [1, 1]],
            "stamp": 99,
            "src": ["127.0.0.1", 6966],
            "newlm": [2, 1],
        });
        let env = Envelope::from_bytes(raw.to_string().as_bytes()).unwrap();
        assert_eq!(
            env.body,
            Body::NewLaceMax {
                newlm: Coord::new(2, 1)
            }
        );
        assert_eq!(env.sender(), NodeId::from_u128(7));
        let src: SocketAddr = env.src.unwrap().into();
        assert_eq!(src, "127.0.0.1:6966".parse().unwrap());
    }

    #[test]
    fn test_flooded_kinds() {
        assert!(Body::Data { data: json!(1) }.is_flooded());
        assert!(Body::NeedPeer.is_flooded());
        assert!(Body::Unknown.is_flooded());
        assert!(!Body::Ping.is_flooded());
        assert!(!Body::Pong.is_flooded());
        assert!(!Body::NewPeer { newlm: Coord::ORIGIN }.is_flooded());
    }

    #[test]
    fn test_full_width_stamp() {
        let raw = format!(
            r#"{{"type":"ping","id":[{},[1,1]],"stamp":{}}}"#,
            serde_json::to_string(&NodeId::from_u128(7)).unwrap(),
            u128::MAX
        );
        let env = Envelope::from_bytes(raw.as_bytes()).unwrap();
        assert_eq!(env.stamp, u128::MAX);
        assert_eq!(env.body, Body::Ping);

        let back = String::from_utf8(env.to_bytes().unwrap()).unwrap();
        assert!(back.contains(&format!(r#""stamp":{}"#, u128::MAX)));
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let raw = json!({
            "type": "gossip-v2",
            "id": [NodeId::from_u128(7), [1, 1]],
            "stamp": 1,
            "extra": true,
        });
        let env = Envelope::from_bytes(raw.to_string().as_bytes()).unwrap();
        assert_eq!(env.body, Body::Unknown);
    }

    #[test]
    fn test_malformed_is_an_error() {
        assert!(Envelope::from_bytes(b"{not json").is_err());
        assert!(Envelope::from_bytes(br#"{"type":"ping","stamp":1}"#).is_err());
    }

    #[test]
    fn test_hello_optional_fields() {
        let env = Envelope::new(
            Body::Hello {
                value: None,
                newlm: None,
            },
            sender(),
            Coord::UNASSIGNED,
        );
        let text = String::from_utf8(env.to_bytes().unwrap()).unwrap();
        assert!(!text.contains("value"));
        let back = Envelope::from_bytes(text.as_bytes()).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_node_id_order_and_short() {
        assert!(NodeId::from_u128(1) < NodeId::from_u128(2));
        assert_eq!(NodeId::from_u128(u128::MAX).short(), "ffffffff");
    }
}
