//! The wire packet model.
//!
//! A packet is a flat JSON object with single-letter field names fixed for
//! interoperability: `t` (topic tag or ack-correlation id), `m` (message
//! name), `d` (payload), `r` (route/correlation id), `i` (ack-request id).
//! Which fields are present, and the JSON type of `r`, determine the packet
//! kind; see [`crate::codec`].

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::WireError;

/// Largest numeric route id (`2^53 - 1`, the max safe JS integer).
///
/// Initiator-side counters wrap back to zero past this value so ids stay
/// exact in peers that parse JSON numbers as doubles.
pub const MAX_ROUTE_ID: u64 = (1 << 53) - 1;

/// Topic tag of a bare heartbeat packet.
pub const TAG_HEARTBEAT: &str = "hb";

/// Topic tag of a heartbeat request packet.
pub const TAG_HEARTBEAT_REQUEST: &str = "hbr";

/// Topic tag of a settings negotiation packet.
pub const TAG_NEGOTIATE: &str = "ns";

/// Correlation id carried in a packet's `r` field.
///
/// The JSON type is the sole direction discriminator on the wire: numeric
/// ids are always minted by the initiator side, string ids always by the
/// acceptor side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteId {
    /// Initiator-minted id from a monotonic counter.
    Numeric(u64),
    /// Acceptor-minted opaque id.
    Opaque(String),
}

impl Serialize for RouteId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RouteId::Numeric(n) => serializer.serialize_u64(*n),
            RouteId::Opaque(s) => serializer.serialize_str(s),
        }
    }
}

impl std::fmt::Display for RouteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteId::Numeric(n) => write!(f, "{}", n),
            RouteId::Opaque(s) => write!(f, "{}", s),
        }
    }
}

/// One wire packet.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Packet {
    /// Control tag (`hb`, `hbr`, `ns`) or, with no `route`, an
    /// acknowledgement-correlation id.
    pub topic: Option<String>,
    /// Message name; empty on control packets and omitted on the wire.
    pub name: String,
    /// Opaque payload; `Null` when absent.
    pub payload: Value,
    /// Request/response correlation id.
    pub route: Option<RouteId>,
    /// Marks this packet as requesting an acknowledgement under this id.
    pub ack_request: Option<String>,
}

impl Serialize for Packet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(topic) = &self.topic {
            map.serialize_entry("t", topic)?;
        }
        if !self.name.is_empty() {
            map.serialize_entry("m", &self.name)?;
        }
        if !self.payload.is_null() {
            map.serialize_entry("d", &self.payload)?;
        }
        if let Some(route) = &self.route {
            map.serialize_entry("r", route)?;
        }
        if let Some(ack) = &self.ack_request {
            map.serialize_entry("i", ack)?;
        }
        map.end()
    }
}

impl Packet {
    /// Serialize to the JSON text sent over the channel.
    pub fn encode(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse packet text received from the channel.
    ///
    /// Rejects anything that is not a JSON object and any field of an
    /// unexpected JSON type; the session layer treats every rejection as a
    /// protocol error.
    pub fn decode(text: &str) -> Result<Packet, WireError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(fields) = value else {
            return Err(WireError::NotObject);
        };

        let topic = match fields.get("t") {
            None | Some(Value::Null) => None,
            Some(Value::String(tag)) => Some(tag.clone()),
            Some(_) => return Err(WireError::Topic),
        };
        let name = match fields.get("m") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(name)) => name.clone(),
            Some(_) => return Err(WireError::Name),
        };
        let payload = fields.get("d").cloned().unwrap_or(Value::Null);
        let route = match fields.get("r") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => match n.as_u64() {
                Some(id) if id <= MAX_ROUTE_ID => Some(RouteId::Numeric(id)),
                _ => return Err(WireError::RouteRange),
            },
            Some(Value::String(id)) => Some(RouteId::Opaque(id.clone())),
            Some(_) => return Err(WireError::Route),
        };
        let ack_request = match fields.get("i") {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(id.clone()),
            Some(_) => return Err(WireError::AckId),
        };

        Ok(Packet {
            topic,
            name,
            payload,
            route,
            ack_request,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_skips_empty_fields() {
        let packet = Packet {
            name: "status".to_string(),
            ..Default::default()
        };
        assert_eq!(packet.encode().unwrap(), r#"{"m":"status"}"#);

        let ack = Packet {
            topic: Some("42".to_string()),
            ..Default::default()
        };
        assert_eq!(ack.encode().unwrap(), r#"{"t":"42"}"#);
    }

    #[test]
    fn test_encode_full_packet() {
        let packet = Packet {
            topic: None,
            name: "add".to_string(),
            payload: json!({"a": 1, "b": 2}),
            route: Some(RouteId::Numeric(7)),
            ack_request: None,
        };
        let text = packet.encode().unwrap();
        assert_eq!(text, r#"{"m":"add","d":{"a":1,"b":2},"r":7}"#);
    }

    #[test]
    fn test_decode_message() {
        let packet = Packet::decode(r#"{"m":"hello","d":[1,2,3]}"#).unwrap();
        assert_eq!(packet.name, "hello");
        assert_eq!(packet.payload, json!([1, 2, 3]));
        assert!(packet.topic.is_none());
        assert!(packet.route.is_none());
    }

    #[test]
    fn test_decode_missing_payload_is_null() {
        let packet = Packet::decode(r#"{"m":"ping"}"#).unwrap();
        assert_eq!(packet.payload, Value::Null);
    }

    #[test]
    fn test_decode_route_types() {
        let numeric = Packet::decode(r#"{"m":"x","r":12}"#).unwrap();
        assert_eq!(numeric.route, Some(RouteId::Numeric(12)));

        let opaque = Packet::decode(r#"{"m":"x","r":"abc123"}"#).unwrap();
        assert_eq!(opaque.route, Some(RouteId::Opaque("abc123".to_string())));
    }

    #[test]
    fn test_decode_rejects_bad_route() {
        assert_eq!(
            Packet::decode(r#"{"m":"x","r":true}"#).unwrap_err(),
            WireError::Route
        );
        assert_eq!(
            Packet::decode(r#"{"m":"x","r":1.5}"#).unwrap_err(),
            WireError::RouteRange
        );
        assert_eq!(
            Packet::decode(r#"{"m":"x","r":-3}"#).unwrap_err(),
            WireError::RouteRange
        );
    }

    #[test]
    fn test_decode_route_range_boundary() {
        let text = format!(r#"{{"m":"x","r":{}}}"#, MAX_ROUTE_ID);
        let packet = Packet::decode(&text).unwrap();
        assert_eq!(packet.route, Some(RouteId::Numeric(MAX_ROUTE_ID)));

        let text = format!(r#"{{"m":"x","r":{}}}"#, MAX_ROUTE_ID + 1);
        assert_eq!(Packet::decode(&text).unwrap_err(), WireError::RouteRange);
    }

    #[test]
    fn test_decode_rejects_non_object() {
        assert_eq!(Packet::decode("[1,2]").unwrap_err(), WireError::NotObject);
        assert_eq!(Packet::decode("\"hi\"").unwrap_err(), WireError::NotObject);
        assert!(matches!(
            Packet::decode("not json").unwrap_err(),
            WireError::Json(_)
        ));
    }

    #[test]
    fn test_decode_rejects_bad_field_types() {
        assert_eq!(
            Packet::decode(r#"{"t":5,"m":"x"}"#).unwrap_err(),
            WireError::Topic
        );
        assert_eq!(Packet::decode(r#"{"m":9}"#).unwrap_err(), WireError::Name);
        assert_eq!(
            Packet::decode(r#"{"m":"x","i":7}"#).unwrap_err(),
            WireError::AckId
        );
    }

    #[test]
    fn test_roundtrip() {
        let packet = Packet {
            topic: None,
            name: "echo".to_string(),
            payload: json!({"nested": {"deep": [null, true]}}),
            route: Some(RouteId::Opaque("id-1".to_string())),
            ack_request: Some("9".to_string()),
        };
        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded, packet);
    }
}
