//! Packet classification and outbound construction.
//!
//! Inbound text is decoded once into a tagged [`Inbound`] variant so the
//! session layer never re-inspects raw JSON shape. Classification is a pure
//! function of the `route` field's JSON type and the `topic` tag, evaluated
//! per [`Role`]: a numeric route id always belongs to the initiator's id
//! space, a string route id to the acceptor's, which makes the same id
//! a request on one side and a response on the other.

use serde_json::Value;

use crate::error::WireError;
use crate::packet::{
    Packet, RouteId, TAG_HEARTBEAT, TAG_HEARTBEAT_REQUEST, TAG_NEGOTIATE,
};
use crate::settings::{NegotiateBody, NegotiateReply, NegotiateRequest};

/// Which end of the connection this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The side that opened the connection.
    Initiator,
    /// The side that accepted the connection.
    Acceptor,
}

/// A classified inbound packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Fire-and-forget message, possibly requesting an acknowledgement.
    Message {
        /// Handler routing key.
        name: String,
        /// Opaque payload.
        payload: Value,
        /// Ack id to echo back after delivery, when present.
        ack_request: Option<String>,
    },
    /// A request from the peer awaiting a response on the same id.
    Request {
        /// Correlation id minted by the peer.
        id: RouteId,
        /// Handler routing key.
        name: String,
        /// Opaque payload.
        payload: Value,
    },
    /// The peer's response to a request this side sent.
    Response {
        /// Correlation id this side minted.
        id: RouteId,
        /// Response payload.
        payload: Value,
        /// Ack id to echo back, when the response requests one.
        ack_request: Option<String>,
    },
    /// Bare liveness signal.
    Heartbeat,
    /// Liveness probe expecting a heartbeat back.
    HeartbeatRequest,
    /// Settings negotiation request or reply.
    Negotiate(NegotiateBody),
    /// Confirmation of a message/response that requested acknowledgement.
    Acknowledgement {
        /// The ack-request id being confirmed.
        id: String,
    },
}

/// Classify a decoded packet for the given role.
pub fn classify(packet: Packet, role: Role) -> Result<Inbound, WireError> {
    let Packet {
        topic,
        name,
        payload,
        route,
        ack_request,
    } = packet;

    if let Some(id) = route {
        let own_id = matches!(
            (&id, role),
            (RouteId::Numeric(_), Role::Initiator) | (RouteId::Opaque(_), Role::Acceptor)
        );
        return Ok(if own_id {
            Inbound::Response {
                id,
                payload,
                ack_request,
            }
        } else {
            Inbound::Request { id, name, payload }
        });
    }

    Ok(match topic.as_deref() {
        Some(TAG_HEARTBEAT) => Inbound::Heartbeat,
        Some(TAG_HEARTBEAT_REQUEST) => Inbound::HeartbeatRequest,
        Some(TAG_NEGOTIATE) => Inbound::Negotiate(NegotiateBody::parse(&payload)?),
        Some(id) => Inbound::Acknowledgement { id: id.to_string() },
        None => Inbound::Message {
            name,
            payload,
            ack_request,
        },
    })
}

/// Decode packet text and classify it in one step.
pub fn decode_inbound(text: &str, role: Role) -> Result<Inbound, WireError> {
    classify(Packet::decode(text)?, role)
}

/// Fluent constructor for outbound packets.
pub struct PacketBuilder {
    packet: Packet,
}

impl PacketBuilder {
    /// Start a plain message packet.
    pub fn message(name: impl Into<String>) -> Self {
        Self {
            packet: Packet {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    /// Start a request packet on the given correlation id.
    pub fn request(name: impl Into<String>, id: RouteId) -> Self {
        Self {
            packet: Packet {
                name: name.into(),
                route: Some(id),
                ..Default::default()
            },
        }
    }

    /// Start a response packet; the name echoes the request's.
    pub fn response(name: impl Into<String>, id: RouteId) -> Self {
        Self::request(name, id)
    }

    /// Attach a payload.
    pub fn payload(mut self, payload: Value) -> Self {
        self.packet.payload = payload;
        self
    }

    /// Ask the peer to acknowledge under the given id.
    pub fn ack_request(mut self, id: impl Into<String>) -> Self {
        self.packet.ack_request = Some(id.into());
        self
    }

    /// Finish the packet.
    pub fn build(self) -> Packet {
        self.packet
    }
}

/// Build a bare heartbeat packet.
pub fn heartbeat() -> Packet {
    Packet {
        topic: Some(TAG_HEARTBEAT.to_string()),
        ..Default::default()
    }
}

/// Build a heartbeat request packet.
pub fn heartbeat_request() -> Packet {
    Packet {
        topic: Some(TAG_HEARTBEAT_REQUEST.to_string()),
        ..Default::default()
    }
}

/// Build an acknowledgement for the given ack-request id.
pub fn acknowledgement(id: impl Into<String>) -> Packet {
    Packet {
        topic: Some(id.into()),
        ..Default::default()
    }
}

/// Build a settings-change request packet.
pub fn negotiate_request(body: &NegotiateRequest) -> Result<Packet, WireError> {
    Ok(Packet {
        topic: Some(TAG_NEGOTIATE.to_string()),
        payload: serde_json::to_value(body)?,
        ..Default::default()
    })
}

/// Build a negotiation reply packet.
pub fn negotiate_reply(body: &NegotiateReply) -> Result<Packet, WireError> {
    Ok(Packet {
        topic: Some(TAG_NEGOTIATE.to_string()),
        payload: serde_json::to_value(body)?,
        ..Default::default()
    })
}
