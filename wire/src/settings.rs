//! Heartbeat modes and settings-negotiation bodies.
//!
//! Negotiation payloads ride in a packet's `d` field under the `ns` topic
//! tag. Intervals are seconds as JSON numbers (fractional allowed) so both
//! directions of the exchange stay language-neutral.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WireError;

/// Which side originates liveness traffic on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatMode {
    /// This side periodically sends a bare heartbeat; no reply expected.
    Upstream,
    /// The peer is expected to send heartbeats; no local polling.
    Downstream,
    /// This side periodically sends a heartbeat request and counts any
    /// traffic as liveness.
    Roundtrip,
    /// No liveness tracking at all.
    Disabled,
}

/// Body of a settings-change request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiateRequest {
    /// Transaction id minted by the requester.
    pub id: String,
    /// Desired heartbeat mode, if the requester wants it changed.
    #[serde(
        rename = "heartbeatMode",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub heartbeat_mode: Option<HeartbeatMode>,
    /// Desired heartbeat interval in seconds.
    #[serde(
        rename = "heartbeatInterval",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub heartbeat_interval: Option<f64>,
}

/// Body of the peer's accept/reject reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiateReply {
    /// Transaction id echoed from the request.
    pub id: String,
    /// Whether the requested change was applied.
    pub approve: bool,
    /// What the replier supports, advertised on every reply.
    #[serde(
        rename = "supportedOptions",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub supported: Option<SupportedRanges>,
}

/// Advertised negotiation limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportedRanges {
    /// Heartbeat modes the replier will accept.
    #[serde(rename = "heartbeatModes")]
    pub heartbeat_modes: Vec<HeartbeatMode>,
    /// Smallest acceptable interval in seconds.
    #[serde(rename = "minHeartbeatInterval")]
    pub min_heartbeat_interval: f64,
    /// Largest acceptable interval in seconds.
    #[serde(rename = "maxHeartbeatInterval")]
    pub max_heartbeat_interval: f64,
}

/// A parsed negotiation body: the request or the reply side of the exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiateBody {
    /// A settings-change request from the peer.
    Request(NegotiateRequest),
    /// The peer's decision on a change this side requested.
    Reply(NegotiateReply),
}

impl NegotiateBody {
    /// Parse the `d` payload of an `ns`-tagged packet.
    ///
    /// A reply is recognized by its `approve` field; anything else with an
    /// `id` is a request. The reply shape is tried first since a reply also
    /// satisfies the request shape.
    pub fn parse(payload: &Value) -> Result<NegotiateBody, WireError> {
        let Value::Object(fields) = payload else {
            return Err(WireError::Negotiation);
        };
        if fields.contains_key("approve") {
            let reply: NegotiateReply =
                serde_json::from_value(payload.clone()).map_err(|_| WireError::Negotiation)?;
            return Ok(NegotiateBody::Reply(reply));
        }
        let request: NegotiateRequest =
            serde_json::from_value(payload.clone()).map_err(|_| WireError::Negotiation)?;
        Ok(NegotiateBody::Request(request))
    }
}
