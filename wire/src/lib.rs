//! Wire packet model, tagged classification, close codes, and channel
//! framing for the tether session protocol.
//!
//! This crate is the pure, stateless half of the protocol: everything here
//! is a function of bytes in and bytes out, with no timers or connection
//! state.
//!
//! ## Packet Format
//!
//! A packet is one JSON object with fixed single-letter field names:
//!
//! ```text
//! { "t"?: "hb" | "hbr" | "ns" | <ack-id>,
//!   "m":  <message name>,
//!   "d":  <payload>,
//!   "r"?: <number | string>,
//!   "i"?: <ack-request-id> }
//! ```
//!
//! The JSON type of `r` discriminates direction: numbers are minted by the
//! connection initiator, strings by the acceptor. [`codec::classify`] turns
//! a decoded [`Packet`] into a tagged [`Inbound`] variant exactly once;
//! nothing downstream re-inspects JSON shape.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod close;
pub mod codec;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod packet;
pub mod settings;

// Re-export main types
pub use close::CloseCode;
pub use codec::{
    acknowledgement, classify, decode_inbound, heartbeat, heartbeat_request, negotiate_reply,
    negotiate_request, Inbound, PacketBuilder, Role,
};
pub use error::WireError;
pub use framing::{ChannelFrame, FrameDecoder, FrameTag, DEFAULT_MAX_FRAME_SIZE};
pub use handshake::{decode_params, encode_params};
pub use packet::{
    Packet, RouteId, MAX_ROUTE_ID, TAG_HEARTBEAT, TAG_HEARTBEAT_REQUEST, TAG_NEGOTIATE,
};
pub use settings::{
    HeartbeatMode, NegotiateBody, NegotiateReply, NegotiateRequest, SupportedRanges,
};
