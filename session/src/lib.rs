//! Session engine for the tether protocol: bidirectional messaging,
//! request/response, heartbeat liveness, settings negotiation, and
//! reconnect over a persistent duplex channel.
//!
//! The protocol is symmetric once a connection is up: either side can
//! send fire-and-forget messages, acknowledged messages, and requests
//! that resolve with a response. The two roles differ only in lifecycle:
//! a [`Session`] initiates the connection and reconnects with backoff
//! when it is lost, while a [`Server`] accepts connections and exposes
//! each one as a [`Peer`] until it goes away.
//!
//! Packet encoding, close codes, and channel framing live in
//! `tether-wire`; this crate adds the stateful half: transaction
//! tracking, timers, the reconnect controller, and the TCP transport.
//!
//! ```no_run
//! use serde_json::json;
//! use tether_session::{ConnectOptions, Server, ServerOptions, Session};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (server, _lifecycle) =
//!         Server::<()>::bind("127.0.0.1:4600".parse()?, ServerOptions::default()).await?;
//!     server.on_request("sum", |_peer, payload, responder| {
//!         let total: i64 = payload
//!             .as_array()
//!             .map(|items| items.iter().filter_map(serde_json::Value::as_i64).sum())
//!             .unwrap_or(0);
//!         responder.respond(json!(total));
//!     });
//!
//!     let (session, _events) = Session::connect(server.local_addr(), ConnectOptions::default());
//!     let total = session.request("sum", json!([1, 2, 3])).await?;
//!     assert_eq!(total, json!(6));
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod channel;
pub mod client;
pub mod endpoint;
pub mod error;
pub mod heartbeat;
pub mod negotiate;
pub mod policy;
pub mod server;
pub mod transaction;
pub mod transport;

// Re-export main types
pub use backoff::{Backoff, RetryOptions};
pub use channel::{memory_pair, Channel, ChannelEvent, ChannelSender};
pub use client::{ConnectOptions, MessageHandler, RequestHandler, Session, SessionEvent};
pub use endpoint::{EndpointState, Responder};
pub use error::SessionError;
pub use heartbeat::TimeoutMultiplier;
pub use negotiate::{NegotiationOutcome, SettingsChange, SupportedOptions};
pub use policy::{classify_close, Disposition};
pub use server::{
    Peer, PeerId, PeerMessageHandler, PeerRequestHandler, Server, ServerEvent, ServerOptions,
};
pub use tether_wire::{CloseCode, HeartbeatMode};
