//! Session error taxonomy.

use thiserror::Error;

use tether_wire::{CloseCode, WireError};

/// Errors surfaced by session operations and lifecycle events
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The peer sent something that failed packet decode; fatal for the
    /// connection carrying it
    #[error("malformed packet: {0}")]
    Malformed(#[from] WireError),

    /// No response, acknowledgement, or negotiation reply arrived within
    /// the deadline
    #[error("timed out")]
    Timeout,

    /// The connection closed while the operation was pending
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer closed the connection with the policy-violation code
    #[error("authentication rejected")]
    AuthenticationRejected,

    /// The peer closed with a code that rules out reconnecting
    #[error("connection terminated: {0}")]
    Terminated(CloseCode),

    /// Transport-level failure
    #[error("channel error: {0}")]
    Channel(String),
}
