//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Packet text is not valid JSON
    #[error("invalid packet json: {0}")]
    Json(String),

    /// Packet is not a JSON object
    #[error("packet is not an object")]
    NotObject,

    /// Route id has a JSON type other than number or string
    #[error("invalid route id type")]
    Route,

    /// Numeric route id is fractional, negative, or beyond the id space
    #[error("numeric route id out of range")]
    RouteRange,

    /// Control tag or ack id is not a string
    #[error("invalid topic tag")]
    Topic,

    /// Message name is not a string
    #[error("invalid message name")]
    Name,

    /// Ack request id is not a string
    #[error("invalid ack request id")]
    AckId,

    /// Negotiation body does not match the request or reply shape
    #[error("malformed negotiation body")]
    Negotiation,

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Unknown channel frame tag
    #[error("unknown frame tag {0}")]
    Tag(u8),

    /// Frame payload shorter than its fixed fields
    #[error("truncated frame")]
    Truncated,

    /// Frame payload is not valid UTF-8 where text is required
    #[error("frame text not utf-8")]
    Utf8,

    /// Handshake header is not valid base58
    #[error("invalid handshake header")]
    Handshake,
}

impl From<serde_json::Error> for WireError {
    fn from(err: serde_json::Error) -> Self {
        WireError::Json(err.to_string())
    }
}
