//! Close-code space shared by the channel and the retry policy layer.

use std::fmt;

/// Named close codes with reserved protocol meanings.
///
/// The numeric space mirrors the standard socket close codes so peers on
/// other stacks interoperate; codes without a reserved meaning round-trip
/// through [`CloseCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000: normal closure.
    Normal,
    /// 1001: endpoint going away.
    GoingAway,
    /// 1002: protocol error.
    ProtocolError,
    /// 1003: unsupported data.
    UnsupportedData,
    /// 1005: no status code present.
    NoStatus,
    /// 1006: abnormal closure, no close frame received.
    Abnormal,
    /// 1007: invalid payload data.
    InvalidData,
    /// 1008: policy violation; used for authentication rejection.
    PolicyViolation,
    /// 1009: message too large.
    MessageTooLarge,
    /// 1011: unexpected server error.
    InternalError,
    /// Any other code, including the caller-defined range at 3000+.
    Other(u16),
}

impl CloseCode {
    /// Map a raw close code.
    pub fn from_u16(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::UnsupportedData,
            1005 => CloseCode::NoStatus,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::InvalidData,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageTooLarge,
            1011 => CloseCode::InternalError,
            other => CloseCode::Other(other),
        }
    }

    /// The raw close code.
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::UnsupportedData => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidData => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooLarge => 1009,
            CloseCode::InternalError => 1011,
            CloseCode::Other(code) => code,
        }
    }

    fn label(self) -> &'static str {
        match self {
            CloseCode::Normal => "normal closure",
            CloseCode::GoingAway => "going away",
            CloseCode::ProtocolError => "protocol error",
            CloseCode::UnsupportedData => "unsupported data",
            CloseCode::NoStatus => "no status",
            CloseCode::Abnormal => "abnormal closure",
            CloseCode::InvalidData => "invalid data",
            CloseCode::PolicyViolation => "policy violation",
            CloseCode::MessageTooLarge => "message too large",
            CloseCode::InternalError => "internal error",
            CloseCode::Other(_) => "unreserved",
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_u16(), self.label())
    }
}
