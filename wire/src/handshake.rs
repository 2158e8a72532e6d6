//! Handshake parameter codec.
//!
//! Connection parameters travel as an opaque header string: the list is
//! `$`-joined and base58-encoded by the initiator, decoded and split by the
//! acceptor. The engine never interprets the parameters themselves.

use crate::error::WireError;

/// Delimiter between parameters inside the encoded header.
const PARAM_DELIMITER: char = '$';

/// Encode a parameter list into the handshake header string.
///
/// An empty list encodes to an empty header.
pub fn encode_params(params: &[String]) -> String {
    if params.is_empty() {
        return String::new();
    }
    let joined = params.join(&PARAM_DELIMITER.to_string());
    bs58::encode(joined.as_bytes()).into_string()
}

/// Decode a handshake header back into the parameter list.
pub fn decode_params(header: &str) -> Result<Vec<String>, WireError> {
    if header.is_empty() {
        return Ok(Vec::new());
    }
    let bytes = bs58::decode(header)
        .into_vec()
        .map_err(|_| WireError::Handshake)?;
    let joined = String::from_utf8(bytes).map_err(|_| WireError::Handshake)?;
    Ok(joined
        .split(PARAM_DELIMITER)
        .map(str::to_owned)
        .collect())
}
