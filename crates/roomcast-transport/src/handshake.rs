//! WebSocket opening handshake validation.
//!
//! The HTTP layer owns the request and the upgrade itself. This module only
//! checks the headers and computes `Sec-WebSocket-Accept`.

use crate::error::HandshakeError;
use axum::http::{header, HeaderMap, HeaderName, Method};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

/// The only protocol version accepted.
pub const WEBSOCKET_VERSION: &str = "13";

/// Validate an upgrade request and return the `Sec-WebSocket-Accept` value.
///
/// # Errors
///
/// Returns the first [`HandshakeError`] found. No state is created on error.
pub fn accept_key(method: &Method, headers: &HeaderMap) -> Result<String, HandshakeError> {
    if method != Method::GET {
        return Err(HandshakeError::MethodNotAllowed);
    }
    if !has_token(headers, &header::UPGRADE, "websocket") {
        return Err(HandshakeError::MissingUpgrade);
    }
    if !has_token(headers, &header::CONNECTION, "upgrade") {
        return Err(HandshakeError::MissingConnectionUpgrade);
    }

    let version = headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .map(|value| value.as_bytes());
    if version != Some(WEBSOCKET_VERSION.as_bytes()) {
        return Err(HandshakeError::UnsupportedVersion);
    }

    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or(HandshakeError::InvalidKey)?;
    if !is_valid_key(key.as_bytes()) {
        return Err(HandshakeError::InvalidKey);
    }

    Ok(derive_accept_key(key.as_bytes()))
}

/// Check a comma-separated header for a token, ignoring case.
fn has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// A key is 16 random bytes in base64: 22 significant characters plus `==`.
fn is_valid_key(key: &[u8]) -> bool {
    key.len() == 24
        && key.ends_with(b"==")
        && key[..22]
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'+' || *b == b'/')
}
