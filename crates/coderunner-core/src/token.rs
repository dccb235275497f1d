//! Token claims and wire codec shared between the daemon (which holds the
//! signing key and does the actual HMAC signing) and the CLI client (which
//! only needs to read `exp`/`username` back out of a token it already has).
//!
//! The signing key itself never lives in this crate - see
//! `coderunnerd::token_issuer` for the keyed half of token issuance.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `{ sub, iat, exp }` token claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenFormatError {
    #[error("token is not in <payload>.<signature> form")]
    MalformedStructure,
    #[error("token payload is not valid base64")]
    BadBase64,
    #[error("token payload is not valid JSON claims")]
    BadClaims,
}

/// Base64url-encode the claims payload (the part the signature covers).
pub fn encode_payload(claims: &Claims) -> String {
    let json = serde_json::to_vec(claims).expect("Claims always serializes");
    URL_SAFE_NO_PAD.encode(json)
}

/// Split a `<payload>.<signature>` token into its two base64url segments.
pub fn split_token(token: &str) -> Result<(&str, &str), TokenFormatError> {
    token
        .split_once('.')
        .filter(|(_, sig)| !sig.is_empty())
        .ok_or(TokenFormatError::MalformedStructure)
}

/// Decode and parse the claims segment of a token, without checking the
/// signature. Used by the CLI to read back `username`/`exp` for display;
/// the daemon must additionally verify the signature before trusting this.
pub fn decode_payload(payload_b64: &str) -> Result<Claims, TokenFormatError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| TokenFormatError::BadBase64)?;
    serde_json::from_slice(&bytes).map_err(|_| TokenFormatError::BadClaims)
}

/// Assemble the final `<payload>.<signature>` wire token.
pub fn assemble(payload_b64: &str, signature_b64: &str) -> String {
    format!("{payload_b64}.{signature_b64}")
}
