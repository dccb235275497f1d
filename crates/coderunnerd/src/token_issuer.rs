//! Token Issuer.
//!
//! Issues and verifies bearer tokens over the `coderunner-core::token` wire
//! codec: `<base64url-claims>.<base64url-hmac-sha256-signature>`. The
//! signing key lives only here; the wire module handles the claims
//! structure and base64 framing that both the daemon and the CLI need.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use coderunner_core::token::{self, Claims, TokenFormatError};
use coderunner_core::Principal;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(#[from] TokenFormatError),
    #[error("signature verification failed")]
    BadSignature,
    #[error("token has expired")]
    Expired,
    #[error("signing key is misconfigured")]
    BadKey,
}

pub type Result<T> = std::result::Result<T, TokenError>;

pub struct TokenIssuer {
    signing_key: Vec<u8>,
    ttl: chrono::Duration,
}

impl TokenIssuer {
    pub fn new(signing_key: &str, ttl_sec: u32) -> Self {
        Self {
            signing_key: signing_key.as_bytes().to_vec(),
            ttl: chrono::Duration::seconds(i64::from(ttl_sec)),
        }
    }

    /// `issue(principal) -> token`. `iat`/`exp` are stamped
    /// from wall-clock time at issuance.
    pub fn issue(&self, principal: &Principal) -> Result<(String, DateTime<Utc>)> {
        let now = Utc::now();
        let expires = now + self.ttl;
        let claims = Claims {
            sub: principal.0.clone(),
            iat: now.timestamp(),
            exp: expires.timestamp(),
        };
        let payload_b64 = token::encode_payload(&claims);
        let signature_b64 = self.sign(&payload_b64)?;
        Ok((token::assemble(&payload_b64, &signature_b64), expires))
    }

    /// `verify(token) -> Principal | ErrAuth`. Checks the
    /// signature in constant time before trusting `exp`, and rejects an
    /// expired token even if the signature is valid.
    pub fn verify(&self, token: &str) -> Result<Principal> {
        let (payload_b64, signature_b64) = token::split_token(token)?;
        let expected = self.sign(payload_b64)?;
        if !constant_time_eq(signature_b64.as_bytes(), expected.as_bytes()) {
            return Err(TokenError::BadSignature);
        }
        let claims = token::decode_payload(payload_b64)?;
        if Utc::now().timestamp() > claims.exp {
            return Err(TokenError::Expired);
        }
        Ok(Principal(claims.sub))
    }

    fn sign(&self, payload_b64: &str) -> Result<String> {
        let mut mac =
            HmacSha256::new_from_slice(&self.signing_key).map_err(|_| TokenError::BadKey)?;
        mac.update(payload_b64.as_bytes());
        let signature = mac.finalize().into_bytes();
        Ok(URL_SAFE_NO_PAD.encode(signature))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_then_verify_round_trips_principal() {
        let issuer = TokenIssuer::new("s3cret-signing-key", 3600);
        let principal = Principal("alice".to_string());
        let (token, _expires) = issuer.issue(&principal).unwrap();
        let verified = issuer.verify(&token).unwrap();
        assert_eq!(verified, principal);
    }

    #[test]
    fn verify_rejects_tampered_signature() {
        let issuer = TokenIssuer::new("s3cret-signing-key", 3600);
        let (token, _) = issuer.issue(&Principal("alice".to_string())).unwrap();
        let (payload, _sig) = token::split_token(&token).unwrap();
        let tampered = format!("{payload}.not-a-real-signature");
        assert!(matches!(issuer.verify(&tampered), Err(TokenError::BadSignature)));
    }

    #[test]
    fn verify_rejects_token_signed_by_a_different_key() {
        let issuer_a = TokenIssuer::new("key-a", 3600);
        let issuer_b = TokenIssuer::new("key-b", 3600);
        let (token, _) = issuer_a.issue(&Principal("alice".to_string())).unwrap();
        assert!(matches!(issuer_b.verify(&token), Err(TokenError::BadSignature)));
    }

    #[test]
    fn verify_rejects_expired_token() {
        let issuer = TokenIssuer::new("s3cret-signing-key", 0);
        let (token, _) = issuer.issue(&Principal("alice".to_string())).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(matches!(issuer.verify(&token), Err(TokenError::Expired)));
    }
}
