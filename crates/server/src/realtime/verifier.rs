//! Bearer-token verification.
//!
//! Access tokens are HS256 JWTs with `sub` = identity id. Issuing tokens is
//! the job of the account service; [`JwtVerifier::issue`] only exists so
//! development setups and tests can mint one.

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub identity_id: String,
    pub expiry: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("token expired")]
    Expired,
    #[error("token rejected: {0}")]
    Invalid(String),
}

pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<VerifiedIdentity, VerifyError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

pub struct JwtVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Mint a token for `identity_id` valid for `ttl` (negative for an
    /// already-expired one).
    pub fn issue(&self, identity_id: &str, ttl: Duration) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let claims = Claims {
            sub: identity_id.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        jsonwebtoken::encode(&Header::default(), &claims, &self.encoding)
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<VerifiedIdentity, VerifyError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => VerifyError::Expired,
                _ => VerifyError::Invalid(e.to_string()),
            }
        })?;

        if data.claims.sub.is_empty() {
            return Err(VerifyError::Invalid("empty subject".to_string()));
        }
        let expiry = Utc
            .timestamp_opt(data.claims.exp, 0)
            .single()
            .ok_or_else(|| VerifyError::Invalid("exp out of range".to_string()))?;

        Ok(VerifiedIdentity {
            identity_id: data.claims.sub,
            expiry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_verify() {
        let verifier = JwtVerifier::new(b"test-secret");
        let token = verifier.issue("alice", Duration::hours(1)).unwrap();
        let verified = verifier.verify(&token).unwrap();
        assert_eq!(verified.identity_id, "alice");
        assert!(verified.expiry > Utc::now());
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let verifier = JwtVerifier::new(b"test-secret");
        let token = verifier.issue("alice", Duration::minutes(-5)).unwrap();
        assert_eq!(verifier.verify(&token), Err(VerifyError::Expired));
    }

    #[test]
    fn tokens_from_another_secret_are_rejected() {
        let ours = JwtVerifier::new(b"test-secret");
        let theirs = JwtVerifier::new(b"other-secret");
        let token = theirs.issue("alice", Duration::hours(1)).unwrap();
        assert!(matches!(ours.verify(&token), Err(VerifyError::Invalid(_))));
        assert!(matches!(ours.verify("not-a-jwt"), Err(VerifyError::Invalid(_))));
    }
}
