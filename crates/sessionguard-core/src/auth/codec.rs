//! Offline decoding of JWT-shaped access tokens.
//!
//! Only the payload is read. Signatures are the resource server's business;
//! the client just needs to know who the token is for and when it runs out.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SessionError;

/// Claims read from an access token's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedClaims {
    pub subject: String,
    pub role: Option<String>,
    /// Expiry as Unix epoch seconds (`exp` claim)
    pub expires_at: i64,
}

/// The user view of a session, persisted next to the credential pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserClaims {
    pub subject: String,
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: String,
    exp: i64,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
}

impl DecodedClaims {
    pub fn user(&self) -> UserClaims {
        UserClaims {
            subject: self.subject.clone(),
            role: self.role.clone(),
        }
    }

    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expires_at, 0)
    }

    /// Seconds left before expiry, negative once expired
    pub fn seconds_until_expiry(&self) -> i64 {
        self.expires_at - Utc::now().timestamp()
    }
}

pub struct TokenCodec;

impl TokenCodec {
    /// Decode a token's claims without touching the network.
    pub fn decode(token: &str) -> Result<DecodedClaims, SessionError> {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(SessionError::MalformedToken(format!(
                "expected 3 segments, found {}",
                parts.len()
            )));
        }

        let payload = URL_SAFE_NO_PAD
            .decode(parts[1].trim_end_matches('='))
            .map_err(|e| SessionError::MalformedToken(format!("payload is not base64url: {}", e)))?;

        let raw: RawClaims = serde_json::from_slice(&payload)
            .map_err(|e| SessionError::MalformedToken(format!("payload is not valid claims: {}", e)))?;

        let role = raw.role.or_else(|| raw.roles.into_iter().next());

        Ok(DecodedClaims {
            subject: raw.sub,
            role,
            expires_at: raw.exp,
        })
    }

    /// True once `now >= expires_at - skew_seconds`.
    pub fn is_expired(claims: &DecodedClaims, skew_seconds: i64) -> bool {
        Self::is_expired_at(claims, skew_seconds, Utc::now().timestamp())
    }

    pub fn is_expired_at(claims: &DecodedClaims, skew_seconds: i64, now: i64) -> bool {
        now >= claims.expires_at.saturating_sub(skew_seconds)
    }

    /// Decode and check in one step. Tokens that cannot be decoded count as expired.
    pub fn token_expired(token: &str, skew_seconds: i64) -> bool {
        match Self::decode(token) {
            Ok(claims) => Self::is_expired(&claims, skew_seconds),
            Err(_) => true,
        }
    }
}
