//! JWT client assertions for the `private_key_jwt` method (RFC 7523).
//!
//! The assertion authenticates the client at the token endpoint:
//!
//! - `iss` and `sub`: the client_id
//! - `aud`: the token endpoint URL
//! - `exp`: at most five minutes in the future
//! - `jti`: unique per assertion, so the server can detect replays

use std::time::Duration;

use jsonwebtoken::Header;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::key::ClientKey;
use crate::BulkResult;
use crate::error::BulkError;

/// `client_assertion_type` sent alongside the assertion.
pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Claims of a client assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAssertionClaims {
    /// Issuer - the client_id.
    pub iss: String,

    /// Subject - the client_id.
    pub sub: String,

    /// Audience - the token endpoint URL.
    pub aud: String,

    /// Expiration time as Unix timestamp.
    pub exp: i64,

    /// Issued at time as Unix timestamp.
    pub iat: i64,

    /// JWT ID, unique per assertion.
    pub jti: String,
}

impl ClientAssertionClaims {
    /// Builds fresh claims valid for `lifetime` from now.
    #[must_use]
    pub fn new(client_id: &str, token_endpoint: &str, lifetime: Duration) -> Self {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let lifetime = i64::try_from(lifetime.as_secs()).unwrap_or(i64::MAX);
        Self {
            iss: client_id.to_string(),
            sub: client_id.to_string(),
            aud: token_endpoint.to_string(),
            exp: now.saturating_add(lifetime),
            iat: now,
            jti: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Signs the claims with the client key.
    ///
    /// # Errors
    ///
    /// Returns [`BulkError::Grant`] if signing fails.
    pub fn sign(&self, key: &ClientKey, kid: Option<&str>) -> BulkResult<String> {
        let mut header = Header::new(key.algorithm());
        header.typ = Some("JWT".to_string());
        header.kid = kid.map(str::to_string);

        jsonwebtoken::encode(&header, self, key.encoding_key())
            .map_err(|e| BulkError::grant(format!("failed to sign client assertion: {e}")))
    }
}
