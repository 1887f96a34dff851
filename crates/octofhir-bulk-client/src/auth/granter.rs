//! Client-credentials grant with `private_key_jwt` client authentication.
//!
//! [`CredentialGranter::grant`] performs a full token request on every
//! call. Tokens are not cached: each kickoff, status check and deletion
//! re-authenticates.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::assertion::{CLIENT_ASSERTION_TYPE, ClientAssertionClaims};
use super::key::{ClientKey, algorithm_name};
use crate::BulkResult;
use crate::config::AuthConfig;
use crate::error::BulkError;
use crate::observability::{HttpObserver, execute};
use crate::status::HttpStatus;

/// Client authentication method used at the token endpoint.
pub const PRIVATE_KEY_JWT: &str = "private_key_jwt";

/// Authorization server description for a bare token endpoint.
///
/// Backend services clients are configured with a token URL only; the
/// issuer is that URL and the supported methods are the SMART defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEndpointMetadata {
    pub issuer: String,
    pub token_endpoint: String,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub token_endpoint_auth_signing_alg_values_supported: Vec<String>,
}

impl TokenEndpointMetadata {
    /// Metadata for a token endpoint that accepts RS384 and ES384 assertions.
    #[must_use]
    pub fn for_token_url(token_url: &str) -> Self {
        Self {
            issuer: token_url.to_string(),
            token_endpoint: token_url.to_string(),
            token_endpoint_auth_methods_supported: vec![PRIVATE_KEY_JWT.to_string()],
            token_endpoint_auth_signing_alg_values_supported: vec![
                "RS384".to_string(),
                "ES384".to_string(),
            ],
        }
    }

    /// Returns `true` if the endpoint advertises the signing algorithm.
    #[must_use]
    pub fn supports_signing_alg(&self, alg: &str) -> bool {
        self.token_endpoint_auth_signing_alg_values_supported
            .iter()
            .any(|a| a == alg)
    }
}

/// An access token issued by the token endpoint.
#[derive(Clone, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Obtains access tokens through the client-credentials grant.
pub struct CredentialGranter {
    http: reqwest::Client,
    metadata: TokenEndpointMetadata,
    client_id: String,
    key: ClientKey,
    key_id: Option<String>,
    scope: Option<String>,
    assertion_lifetime: Duration,
    observer: Arc<dyn HttpObserver>,
}

impl fmt::Debug for CredentialGranter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialGranter")
            .field("token_endpoint", &self.metadata.token_endpoint)
            .field("client_id", &self.client_id)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl CredentialGranter {
    /// Builds a granter from auth configuration.
    ///
    /// Returns `Ok(None)` when no token endpoint is configured.
    ///
    /// # Errors
    ///
    /// Returns [`BulkError::InvalidKey`] if the private key is unsupported,
    /// or [`BulkError::Configuration`] if it cannot be loaded.
    pub fn from_config(
        config: &AuthConfig,
        http: reqwest::Client,
        observer: Arc<dyn HttpObserver>,
    ) -> BulkResult<Option<Self>> {
        let Some(token_url) = config.token_endpoint() else {
            return Ok(None);
        };
        let pem = config.private_key()?;
        let key = ClientKey::from_pem(&pem, config.algorithm.as_deref())?;

        let mut granter = Self::new(
            http,
            TokenEndpointMetadata::for_token_url(token_url),
            config.client_id.clone(),
            key,
            observer,
        )?;
        granter.key_id = config.key_id.clone();
        granter.scope = config.scope.clone();
        granter.assertion_lifetime = config.assertion_lifetime;
        Ok(Some(granter))
    }

    /// Creates a granter for a token endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`BulkError::Configuration`] if the endpoint does not accept
    /// `private_key_jwt` authentication.
    pub fn new(
        http: reqwest::Client,
        metadata: TokenEndpointMetadata,
        client_id: impl Into<String>,
        key: ClientKey,
        observer: Arc<dyn HttpObserver>,
    ) -> BulkResult<Self> {
        if !metadata
            .token_endpoint_auth_methods_supported
            .iter()
            .any(|m| m == PRIVATE_KEY_JWT)
        {
            return Err(BulkError::configuration(format!(
                "token endpoint {} does not support {PRIVATE_KEY_JWT}",
                metadata.token_endpoint
            )));
        }
        let alg = algorithm_name(key.algorithm());
        if !metadata.supports_signing_alg(&alg) {
            tracing::warn!(
                alg = %alg,
                token_endpoint = %metadata.token_endpoint,
                "Signing algorithm is not advertised by the token endpoint"
            );
        }

        Ok(Self {
            http,
            metadata,
            client_id: client_id.into(),
            key,
            key_id: None,
            scope: None,
            assertion_lifetime: Duration::from_secs(300),
            observer,
        })
    }

    /// Sets the `kid` header of client assertions.
    #[must_use]
    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    /// Sets the scope requested with each grant.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// The token endpoint description.
    #[must_use]
    pub fn metadata(&self) -> &TokenEndpointMetadata {
        &self.metadata
    }

    /// Requests a new access token.
    ///
    /// # Errors
    ///
    /// Returns [`BulkError::Grant`] when the assertion cannot be signed, the
    /// token endpoint is unreachable, or it answers with an error.
    pub async fn grant(&self) -> BulkResult<AccessToken> {
        let claims = ClientAssertionClaims::new(
            &self.client_id,
            &self.metadata.token_endpoint,
            self.assertion_lifetime,
        );
        let assertion = claims.sign(&self.key, self.key_id.as_deref())?;

        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_assertion_type", CLIENT_ASSERTION_TYPE),
            ("client_assertion", assertion.as_str()),
        ];
        if let Some(scope) = self.scope.as_deref() {
            form.push(("scope", scope));
        }

        let request = self
            .http
            .post(&self.metadata.token_endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .build()
            .map_err(|e| BulkError::grant(e.to_string()))?;

        let response = execute(&self.http, request, self.observer.as_ref())
            .await
            .map_err(|e| BulkError::grant(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BulkError::grant(e.to_string()))?;

        if !status.is_success() {
            let detail = match serde_json::from_str::<OAuthErrorResponse>(&body) {
                Ok(err) => match err.error_description {
                    Some(description) => format!("{} - {}", err.error, description),
                    None => err.error,
                },
                Err(_) => body,
            };
            return Err(BulkError::grant(format!(
                "token endpoint returned {}: {}",
                HttpStatus::from(status),
                detail
            )));
        }

        let token: AccessToken = serde_json::from_str(&body)
            .map_err(|e| BulkError::grant(format!("invalid token response: {e}")))?;
        tracing::debug!(
            client_id = %self.client_id,
            expires_in = ?token.expires_in,
            "Access token granted"
        );
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::NoopObserver;

    const EC_P384: &str = include_str!("../../tests/fixtures/ec_p384.pem");

    #[test]
    fn test_metadata_defaults() {
        let metadata = TokenEndpointMetadata::for_token_url("https://auth.example.com/token");
        assert_eq!(metadata.issuer, metadata.token_endpoint);
        assert_eq!(
            metadata.token_endpoint_auth_methods_supported,
            vec!["private_key_jwt"]
        );
        assert!(metadata.supports_signing_alg("RS384"));
        assert!(metadata.supports_signing_alg("ES384"));
        assert!(!metadata.supports_signing_alg("RS256"));
    }

    #[test]
    fn test_rejects_endpoint_without_private_key_jwt() {
        let mut metadata = TokenEndpointMetadata::for_token_url("https://auth.example.com/token");
        metadata.token_endpoint_auth_methods_supported = vec!["client_secret_basic".to_string()];
        let key = ClientKey::from_pem(EC_P384, None).unwrap();

        let err = CredentialGranter::new(
            reqwest::Client::new(),
            metadata,
            "client",
            key,
            Arc::new(NoopObserver),
        )
        .unwrap_err();
        assert!(err.to_string().contains("private_key_jwt"));
    }

    #[test]
    fn test_from_config_without_token_url() {
        let granter = CredentialGranter::from_config(
            &AuthConfig::default(),
            reqwest::Client::new(),
            Arc::new(NoopObserver),
        )
        .unwrap();
        assert!(granter.is_none());
    }

    #[tokio::test]
    async fn test_grant_sends_scope_and_key_id() {
        use wiremock::matchers::{body_string_contains, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("scope=system%2F*.read"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "abc",
                "token_type": "bearer",
                "expires_in": 300
            })))
            .expect(1)
            .mount(&server)
            .await;

        let token_url = format!("{}/token", server.uri());
        let granter = CredentialGranter::new(
            reqwest::Client::new(),
            TokenEndpointMetadata::for_token_url(&token_url),
            "client",
            ClientKey::from_pem(EC_P384, None).unwrap(),
            Arc::new(NoopObserver),
        )
        .unwrap()
        .with_key_id("key-1")
        .with_scope("system/*.read");
        assert_eq!(granter.metadata().token_endpoint, token_url);

        let token = granter.grant().await.unwrap();
        assert_eq!(token.access_token, "abc");
        assert_eq!(token.expires_in, Some(300));

        let requests = server.received_requests().await.unwrap();
        let form: std::collections::HashMap<String, String> =
            url::form_urlencoded::parse(&requests[0].body).into_owned().collect();
        let header = jsonwebtoken::decode_header(&form["client_assertion"]).unwrap();
        assert_eq!(header.kid.as_deref(), Some("key-1"));
    }

    #[tokio::test]
    async fn test_grant_rejects_malformed_token_response() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let granter = CredentialGranter::new(
            reqwest::Client::new(),
            TokenEndpointMetadata::for_token_url(&format!("{}/token", server.uri())),
            "client",
            ClientKey::from_pem(EC_P384, None).unwrap(),
            Arc::new(NoopObserver),
        )
        .unwrap();
        let err = granter.grant().await.unwrap_err();
        assert!(matches!(err, BulkError::Grant { .. }));
        assert!(err.to_string().contains("invalid token response"));
    }

    #[test]
    fn test_access_token_debug_redacts() {
        let token: AccessToken =
            serde_json::from_str(r#"{"access_token":"secret","expires_in":300}"#).unwrap();
        assert_eq!(token.token_type, "bearer");
        let shown = format!("{token:?}");
        assert!(!shown.contains("secret"));
        assert!(shown.contains("300"));
    }
}
