//! Bulk export client configuration.
//!
//! # Example (TOML)
//!
//! ```toml
//! fhir_url = "https://fhir.example.com/fhir"
//!
//! [auth]
//! token_url = "https://fhir.example.com/auth/token"
//! client_id = "bulk-client"
//! private_key_path = "/etc/bulk/key.pem"
//! key_id = "key-1"
//! scope = "system/*.read"
//!
//! [poll]
//! retry_after_default = "10s"
//! max_attempts = 720
//! ```
//!
//! Every value can be overridden from the environment, e.g.
//! `OCTOFHIR_BULK__POLL__RETRY_AFTER_DEFAULT=30s`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::BulkResult;
use crate::error::BulkError;

/// Root configuration for [`crate::client::BulkExportClient`].
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BulkClientConfig {
    /// Base URL of the FHIR server.
    pub fhir_url: String,

    /// SMART Backend Services credentials.
    pub auth: AuthConfig,

    /// Status polling behavior.
    pub poll: PollConfig,

    /// HTTP transport settings.
    pub http: HttpConfig,
}

/// Client-credentials grant configuration.
///
/// Leaving `token_url` unset runs the client unauthenticated, for open
/// servers.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Token endpoint of the authorization server.
    pub token_url: Option<String>,

    /// Registered client id, used as `iss` and `sub` of the assertion.
    pub client_id: String,

    /// PEM-encoded private key (RS384 or ES384).
    pub private_key_pem: Option<String>,

    /// Path to a PEM-encoded private key.
    pub private_key_path: Option<PathBuf>,

    /// Key id placed in the assertion's `kid` header.
    pub key_id: Option<String>,

    /// Signing algorithm override for RSA keys.
    pub algorithm: Option<String>,

    /// Scope requested in the token request.
    pub scope: Option<String>,

    /// Lifetime of each client assertion.
    #[serde(with = "humantime_serde")]
    pub assertion_lifetime: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_url: None,
            client_id: String::new(),
            private_key_pem: None,
            private_key_path: None,
            key_id: None,
            algorithm: None,
            scope: None,
            assertion_lifetime: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl AuthConfig {
    /// Returns the token endpoint when authentication is enabled.
    #[must_use]
    pub fn token_endpoint(&self) -> Option<&str> {
        self.token_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    /// Loads the private key PEM from whichever source is configured.
    pub fn private_key(&self) -> BulkResult<String> {
        match (&self.private_key_pem, &self.private_key_path) {
            (Some(pem), None) => Ok(pem.clone()),
            (None, Some(path)) => std::fs::read_to_string(path).map_err(|e| {
                BulkError::configuration(format!(
                    "cannot read private key {}: {e}",
                    path.display()
                ))
            }),
            (Some(_), Some(_)) => Err(BulkError::configuration(
                "auth.private_key_pem and auth.private_key_path are mutually exclusive",
            )),
            (None, None) => Err(BulkError::configuration(
                "auth.private_key_pem or auth.private_key_path is required",
            )),
        }
    }
}

/// Status polling configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PollConfig {
    /// Wait used before the first status check, and whenever the server
    /// gives no usable hint.
    #[serde(with = "humantime_serde")]
    pub retry_after_default: Duration,

    /// Maximum number of non-terminal status checks. Unbounded when unset.
    pub max_attempts: Option<u32>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            retry_after_default: Duration::ZERO,
            max_attempts: None,
        }
    }
}

/// HTTP transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Per-request timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// User agent sent with every request.
    pub user_agent: String,

    /// Longest NDJSON line accepted when decoding file entries, in bytes.
    pub max_line_length: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            user_agent: concat!("octofhir-bulk-client/", env!("CARGO_PKG_VERSION")).to_string(),
            max_line_length: crate::ndjson::DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl BulkClientConfig {
    /// Creates a configuration for an open (unauthenticated) server.
    #[must_use]
    pub fn new(fhir_url: impl Into<String>) -> Self {
        Self {
            fhir_url: fhir_url.into(),
            ..Self::default()
        }
    }

    /// Enables the client-credentials grant.
    #[must_use]
    pub fn with_auth(
        mut self,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        private_key_pem: impl Into<String>,
    ) -> Self {
        self.auth.token_url = Some(token_url.into());
        self.auth.client_id = client_id.into();
        self.auth.private_key_pem = Some(private_key_pem.into());
        self
    }

    /// Sets the default wait between status checks.
    #[must_use]
    pub fn with_retry_after_default(mut self, wait: Duration) -> Self {
        self.poll.retry_after_default = wait;
        self
    }

    /// Bounds the number of non-terminal status checks.
    #[must_use]
    pub fn with_max_poll_attempts(mut self, attempts: u32) -> Self {
        self.poll.max_attempts = Some(attempts);
        self
    }

    /// Checks the configuration for consistency.
    pub fn validate(&self) -> BulkResult<()> {
        if self.fhir_url.trim().is_empty() {
            return Err(BulkError::configuration("fhir_url is required"));
        }
        Url::parse(&self.fhir_url)
            .map_err(|e| BulkError::configuration(format!("fhir_url is not a valid URL: {e}")))?;

        if let Some(token_url) = self.auth.token_endpoint() {
            Url::parse(token_url).map_err(|e| {
                BulkError::configuration(format!("auth.token_url is not a valid URL: {e}"))
            })?;
            if self.auth.client_id.trim().is_empty() {
                return Err(BulkError::configuration(
                    "auth.client_id is required when auth.token_url is set",
                ));
            }
            if self.auth.private_key_pem.is_some() == self.auth.private_key_path.is_some() {
                return Err(BulkError::configuration(
                    "exactly one of auth.private_key_pem or auth.private_key_path is required",
                ));
            }
            if self.auth.assertion_lifetime.is_zero() {
                return Err(BulkError::configuration(
                    "auth.assertion_lifetime must be > 0",
                ));
            }
        }

        if self.poll.max_attempts == Some(0) {
            return Err(BulkError::configuration("poll.max_attempts must be > 0"));
        }
        if self.http.request_timeout.is_zero() {
            return Err(BulkError::configuration("http.request_timeout must be > 0"));
        }
        if self.http.max_line_length == 0 {
            return Err(BulkError::configuration("http.max_line_length must be > 0"));
        }
        Ok(())
    }
}

pub mod loader {
    use super::BulkClientConfig;
    use crate::BulkResult;
    use crate::error::BulkError;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Environment prefix, e.g. `OCTOFHIR_BULK__AUTH__CLIENT_ID`.
    pub const ENV_PREFIX: &str = "OCTOFHIR_BULK";

    /// Loads configuration from an optional TOML file plus environment
    /// overrides, then validates it.
    pub fn load_config(path: Option<&str>) -> BulkResult<BulkClientConfig> {
        let mut builder = Config::builder();
        let path = PathBuf::from(path.unwrap_or("octofhir-bulk.toml"));
        if path.exists() {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| BulkError::configuration(format!("config build error: {e}")))?;
        let merged: BulkClientConfig = cfg
            .try_deserialize()
            .map_err(|e| BulkError::configuration(format!("config deserialize error: {e}")))?;
        merged.validate()?;
        Ok(merged)
    }
}
