//! Error types for bulk export client operations.
//!
//! Protocol violations and transport failures abort the current operation
//! chain. Job-level failures (a rejected kickoff, an errored job) are carried
//! as status data by the state machine and only become errors at the
//! orchestration boundary in [`crate::client::BulkExportClient`].

use serde_json::Value;

use crate::status::HttpStatus;

/// Errors that can occur while talking to a bulk export server.
#[derive(Debug, thiserror::Error)]
pub enum BulkError {
    /// The private key is of an unsupported type or curve.
    #[error(
        "Invalid key: {message} SMART Backend Services defines the allowed algorithms of ES384 and RS384."
    )]
    InvalidKey {
        /// Description of why the key was rejected.
        message: String,
    },

    /// Access token acquisition failed.
    #[error("Grant failed: {message}")]
    Grant {
        /// Description of the token endpoint failure.
        message: String,
    },

    /// A network or connection failure.
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server response broke the bulk data protocol.
    #[error("Protocol violation: {message}")]
    ProtocolViolation {
        /// Description of the violation.
        message: String,
    },

    /// A streaming fetch returned a non-success status.
    #[error("Unexpected status {status} from {url}")]
    UnexpectedStatus {
        /// The requested URL.
        url: String,
        /// The response status.
        status: HttpStatus,
    },

    /// The kickoff request was rate limited by the server.
    #[error("Kickoff rate limited by server. Try again later{}{}", retry_hint(.retry_after), diagnostics(.outcome.as_ref()))]
    KickoffRateLimited {
        /// Seconds the server asked us to wait, if given.
        retry_after: Option<u64>,
        /// Parsed response body, if any.
        outcome: Option<Value>,
    },

    /// The kickoff request was rejected.
    #[error("Kickoff failed with status: {status}{}", diagnostics(Some(.outcome)))]
    KickoffRejected {
        /// The response status.
        status: HttpStatus,
        /// Parsed response body.
        outcome: Value,
    },

    /// The export job terminated with an error.
    #[error("Export at {location} failed with status: {status}{}", diagnostics(Some(.outcome)))]
    ExportFailed {
        /// The polling location of the job.
        location: String,
        /// The response status.
        status: HttpStatus,
        /// Parsed response body.
        outcome: Value,
    },

    /// The poll loop gave up before reaching a terminal state.
    #[error("Export at {location} still pending after {attempts} status checks")]
    PollAttemptsExhausted {
        /// The polling location of the job.
        location: String,
        /// Number of status checks performed.
        attempts: u32,
    },

    /// The poll loop was cancelled by the caller.
    #[error("Status polling for {location} was cancelled")]
    Cancelled {
        /// The polling location of the job.
        location: String,
    },

    /// The client configuration is invalid.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration error.
        message: String,
    },
}

fn retry_hint(retry_after: &Option<u64>) -> String {
    retry_after
        .map(|secs| format!(" (retry after {secs}s)"))
        .unwrap_or_default()
}

fn diagnostics(outcome: Option<&Value>) -> String {
    outcome
        .map(|obj| format!(". Status: {obj}"))
        .unwrap_or_default()
}

impl BulkError {
    /// Creates a new `InvalidKey` error.
    #[must_use]
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey {
            message: message.into(),
        }
    }

    /// Creates a new `Grant` error.
    #[must_use]
    pub fn grant(message: impl Into<String>) -> Self {
        Self::Grant {
            message: message.into(),
        }
    }

    /// Creates a new `ProtocolViolation` error.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns `true` if the server broke the protocol.
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation { .. } | Self::UnexpectedStatus { .. }
        )
    }

    /// Returns `true` if the export job itself failed or was refused.
    #[must_use]
    pub fn is_job_failure(&self) -> bool {
        matches!(
            self,
            Self::KickoffRateLimited { .. }
                | Self::KickoffRejected { .. }
                | Self::ExportFailed { .. }
        )
    }

    /// Returns `true` if this is a network failure, including token
    /// endpoint failures.
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Grant { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invalid_key_names_allowed_algorithms() {
        let err = BulkError::invalid_key("Invalid Elliptic Curve encountered: P-256.");
        assert_eq!(
            err.to_string(),
            "Invalid key: Invalid Elliptic Curve encountered: P-256. \
             SMART Backend Services defines the allowed algorithms of ES384 and RS384."
        );
    }

    #[test]
    fn test_kickoff_errors_include_diagnostics() {
        let err = BulkError::KickoffRateLimited {
            retry_after: Some(120),
            outcome: Some(json!({"resourceType": "OperationOutcome"})),
        };
        let msg = err.to_string();
        assert!(msg.contains("rate limited"));
        assert!(msg.contains("retry after 120s"));
        assert!(msg.contains("OperationOutcome"));

        let err = BulkError::KickoffRejected {
            status: HttpStatus::new(400, Some("Bad Request".to_string())),
            outcome: json!({"issue": []}),
        };
        let msg = err.to_string();
        assert!(msg.contains("400/Bad Request"));
        assert!(msg.contains("issue"));
    }

    #[test]
    fn test_error_predicates() {
        assert!(BulkError::protocol("x").is_protocol_error());
        assert!(!BulkError::protocol("x").is_job_failure());
        assert!(BulkError::grant("x").is_transport_error());

        let err = BulkError::ExportFailed {
            location: "https://x/status/1".to_string(),
            status: HttpStatus::new(500, None),
            outcome: json!({}),
        };
        assert!(err.is_job_failure());
        assert!(!err.is_protocol_error());
    }
}
