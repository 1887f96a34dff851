//! Export job status model.
//!
//! A bulk export job moves through a closed set of states:
//!
//! ```text
//! kickoff ─┬─> KickoffSucceeded ─> (InProgress | StatusLimited)* ─> Complete | Errored
//!          ├─> KickoffLimited
//!          └─> KickoffFailed
//!
//! any state with a location ─ delete ─> Deleted | DeletionFailed
//! ```
//!
//! Each state is its own struct. The narrower unions ([`KickoffResult`],
//! [`CheckableStatus`], [`CheckedStatus`], [`DeletionResult`], [`JobOutcome`])
//! type the inputs and outputs of individual operations, and all of them
//! convert into the full [`JobStatus`] union.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// HTTP status of a response that produced a failure state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpStatus {
    /// Numeric status code.
    pub code: u16,
    /// Canonical reason phrase, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl HttpStatus {
    /// Creates a new status value.
    #[must_use]
    pub fn new(code: u16, reason: Option<String>) -> Self {
        Self { code, reason }
    }
}

impl From<reqwest::StatusCode> for HttpStatus {
    fn from(status: reqwest::StatusCode) -> Self {
        Self {
            code: status.as_u16(),
            reason: status.canonical_reason().map(str::to_string),
        }
    }
}

impl fmt::Display for HttpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.code, self.reason.as_deref().unwrap_or(""))
    }
}

// ============================================================================
// Manifest
// ============================================================================

/// A single file listed in a completed export manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Resource type contained in the file.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Location of the file.
    pub url: String,
    /// Number of resources in the file, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

/// The body of a `200 OK` status response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Server time at which the export snapshot was taken.
    pub transaction_time: String,
    /// The original kickoff request URL.
    pub request: String,
    /// Whether file downloads need a bearer token.
    pub requires_access_token: bool,
    /// Exported data files, in server order.
    pub output: Vec<FileEntry>,
    /// OperationOutcome files describing export errors, in server order.
    pub error: Vec<FileEntry>,
    /// Server-specific extension payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<Value>,
}

// ============================================================================
// States
// ============================================================================

/// The server rejected the kickoff request outright.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KickoffFailed {
    pub outcome: Value,
    pub http_status: HttpStatus,
}

/// The server accepted the kickoff and issued a polling location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KickoffSucceeded {
    pub location: String,
    pub outcome: Option<Value>,
}

/// The kickoff request itself was rate limited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KickoffLimited {
    pub outcome: Option<Value>,
    /// Seconds from the `Retry-After` header.
    pub retry_after: Option<u64>,
}

/// The job is still running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InProgress {
    pub location: String,
    /// Raw `X-Progress` header text.
    pub progress: Option<String>,
    /// Seconds from the `Retry-After` header.
    pub retry_after: Option<u64>,
}

/// A status check was rate limited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusLimited {
    pub location: String,
    pub outcome: Option<Value>,
    /// Seconds from the `Retry-After` header.
    pub retry_after: Option<u64>,
}

/// The job terminated with an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Errored {
    pub location: String,
    pub outcome: Value,
    pub http_status: HttpStatus,
}

/// The job finished and produced a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Complete {
    pub location: String,
    pub manifest: Manifest,
}

/// The job was deleted. The prior location is kept for debugging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deleted {
    pub prior_location: String,
    pub outcome: Option<Value>,
}

/// The server refused to delete the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionFailed {
    pub location: String,
    pub outcome: Value,
    pub http_status: HttpStatus,
}

/// Every state an export job can be in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobStatus {
    KickoffFailed(KickoffFailed),
    KickoffSucceeded(KickoffSucceeded),
    KickoffLimited(KickoffLimited),
    InProgress(InProgress),
    StatusLimited(StatusLimited),
    Errored(Errored),
    Complete(Complete),
    Deleted(Deleted),
    DeletionFailed(DeletionFailed),
}

impl JobStatus {
    /// Returns the polling location, if the job has one.
    ///
    /// For [`JobStatus::Deleted`] this is the location the job had before
    /// deletion.
    #[must_use]
    pub fn location(&self) -> Option<&str> {
        match self {
            Self::KickoffFailed(_) | Self::KickoffLimited(_) => None,
            Self::KickoffSucceeded(s) => Some(&s.location),
            Self::InProgress(s) => Some(&s.location),
            Self::StatusLimited(s) => Some(&s.location),
            Self::Errored(s) => Some(&s.location),
            Self::Complete(s) => Some(&s.location),
            Self::Deleted(s) => Some(&s.prior_location),
            Self::DeletionFailed(s) => Some(&s.location),
        }
    }

    /// Returns `true` if no further status checks apply to this state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::KickoffFailed(_)
                | Self::KickoffLimited(_)
                | Self::Errored(_)
                | Self::Complete(_)
                | Self::Deleted(_)
                | Self::DeletionFailed(_)
        )
    }

    /// Returns `true` if a delete request can be sent for this job.
    ///
    /// Any state with a location qualifies, including [`JobStatus::Errored`]
    /// and [`JobStatus::DeletionFailed`], so a failed delete can be retried.
    #[must_use]
    pub fn is_deletable(&self) -> bool {
        !matches!(self, Self::Deleted(_)) && self.location().is_some()
    }
}

// ============================================================================
// Operation unions
// ============================================================================

/// Result of a kickoff request.
#[derive(Debug, Clone, PartialEq)]
pub enum KickoffResult {
    Succeeded(KickoffSucceeded),
    Limited(KickoffLimited),
    Failed(KickoffFailed),
}

/// A state from which a status check can be made.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckableStatus {
    KickoffSucceeded(KickoffSucceeded),
    InProgress(InProgress),
    StatusLimited(StatusLimited),
}

impl CheckableStatus {
    /// The polling location to check.
    #[must_use]
    pub fn location(&self) -> &str {
        match self {
            Self::KickoffSucceeded(s) => &s.location,
            Self::InProgress(s) => &s.location,
            Self::StatusLimited(s) => &s.location,
        }
    }
}

/// Result of a single status check.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckedStatus {
    InProgress(InProgress),
    StatusLimited(StatusLimited),
    Errored(Errored),
    Complete(Complete),
}

impl CheckedStatus {
    /// The polling location that was checked.
    #[must_use]
    pub fn location(&self) -> &str {
        match self {
            Self::InProgress(s) => &s.location,
            Self::StatusLimited(s) => &s.location,
            Self::Errored(s) => &s.location,
            Self::Complete(s) => &s.location,
        }
    }
}

/// Result of a deletion request.
#[derive(Debug, Clone, PartialEq)]
pub enum DeletionResult {
    Deleted(Deleted),
    DeletionFailed(DeletionFailed),
}

/// Terminal result of the status poll loop.
///
/// Both variants mean the loop itself succeeded; `Errored` is a job-level
/// failure reported by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Complete(Complete),
    Errored(Errored),
}

impl JobOutcome {
    /// Splits the outcome into success and job failure.
    pub fn into_result(self) -> Result<Complete, Errored> {
        match self {
            Self::Complete(complete) => Ok(complete),
            Self::Errored(errored) => Err(errored),
        }
    }
}

impl From<KickoffResult> for JobStatus {
    fn from(result: KickoffResult) -> Self {
        match result {
            KickoffResult::Succeeded(s) => Self::KickoffSucceeded(s),
            KickoffResult::Limited(s) => Self::KickoffLimited(s),
            KickoffResult::Failed(s) => Self::KickoffFailed(s),
        }
    }
}

impl From<CheckableStatus> for JobStatus {
    fn from(status: CheckableStatus) -> Self {
        match status {
            CheckableStatus::KickoffSucceeded(s) => Self::KickoffSucceeded(s),
            CheckableStatus::InProgress(s) => Self::InProgress(s),
            CheckableStatus::StatusLimited(s) => Self::StatusLimited(s),
        }
    }
}

impl From<CheckedStatus> for JobStatus {
    fn from(status: CheckedStatus) -> Self {
        match status {
            CheckedStatus::InProgress(s) => Self::InProgress(s),
            CheckedStatus::StatusLimited(s) => Self::StatusLimited(s),
            CheckedStatus::Errored(s) => Self::Errored(s),
            CheckedStatus::Complete(s) => Self::Complete(s),
        }
    }
}

impl From<DeletionResult> for JobStatus {
    fn from(result: DeletionResult) -> Self {
        match result {
            DeletionResult::Deleted(s) => Self::Deleted(s),
            DeletionResult::DeletionFailed(s) => Self::DeletionFailed(s),
        }
    }
}

impl From<JobOutcome> for JobStatus {
    fn from(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Complete(s) => Self::Complete(s),
            JobOutcome::Errored(s) => Self::Errored(s),
        }
    }
}

impl From<KickoffSucceeded> for CheckableStatus {
    fn from(status: KickoffSucceeded) -> Self {
        Self::KickoffSucceeded(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest_json() -> Value {
        json!({
            "transactionTime": "2024-01-01T00:00:00Z",
            "request": "https://x/fhir/$export",
            "requiresAccessToken": true,
            "output": [
                {"type": "Patient", "url": "https://x/files/1.ndjson", "count": 10},
                {"type": "Observation", "url": "https://x/files/2.ndjson"}
            ],
            "error": []
        })
    }

    #[test]
    fn test_manifest_decodes() {
        let manifest: Manifest = serde_json::from_value(manifest_json()).unwrap();
        assert!(manifest.requires_access_token);
        assert_eq!(manifest.output.len(), 2);
        assert_eq!(manifest.output[0].resource_type, "Patient");
        assert_eq!(manifest.output[0].count, Some(10));
        assert_eq!(manifest.output[1].count, None);
        assert!(manifest.error.is_empty());
        assert!(manifest.extension.is_none());
    }

    #[test]
    fn test_manifest_rejects_missing_fields() {
        let mut body = manifest_json();
        body.as_object_mut().unwrap().remove("error");
        assert!(serde_json::from_value::<Manifest>(body).is_err());

        let mut body = manifest_json();
        body["requiresAccessToken"] = json!("yes");
        assert!(serde_json::from_value::<Manifest>(body).is_err());

        let mut body = manifest_json();
        body["output"] = json!([{"type": "Patient"}]);
        assert!(serde_json::from_value::<Manifest>(body).is_err());
    }

    #[test]
    fn test_job_status_location_and_terminal() {
        let in_progress = JobStatus::InProgress(InProgress {
            location: "https://x/status/1".to_string(),
            progress: Some("50%".to_string()),
            retry_after: None,
        });
        assert_eq!(in_progress.location(), Some("https://x/status/1"));
        assert!(!in_progress.is_terminal());
        assert!(in_progress.is_deletable());

        let limited = JobStatus::KickoffLimited(KickoffLimited {
            outcome: None,
            retry_after: Some(5),
        });
        assert_eq!(limited.location(), None);
        assert!(limited.is_terminal());
        assert!(!limited.is_deletable());

        let deleted = JobStatus::Deleted(Deleted {
            prior_location: "https://x/status/1".to_string(),
            outcome: None,
        });
        assert_eq!(deleted.location(), Some("https://x/status/1"));
        assert!(deleted.is_terminal());
        assert!(!deleted.is_deletable());
    }

    #[test]
    fn test_job_status_deletable_whenever_located() {
        let http_status = HttpStatus::from(reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        let errored = JobStatus::Errored(Errored {
            location: "https://x/status/1".to_string(),
            outcome: json!({"resourceType": "OperationOutcome"}),
            http_status: http_status.clone(),
        });
        assert!(errored.is_deletable());

        let deletion_failed = JobStatus::DeletionFailed(DeletionFailed {
            location: "https://x/status/1".to_string(),
            outcome: json!({"resourceType": "OperationOutcome"}),
            http_status: http_status.clone(),
        });
        assert!(deletion_failed.is_deletable());

        let complete = JobStatus::Complete(Complete {
            location: "https://x/status/1".to_string(),
            manifest: serde_json::from_value(manifest_json()).unwrap(),
        });
        assert!(complete.is_deletable());

        let kickoff_failed = JobStatus::KickoffFailed(KickoffFailed {
            outcome: json!({"resourceType": "OperationOutcome"}),
            http_status,
        });
        assert!(!kickoff_failed.is_deletable());
    }

    #[test]
    fn test_job_status_serializes_with_type_tag() {
        let status = JobStatus::StatusLimited(StatusLimited {
            location: "https://x/status/1".to_string(),
            outcome: None,
            retry_after: Some(30),
        });
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["type"], "status-limited");
        assert_eq!(value["retry_after"], 30);
    }

    #[test]
    fn test_http_status_display() {
        let status = HttpStatus::from(reqwest::StatusCode::NOT_FOUND);
        assert_eq!(status.to_string(), "404/Not Found");
        assert_eq!(HttpStatus::new(599, None).to_string(), "599/");
    }

    #[test]
    fn test_job_outcome_into_result() {
        let errored = JobOutcome::Errored(Errored {
            location: "https://x/status/1".to_string(),
            outcome: json!({}),
            http_status: HttpStatus::new(500, None),
        });
        assert!(errored.into_result().is_err());
    }
}
