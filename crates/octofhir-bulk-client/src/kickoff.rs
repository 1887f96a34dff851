//! `$export` kickoff.

use std::fmt;

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::BulkResult;
use crate::error::BulkError;
use crate::request::{RequestFactory, RequestPurpose};
use crate::response::ReceivedResponse;
use crate::status::{KickoffFailed, KickoffLimited, KickoffResult, KickoffSucceeded};

/// Which data an export covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "level", rename_all = "kebab-case")]
pub enum KickoffType {
    /// All data on the server.
    System,
    /// Data of all patients.
    AllPatients,
    /// Data of the members of a group.
    Group { group_id: String },
}

impl KickoffType {
    /// Path inserted between the FHIR base URL and `/$export`.
    #[must_use]
    pub fn path_suffix(&self) -> String {
        match self {
            Self::System => String::new(),
            Self::AllPatients => "/Patient".to_string(),
            Self::Group { group_id } => format!("/Group/{group_id}"),
        }
    }

    /// Full kickoff URL for a FHIR base URL.
    #[must_use]
    pub fn export_url(&self, fhir_url: &str) -> String {
        format!(
            "{}{}/$export",
            fhir_url.trim_end_matches('/'),
            self.path_suffix()
        )
    }
}

/// Format requested for exported files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    #[serde(rename = "application/fhir+ndjson")]
    FhirNdjson,
    #[serde(rename = "application/ndjson")]
    Ndjson,
    #[serde(rename = "ndjson")]
    NdjsonShort,
}

impl OutputFormat {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FhirNdjson => "application/fhir+ndjson",
            Self::Ndjson => "application/ndjson",
            Self::NdjsonShort => "ndjson",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional kickoff query parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KickoffParams {
    /// Only include resources modified after this instant (`_since`).
    pub since: Option<String>,
    /// `_outputFormat`.
    pub output_format: Option<OutputFormat>,
    /// Resource types to include (`_type`).
    #[serde(default)]
    pub types: Vec<String>,
}

impl KickoffParams {
    #[must_use]
    pub fn since(mut self, since: impl Into<String>) -> Self {
        self.since = Some(since.into());
        self
    }

    #[must_use]
    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = Some(format);
        self
    }

    #[must_use]
    pub fn types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Query pairs in request order. Absent values are omitted.
    #[must_use]
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(since) = &self.since {
            pairs.push(("_since", since.clone()));
        }
        if let Some(format) = self.output_format {
            pairs.push(("_outputFormat", format.as_str().to_string()));
        }
        if !self.types.is_empty() {
            pairs.push(("_type", self.types.join(",")));
        }
        pairs
    }
}

/// Sends the kickoff request and classifies the response.
///
/// # Errors
///
/// Fails on transport and grant errors, and with
/// [`BulkError::ProtocolViolation`] when the response breaks the protocol.
pub async fn kickoff(
    factory: &RequestFactory,
    fhir_url: &str,
    kickoff_type: &KickoffType,
    params: &KickoffParams,
) -> BulkResult<KickoffResult> {
    let url = kickoff_type.export_url(fhir_url);
    let query = params.query_pairs();
    tracing::info!(url = %url, query = ?query, "Starting bulk export");

    let template = factory.template(&RequestPurpose::Kickoff);
    let response = template.send(Method::GET, &url, &query).await?;
    let response = ReceivedResponse::read(response).await?;
    classify(&url, &response)
}

fn classify(url: &str, response: &ReceivedResponse) -> BulkResult<KickoffResult> {
    match response.status {
        StatusCode::ACCEPTED => {
            let content_location = response.required_header("content-location")?;
            let location = resolve_location(url, &content_location)?;
            tracing::info!(location = %location, "Bulk export accepted");
            Ok(KickoffResult::Succeeded(KickoffSucceeded {
                location,
                outcome: response.optional_json(),
            }))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = response.retry_after()?;
            tracing::warn!(retry_after = ?retry_after, "Bulk export kickoff rate limited");
            Ok(KickoffResult::Limited(KickoffLimited {
                outcome: response.optional_json(),
                retry_after,
            }))
        }
        _ => {
            let outcome = response.failure_json()?;
            tracing::warn!(status = response.status.as_u16(), "Bulk export kickoff failed");
            Ok(KickoffResult::Failed(KickoffFailed {
                outcome,
                http_status: response.http_status(),
            }))
        }
    }
}

/// Resolves a `Content-Location` against the kickoff URL.
///
/// Absolute locations are kept exactly as sent.
fn resolve_location(request_url: &str, content_location: &str) -> BulkResult<String> {
    if Url::parse(content_location).is_ok() {
        return Ok(content_location.to_string());
    }
    let base = Url::parse(request_url)
        .map_err(|e| BulkError::protocol(format!("invalid kickoff URL {request_url}: {e}")))?;
    base.join(content_location)
        .map(String::from)
        .map_err(|e| {
            BulkError::protocol(format!(
                "invalid content-location {content_location}: {e}"
            ))
        })
}
