//! Response inspection shared by the kickoff, status and deletion operations.

use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::BulkResult;
use crate::error::BulkError;
use crate::status::HttpStatus;

/// A fully read response: status, headers and text body.
#[derive(Debug)]
pub(crate) struct ReceivedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl ReceivedResponse {
    /// Reads the whole body of a response.
    pub async fn read(response: reqwest::Response) -> BulkResult<Self> {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;
        Ok(Self {
            status,
            headers,
            body,
        })
    }

    pub fn http_status(&self) -> HttpStatus {
        HttpStatus::from(self.status)
    }

    /// Parses the body as JSON, describing why it could not be.
    pub fn json(&self) -> Result<Value, String> {
        if self.body.trim().is_empty() {
            return Err("Empty body".to_string());
        }
        serde_json::from_str(&self.body).map_err(|e| e.to_string())
    }

    /// Parses the body as JSON if possible; absence is not an error.
    pub fn optional_json(&self) -> Option<Value> {
        self.json().ok()
    }

    /// Parses the body as JSON for a failure status, which must carry one.
    pub fn failure_json(&self) -> BulkResult<Value> {
        self.json().map_err(|e| {
            BulkError::protocol(format!(
                "Response body [for status {}] is missing or is not JSON. Additional error: {}",
                self.status.as_u16(),
                e
            ))
        })
    }

    /// Returns the single value of a header, `None` if absent.
    ///
    /// A header that appears more than once is a protocol violation.
    pub fn single_header(&self, name: &str) -> BulkResult<Option<String>> {
        let mut values = self.headers.get_all(name).iter();
        let Some(first) = values.next() else {
            return Ok(None);
        };
        if values.next().is_some() {
            return Err(BulkError::protocol(format!(
                "Multiple {name} headers provided"
            )));
        }
        first
            .to_str()
            .map(|v| Some(v.to_string()))
            .map_err(|_| BulkError::protocol(format!("{name} header is not valid text")))
    }

    /// Returns the single value of a header that must be present.
    pub fn required_header(&self, name: &str) -> BulkResult<String> {
        self.single_header(name)?
            .ok_or_else(|| BulkError::protocol(format!("{name} missing")))
    }

    /// Reads `Retry-After` as whole seconds.
    pub fn retry_after(&self) -> BulkResult<Option<u64>> {
        Ok(self
            .single_header("retry-after")?
            .as_deref()
            .and_then(parse_retry_after))
    }
}

/// Parses a `Retry-After` value given in delay-seconds.
///
/// Values that are not a non-negative integer yield `None`.
pub fn parse_retry_after(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok()
}
