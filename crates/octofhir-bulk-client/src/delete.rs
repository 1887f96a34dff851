//! Export job deletion.

use reqwest::{Method, StatusCode};

use crate::BulkResult;
use crate::request::{RequestFactory, RequestPurpose};
use crate::response::ReceivedResponse;
use crate::status::{Deleted, DeletionFailed, DeletionResult};

/// Deletes the job at `location`.
///
/// # Errors
///
/// Fails on transport and grant errors, and with
/// [`crate::BulkError::ProtocolViolation`] when a refusal carries no JSON body.
pub async fn delete(factory: &RequestFactory, location: &str) -> BulkResult<DeletionResult> {
    let template = factory.template(&RequestPurpose::StatusOrDelete);
    let response = template.send(Method::DELETE, location, &[]).await?;
    let response = ReceivedResponse::read(response).await?;
    classify(location, &response)
}

fn classify(location: &str, response: &ReceivedResponse) -> BulkResult<DeletionResult> {
    if response.status == StatusCode::ACCEPTED {
        tracing::info!(location = %location, "Bulk export deleted");
        return Ok(DeletionResult::Deleted(Deleted {
            prior_location: location.to_string(),
            outcome: response.optional_json(),
        }));
    }

    let outcome = response.failure_json()?;
    tracing::warn!(
        location = %location,
        status = response.status.as_u16(),
        "Bulk export deletion refused"
    );
    Ok(DeletionResult::DeletionFailed(DeletionFailed {
        location: location.to_string(),
        outcome,
        http_status: response.http_status(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderMap;
    use serde_json::json;

    fn response(status: u16, body: &str) -> ReceivedResponse {
        ReceivedResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers: HeaderMap::new(),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_deleted_keeps_prior_location() {
        let result = classify("https://x/status/1", &response(202, "")).unwrap();
        assert_eq!(
            result,
            DeletionResult::Deleted(Deleted {
                prior_location: "https://x/status/1".to_string(),
                outcome: None,
            })
        );
    }

    #[test]
    fn test_refusal() {
        let result = classify("https://x/status/1", &response(404, r#"{"issue":[]}"#)).unwrap();
        let DeletionResult::DeletionFailed(failed) = result else {
            panic!("expected failure");
        };
        assert_eq!(failed.location, "https://x/status/1");
        assert_eq!(failed.http_status.code, 404);
        assert_eq!(failed.outcome, json!({"issue": []}));

        let err = classify("https://x/status/1", &response(404, "")).unwrap_err();
        assert!(err.is_protocol_error());
        assert!(err.to_string().contains("[for status 404]"));
    }
}
