//! Status checks and the backoff poll loop.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::BulkResult;
use crate::config::PollConfig;
use crate::error::BulkError;
use crate::request::{RequestFactory, RequestPurpose};
use crate::response::ReceivedResponse;
use crate::status::{
    CheckableStatus, CheckedStatus, Complete, Errored, InProgress, JobOutcome, KickoffSucceeded,
    Manifest, StatusLimited,
};

/// Maps raw `X-Progress` text to a wait in seconds.
pub type XProgressMapper = Arc<dyn Fn(&str) -> Option<u64> + Send + Sync>;

/// Wait computation and bounds for the poll loop.
#[derive(Clone, Default)]
pub struct PollSettings {
    /// Wait before the first check and whenever the server gives no hint.
    pub default_wait: Duration,
    /// Consulted for in-progress responses without `Retry-After`.
    pub x_progress_mapper: Option<XProgressMapper>,
    /// Maximum number of non-terminal status checks.
    pub max_attempts: Option<u32>,
}

impl fmt::Debug for PollSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollSettings")
            .field("default_wait", &self.default_wait)
            .field("x_progress_mapper", &self.x_progress_mapper.is_some())
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl From<&PollConfig> for PollSettings {
    fn from(config: &PollConfig) -> Self {
        Self {
            default_wait: config.retry_after_default,
            x_progress_mapper: None,
            max_attempts: config.max_attempts,
        }
    }
}

impl PollSettings {
    #[must_use]
    pub fn with_x_progress_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&str) -> Option<u64> + Send + Sync + 'static,
    {
        self.x_progress_mapper = Some(Arc::new(mapper));
        self
    }
}

/// Wait before checking a status again.
///
/// `Retry-After` wins. For in-progress jobs without it, the X-Progress
/// mapper is tried next. Anything else waits the default.
#[must_use]
pub fn next_wait(status: &CheckableStatus, settings: &PollSettings) -> Duration {
    let seconds = match status {
        CheckableStatus::KickoffSucceeded(_) => None,
        CheckableStatus::InProgress(s) => s.retry_after.or_else(|| {
            match (&settings.x_progress_mapper, s.progress.as_deref()) {
                (Some(mapper), Some(progress)) => mapper(progress),
                _ => None,
            }
        }),
        CheckableStatus::StatusLimited(s) => s.retry_after,
    };
    seconds.map_or(settings.default_wait, Duration::from_secs)
}

/// Performs one status check.
///
/// # Errors
///
/// Fails on transport and grant errors, and with
/// [`BulkError::ProtocolViolation`] when the response breaks the protocol.
pub async fn check_status(
    factory: &RequestFactory,
    status: &CheckableStatus,
) -> BulkResult<CheckedStatus> {
    let location = status.location();
    let template = factory.template(&RequestPurpose::StatusOrDelete);
    let response = template.send(Method::GET, location, &[]).await?;
    let response = ReceivedResponse::read(response).await?;
    classify(location, &response)
}

/// Bumps the attempt counter and reports whether the limit was reached.
fn record_attempt(attempts: &mut u32, max_attempts: Option<u32>) -> bool {
    *attempts = attempts.saturating_add(1);
    max_attempts.is_some_and(|max| *attempts >= max)
}

fn millis(wait: Duration) -> u64 {
    u64::try_from(wait.as_millis()).unwrap_or(u64::MAX)
}

fn classify(location: &str, response: &ReceivedResponse) -> BulkResult<CheckedStatus> {
    let location = location.to_string();
    match response.status {
        StatusCode::ACCEPTED => Ok(CheckedStatus::InProgress(InProgress {
            progress: response.single_header("x-progress")?,
            retry_after: response.retry_after()?,
            location,
        })),
        StatusCode::TOO_MANY_REQUESTS => Ok(CheckedStatus::StatusLimited(StatusLimited {
            retry_after: response.retry_after()?,
            outcome: response.optional_json(),
            location,
        })),
        StatusCode::OK => {
            let body = response.json().map_err(|e| {
                BulkError::protocol(format!("Completed status response is not JSON: {e}"))
            })?;
            let manifest: Manifest = serde_json::from_value(body).map_err(|e| {
                BulkError::protocol(format!(
                    "Completed status response does not match the manifest schema: {e}"
                ))
            })?;
            Ok(CheckedStatus::Complete(Complete { location, manifest }))
        }
        _ => Ok(CheckedStatus::Errored(Errored {
            outcome: response.failure_json()?,
            http_status: response.http_status(),
            location,
        })),
    }
}

/// Polls a job until it completes or errors.
#[derive(Debug, Clone)]
pub struct StatusPoller {
    factory: RequestFactory,
    settings: PollSettings,
    cancel: Option<CancellationToken>,
}

impl StatusPoller {
    #[must_use]
    pub fn new(factory: RequestFactory, settings: PollSettings) -> Self {
        Self {
            factory,
            settings,
            cancel: None,
        }
    }

    /// Stops the loop with [`BulkError::Cancelled`] once `token` fires.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Runs the loop from an accepted kickoff.
    ///
    /// Returns [`JobOutcome::Errored`] when the server reports the job
    /// failed; errors are reserved for failures of the loop itself.
    pub async fn run(&self, start: KickoffSucceeded) -> BulkResult<JobOutcome> {
        let location = start.location.clone();
        let mut current = CheckableStatus::from(start);
        let mut attempts: u32 = 0;

        loop {
            let wait = next_wait(&current, &self.settings);
            tracing::debug!(
                location = %location,
                wait_ms = millis(wait),
                attempts,
                "Waiting before status check"
            );
            self.wait(&location, wait).await?;

            current = match check_status(&self.factory, &current).await? {
                CheckedStatus::Complete(complete) => {
                    tracing::info!(
                        location = %location,
                        files = complete.manifest.output.len(),
                        errors = complete.manifest.error.len(),
                        "Bulk export complete"
                    );
                    return Ok(JobOutcome::Complete(complete));
                }
                CheckedStatus::Errored(errored) => {
                    tracing::warn!(
                        location = %location,
                        status = errored.http_status.code,
                        "Bulk export failed"
                    );
                    return Ok(JobOutcome::Errored(errored));
                }
                CheckedStatus::InProgress(in_progress) => {
                    tracing::debug!(
                        location = %location,
                        progress = ?in_progress.progress,
                        retry_after = ?in_progress.retry_after,
                        "Bulk export in progress"
                    );
                    CheckableStatus::InProgress(in_progress)
                }
                CheckedStatus::StatusLimited(limited) => {
                    tracing::warn!(
                        location = %location,
                        retry_after = ?limited.retry_after,
                        "Status check rate limited"
                    );
                    CheckableStatus::StatusLimited(limited)
                }
            };

            if record_attempt(&mut attempts, self.settings.max_attempts) {
                return Err(BulkError::PollAttemptsExhausted { location, attempts });
            }
        }
    }

    async fn wait(&self, location: &str, wait: Duration) -> BulkResult<()> {
        let cancelled = || BulkError::Cancelled {
            location: location.to_string(),
        };
        let Some(token) = &self.cancel else {
            tokio::time::sleep(wait).await;
            return Ok(());
        };
        if token.is_cancelled() {
            return Err(cancelled());
        }
        tokio::select! {
            () = token.cancelled() => Err(cancelled()),
            () = tokio::time::sleep(wait) => Ok(()),
        }
    }
}
