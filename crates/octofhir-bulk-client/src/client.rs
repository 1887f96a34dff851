//! Bulk export orchestration.
//!
//! [`BulkExportClient::kickoff`] chains kickoff, polling and result
//! interpretation, turning job-level failures into [`BulkError`]s. The
//! lower-level methods expose each step for callers who drive the state
//! machine themselves.

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::BulkResult;
use crate::config::BulkClientConfig;
use crate::delete;
use crate::error::BulkError;
use crate::kickoff::{self, KickoffParams, KickoffType};
use crate::ndjson::{self, NdjsonLine};
use crate::observability::{HttpObserver, TracingObserver};
use crate::poll::{self, PollSettings, StatusPoller};
use crate::request::{RequestFactory, RequestPurpose};
use crate::status::{
    CheckableStatus, CheckedStatus, DeletionResult, JobOutcome, KickoffResult, KickoffSucceeded,
    Manifest,
};

/// A completed export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportResult {
    /// The polling location of the job, usable for deletion.
    pub location: String,
    /// The completion manifest.
    pub response: Manifest,
}

/// Options for fetching a manifest file entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileEntryOptions {
    /// Send a bearer token (the manifest's `requiresAccessToken`).
    pub requires_access_token: bool,
    /// Request this encoding and receive the body undecoded.
    pub accept_encoding: Option<String>,
}

struct ClientInner {
    fhir_url: String,
    requests: RequestFactory,
    poll: PollSettings,
    max_line_length: usize,
}

/// Client for the FHIR Bulk Data `$export` operation.
///
/// Cheap to clone. Holds no job state, so separate exports can run
/// concurrently from clones of the same client.
#[derive(Clone)]
pub struct BulkExportClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for BulkExportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkExportClient")
            .field("fhir_url", &self.inner.fhir_url)
            .field("authenticated", &self.inner.requests.is_authenticated())
            .field("poll", &self.inner.poll)
            .finish()
    }
}

/// Builder for [`BulkExportClient`].
pub struct BulkExportClientBuilder {
    config: BulkClientConfig,
    observer: Arc<dyn HttpObserver>,
    poll: PollSettings,
}

impl BulkExportClientBuilder {
    /// Replaces the default [`TracingObserver`].
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn HttpObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Maps `X-Progress` text to a wait in seconds.
    #[must_use]
    pub fn x_progress_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&str) -> Option<u64> + Send + Sync + 'static,
    {
        self.poll = self.poll.with_x_progress_mapper(mapper);
        self
    }

    /// Validates the configuration and builds the client.
    ///
    /// # Errors
    ///
    /// Returns [`BulkError::Configuration`] for invalid settings and
    /// [`BulkError::InvalidKey`] for an unsupported private key.
    pub fn build(self) -> BulkResult<BulkExportClient> {
        self.config.validate()?;
        let requests = RequestFactory::new(&self.config, self.observer)?;
        Ok(BulkExportClient {
            inner: Arc::new(ClientInner {
                max_line_length: self.config.http.max_line_length,
                fhir_url: self.config.fhir_url,
                requests,
                poll: self.poll,
            }),
        })
    }
}

impl BulkExportClient {
    /// Builds a client with the default observer.
    ///
    /// # Errors
    ///
    /// See [`BulkExportClientBuilder::build`].
    pub fn new(config: BulkClientConfig) -> BulkResult<Self> {
        Self::builder(config).build()
    }

    #[must_use]
    pub fn builder(config: BulkClientConfig) -> BulkExportClientBuilder {
        let poll = PollSettings::from(&config.poll);
        BulkExportClientBuilder {
            config,
            observer: Arc::new(TracingObserver),
            poll,
        }
    }

    /// Runs an export to completion.
    ///
    /// # Errors
    ///
    /// Besides transport, grant and protocol errors, a refused or rate
    /// limited kickoff and a failed job are reported as
    /// [`BulkError::KickoffRejected`], [`BulkError::KickoffRateLimited`] and
    /// [`BulkError::ExportFailed`].
    pub async fn kickoff(
        &self,
        kickoff_type: &KickoffType,
        params: &KickoffParams,
    ) -> BulkResult<ExportResult> {
        let poller = StatusPoller::new(self.inner.requests.clone(), self.inner.poll.clone());
        self.run_export(kickoff_type, params, poller).await
    }

    /// Like [`Self::kickoff`], stopping with [`BulkError::Cancelled`] once
    /// `cancel` fires.
    pub async fn kickoff_with_cancel(
        &self,
        kickoff_type: &KickoffType,
        params: &KickoffParams,
        cancel: CancellationToken,
    ) -> BulkResult<ExportResult> {
        let poller = StatusPoller::new(self.inner.requests.clone(), self.inner.poll.clone())
            .with_cancellation(cancel);
        self.run_export(kickoff_type, params, poller).await
    }

    async fn run_export(
        &self,
        kickoff_type: &KickoffType,
        params: &KickoffParams,
        poller: StatusPoller,
    ) -> BulkResult<ExportResult> {
        let accepted = match self.start_export(kickoff_type, params).await? {
            KickoffResult::Succeeded(accepted) => accepted,
            KickoffResult::Limited(limited) => {
                return Err(BulkError::KickoffRateLimited {
                    retry_after: limited.retry_after,
                    outcome: limited.outcome,
                });
            }
            KickoffResult::Failed(failed) => {
                return Err(BulkError::KickoffRejected {
                    status: failed.http_status,
                    outcome: failed.outcome,
                });
            }
        };

        match poller.run(accepted).await? {
            JobOutcome::Complete(complete) => Ok(ExportResult {
                location: complete.location,
                response: complete.manifest,
            }),
            JobOutcome::Errored(errored) => Err(BulkError::ExportFailed {
                location: errored.location,
                status: errored.http_status,
                outcome: errored.outcome,
            }),
        }
    }

    /// Sends the kickoff request only.
    pub async fn start_export(
        &self,
        kickoff_type: &KickoffType,
        params: &KickoffParams,
    ) -> BulkResult<KickoffResult> {
        kickoff::kickoff(&self.inner.requests, &self.inner.fhir_url, kickoff_type, params).await
    }

    /// Performs a single status check.
    pub async fn check_status(&self, status: &CheckableStatus) -> BulkResult<CheckedStatus> {
        poll::check_status(&self.inner.requests, status).await
    }

    /// Polls an accepted job until it completes or errors.
    pub async fn poll(&self, accepted: KickoffSucceeded) -> BulkResult<JobOutcome> {
        StatusPoller::new(self.inner.requests.clone(), self.inner.poll.clone())
            .run(accepted)
            .await
    }

    /// Deletes the job at `location`.
    pub async fn delete(&self, location: &str) -> BulkResult<DeletionResult> {
        delete::delete(&self.inner.requests, location).await
    }

    /// Opens a download of a manifest file entry.
    ///
    /// # Errors
    ///
    /// Returns [`BulkError::UnexpectedStatus`] for a non-2xx response.
    pub async fn file_entry(
        &self,
        url: &str,
        options: &FileEntryOptions,
    ) -> BulkResult<reqwest::Response> {
        let template = self.inner.requests.template(&RequestPurpose::FileEntry {
            requires_access_token: options.requires_access_token,
            accept_encoding: options.accept_encoding.clone(),
        });
        template.send(Method::GET, url, &[]).await
    }

    /// Downloads a manifest file entry and decodes it as NDJSON.
    ///
    /// The body is always decompressed, so `accept_encoding` is ignored.
    /// Lines longer than `http.max_line_length` end the stream with
    /// [`BulkError::ProtocolViolation`].
    pub async fn ndjson_records(
        &self,
        url: &str,
        options: &FileEntryOptions,
    ) -> BulkResult<BoxStream<'static, BulkResult<NdjsonLine>>> {
        if let Some(encoding) = &options.accept_encoding {
            tracing::debug!(
                url,
                accept_encoding = %encoding,
                "Ignoring accept_encoding for NDJSON decoding"
            );
        }
        let options = FileEntryOptions {
            accept_encoding: None,
            ..options.clone()
        };
        let response = self.file_entry(url, &options).await?;
        Ok(ndjson::decode(response.bytes_stream(), self.inner.max_line_length).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_validates_config() {
        let err = BulkExportClient::new(BulkClientConfig::default()).unwrap_err();
        assert!(matches!(err, BulkError::Configuration { .. }));

        let err = BulkExportClient::new(
            BulkClientConfig::new("https://fhir.example.com").with_auth(
                "https://auth.example.com/token",
                "client",
                "not a pem",
            ),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            BulkError::InvalidKey { .. } | BulkError::Configuration { .. }
        ));
    }

    #[test]
    fn test_client_is_clone_and_debug() {
        let client = BulkExportClient::builder(BulkClientConfig::new("https://fhir.example.com"))
            .x_progress_mapper(|_| Some(1))
            .build()
            .unwrap();
        let shown = format!("{:?}", client.clone());
        assert!(shown.contains("fhir.example.com"));
        assert!(shown.contains("authenticated: false"));
    }
}
