//! SMART Backend Services client for the FHIR Bulk Data `$export` operation.
//!
//! The client authenticates with a JWT client-credentials grant, kicks off
//! an asynchronous export, polls its status with server-directed backoff and
//! returns the completed file manifest. Jobs can be deleted afterwards, and
//! manifest files can be streamed as NDJSON records.
//!
//! ```no_run
//! use octofhir_bulk_client::{BulkClientConfig, BulkExportClient, KickoffParams, KickoffType};
//!
//! # async fn run() -> octofhir_bulk_client::BulkResult<()> {
//! let config = BulkClientConfig::new("https://fhir.example.com/fhir");
//! let client = BulkExportClient::new(config)?;
//!
//! let params = KickoffParams::default().types(["Patient", "Observation"]);
//! let export = client.kickoff(&KickoffType::AllPatients, &params).await?;
//! for file in &export.response.output {
//!     println!("{} {}", file.resource_type, file.url);
//! }
//! client.delete(&export.location).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod delete;
pub mod error;
pub mod kickoff;
pub mod ndjson;
pub mod observability;
pub mod poll;
pub mod request;
mod response;
pub mod status;

pub use auth::{AccessToken, ClientKey, CredentialGranter, KeyKind, TokenEndpointMetadata};
pub use client::{BulkExportClient, BulkExportClientBuilder, ExportResult, FileEntryOptions};
pub use config::{AuthConfig, BulkClientConfig, HttpConfig, PollConfig};
pub use error::BulkError;
pub use kickoff::{KickoffParams, KickoffType, OutputFormat};
pub use ndjson::{DecodeFailure, NdjsonLine, ResourceRecord};
pub use observability::{HttpObserver, NoopObserver, TracingObserver, init_tracing};
pub use poll::{PollSettings, StatusPoller, next_wait};
pub use request::{RequestFactory, RequestPurpose, RequestTemplate};
pub use response::parse_retry_after;
pub use status::{
    CheckableStatus, CheckedStatus, Complete, Deleted, DeletionFailed, DeletionResult, Errored,
    FileEntry, HttpStatus, InProgress, JobOutcome, JobStatus, KickoffFailed, KickoffLimited,
    KickoffResult, KickoffSucceeded, Manifest, StatusLimited,
};

/// Result type for bulk export client operations.
pub type BulkResult<T> = Result<T, BulkError>;
