//! Authorized request construction.
//!
//! A [`RequestTemplate`] carries the headers and pre-send hooks for one kind
//! of request. Hooks run in order right before each send, so every request
//! gets a freshly granted token.

use std::sync::Arc;

use reqwest::header::{ACCEPT, ACCEPT_ENCODING, HeaderMap, HeaderValue};
use reqwest::{Method, RequestBuilder};
use url::Url;

use crate::BulkResult;
use crate::auth::CredentialGranter;
use crate::config::BulkClientConfig;
use crate::error::BulkError;
use crate::observability::{HttpObserver, execute};
use crate::status::HttpStatus;

const FHIR_JSON: &str = "application/fhir+json";
const JSON: &str = "application/json";

/// What a request is for. Determines headers and error handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPurpose {
    /// The `$export` kickoff request.
    Kickoff,
    /// A status check or deletion at the polling location.
    StatusOrDelete,
    /// A download of a manifest file entry.
    FileEntry {
        /// Whether the manifest requires a bearer token for downloads.
        requires_access_token: bool,
        /// Explicit `Accept-Encoding`; the body is returned undecoded.
        accept_encoding: Option<String>,
    },
}

/// Runs before each send.
#[derive(Debug, Clone)]
enum PreSendHook {
    Authorize(Arc<CredentialGranter>),
    AcceptEncoding(String),
}

impl PreSendHook {
    async fn apply(&self, builder: RequestBuilder) -> BulkResult<RequestBuilder> {
        match self {
            Self::Authorize(granter) => {
                let token = granter.grant().await?;
                Ok(builder.bearer_auth(token.access_token))
            }
            Self::AcceptEncoding(encoding) => {
                let value = HeaderValue::from_str(encoding).map_err(|_| {
                    BulkError::configuration(format!("invalid Accept-Encoding value: {encoding}"))
                })?;
                Ok(builder.header(ACCEPT_ENCODING, value))
            }
        }
    }
}

/// Builds request templates sharing HTTP clients, the granter and the
/// observer.
#[derive(Clone)]
pub struct RequestFactory {
    http: reqwest::Client,
    raw_http: reqwest::Client,
    granter: Option<Arc<CredentialGranter>>,
    observer: Arc<dyn HttpObserver>,
}

impl std::fmt::Debug for RequestFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestFactory")
            .field("granter", &self.granter)
            .finish_non_exhaustive()
    }
}

impl RequestFactory {
    /// Creates the HTTP clients and, when a token endpoint is configured,
    /// the credential granter.
    pub fn new(config: &BulkClientConfig, observer: Arc<dyn HttpObserver>) -> BulkResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http.request_timeout)
            .user_agent(&config.http.user_agent)
            .build()
            .map_err(|e| BulkError::configuration(format!("failed to build HTTP client: {e}")))?;
        let raw_http = reqwest::Client::builder()
            .timeout(config.http.request_timeout)
            .user_agent(&config.http.user_agent)
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .build()
            .map_err(|e| BulkError::configuration(format!("failed to build HTTP client: {e}")))?;

        let granter =
            CredentialGranter::from_config(&config.auth, http.clone(), observer.clone())?
                .map(Arc::new);
        if granter.is_none() {
            tracing::info!("No token endpoint configured, requests are unauthenticated");
        }

        Ok(Self {
            http,
            raw_http,
            granter,
            observer,
        })
    }

    /// Returns `true` if requests are authorized with a bearer token.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.granter.is_some()
    }

    /// Returns the template for a purpose.
    #[must_use]
    pub fn template(&self, purpose: &RequestPurpose) -> RequestTemplate {
        let mut headers = HeaderMap::new();
        let mut hooks = Vec::new();
        let mut fail_on_error_status = false;

        let needs_auth = match purpose {
            RequestPurpose::Kickoff => {
                headers.insert(ACCEPT, HeaderValue::from_static(FHIR_JSON));
                headers.insert("prefer", HeaderValue::from_static("respond-async"));
                true
            }
            RequestPurpose::StatusOrDelete => {
                headers.insert(ACCEPT, HeaderValue::from_static(JSON));
                true
            }
            RequestPurpose::FileEntry {
                requires_access_token,
                ..
            } => {
                headers.insert(ACCEPT, HeaderValue::from_static(JSON));
                fail_on_error_status = true;
                *requires_access_token
            }
        };

        if needs_auth && let Some(granter) = &self.granter {
            hooks.push(PreSendHook::Authorize(granter.clone()));
        }
        if let RequestPurpose::FileEntry {
            accept_encoding: Some(encoding),
            ..
        } = purpose
        {
            hooks.push(PreSendHook::AcceptEncoding(encoding.clone()));
        }

        let raw = hooks
            .iter()
            .any(|hook| matches!(hook, PreSendHook::AcceptEncoding(_)));

        RequestTemplate {
            http: if raw {
                self.raw_http.clone()
            } else {
                self.http.clone()
            },
            observer: self.observer.clone(),
            headers,
            hooks,
            fail_on_error_status,
        }
    }
}

/// A prepared kind of request, sendable any number of times.
pub struct RequestTemplate {
    http: reqwest::Client,
    observer: Arc<dyn HttpObserver>,
    headers: HeaderMap,
    hooks: Vec<PreSendHook>,
    fail_on_error_status: bool,
}

impl RequestTemplate {
    /// Headers set on every request from this template.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Sends a request, running the pre-send hooks first.
    ///
    /// # Errors
    ///
    /// Grant failures abort before anything is sent. File entry fetches
    /// fail with [`BulkError::UnexpectedStatus`] on a non-2xx response.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
    ) -> BulkResult<reqwest::Response> {
        let parsed = Url::parse(url)
            .map_err(|e| BulkError::protocol(format!("invalid request URL {url}: {e}")))?;

        let mut builder = self
            .http
            .request(method, parsed)
            .headers(self.headers.clone());
        if !query.is_empty() {
            builder = builder.query(query);
        }
        for hook in &self.hooks {
            builder = hook.apply(builder).await?;
        }

        let request = builder.build()?;
        let response = execute(&self.http, request, self.observer.as_ref()).await?;

        if self.fail_on_error_status && !response.status().is_success() {
            return Err(BulkError::UnexpectedStatus {
                url: url.to_string(),
                status: HttpStatus::from(response.status()),
            });
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::NoopObserver;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn factory(base: &str) -> RequestFactory {
        RequestFactory::new(&BulkClientConfig::new(base), Arc::new(NoopObserver)).unwrap()
    }

    #[test]
    fn test_template_headers() {
        let factory = factory("https://fhir.example.com");
        assert!(!factory.is_authenticated());

        let kickoff = factory.template(&RequestPurpose::Kickoff);
        assert_eq!(kickoff.headers()[ACCEPT], FHIR_JSON);
        assert_eq!(kickoff.headers()["prefer"], "respond-async");
        assert!(kickoff.hooks.is_empty());

        let status = factory.template(&RequestPurpose::StatusOrDelete);
        assert_eq!(status.headers()[ACCEPT], JSON);
        assert!(status.headers().get("prefer").is_none());
        assert!(!status.fail_on_error_status);

        let file = factory.template(&RequestPurpose::FileEntry {
            requires_access_token: true,
            accept_encoding: Some("gzip".to_string()),
        });
        assert!(file.fail_on_error_status);
        assert_eq!(file.hooks.len(), 1);
    }

    #[tokio::test]
    async fn test_send_with_query_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/$export"))
            .and(query_param("_type", "Patient"))
            .and(header("accept", FHIR_JSON))
            .and(header("prefer", "respond-async"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let template = factory(&server.uri()).template(&RequestPurpose::Kickoff);
        let url = format!("{}/$export", server.uri());
        let response = template
            .send(Method::GET, &url, &[("_type", "Patient".to_string())])
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 202);
    }

    #[tokio::test]
    async fn test_status_errors_are_returned() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let template = factory(&server.uri()).template(&RequestPurpose::StatusOrDelete);
        let url = format!("{}/status/1", server.uri());
        let response = template.send(Method::GET, &url, &[]).await.unwrap();
        assert_eq!(response.status().as_u16(), 500);
    }

    #[tokio::test]
    async fn test_file_entry_rejects_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let template = factory(&server.uri()).template(&RequestPurpose::FileEntry {
            requires_access_token: false,
            accept_encoding: None,
        });
        let url = format!("{}/files/1.ndjson", server.uri());
        let err = template.send(Method::GET, &url, &[]).await.unwrap_err();
        match err {
            BulkError::UnexpectedStatus { url: failed, status } => {
                assert_eq!(failed, url);
                assert_eq!(status.code, 404);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_accept_encoding_returns_raw_body() {
        let server = MockServer::start().await;
        let compressed = vec![0x1f, 0x8b, 0x08, 0x00, 0x01, 0x02, 0x03];
        Mock::given(method("GET"))
            .and(path("/files/1.ndjson.gz"))
            .and(header("accept-encoding", "gzip"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-encoding", "gzip")
                    .set_body_bytes(compressed.clone()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let template = factory(&server.uri()).template(&RequestPurpose::FileEntry {
            requires_access_token: false,
            accept_encoding: Some("gzip".to_string()),
        });
        let url = format!("{}/files/1.ndjson.gz", server.uri());
        let response = template.send(Method::GET, &url, &[]).await.unwrap();
        assert_eq!(response.bytes().await.unwrap().to_vec(), compressed);
    }

    #[tokio::test]
    async fn test_invalid_url_is_protocol_error() {
        let template = factory("https://fhir.example.com").template(&RequestPurpose::StatusOrDelete);
        let err = template.send(Method::GET, "not a url", &[]).await.unwrap_err();
        assert!(err.is_protocol_error());
    }
}
