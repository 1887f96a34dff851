//! Request/response observation and tracing setup.
//!
//! Every outbound request made by the client is reported to an
//! [`HttpObserver`]. The default [`TracingObserver`] emits `tracing` events;
//! callers can inject their own observer through
//! [`crate::client::BulkExportClientBuilder::observer`].

use reqwest::header::{AUTHORIZATION, HeaderMap};
use reqwest::{Method, StatusCode};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use url::Url;

/// Receives a notification for each request sent and response received.
pub trait HttpObserver: Send + Sync {
    /// Called right before a request is sent, after pre-send hooks ran.
    fn on_request(&self, method: &Method, url: &Url, headers: &HeaderMap);

    /// Called when response headers arrive.
    fn on_response(&self, method: &Method, url: &Url, status: StatusCode, headers: &HeaderMap);
}

/// Observer that logs traffic at `debug` level.
///
/// The `Authorization` header is never logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl HttpObserver for TracingObserver {
    fn on_request(&self, method: &Method, url: &Url, headers: &HeaderMap) {
        tracing::debug!(
            %method,
            %url,
            headers = ?redacted(headers),
            "--> sending request"
        );
    }

    fn on_response(&self, method: &Method, url: &Url, status: StatusCode, headers: &HeaderMap) {
        tracing::debug!(
            %method,
            %url,
            status = status.as_u16(),
            headers = ?redacted(headers),
            "<-- received response"
        );
    }
}

/// Observer that ignores all traffic.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl HttpObserver for NoopObserver {
    fn on_request(&self, _method: &Method, _url: &Url, _headers: &HeaderMap) {}

    fn on_response(&self, _method: &Method, _url: &Url, _status: StatusCode, _headers: &HeaderMap) {}
}

/// Sends a built request, reporting it and its response to `observer`.
pub(crate) async fn execute(
    client: &reqwest::Client,
    request: reqwest::Request,
    observer: &dyn HttpObserver,
) -> Result<reqwest::Response, reqwest::Error> {
    let method = request.method().clone();
    let url = request.url().clone();
    observer.on_request(&method, &url, request.headers());

    let response = client.execute(request).await?;
    observer.on_response(&method, &url, response.status(), response.headers());
    Ok(response)
}

fn redacted(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let shown = if name == AUTHORIZATION {
                "<redacted>".to_string()
            } else {
                value.to_str().unwrap_or("<binary>").to_string()
            };
            (name.to_string(), shown)
        })
        .collect()
}

/// Installs a global `fmt` subscriber filtered by `RUST_LOG`, or by `level`
/// when `RUST_LOG` is unset. Does nothing if a subscriber is already set.
pub fn init_tracing(level: &str) {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
