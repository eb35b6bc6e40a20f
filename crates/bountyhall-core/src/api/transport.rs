use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

use super::request::{Body, HttpRequest, HttpResponse};

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request to {0} timed out")]
    Timeout(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Sends a request and buffers the response.
///
/// Any HTTP status, including 4xx and 5xx, is a successful send; errors are
/// reserved for failures to exchange a response at all.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Transport backed by a shared `reqwest::Client`.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
        } = request;

        let mut builder = self.client.request(method.clone(), &url).headers(headers);
        builder = match body {
            Body::Empty => builder,
            Body::Json(data) | Body::Bytes(data) => builder.body(data),
            Body::Text(text) => builder.body(text),
            // reqwest writes the multipart Content-Type with its boundary
            Body::Multipart(form) => builder.multipart(form.to_reqwest()?),
        };

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(url.clone())
            } else {
                TransportError::Network(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();
        debug!(method = %method, url = %url, status = status.as_u16(), "HTTP exchange complete");

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
