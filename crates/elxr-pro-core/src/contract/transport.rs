//! HTTP transport used by the contract client.

use std::error::Error as _;
use std::future::Future;
use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use thiserror::Error;

use crate::error::{Error, Result};

/// Per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Raw answer from the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Failure below the HTTP layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The socket timed out. The caller may retry.
    #[error("timed out: {0}")]
    Timeout(String),
    /// DNS, TLS, refused connection or any other non-retryable failure.
    #[error("{0}")]
    Connect(String),
}

/// Something that can POST a JSON body and hand back status and body.
pub trait HttpTransport {
    fn post_json(
        &self,
        url: &str,
        body: String,
        bearer: Option<&str>,
    ) -> impl Future<Output = std::result::Result<HttpResponse, TransportError>> + Send;
}

/// Proxies applied to outgoing requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxySettings {
    pub http: Option<String>,
    pub https: Option<String>,
}

/// [`HttpTransport`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(proxies: &ProxySettings) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let agent = format!("EA-Client/{}", env!("CARGO_PKG_VERSION"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&agent).map_err(|e| Error::Config(e.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        // reqwest is built with rustls-no-provider; Err means already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT);
        if let Some(url) = proxies.http.as_deref() {
            builder = builder.proxy(proxy(reqwest::Proxy::http(url), url)?);
        }
        if let Some(url) = proxies.https.as_deref() {
            builder = builder.proxy(proxy(reqwest::Proxy::https(url), url)?);
        }
        let http = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }
}

fn proxy(result: reqwest::Result<reqwest::Proxy>, url: &str) -> Result<reqwest::Proxy> {
    result.map_err(|_| Error::InvalidProxyUrl {
        url: url.to_string(),
    })
}

/// Flatten an error and its sources into one line.
fn describe(err: &reqwest::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

impl HttpTransport for ReqwestTransport {
    async fn post_json(
        &self,
        url: &str,
        body: String,
        bearer: Option<&str>,
    ) -> std::result::Result<HttpResponse, TransportError> {
        let mut request = self.http.post(url).body(body);
        if let Some(token) = bearer {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let classify = |e: reqwest::Error| {
            if e.is_timeout() {
                TransportError::Timeout(describe(&e))
            } else {
                TransportError::Connect(describe(&e))
            }
        };
        let resp = request.send().await.map_err(classify)?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(classify)?;
        Ok(HttpResponse { status, body })
    }
}
