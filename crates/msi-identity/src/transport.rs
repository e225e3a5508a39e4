//! HTTP transport seam and the retrying executor.
//!
//! The pipeline never opens sockets itself. Every call is expressed as an
//! [`HttpRequest`] handed to an [`HttpTransport`]; [`send_with_retry`] drives
//! that transport under a [`RetryPolicy`] and turns the final outcome into
//! either a successful [`HttpResponse`] or a classified [`Error`].
//!
//! [`ReqwestTransport`] is the production implementation. When a request
//! carries a binding certificate, it is presented as the TLS client identity.

use crate::certificate::BindingCertificate;
use crate::retry::RetryPolicy;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// Result of a single transport attempt, as seen by the retry policies.
pub type Outcome = std::result::Result<HttpResponse, TransportError>;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A request handed to the transport.
#[derive(Clone)]
pub struct HttpRequest {
    method: Method,
    url: Url,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    client_certificate: Option<Arc<BindingCertificate>>,
}

impl HttpRequest {
    /// Creates a request with no headers or body.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
            client_certificate: None,
        }
    }

    /// Creates a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::Get, url)
    }

    /// Creates a POST request.
    pub fn post(url: Url) -> Self {
        Self::new(Method::Post, url)
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets a JSON body and the matching content type.
    pub fn with_json<T: Serialize>(self, body: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| Error::InvalidResponse(format!("failed to encode request body: {e}")))?;
        Ok(self
            .with_header("Content-Type", "application/json")
            .with_body(bytes))
    }

    /// Sets a form-encoded body and the matching content type.
    pub fn with_form(self, pairs: &[(&str, &str)]) -> Self {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        self.with_header("Content-Type", "application/x-www-form-urlencoded")
            .with_body(body.into_bytes())
    }

    /// Sets a raw body.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Presents `certificate` as the TLS client identity.
    pub fn with_client_certificate(mut self, certificate: Arc<BindingCertificate>) -> Self {
        self.client_certificate = Some(certificate);
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Returns the first header with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn client_certificate(&self) -> Option<&Arc<BindingCertificate>> {
        self.client_certificate.as_ref()
    }
}

impl std::fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let header_names: Vec<&str> = self.headers.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &header_names)
            .field("body_len", &self.body.as_ref().map(Vec::len))
            .field(
                "client_certificate",
                &self.client_certificate.as_ref().map(|c| c.thumbprint()),
            )
            .finish()
    }
}

/// A response returned by the transport.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Returns the first header with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Returns the body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| Error::InvalidResponse(format!("malformed JSON body: {e}")))
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// A failure below the HTTP layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The request did not complete within the transport deadline.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The connection could not be established or was reset.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Any other failure, such as an unusable client identity.
    #[error("transport failure: {0}")]
    Other(String),
}

impl TransportError {
    /// Timeouts and connection failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connection(_))
    }
}

/// Executes HTTP requests on behalf of the pipeline.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Performs one attempt. Non-2xx statuses are responses, not errors.
    async fn send(&self, request: HttpRequest) -> Outcome;
}

/// Runs `request` under `policy` until it succeeds, fails terminally, or
/// `cancel` fires.
///
/// Terminal classification:
/// - exhausted timeout → [`Error::RequestTimedOut`]
/// - exhausted retryable status → [`Error::ServiceUnavailable`]
/// - non-retryable status → [`Error::Service`]
/// - other transport failure → [`Error::Transport`]
pub async fn send_with_retry(
    transport: &dyn HttpTransport,
    request: HttpRequest,
    mut policy: Box<dyn RetryPolicy>,
    cancel: &CancellationToken,
) -> Result<HttpResponse> {
    let mut retry_count = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = transport.send(request.clone()) => outcome,
        };

        let outcome = match outcome {
            Ok(response) if response.is_success() => return Ok(response),
            other => other,
        };

        match &outcome {
            Ok(response) => debug!(
                url = %request.url(),
                status = response.status(),
                attempt = retry_count + 1,
                "request failed"
            ),
            Err(e) => debug!(
                url = %request.url(),
                error = %e,
                attempt = retry_count + 1,
                "request failed"
            ),
        }

        if policy.pause_for_retry(&outcome, retry_count, cancel).await? {
            retry_count += 1;
            continue;
        }

        let retryable = policy.is_retryable(&outcome);
        if retryable {
            warn!(
                url = %request.url(),
                retries = retry_count,
                request_type = ?policy.request_type(),
                "retries exhausted"
            );
        }
        return Err(classify_terminal(outcome, retryable, request.url()));
    }
}

fn classify_terminal(outcome: Outcome, retryable: bool, url: &Url) -> Error {
    match outcome {
        Ok(response) if retryable => Error::ServiceUnavailable {
            status: response.status(),
            body: response.text(),
        },
        Ok(response) => service_error(&response),
        Err(TransportError::Timeout(_)) => Error::RequestTimedOut {
            endpoint: endpoint_of(url),
        },
        Err(e) => Error::Transport(e.to_string()),
    }
}

/// OAuth2-style error body.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    error_description: Option<String>,
    message: Option<String>,
}

/// Builds a non-retryable service error, extracting OAuth2 error fields when present.
pub(crate) fn service_error(response: &HttpResponse) -> Error {
    let parsed = serde_json::from_slice::<ErrorBody>(response.body()).ok();
    let code = parsed
        .as_ref()
        .and_then(|b| b.error.clone())
        .unwrap_or_else(|| "http_error".to_string());
    let description = parsed
        .and_then(|b| b.error_description.or(b.message))
        .unwrap_or_else(|| response.text());

    Error::Service {
        status: response.status(),
        code,
        description,
    }
}

/// Scheme, host and path of a URL, without the query string.
fn endpoint_of(url: &Url) -> String {
    let mut endpoint = url.clone();
    endpoint.set_query(None);
    endpoint.to_string()
}

/// [`HttpTransport`] over `reqwest` with rustls.
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Duration,
    /// Client presenting the most recently used binding certificate, keyed by thumbprint.
    mtls_client: Mutex<Option<(String, reqwest::Client)>>,
}

impl ReqwestTransport {
    /// Creates a transport with the given per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            timeout,
            mtls_client: Mutex::new(None),
        })
    }

    fn client_for(
        &self,
        certificate: Option<&Arc<BindingCertificate>>,
    ) -> std::result::Result<reqwest::Client, TransportError> {
        let Some(certificate) = certificate else {
            return Ok(self.client.clone());
        };

        let thumbprint = certificate.thumbprint();
        if let Some((cached, client)) = self.mtls_client.lock().as_ref() {
            if *cached == thumbprint {
                return Ok(client.clone());
            }
        }

        let identity_pem = certificate
            .to_pem_identity()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        let identity = reqwest::Identity::from_pem(&identity_pem)
            .map_err(|e| TransportError::Other(format!("invalid client identity: {e}")))?;
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .timeout(self.timeout)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build mTLS client: {e}")))?;

        debug!(%thumbprint, "built mTLS client for binding certificate");
        *self.mtls_client.lock() = Some((thumbprint, client.clone()));
        Ok(client)
    }
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Outcome {
        let client = self.client_for(request.client_certificate())?;

        let method = match request.method() {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        };
        let mut builder = client.request(method, request.url().clone());
        for (name, value) in request.headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body() {
            builder = builder.body(body.to_vec());
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        Ok(HttpResponse::new(status, headers, body.to_vec()))
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_request() || e.is_body() {
        TransportError::Connection(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}
