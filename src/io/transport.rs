use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderValue, AUTHORIZATION};
use http::HeaderMap;

use super::request::TileHttpRequest;
use crate::error::{TileError, TransportError};

/// Default per-request timeout for the blocking transport.
pub const DEFAULT_TRANSPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Synchronous request/response transport.
///
/// `execute` may block the calling thread for the duration of the fetch;
/// the pooled strategy only ever calls it from the blocking thread pool.
pub trait TileTransport: Send + Sync {
    /// Fetch the response body for `request`.
    ///
    /// Non-success statuses are errors.
    fn execute(&self, request: &TileHttpRequest) -> Result<Bytes, TileError>;

    /// Whether connections made by this transport are plain, unauthenticated
    /// HTTP. Used only to decide whether the pipelined strategy may be used.
    fn is_plain_unauthenticated(&self) -> bool {
        false
    }
}

/// Blocking HTTP transport built on `reqwest`.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    timeout: Duration,
    authenticated: bool,
}

impl HttpTransport {
    /// Create a transport with the default timeout.
    pub fn new() -> Result<Self, TransportError> {
        Self::with_timeout(DEFAULT_TRANSPORT_TIMEOUT)
    }

    /// Create a transport with a custom timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, TransportError> {
        Self::build(timeout, HeaderMap::new())
    }

    /// Create a transport that sends a bearer token on every request.
    pub fn with_bearer_token(timeout: Duration, token: &str) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| {
            TransportError::InvalidHeader {
                name: AUTHORIZATION.to_string(),
                message: e.to_string(),
            }
        })?;
        headers.insert(AUTHORIZATION, value);
        Self::build(timeout, headers)
    }

    fn build(timeout: Duration, default_headers: HeaderMap) -> Result<Self, TransportError> {
        let authenticated = default_headers.contains_key(AUTHORIZATION);
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .default_headers(default_headers)
            .build()
            .map_err(|e| TransportError::ClientBuild(e.to_string()))?;

        Ok(Self {
            client,
            timeout,
            authenticated,
        })
    }

    /// The configured request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl TileTransport for HttpTransport {
    fn execute(&self, request: &TileHttpRequest) -> Result<Bytes, TileError> {
        let response = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .send()
            .map_err(|e| map_reqwest_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TileError::HttpStatus {
                status: status.as_u16(),
                url: request.url.to_string(),
            });
        }

        response
            .bytes()
            .map_err(|e| map_reqwest_error(e, self.timeout))
    }

    fn is_plain_unauthenticated(&self) -> bool {
        !self.authenticated
    }
}

/// Translate a `reqwest` failure into the tile error taxonomy.
pub(crate) fn map_reqwest_error(err: reqwest::Error, timeout: Duration) -> TileError {
    if err.is_timeout() {
        return TileError::Timeout {
            millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };
    }
    if let Some(status) = err.status() {
        return TileError::HttpStatus {
            status: status.as_u16(),
            url: err.url().map(|u| u.to_string()).unwrap_or_default(),
        };
    }
    TileError::Transport(err.to_string())
}
