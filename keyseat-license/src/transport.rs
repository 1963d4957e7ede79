//! HTTP transport.
//!
//! A [`Transport`] performs exactly one round trip per call. Retries and
//! verification live in [`crate::client`]; tests swap in scripted transports.

use crate::config::url_authority;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// JSON:API media type used for requests and responses.
pub const JSONAPI_MEDIA_TYPE: &str = "application/vnd.api+json";

/// Bytes left unescaped in a signed request-target: unreserved characters
/// plus the path and query delimiters.
const TARGET_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/')
    .remove(b'?')
    .remove(b'=')
    .remove(b'&');

/// Canonical form of a path and query for signing.
///
/// Decodes any existing escapes and re-encodes everything outside
/// [`TARGET_RESERVED`], so `page[number]=2` and `page%5Bnumber%5D=2` sign
/// identically.
#[must_use]
pub fn normalize_target(raw: &str) -> String {
    let decoded = percent_decode_str(raw).decode_utf8_lossy();
    utf8_percent_encode(&decoded, TARGET_RESERVED).to_string()
}

/// How a request authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    None,
    Bearer(String),
    Basic { username: String, password: String },
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Self::Basic { username, .. } => write!(f, "Basic({username}, <redacted>)"),
        }
    }
}

/// A fully built request.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: reqwest::Url,
    pub auth: Auth,
    pub body: Option<Vec<u8>>,
    /// Whether a transient failure may be retried. False for calls that
    /// claim or create something remotely.
    pub retryable: bool,
}

impl ApiRequest {
    /// Path and query as covered by the response signature, normalized
    /// with [`normalize_target`].
    #[must_use]
    pub fn target(&self) -> String {
        let raw = match self.url.query() {
            Some(query) => format!("{}?{query}", self.url.path()),
            None => self.url.path().to_string(),
        };
        normalize_target(&raw)
    }
}

/// An unverified response. Its body must not be interpreted until it has
/// passed [`crate::signature::ResponseVerifier::verify`].
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// `host[:port]` of the URL that actually produced the response.
    pub served_host: String,
}

impl RawResponse {
    /// Header value as a string, if present and visible ASCII.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Failure to complete a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Other(String),
}

/// One HTTP round trip.
pub trait Transport {
    /// Sends the request and returns the raw response.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if no response was received.
    fn send(&self, request: &ApiRequest) -> Result<RawResponse, TransportError>;
}

/// Blocking `reqwest` transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// # Errors
    ///
    /// Returns [`TransportError::Other`] if the client cannot be built.
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| TransportError::Other(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: &ApiRequest) -> Result<RawResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .header(ACCEPT, JSONAPI_MEDIA_TYPE);

        builder = match &request.auth {
            Auth::None => builder,
            Auth::Bearer(token) => builder.bearer_auth(token),
            Auth::Basic { username, password } => builder.basic_auth(username, Some(password)),
        };
        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, JSONAPI_MEDIA_TYPE)
                .body(body.clone());
        }

        let response = builder.send().map_err(classify)?;
        let status = response.status().as_u16();
        let served_host = url_authority(response.url()).unwrap_or_default();
        let headers = response.headers().clone();
        let body = response.bytes().map_err(classify)?.to_vec();

        Ok(RawResponse {
            status,
            headers,
            body,
            served_host,
        })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}
