//! Signed API client.
//!
//! Wraps a [`Transport`] with the account scope, credentials, retry policy
//! and response verification. Callers only ever see [`SignedResponse`]s.

use crate::config::ClientConfig;
use crate::credential::Credential;
use crate::error::{LicenseError, LicenseResult, is_transient_status};
use crate::signature::{ResponseVerifier, SignedResponse};
use crate::transport::{ApiRequest, Auth, HttpTransport, RawResponse, Transport};
use chrono::Utc;
use reqwest::Method;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on a server-requested `Retry-After`.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct ErrorDocument {
    #[serde(default)]
    errors: Vec<ErrorObject>,
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    title: Option<String>,
    detail: Option<String>,
    code: Option<String>,
}

/// Client for the license service.
pub struct SignedClient<T: Transport = HttpTransport> {
    config: ClientConfig,
    transport: T,
    verifier: ResponseVerifier,
}

impl SignedClient<HttpTransport> {
    /// Builds a client over blocking HTTP.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Config`] for an unusable base URL or key.
    pub fn connect(config: ClientConfig) -> LicenseResult<Self> {
        let transport = HttpTransport::new(config.timeout, &config.user_agent)
            .map_err(|e| LicenseError::Config(e.to_string()))?;
        Self::with_transport(config, transport)
    }
}

impl<T: Transport> SignedClient<T> {
    /// Builds a client over an arbitrary transport.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Config`] for an unusable base URL or key.
    pub fn with_transport(config: ClientConfig, transport: T) -> LicenseResult<Self> {
        let host = config.host()?;
        let verifier = ResponseVerifier::new(&config.public_key, &host, config.max_response_age)
            .map_err(|e| LicenseError::Config(e.to_string()))?;
        Ok(Self {
            config,
            transport,
            verifier,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// URL for an account-scoped path such as `/machines`.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Config`] if the URL does not parse.
    pub fn account_url(&self, path: &str, query: &[(&str, &str)]) -> LicenseResult<reqwest::Url> {
        let raw = format!(
            "{}/v1/accounts/{}{path}",
            self.config.base_url, self.config.account_id
        );
        let mut url = reqwest::Url::parse(&raw)
            .map_err(|e| LicenseError::Config(format!("invalid request URL {raw}: {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    /// Resolves a pagination link (absolute or root-relative) against the
    /// base URL.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::InvalidPayload`] if the link does not parse.
    pub fn resolve_link(&self, link: &str) -> LicenseResult<reqwest::Url> {
        let base = reqwest::Url::parse(&format!("{}/", self.config.base_url))
            .map_err(|e| LicenseError::Config(e.to_string()))?;
        base.join(link)
            .map_err(|e| LicenseError::InvalidPayload(format!("bad link {link}: {e}")))
    }

    /// Builds a request with the credential attached.
    #[must_use]
    pub fn request(
        &self,
        method: Method,
        url: reqwest::Url,
        credential: Option<&Credential>,
    ) -> ApiRequest {
        let retryable = matches!(method, Method::GET | Method::DELETE);
        ApiRequest {
            method,
            url,
            auth: credential.map_or(Auth::None, |c| Auth::Bearer(c.token().to_string())),
            body: None,
            retryable,
        }
    }

    /// Sends the request, retrying transient failures when allowed, and
    /// verifies the final response.
    ///
    /// # Errors
    ///
    /// - [`LicenseError::Network`] when no response arrived within the budget
    /// - [`LicenseError::InvalidSignature`] when verification fails
    /// - [`LicenseError::Unauthorized`] for 401/403
    /// - [`LicenseError::Http`] for other non-success statuses
    pub fn call(&self, request: &ApiRequest) -> LicenseResult<SignedResponse> {
        let attempts = if request.retryable {
            self.config.retry.max_attempts.max(1)
        } else {
            1
        };
        let target = request.target();

        let mut last_err = None;
        let mut next_delay = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = next_delay
                    .take()
                    .unwrap_or_else(|| self.config.retry.delay_for(attempt - 1));
                debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off");
                std::thread::sleep(delay);
            }

            debug!(method = %request.method, %target, attempt, "sending request");
            match self.transport.send(request) {
                Err(e) => {
                    warn!(method = %request.method, %target, attempt, error = %e, "request failed");
                    last_err = Some(LicenseError::Network(e.to_string()));
                }
                Ok(raw) if is_transient_status(raw.status) => {
                    warn!(method = %request.method, %target, attempt, status = raw.status, "transient status");
                    next_delay = retry_after(&raw);
                    last_err = Some(LicenseError::Http {
                        status: raw.status,
                        code: None,
                        detail: "service unavailable".to_string(),
                    });
                }
                Ok(raw) => return self.finish(request, &target, raw),
            }
        }

        Err(last_err.unwrap_or_else(|| LicenseError::Network("no attempt made".to_string())))
    }

    fn finish(
        &self,
        request: &ApiRequest,
        target: &str,
        raw: RawResponse,
    ) -> LicenseResult<SignedResponse> {
        let signed = self
            .verifier
            .verify(&request.method, target, raw, Utc::now())
            .inspect_err(|e| {
                warn!(method = %request.method, %target, error = %e, "response rejected");
            })?;

        let status = signed.status();
        if (200..300).contains(&status) {
            debug!(method = %request.method, %target, status, "verified response");
            return Ok(signed);
        }

        let (code, detail) = describe_error(&signed);
        match status {
            401 | 403 => Err(LicenseError::Unauthorized(detail)),
            _ => Err(LicenseError::Http {
                status,
                code,
                detail,
            }),
        }
    }
}

fn retry_after(raw: &RawResponse) -> Option<Duration> {
    raw.header("Retry-After")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}

/// First error code and message from a verified error document.
fn describe_error(signed: &SignedResponse) -> (Option<String>, String) {
    let fallback = format!("status {}", signed.status());
    match signed.json::<ErrorDocument>() {
        Ok(doc) => match doc.errors.into_iter().next() {
            Some(err) => {
                let detail = match (err.title, err.detail) {
                    (Some(t), Some(d)) => format!("{t}: {d}"),
                    (Some(m), None) | (None, Some(m)) => m,
                    (None, None) => fallback,
                };
                (err.code, detail)
            }
            None => (None, fallback),
        },
        Err(_) => (None, fallback),
    }
}
