//! Response signature verification.
//!
//! Every response from the service carries a detached Ed25519 signature in
//! the `Keygen-Signature` header:
//!
//! ```text
//! keyid="<account>", algorithm="ed25519", signature="<base64>", headers="(request-target) host date digest"
//! ```
//!
//! The signed message is
//!
//! ```text
//! (request-target): <method> <path?query>\n
//! host: <host>\n
//! date: <Date header>\n
//! digest: sha-256=<base64(sha256(body))>
//! ```
//!
//! `host` is always the configured host, never one taken from the response,
//! so a response signed for another deployment does not verify. The host
//! that actually served the response must also equal the configured one.

use crate::error::SignatureError;
use crate::transport::RawResponse;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use reqwest::Method;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Response header carrying the signature.
pub const SIGNATURE_HEADER: &str = "Keygen-Signature";

/// A response whose signature and host binding have been verified.
///
/// Only this type exposes the body, so nothing can parse an unverified one.
#[derive(Debug, Clone)]
pub struct SignedResponse {
    status: u16,
    body: Vec<u8>,
}

impl SignedResponse {
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Parses the verified body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`crate::LicenseError::InvalidPayload`] if the body does not
    /// match `T`.
    pub fn json<T: DeserializeOwned>(&self) -> crate::LicenseResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| crate::LicenseError::InvalidPayload(e.to_string()))
    }
}

/// `sha-256=<base64>` digest of a body, as sent in the `Digest` header.
#[must_use]
pub fn digest_header(body: &[u8]) -> String {
    format!("sha-256={}", BASE64.encode(Sha256::digest(body)))
}

/// Builds the message covered by the signature.
#[must_use]
pub fn signing_string(method: &Method, target: &str, host: &str, date: &str, digest: &str) -> String {
    format!(
        "(request-target): {} {target}\nhost: {host}\ndate: {date}\ndigest: {digest}",
        method.as_str().to_ascii_lowercase()
    )
}

/// Parsed `Keygen-Signature` header.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SignatureParams {
    algorithm: String,
    signature: String,
}

fn parse_signature_header(value: &str) -> Result<SignatureParams, SignatureError> {
    let mut algorithm = None;
    let mut signature = None;
    for part in value.split(',') {
        let Some((key, val)) = part.split_once('=') else {
            continue;
        };
        let val = val.trim().trim_matches('"');
        match key.trim() {
            "algorithm" => algorithm = Some(val.to_string()),
            "signature" => signature = Some(val.to_string()),
            _ => {}
        }
    }
    let algorithm =
        algorithm.ok_or_else(|| SignatureError::MalformedHeader("no algorithm".to_string()))?;
    let signature =
        signature.ok_or_else(|| SignatureError::MalformedHeader("no signature".to_string()))?;
    Ok(SignatureParams {
        algorithm,
        signature,
    })
}

/// Verifies responses against a fixed key and host.
#[derive(Debug, Clone)]
pub struct ResponseVerifier {
    key: VerifyingKey,
    host: String,
    max_age: Duration,
}

impl ResponseVerifier {
    /// # Errors
    ///
    /// Returns [`SignatureError::InvalidPublicKey`] if the bytes are not a
    /// valid Ed25519 point.
    pub fn new(public_key: &[u8; 32], host: &str, max_age: Duration) -> Result<Self, SignatureError> {
        let key = VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;
        Ok(Self {
            key,
            host: host.to_string(),
            max_age,
        })
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Checks host binding, digest, freshness and signature, in that order.
    /// The body is handed out only if all pass.
    ///
    /// # Errors
    ///
    /// Returns the first [`SignatureError`] encountered.
    pub fn verify(
        &self,
        method: &Method,
        target: &str,
        response: RawResponse,
        now: DateTime<Utc>,
    ) -> Result<SignedResponse, SignatureError> {
        if response.served_host != self.host {
            return Err(SignatureError::HostMismatch {
                expected: self.host.clone(),
                declared: response.served_host,
            });
        }

        let header = response
            .header(SIGNATURE_HEADER)
            .ok_or(SignatureError::MissingSignature)?;
        let params = parse_signature_header(header)?;
        if !params.algorithm.eq_ignore_ascii_case("ed25519") {
            return Err(SignatureError::UnsupportedAlgorithm(params.algorithm));
        }

        let digest = digest_header(&response.body);
        if response.header("Digest") != Some(digest.as_str()) {
            return Err(SignatureError::DigestMismatch);
        }

        let date = response.header("Date").ok_or(SignatureError::MissingDate)?;
        let sent_at = DateTime::parse_from_rfc2822(date)
            .map_err(|_| SignatureError::MissingDate)?
            .with_timezone(&Utc);
        let age_secs = (now - sent_at).num_seconds();
        let max_age = i64::try_from(self.max_age.as_secs()).unwrap_or(i64::MAX);
        if age_secs.abs() > max_age {
            return Err(SignatureError::Stale { age_secs });
        }

        let sig_bytes = BASE64
            .decode(params.signature.as_bytes())
            .map_err(|_| SignatureError::MalformedHeader("signature is not base64".to_string()))?;
        let signature = Signature::from_slice(&sig_bytes).map_err(|_| SignatureError::BadSignature)?;

        let message = signing_string(method, target, &self.host, date, &digest);
        self.key
            .verify(message.as_bytes(), &signature)
            .map_err(|_| SignatureError::BadSignature)?;

        Ok(SignedResponse {
            status: response.status,
            body: response.body,
        })
    }
}
