//! Error types for the licensing client.

use thiserror::Error;

/// Reasons a response failed authenticity checks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// No `Keygen-Signature` header on the response.
    #[error("signature header missing")]
    MissingSignature,

    /// Signature header present but unparseable.
    #[error("malformed signature header: {0}")]
    MalformedHeader(String),

    /// Algorithm other than ed25519.
    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// `Digest` header missing or not matching the body.
    #[error("body digest mismatch")]
    DigestMismatch,

    /// `Date` header missing or unparseable.
    #[error("date header missing or invalid")]
    MissingDate,

    /// Response older than the freshness window.
    #[error("response is stale ({age_secs}s old)")]
    Stale { age_secs: i64 },

    /// Host that served the response is not the configured one.
    #[error("host mismatch: expected {expected}, response from {declared}")]
    HostMismatch { expected: String, declared: String },

    /// Ed25519 verification failed.
    #[error("signature does not verify")]
    BadSignature,

    /// The configured public key is not a valid Ed25519 key.
    #[error("invalid public key")]
    InvalidPublicKey,
}

/// Reasons an offline license or machine file was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CertificateError {
    #[error("malformed certificate: {0}")]
    Malformed(String),

    #[error("unsupported certificate kind: {0}")]
    UnsupportedKind(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("certificate is not signed")]
    Unsigned,

    #[error("certificate signature does not verify")]
    BadSignature,

    /// A machine file needs the fingerprint it was issued for.
    #[error("a machine fingerprint is required to decrypt a machine file")]
    FingerprintRequired,

    /// Wrong license key or fingerprint, or a tampered payload.
    #[error("decryption failed")]
    Decryption,

    #[error("certificate expired at {0}")]
    Expired(String),
}

/// Licensing-specific errors.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// Response authenticity could not be established.
    #[error("response signature invalid: {0}")]
    InvalidSignature(#[from] SignatureError),

    /// Transport failure after the retry budget was spent.
    #[error("network error: {0}")]
    Network(String),

    /// Non-success HTTP status that is not retried (or retries ran out).
    #[error("HTTP {status}: {detail}")]
    Http {
        status: u16,
        code: Option<String>,
        detail: String,
    },

    /// Token rejected by the service.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// No credential could be resolved.
    #[error("not logged in (run `keyseat login`, pass --api-token, or set KEYSEAT_API_TOKEN)")]
    NotLoggedIn,

    /// Fingerprint empty or outside the URL-safe base64 alphabet.
    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    /// Product id unusable as a remote filter or local file name.
    #[error("invalid product id: {0:?}")]
    InvalidProductId(String),

    /// A verified body did not have the expected shape.
    #[error("invalid response payload: {0}")]
    InvalidPayload(String),

    /// The resolved fingerprint strategy failed.
    #[error("fingerprint generation failed: {0}")]
    Fingerprint(String),

    /// Local persistence error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An offline certificate failed to parse, verify or decrypt.
    #[error("certificate rejected: {0}")]
    Certificate(#[from] CertificateError),
}

impl LicenseError {
    /// Stable machine-readable tag for this failure.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::InvalidSignature(_) => "invalid-signature",
            Self::Network(_) => "network-error",
            Self::Http { .. } => "http-error",
            Self::Unauthorized(_) => "unauthorized",
            Self::NotLoggedIn => "not-logged-in",
            Self::InvalidFingerprint(_) => "invalid-fingerprint",
            Self::InvalidProductId(_) => "invalid-product-id",
            Self::InvalidPayload(_) => "invalid-payload",
            Self::Fingerprint(_) => "fingerprint-error",
            Self::Storage(_) => "storage-error",
            Self::Config(_) => "config-error",
            Self::Serialization(_) => "serialization-error",
            Self::Certificate(_) => "certificate-error",
        }
    }

    /// Process exit code reported for this failure. Distinct per variant.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Unauthorized(_) => 10,
            Self::Network(_) => 12,
            Self::Http { .. } => 13,
            Self::InvalidSignature(_) => 14,
            Self::NotLoggedIn => 15,
            Self::InvalidFingerprint(_) => 16,
            Self::InvalidProductId(_) => 17,
            Self::InvalidPayload(_) => 18,
            Self::Fingerprint(_) => 19,
            Self::Storage(_) => 20,
            Self::Config(_) => 21,
            Self::Serialization(_) => 22,
            Self::Certificate(_) => 23,
        }
    }

    /// Returns true for failures the client may retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http { status, .. } => is_transient_status(*status),
            _ => false,
        }
    }

    /// Machine-readable error code from the service, if one was reported.
    #[must_use]
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            Self::Http { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LicenseError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Statuses worth another attempt: rate limiting and server errors.
#[must_use]
pub fn is_transient_status(status: u16) -> bool {
    status == 429 || status >= 500
}

/// Result type for license operations.
pub type LicenseResult<T> = Result<T, LicenseError>;
