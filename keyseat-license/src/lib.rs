//! Machine-bound licensing against a Keygen-compatible service.
//!
//! This crate handles:
//! - Deterministic, low-PII machine fingerprints
//! - Bearer token resolution across flag, environment, file and config
//! - Signed API calls whose responses are verified before use
//! - Activation, deactivation and validation of per-product licenses
//! - Offline license and machine file verification and decryption
//!
//! # Design Principles
//!
//! - **Remote is authoritative**: the local license record is a cache
//! - **Verify before parse**: no body is read until its Ed25519 signature,
//!   digest, date and host binding check out
//! - **Persist after confirm**: local state changes only after the remote
//!   accepted the change

mod activation;
mod api;
mod certificate;
mod client;
mod config;
mod credential;
mod device;
mod error;
mod signature;
mod store;
mod transport;

pub use activation::{ActivationOutcome, Activator, POOL_EXHAUSTED_EXIT_CODE, validate_key};
pub use api::{
    Document, Identity, License, Links, Machine, PoolCounts, PoolStatus, Product, Relationship,
    Resource, Validation, ValidationReason,
};
pub use certificate::{Certificate, CertificateKind};
pub use client::SignedClient;
pub use config::{
    APP_DIR, ClientConfig, Config, DEFAULT_ACCOUNT_ID, DEFAULT_BASE_URL, DEFAULT_PUBLIC_KEY_HEX,
    ENV_API_TOKEN, ENV_API_TOKEN_FILE, FileConfig, Overrides, RetryPolicy, decode_public_key,
};
pub use credential::{Credential, CredentialResolver, CredentialSource, EnvSnapshot};
pub use device::{
    DEFAULT_MACHINE_ID_PATH, FingerprintStrategy, HELPER_EXECUTABLE, HelperExecutable, InProcess,
    MachineFingerprint, StrategyChain, fingerprint_from_parts, read_machine_id,
};
pub use error::{CertificateError, LicenseError, LicenseResult, SignatureError, is_transient_status};
pub use signature::{ResponseVerifier, SIGNATURE_HEADER, SignedResponse, digest_header, signing_string};
pub use store::{FileStore, HISTORY_LIMIT, LicenseRecord, LocalStore, MemoryStore, check_product_id, write_atomic};
pub use transport::{
    ApiRequest, Auth, HttpTransport, JSONAPI_MEDIA_TYPE, RawResponse, Transport, TransportError,
    normalize_target,
};
