//! Offline license and machine files.
//!
//! A checked-out file is PEM-like armour around base64 JSON:
//!
//! ```text
//! -----BEGIN MACHINE FILE-----
//! eyJlbmMiOiIuLi4iLCJzaWciOiIuLi4iLCJhbGciOiJhZXMtMjU2LWdjbStlZDI1NTE5In0=
//! -----END MACHINE FILE-----
//! ```
//!
//! The JSON carries `enc` (the payload), `alg`, `sig` and optional `meta`.
//! `sig` is an Ed25519 signature over `"<kind>/<enc>"` with the kind in lower
//! case. For `aes-256-gcm+ed25519`, `enc` is `ct.iv.tag` (each base64) and
//! the AES key is `sha256(license_key)` for a license file or
//! `sha256(license_key + fingerprint)` for a machine file. For
//! `base64+ed25519`, `enc` is the base64 JSON payload itself.

use crate::error::CertificateError;
use aes_gcm::Aes256Gcm;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::debug;

const LENIENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);
const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, LENIENT);
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, LENIENT);

const AES_GCM_PREFIX: &str = "aes-256-gcm";
const BASE64_PREFIX: &str = "base64+";
const IV_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// What a certificate was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateKind {
    License,
    Machine,
}

impl CertificateKind {
    fn from_label(label: &str) -> Result<Self, CertificateError> {
        match label {
            "LICENSE" => Ok(Self::License),
            "MACHINE" => Ok(Self::Machine),
            other => Err(CertificateError::UnsupportedKind(other.to_string())),
        }
    }

    /// Armour label, e.g. `MACHINE`.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::License => "LICENSE",
            Self::Machine => "MACHINE",
        }
    }

    /// Prefix of the signed message, e.g. `machine`.
    #[must_use]
    pub fn signing_prefix(self) -> &'static str {
        match self {
            Self::License => "license",
            Self::Machine => "machine",
        }
    }
}

impl fmt::Display for CertificateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.signing_prefix())
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    enc: String,
    alg: String,
    sig: Option<String>,
    #[serde(default)]
    meta: Option<Value>,
}

/// A parsed, not yet trusted, license or machine file.
#[derive(Debug, Clone)]
pub struct Certificate {
    kind: CertificateKind,
    alg: String,
    enc: String,
    sig: Option<String>,
    meta: Option<Value>,
}

impl Certificate {
    /// Parses the armoured text. CRLF line endings and payloads wrapped over
    /// several lines are accepted.
    ///
    /// # Errors
    ///
    /// Returns [`CertificateError::Malformed`] for bad armour, base64 or
    /// JSON, and [`CertificateError::UnsupportedKind`] for kinds other than
    /// license and machine.
    pub fn parse(text: &str) -> Result<Self, CertificateError> {
        let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        let (first, rest) = lines
            .split_first()
            .ok_or_else(|| CertificateError::Malformed("empty certificate".to_string()))?;
        let label = first
            .strip_prefix("-----BEGIN ")
            .and_then(|l| l.strip_suffix(" FILE-----"))
            .ok_or_else(|| CertificateError::Malformed("bad header".to_string()))?;
        let kind = CertificateKind::from_label(label.trim())?;

        let footer = format!("-----END {} FILE-----", kind.label());
        let (last, body) = rest
            .split_last()
            .ok_or_else(|| CertificateError::Malformed("missing footer".to_string()))?;
        if *last != footer {
            return Err(CertificateError::Malformed("bad footer".to_string()));
        }

        let decoded = decode_lenient(&body.concat())
            .map_err(|_| CertificateError::Malformed("payload is not base64".to_string()))?;
        let envelope: Envelope = serde_json::from_slice(&decoded)
            .map_err(|e| CertificateError::Malformed(format!("payload is not JSON: {e}")))?;

        Ok(Self {
            kind,
            alg: envelope.alg,
            enc: envelope.enc,
            sig: envelope.sig,
            meta: envelope.meta.filter(Value::is_object),
        })
    }

    #[must_use]
    pub fn kind(&self) -> CertificateKind {
        self.kind
    }

    #[must_use]
    pub fn algorithm(&self) -> &str {
        &self.alg
    }

    #[must_use]
    pub fn meta(&self) -> Option<&Value> {
        self.meta.as_ref()
    }

    /// `meta.expiry`, if present and a valid RFC 3339 timestamp.
    #[must_use]
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        let raw = self.meta.as_ref()?.get("expiry")?.as_str()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Fails if `meta.expiry` lies before `now`. Files without an expiry
    /// pass.
    ///
    /// # Errors
    ///
    /// Returns [`CertificateError::Expired`].
    pub fn check_expiry(&self, now: DateTime<Utc>) -> Result<(), CertificateError> {
        match self.expiry() {
            Some(expiry) if expiry < now => Err(CertificateError::Expired(expiry.to_rfc3339())),
            _ => Ok(()),
        }
    }

    /// Verifies the Ed25519 signature over `"<kind>/<enc>"`.
    ///
    /// # Errors
    ///
    /// [`CertificateError::Unsigned`] when there is no signature,
    /// [`CertificateError::BadSignature`] when it or the key is invalid.
    pub fn verify(&self, public_key: &[u8; 32]) -> Result<(), CertificateError> {
        let key = VerifyingKey::from_bytes(public_key).map_err(|_| CertificateError::BadSignature)?;
        let sig = self.sig.as_deref().ok_or(CertificateError::Unsigned)?;
        let bytes = decode_lenient(sig).map_err(|_| CertificateError::BadSignature)?;
        let signature = Signature::from_slice(&bytes).map_err(|_| CertificateError::BadSignature)?;
        let message = format!("{}/{}", self.kind.signing_prefix(), self.enc);
        key.verify(message.as_bytes(), &signature)
            .map_err(|_| CertificateError::BadSignature)?;
        debug!(kind = %self.kind, "certificate signature verified");
        Ok(())
    }

    /// Decrypts (or decodes) the payload.
    ///
    /// `fingerprint` is required for machine files and ignored for license
    /// files.
    ///
    /// # Errors
    ///
    /// - [`CertificateError::FingerprintRequired`] for a machine file without one
    /// - [`CertificateError::Decryption`] for a wrong key or tampered payload
    /// - [`CertificateError::Malformed`] for a bad `enc` layout or non-JSON plaintext
    /// - [`CertificateError::UnsupportedAlgorithm`] for anything else
    pub fn decrypt(&self, license_key: &str, fingerprint: Option<&str>) -> Result<Value, CertificateError> {
        let plaintext = if self.alg.starts_with(AES_GCM_PREFIX) {
            let secret = match self.kind {
                CertificateKind::License => Sha256::digest(license_key.as_bytes()),
                CertificateKind::Machine => {
                    let fingerprint = fingerprint.ok_or(CertificateError::FingerprintRequired)?;
                    Sha256::digest(format!("{license_key}{fingerprint}").as_bytes())
                }
            };
            decrypt_aes_gcm(&secret, &self.enc)?
        } else if self.alg.starts_with(BASE64_PREFIX) {
            decode_lenient(&self.enc)
                .map_err(|_| CertificateError::Malformed("payload is not base64".to_string()))?
        } else {
            return Err(CertificateError::UnsupportedAlgorithm(self.alg.clone()));
        };

        serde_json::from_slice(&plaintext)
            .map_err(|e| CertificateError::Malformed(format!("decrypted payload is not JSON: {e}")))
    }
}

/// `enc` is `base64(ciphertext).base64(iv).base64(tag)`.
fn decrypt_aes_gcm(secret: &[u8], enc: &str) -> Result<Vec<u8>, CertificateError> {
    let mut parts = enc.split('.');
    let (Some(ct), Some(iv), Some(tag), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(CertificateError::Malformed(
            "encrypted payload must have three dot-separated parts".to_string(),
        ));
    };
    let bad_part = |_| CertificateError::Malformed("encrypted part is not base64".to_string());
    let mut sealed = decode_lenient(ct).map_err(bad_part)?;
    let iv = decode_lenient(iv).map_err(bad_part)?;
    let tag = decode_lenient(tag).map_err(bad_part)?;
    if iv.len() != IV_SIZE {
        return Err(CertificateError::Malformed(format!("IV must be {IV_SIZE} bytes")));
    }
    if tag.len() != TAG_SIZE {
        return Err(CertificateError::Malformed(format!("tag must be {TAG_SIZE} bytes")));
    }
    sealed.extend_from_slice(&tag);

    let cipher = Aes256Gcm::new_from_slice(secret).map_err(|_| CertificateError::Decryption)?;
    cipher
        .decrypt(GenericArray::from_slice(&iv), sealed.as_ref())
        .map_err(|_| CertificateError::Decryption)
}

/// Standard or URL-safe base64, padded or not.
fn decode_lenient(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD_LENIENT
        .decode(input)
        .or_else(|_| URL_SAFE_LENIENT.decode(input))
}
