//! Activation state machine.
//!
//! ```text
//! Unknown ──activate──▶ Activated ──deactivate──▶ Deactivated
//!    └──────────── validate (read-only, any state) ────────────┘
//! ```
//!
//! The remote service is authoritative. The local [`LicenseRecord`] only
//! saves a redundant write and hands the key to the licensed application;
//! it is written after the remote confirms a claim and removed after the
//! remote confirms a release, never before.

use crate::api::{License, Machine, Validation};
use crate::client::SignedClient;
use crate::credential::Credential;
use crate::device::MachineFingerprint;
use crate::error::{LicenseError, LicenseResult};
use crate::store::{LicenseRecord, LocalStore, check_product_id};
use crate::transport::Transport;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::fmt;
use tracing::{debug, info, warn};

/// Remote error codes meaning no seat is left.
const LIMIT_CODES: &[&str] = &["MACHINE_LIMIT_EXCEEDED", "LICENSE_LIMIT_EXCEEDED"];

/// Remote error code for a fingerprint already bound on the license.
const FINGERPRINT_TAKEN: &str = "FINGERPRINT_TAKEN";

/// Exit code reported for [`ActivationOutcome::PoolExhausted`].
pub const POOL_EXHAUSTED_EXIT_CODE: i32 = 11;

/// Result of a state-changing license operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum ActivationOutcome {
    /// A license was claimed and the record written.
    Activated { record: LicenseRecord },
    /// The machine already held a license for the product.
    AlreadyActivated { record: LicenseRecord },
    /// No unclaimed license is left for the product.
    PoolExhausted { product_id: String },
    /// The activation was released remotely and locally.
    Deactivated { product_id: String },
    /// Nothing to release; any stale local record was removed.
    NotFound { product_id: String },
}

impl ActivationOutcome {
    /// Stable machine-readable tag.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Activated { .. } => "activated",
            Self::AlreadyActivated { .. } => "already-activated",
            Self::PoolExhausted { .. } => "pool-exhausted",
            Self::Deactivated { .. } => "deactivated",
            Self::NotFound { .. } => "not-found",
        }
    }

    /// Process exit code. Only pool exhaustion is non-zero.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::PoolExhausted { .. } => POOL_EXHAUSTED_EXIT_CODE,
            _ => 0,
        }
    }

    /// The record held after the operation, if any.
    #[must_use]
    pub fn record(&self) -> Option<&LicenseRecord> {
        match self {
            Self::Activated { record } | Self::AlreadyActivated { record } => Some(record),
            _ => None,
        }
    }
}

impl fmt::Display for ActivationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Activated { record } => write!(f, "activated {}", record.product_id),
            Self::AlreadyActivated { record } => {
                write!(f, "{} already activated on this machine", record.product_id)
            }
            Self::PoolExhausted { product_id } => write!(
                f,
                "no free license left for {product_id}; deactivate another machine or add licenses"
            ),
            Self::Deactivated { product_id } => write!(f, "deactivated {product_id}"),
            Self::NotFound { product_id } => {
                write!(f, "{product_id} is not activated on this machine")
            }
        }
    }
}

/// Drives activation, deactivation and validation for one invocation.
pub struct Activator<'a, T: Transport> {
    client: &'a SignedClient<T>,
    store: &'a dyn LocalStore,
    credential: &'a Credential,
}

impl<'a, T: Transport> Activator<'a, T> {
    #[must_use]
    pub fn new(
        client: &'a SignedClient<T>,
        store: &'a dyn LocalStore,
        credential: &'a Credential,
    ) -> Self {
        Self {
            client,
            store,
            credential,
        }
    }

    /// Claims a license of `product_id` for this machine.
    ///
    /// Idempotent: when the remote already has the machine, returns
    /// [`ActivationOutcome::AlreadyActivated`] and writes only if the local
    /// record is missing or stale.
    ///
    /// # Errors
    ///
    /// Network, signature and HTTP failures are returned without touching
    /// local state. A storage failure after a successful claim is returned
    /// as [`LicenseError::Storage`]; the remote activation stands.
    pub fn activate(
        &self,
        product_id: &str,
        fingerprint: &MachineFingerprint,
    ) -> LicenseResult<ActivationOutcome> {
        check_product_id(product_id)?;
        let fingerprint = MachineFingerprint::parse(fingerprint.as_str())?;

        if let Some(machine) = self.client.find_machine(self.credential, &fingerprint, product_id)? {
            return self.adopt(product_id, &fingerprint, &machine);
        }

        if self.store.remove_license(product_id)? {
            warn!(product_id, "remote has no activation, discarded stale local record");
        }

        let Some(license) = self
            .client
            .find_unactivated_license(self.credential, product_id)?
        else {
            info!(product_id, "no unactivated license left");
            return Ok(ActivationOutcome::PoolExhausted {
                product_id: product_id.to_string(),
            });
        };

        debug!(product_id, license_id = %license.id, "claiming license");
        let metadata = machine_metadata();
        let machine = match self.client.activate_machine(
            self.credential,
            &fingerprint,
            &license.id,
            &metadata,
        ) {
            Ok(machine) => machine,
            Err(err) if is_pool_exhausted(&err) => {
                info!(product_id, "license limit reached during claim");
                return Ok(ActivationOutcome::PoolExhausted {
                    product_id: product_id.to_string(),
                });
            }
            Err(err) if err.remote_code() == Some(FINGERPRINT_TAKEN) => {
                info!(product_id, "fingerprint claimed concurrently, re-reading");
                let machine = self
                    .client
                    .find_machine(self.credential, &fingerprint, product_id)?
                    .ok_or(err)?;
                return self.adopt(product_id, &fingerprint, &machine);
            }
            Err(err) => return Err(err),
        };

        let record = self.record_for(product_id, &fingerprint, &license, &machine)?;
        self.store.write_license(&record)?;
        info!(product_id, machine_id = %record.machine_id, "activated");
        Ok(ActivationOutcome::Activated { record })
    }

    /// Releases this machine's activation for `product_id`.
    ///
    /// # Errors
    ///
    /// Network, signature and non-404 HTTP failures are returned and the
    /// local record is kept.
    pub fn deactivate(
        &self,
        product_id: &str,
        fingerprint: &MachineFingerprint,
    ) -> LicenseResult<ActivationOutcome> {
        check_product_id(product_id)?;
        let fingerprint = MachineFingerprint::parse(fingerprint.as_str())?;
        let not_found = || ActivationOutcome::NotFound {
            product_id: product_id.to_string(),
        };

        let Some(machine) = self.client.find_machine(self.credential, &fingerprint, product_id)? else {
            if self.store.remove_license(product_id)? {
                warn!(product_id, "remote has no activation, removed stale local record");
            }
            return Ok(not_found());
        };

        match self.client.deactivate_machine(self.credential, &machine.id) {
            Ok(()) => {}
            Err(LicenseError::Http { status: 404, .. }) => {
                self.store.remove_license(product_id)?;
                debug!(product_id, machine_id = %machine.id, "machine vanished before delete");
                return Ok(not_found());
            }
            Err(err) => {
                warn!(product_id, error = %err, "deactivation failed, local record kept");
                return Err(err);
            }
        }

        self.store.remove_license(product_id)?;
        info!(product_id, machine_id = %machine.id, "deactivated");
        Ok(ActivationOutcome::Deactivated {
            product_id: product_id.to_string(),
        })
    }

    /// Checks a key against this machine. Read-only.
    ///
    /// # Errors
    ///
    /// Propagates request failures. An invalid key is `Ok` with
    /// `valid == false`.
    pub fn validate(&self, key: &str, fingerprint: &MachineFingerprint) -> LicenseResult<Validation> {
        validate_key(self.client, Some(self.credential), key, fingerprint)
    }

    /// Ensures a local record matches the remote machine.
    fn adopt(
        &self,
        product_id: &str,
        fingerprint: &MachineFingerprint,
        machine: &Machine,
    ) -> LicenseResult<ActivationOutcome> {
        if let Some(record) = self.store.read_license(product_id)? {
            if record.fingerprint == fingerprint.as_str() && record.machine_id == machine.id {
                debug!(product_id, "local record current");
                return Ok(ActivationOutcome::AlreadyActivated { record });
            }
        }

        let license_id = machine.license_id.as_deref().ok_or_else(|| {
            LicenseError::InvalidPayload(format!("machine {} has no license", machine.id))
        })?;
        let license = self.client.retrieve_license(self.credential, license_id)?;
        let record = self.record_for(product_id, fingerprint, &license, machine)?;
        self.store.write_license(&record)?;
        info!(product_id, "restored local record from remote activation");
        Ok(ActivationOutcome::AlreadyActivated { record })
    }

    fn record_for(
        &self,
        product_id: &str,
        fingerprint: &MachineFingerprint,
        license: &License,
        machine: &Machine,
    ) -> LicenseResult<LicenseRecord> {
        let key = license.key.clone().ok_or_else(|| {
            LicenseError::InvalidPayload(format!("license {} has no key", license.id))
        })?;
        Ok(LicenseRecord {
            product_id: product_id.to_string(),
            key,
            fingerprint: fingerprint.as_str().to_string(),
            license_id: license.id.clone(),
            machine_id: machine.id.clone(),
            created_at: Utc::now(),
        })
    }
}

/// Validates a key, optionally without a credential (license-key auth).
///
/// # Errors
///
/// Propagates request failures.
pub fn validate_key<T: Transport>(
    client: &SignedClient<T>,
    credential: Option<&Credential>,
    key: &str,
    fingerprint: &MachineFingerprint,
) -> LicenseResult<Validation> {
    let fingerprint = MachineFingerprint::parse(fingerprint.as_str())?;
    let validation = client.validate_key(credential, key, &fingerprint)?;
    debug!(valid = validation.valid, code = %validation.code, "key validated");
    Ok(validation)
}

fn is_pool_exhausted(err: &LicenseError) -> bool {
    match err {
        LicenseError::Http { status: 402, .. } => true,
        LicenseError::Http { code: Some(code), .. } => LIMIT_CODES.contains(&code.as_str()),
        _ => false,
    }
}

fn machine_metadata() -> serde_json::Value {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default();
    json!({
        "hostname": host,
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "client": format!("keyseat/{}", env!("CARGO_PKG_VERSION")),
    })
}
