//! Machine fingerprinting for license binding.
//!
//! A fingerprint is `base64url_nopad(sha256(parts.join("|")))` where the parts
//! are, in order and only when present:
//!
//! - `mid:<machine-id>` read from the platform identity file
//! - `salt:<salt>` supplied by the caller
//!
//! Nothing else about the host goes into the digest. Two strategies compute
//! it: the `keyseat-fingerprint` helper executable and an in-process
//! implementation. They must agree byte for byte.

use crate::error::{LicenseError, LicenseResult};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Default identity file on Linux hosts.
pub const DEFAULT_MACHINE_ID_PATH: &str = "/etc/machine-id";

/// File name of the helper executable.
pub const HELPER_EXECUTABLE: &str = "keyseat-fingerprint";

const PART_SEPARATOR: &str = "|";

/// A stable fingerprint that identifies this machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineFingerprint(String);

impl MachineFingerprint {
    /// Wraps a caller-supplied fingerprint, e.g. from `--fingerprint`.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::InvalidFingerprint`] if the value is empty or
    /// contains characters outside the URL-safe base64 alphabet.
    pub fn parse(value: &str) -> LicenseResult<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(LicenseError::InvalidFingerprint("empty".to_string()));
        }
        if let Some(bad) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(LicenseError::InvalidFingerprint(format!(
                "unexpected character {bad:?}"
            )));
        }
        Ok(Self(value.to_string()))
    }

    /// Returns the fingerprint string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes the fingerprint from already-gathered inputs.
///
/// Empty inputs are treated as absent. With no parts at all the digest is
/// taken over the empty string.
#[must_use]
pub fn fingerprint_from_parts(machine_id: Option<&str>, salt: Option<&str>) -> MachineFingerprint {
    let mut parts: Vec<String> = Vec::with_capacity(2);
    if let Some(mid) = machine_id.map(str::trim).filter(|m| !m.is_empty()) {
        parts.push(format!("mid:{mid}"));
    }
    if let Some(salt) = salt.filter(|s| !s.is_empty()) {
        parts.push(format!("salt:{salt}"));
    }
    let joined = parts.join(PART_SEPARATOR);

    let digest = Sha256::digest(joined.as_bytes());
    MachineFingerprint(URL_SAFE_NO_PAD.encode(digest))
}

/// Reads the machine identifier, treating any failure as absence.
#[must_use]
pub fn read_machine_id(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let trimmed = content.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "machine id unavailable");
            None
        }
    }
}

/// One way of computing the machine fingerprint.
pub trait FingerprintStrategy {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this strategy can run here. Only checks resolution
    /// (e.g. the executable exists), never runs the computation.
    fn is_available(&self) -> bool;

    /// Computes the fingerprint for the given salt.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Fingerprint`] if the computation itself fails.
    fn compute_fingerprint(&self, salt: Option<&str>) -> LicenseResult<MachineFingerprint>;
}

/// Computes the fingerprint in-process. Always available.
#[derive(Debug, Clone)]
pub struct InProcess {
    machine_id_path: PathBuf,
}

impl InProcess {
    /// Creates a strategy reading the given identity file.
    #[must_use]
    pub fn new(machine_id_path: impl Into<PathBuf>) -> Self {
        Self {
            machine_id_path: machine_id_path.into(),
        }
    }
}

impl Default for InProcess {
    fn default() -> Self {
        Self::new(DEFAULT_MACHINE_ID_PATH)
    }
}

impl FingerprintStrategy for InProcess {
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn compute_fingerprint(&self, salt: Option<&str>) -> LicenseResult<MachineFingerprint> {
        let machine_id = read_machine_id(&self.machine_id_path);
        Ok(fingerprint_from_parts(machine_id.as_deref(), salt))
    }
}

/// Runs the `keyseat-fingerprint` helper and reads its output.
#[derive(Debug, Clone)]
pub struct HelperExecutable {
    program: PathBuf,
    machine_id_path: PathBuf,
}

impl HelperExecutable {
    /// Creates a strategy for an explicit helper path.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, machine_id_path: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            machine_id_path: machine_id_path.into(),
        }
    }

    /// Locates the helper next to the running executable, then on `PATH`.
    #[must_use]
    pub fn locate(machine_id_path: impl Into<PathBuf>) -> Option<Self> {
        let machine_id_path = machine_id_path.into();
        let file_name = format!("{HELPER_EXECUTABLE}{}", std::env::consts::EXE_SUFFIX);

        let beside_current = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&file_name)));
        let on_path = std::env::var_os("PATH")
            .map(|paths| {
                std::env::split_paths(&paths)
                    .map(|dir| dir.join(&file_name))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        beside_current
            .into_iter()
            .chain(on_path)
            .find(|candidate| is_executable(candidate))
            .map(|program| Self::new(program, machine_id_path))
    }
}

impl FingerprintStrategy for HelperExecutable {
    fn name(&self) -> &'static str {
        "helper-executable"
    }

    fn is_available(&self) -> bool {
        is_executable(&self.program)
    }

    fn compute_fingerprint(&self, salt: Option<&str>) -> LicenseResult<MachineFingerprint> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--machine-id-file").arg(&self.machine_id_path);
        if let Some(salt) = salt.filter(|s| !s.is_empty()) {
            cmd.arg("--salt").arg(salt);
        }

        let output = cmd.output().map_err(|e| {
            LicenseError::Fingerprint(format!("spawn {}: {e}", self.program.display()))
        })?;
        if !output.status.success() {
            return Err(LicenseError::Fingerprint(format!(
                "{} exited with {}",
                self.program.display(),
                output.status
            )));
        }

        let stdout = String::from_utf8(output.stdout)
            .map_err(|_| LicenseError::Fingerprint("helper output is not UTF-8".to_string()))?;
        let line = stdout.lines().next().unwrap_or_default();
        MachineFingerprint::parse(line)
            .map_err(|e| LicenseError::Fingerprint(format!("helper output rejected: {e}")))
    }
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Ranked list of strategies. The first available one is used.
pub struct StrategyChain {
    strategies: Vec<Box<dyn FingerprintStrategy>>,
}

impl StrategyChain {
    /// Creates a chain from strategies in preference order.
    #[must_use]
    pub fn new(strategies: Vec<Box<dyn FingerprintStrategy>>) -> Self {
        Self { strategies }
    }

    /// The standard chain: helper executable (if found) then in-process.
    #[must_use]
    pub fn standard(helper_override: Option<&Path>, machine_id_path: &Path) -> Self {
        let mut strategies: Vec<Box<dyn FingerprintStrategy>> = Vec::with_capacity(2);
        match helper_override {
            Some(program) => {
                strategies.push(Box::new(HelperExecutable::new(program, machine_id_path)));
            }
            None => {
                if let Some(helper) = HelperExecutable::locate(machine_id_path) {
                    strategies.push(Box::new(helper));
                }
            }
        }
        strategies.push(Box::new(InProcess::new(machine_id_path)));
        Self::new(strategies)
    }

    /// Selects the first available strategy.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Fingerprint`] if no strategy is available.
    pub fn resolve(self) -> LicenseResult<Box<dyn FingerprintStrategy>> {
        let selected = self
            .strategies
            .into_iter()
            .find(|s| s.is_available())
            .ok_or_else(|| {
                LicenseError::Fingerprint("no fingerprint strategy available".to_string())
            })?;
        info!(strategy = selected.name(), "fingerprint strategy selected");
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_parts_hash_empty_string() {
        // sha256("") = e3b0c442...b855
        let fp = fingerprint_from_parts(None, None);
        assert_eq!(fp.as_str(), "47DEQpj8HBSa-_TImW-5JCeuQeRkm5NMpJWZG3hSuFU");
    }

    #[test]
    fn empty_values_are_absent() {
        assert_eq!(
            fingerprint_from_parts(Some("  \n"), Some("")),
            fingerprint_from_parts(None, None)
        );
    }

    #[test]
    fn machine_id_is_trimmed() {
        assert_eq!(
            fingerprint_from_parts(Some("abc123\n"), None),
            fingerprint_from_parts(Some("abc123"), None)
        );
    }

    #[test]
    fn output_is_unpadded_urlsafe() {
        let fp = fingerprint_from_parts(Some("abc123"), Some("tenant-x"));
        assert_eq!(fp.as_str().len(), 43);
        assert!(MachineFingerprint::parse(fp.as_str()).is_ok());
    }

    #[test]
    fn parse_rejects_empty_and_foreign_chars() {
        assert!(MachineFingerprint::parse("").is_err());
        assert!(MachineFingerprint::parse("   ").is_err());
        assert!(MachineFingerprint::parse("abc/def").is_err());
        assert!(MachineFingerprint::parse("abc=").is_err());
        assert!(MachineFingerprint::parse("abc-DEF_123").is_ok());
    }

    #[test]
    fn missing_helper_is_unavailable() {
        let helper =
            HelperExecutable::new("/nonexistent/keyseat-fingerprint", DEFAULT_MACHINE_ID_PATH);
        assert!(!helper.is_available());
    }

    #[test]
    fn chain_falls_back_when_helper_missing() {
        let chain = StrategyChain::standard(
            Some(Path::new("/nonexistent/keyseat-fingerprint")),
            Path::new(DEFAULT_MACHINE_ID_PATH),
        );
        let selected = chain.resolve().unwrap();
        assert_eq!(selected.name(), "in-process");
    }

    #[test]
    fn empty_chain_fails() {
        assert!(StrategyChain::new(Vec::new()).resolve().is_err());
    }
}
