//! Local persistence: token cache, license records, command history.
//!
//! Everything the client keeps on disk goes through [`LocalStore`] so the
//! state machine can run against [`MemoryStore`] in tests. [`FileStore`]
//! writes atomically (temp file in the same directory, then rename) and
//! restricts token and license files to the owner on Unix.

use crate::error::{LicenseError, LicenseResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Max lines kept in the history file.
pub const HISTORY_LIMIT: usize = 1000;

/// A license claimed for this machine, cached per product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseRecord {
    pub product_id: String,
    /// The license key handed to the licensed application.
    pub key: String,
    /// Fingerprint the license was activated for.
    pub fingerprint: String,
    pub license_id: String,
    pub machine_id: String,
    pub created_at: DateTime<Utc>,
}

/// Validates a product id for use in remote filters and file names.
///
/// # Errors
///
/// Returns [`LicenseError::InvalidProductId`] for empty ids, ids starting
/// with `.`, or characters outside `[A-Za-z0-9._-]`.
pub fn check_product_id(product_id: &str) -> LicenseResult<()> {
    let ok = !product_id.is_empty()
        && !product_id.starts_with('.')
        && product_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(LicenseError::InvalidProductId(product_id.to_string()))
    }
}

/// Storage for everything the client persists locally.
pub trait LocalStore {
    /// Reads the cached token, `None` if absent or blank.
    fn read_token(&self) -> LicenseResult<Option<String>>;
    fn write_token(&self, token: &str) -> LicenseResult<()>;
    /// Removes the cached token. Returns whether one existed.
    fn clear_token(&self) -> LicenseResult<bool>;

    fn read_license(&self, product_id: &str) -> LicenseResult<Option<LicenseRecord>>;
    /// Stores the record, replacing any record for the same product.
    fn write_license(&self, record: &LicenseRecord) -> LicenseResult<()>;
    /// Removes the record. Returns whether one existed.
    fn remove_license(&self, product_id: &str) -> LicenseResult<bool>;

    fn append_history(&self, line: &str) -> LicenseResult<()>;
    fn load_history(&self) -> LicenseResult<Vec<String>>;
}

/// Filesystem-backed store.
#[derive(Debug, Clone)]
pub struct FileStore {
    token_file: PathBuf,
    data_dir: PathBuf,
}

impl FileStore {
    #[must_use]
    pub fn new(token_file: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            token_file: token_file.into(),
            data_dir: data_dir.into(),
        }
    }

    /// Path of the record file for a product.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::InvalidProductId`] for unusable ids.
    pub fn license_path(&self, product_id: &str) -> LicenseResult<PathBuf> {
        check_product_id(product_id)?;
        Ok(self.data_dir.join(format!("license.{product_id}.json")))
    }

    #[must_use]
    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join("history")
    }
}

/// Writes `contents` to `path` via a temp file in the same directory.
///
/// # Errors
///
/// Returns [`LicenseError::Storage`] on any I/O failure; the target is left
/// untouched in that case.
pub fn write_atomic(path: &Path, contents: &[u8], owner_only: bool) -> LicenseResult<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .map_err(|e| LicenseError::Storage(format!("create {}: {e}", dir.display())))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| LicenseError::Storage(format!("temp file in {}: {e}", dir.display())))?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if owner_only {
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
    }
    #[cfg(not(unix))]
    let _ = owner_only;

    tmp.persist(path).map_err(|e| {
        LicenseError::Storage(format!("rename into {}: {}", path.display(), e.error))
    })?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> LicenseResult<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(LicenseError::Storage(format!("remove {}: {e}", path.display()))),
    }
}

fn read_optional(path: &Path) -> LicenseResult<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LicenseError::Storage(format!("read {}: {e}", path.display()))),
    }
}

impl LocalStore for FileStore {
    fn read_token(&self) -> LicenseResult<Option<String>> {
        Ok(read_optional(&self.token_file)?
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()))
    }

    fn write_token(&self, token: &str) -> LicenseResult<()> {
        write_atomic(&self.token_file, token.as_bytes(), true)?;
        debug!(path = %self.token_file.display(), "token cached");
        Ok(())
    }

    fn clear_token(&self) -> LicenseResult<bool> {
        remove_if_exists(&self.token_file)
    }

    fn read_license(&self, product_id: &str) -> LicenseResult<Option<LicenseRecord>> {
        let path = self.license_path(product_id)?;
        let Some(text) = read_optional(&path)? else {
            return Ok(None);
        };
        match serde_json::from_str::<LicenseRecord>(&text) {
            Ok(record) if record.product_id == product_id => Ok(Some(record)),
            Ok(record) => {
                warn!(
                    path = %path.display(),
                    found = %record.product_id,
                    "license record belongs to another product, ignoring"
                );
                Ok(None)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable license record, ignoring");
                Ok(None)
            }
        }
    }

    fn write_license(&self, record: &LicenseRecord) -> LicenseResult<()> {
        let path = self.license_path(&record.product_id)?;
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic(&path, &json, true)?;
        debug!(product_id = %record.product_id, path = %path.display(), "license record written");
        Ok(())
    }

    fn remove_license(&self, product_id: &str) -> LicenseResult<bool> {
        remove_if_exists(&self.license_path(product_id)?)
    }

    fn append_history(&self, line: &str) -> LicenseResult<()> {
        let mut lines = self.load_history()?;
        if lines.last().map(String::as_str) == Some(line) {
            return Ok(());
        }
        lines.push(line.to_string());
        let skip = lines.len().saturating_sub(HISTORY_LIMIT);
        let mut contents = lines[skip..].join("\n");
        contents.push('\n');
        write_atomic(&self.history_path(), contents.as_bytes(), false)
    }

    fn load_history(&self) -> LicenseResult<Vec<String>> {
        Ok(read_optional(&self.history_path())?
            .map(|text| {
                text.lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    token: Option<String>,
    licenses: BTreeMap<String, LicenseRecord>,
    history: Vec<String>,
    license_writes: usize,
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `write_license` calls so far.
    #[must_use]
    pub fn license_writes(&self) -> usize {
        self.lock().license_writes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl LocalStore for MemoryStore {
    fn read_token(&self) -> LicenseResult<Option<String>> {
        Ok(self.lock().token.clone().filter(|t| !t.trim().is_empty()))
    }

    fn write_token(&self, token: &str) -> LicenseResult<()> {
        self.lock().token = Some(token.to_string());
        Ok(())
    }

    fn clear_token(&self) -> LicenseResult<bool> {
        Ok(self.lock().token.take().is_some())
    }

    fn read_license(&self, product_id: &str) -> LicenseResult<Option<LicenseRecord>> {
        check_product_id(product_id)?;
        Ok(self.lock().licenses.get(product_id).cloned())
    }

    fn write_license(&self, record: &LicenseRecord) -> LicenseResult<()> {
        check_product_id(&record.product_id)?;
        let mut state = self.lock();
        state.license_writes += 1;
        state.licenses.insert(record.product_id.clone(), record.clone());
        Ok(())
    }

    fn remove_license(&self, product_id: &str) -> LicenseResult<bool> {
        check_product_id(product_id)?;
        Ok(self.lock().licenses.remove(product_id).is_some())
    }

    fn append_history(&self, line: &str) -> LicenseResult<()> {
        let mut state = self.lock();
        if state.history.last().map(String::as_str) != Some(line) {
            state.history.push(line.to_string());
        }
        Ok(())
    }

    fn load_history(&self) -> LicenseResult<Vec<String>> {
        Ok(self.lock().history.clone())
    }
}
