//! Client configuration.
//!
//! Loaded from `~/.keyseat/config.toml`. Every field is optional in the
//! file; missing fields take the defaults below. Command-line overrides are
//! applied on top by the caller for a single invocation.

use crate::error::{LicenseError, LicenseResult};
use crate::device::DEFAULT_MACHINE_ID_PATH;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default service endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.keygen.sh";

/// Default account scope.
pub const DEFAULT_ACCOUNT_ID: &str = "b4ddeca5-0b33-485f-94bb-20c229fecd44";

/// Default Ed25519 verify key of the service, hex encoded.
pub const DEFAULT_PUBLIC_KEY_HEX: &str =
    "89d96e37fe21302d0a8ff8f9c2509f480ec6c6f28ec9645514a4043e3b29142b";

/// Environment variable carrying a bearer token.
pub const ENV_API_TOKEN: &str = "KEYSEAT_API_TOKEN";

/// Environment variable overriding the token cache path.
pub const ENV_API_TOKEN_FILE: &str = "KEYSEAT_API_TOKEN_FILE";

/// Directory name used under the home and working directories.
pub const APP_DIR: &str = ".keyseat";

/// Contents of the user configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Bearer token. Lowest-precedence credential source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    pub base_url: Option<String>,
    pub account_id: Option<String>,
    /// Hex-encoded Ed25519 public key used to verify responses.
    pub public_key: Option<String>,
    /// Where license records and history live.
    pub data_dir: Option<PathBuf>,
    pub machine_id_path: Option<PathBuf>,
    /// Explicit path to the `keyseat-fingerprint` helper.
    pub fingerprint_helper: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
}

impl FileConfig {
    /// Reads the config file. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Config`] if the file exists but cannot be
    /// read or parsed.
    pub fn load(path: &Path) -> LicenseResult<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(LicenseError::Config(format!("read {}: {e}", path.display())));
            }
        };
        toml::from_str(&text)
            .map_err(|e| LicenseError::Config(format!("parse {}: {e}", path.display())))
    }
}

/// Retry behaviour for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each time.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay to wait after the given (zero-based) failed attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(600),
        }
    }
}

/// Settings for the signed API client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub account_id: String,
    /// Raw Ed25519 public key bytes.
    pub public_key: [u8; 32],
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Maximum accepted age of a signed response.
    pub max_response_age: Duration,
    pub user_agent: String,
}

impl ClientConfig {
    /// Builds a config with the given endpoint and key, defaults elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Config`] if the key is not 64 hex characters.
    pub fn new(base_url: &str, account_id: &str, public_key_hex: &str) -> LicenseResult<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            account_id: account_id.to_string(),
            public_key: decode_public_key(public_key_hex)?,
            timeout: Duration::from_secs(20),
            retry: RetryPolicy::default(),
            max_response_age: Duration::from_secs(5 * 60),
            user_agent: format!("keyseat/{}", env!("CARGO_PKG_VERSION")),
        })
    }

    /// Host (with port if non-default) of the base URL.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Config`] if the base URL does not parse.
    pub fn host(&self) -> LicenseResult<String> {
        let url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| LicenseError::Config(format!("invalid base URL {}: {e}", self.base_url)))?;
        url_authority(&url)
            .ok_or_else(|| LicenseError::Config(format!("base URL has no host: {}", self.base_url)))
    }
}

/// `host[:port]` of a URL, the port only when it differs from the default.
pub(crate) fn url_authority(url: &reqwest::Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Decodes a hex Ed25519 public key.
///
/// # Errors
///
/// Returns [`LicenseError::Config`] on bad hex or wrong length.
pub fn decode_public_key(hex_key: &str) -> LicenseResult<[u8; 32]> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| LicenseError::Config(format!("public key is not hex: {e}")))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        LicenseError::Config(format!("public key must be 32 bytes, got {}", b.len()))
    })
}

/// Per-invocation overrides, typically from command-line flags.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub base_url: Option<String>,
    pub account_id: Option<String>,
    pub public_key: Option<String>,
}

/// Fully resolved configuration for one invocation.
#[derive(Debug, Clone)]
pub struct Config {
    pub client: ClientConfig,
    pub data_dir: PathBuf,
    pub token_file: PathBuf,
    pub machine_id_path: PathBuf,
    pub fingerprint_helper: Option<PathBuf>,
    /// Token from the config file, kept for credential resolution.
    pub file_token: Option<String>,
}

impl Config {
    /// Default location of the user configuration file.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(APP_DIR).join("config.toml"))
    }

    /// Resolves the configuration from file contents, the working
    /// directory, the token-file environment override and flag overrides.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Config`] if the resulting public key or
    /// base URL is unusable.
    pub fn resolve(
        file: FileConfig,
        cwd: &Path,
        token_file_env: Option<PathBuf>,
        overrides: &Overrides,
    ) -> LicenseResult<Self> {
        let base_url = overrides
            .base_url
            .clone()
            .or(file.base_url)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let account_id = overrides
            .account_id
            .clone()
            .or(file.account_id)
            .unwrap_or_else(|| DEFAULT_ACCOUNT_ID.to_string());
        let public_key = overrides
            .public_key
            .clone()
            .or(file.public_key)
            .unwrap_or_else(|| DEFAULT_PUBLIC_KEY_HEX.to_string());

        let mut client = ClientConfig::new(&base_url, &account_id, &public_key)?;
        client.host()?;
        if let Some(secs) = file.timeout_secs {
            client.timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = file.max_attempts {
            client.retry.max_attempts = attempts.max(1);
        }

        let data_dir = file.data_dir.unwrap_or_else(|| cwd.join(APP_DIR));
        let token_file = token_file_env.unwrap_or_else(|| cwd.join(APP_DIR).join("api_token"));

        Ok(Self {
            client,
            data_dir,
            token_file,
            machine_id_path: file
                .machine_id_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MACHINE_ID_PATH)),
            fingerprint_helper: file.fingerprint_helper,
            file_token: file.api_token,
        })
    }
}
