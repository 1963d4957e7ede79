//! Bearer token resolution.
//!
//! Sources are checked in a fixed order and the first one yielding a
//! non-blank token wins:
//!
//! 1. per-invocation override (`--api-token`)
//! 2. `KEYSEAT_API_TOKEN`
//! 3. the token cache file
//! 4. `api_token` in the user config file
//!
//! The resolver only reads. Absence is `None`, not an error; commands that
//! need a token turn it into [`LicenseError::NotLoggedIn`](crate::LicenseError::NotLoggedIn).

use crate::config::{ENV_API_TOKEN, ENV_API_TOKEN_FILE};
use crate::store::LocalStore;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Where a credential came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialSource {
    Flag,
    Env,
    File,
    Config,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::File => "file",
            Self::Config => "config",
        })
    }
}

/// The single token used for an invocation.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    source: CredentialSource,
}

impl Credential {
    #[must_use]
    pub fn new(token: impl Into<String>, source: CredentialSource) -> Self {
        Self {
            token: token.into(),
            source,
        }
    }

    /// The raw token. Do not log.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    #[must_use]
    pub fn source(&self) -> CredentialSource {
        self.source
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

/// The token-related environment, captured once per process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    pub api_token: Option<String>,
    pub api_token_file: Option<PathBuf>,
}

impl EnvSnapshot {
    /// Reads the process environment.
    #[must_use]
    pub fn capture() -> Self {
        Self {
            api_token: std::env::var(ENV_API_TOKEN).ok(),
            api_token_file: std::env::var_os(ENV_API_TOKEN_FILE)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
        }
    }
}

/// Resolves the credential for one invocation.
pub struct CredentialResolver<'a> {
    flag: Option<&'a str>,
    env: &'a EnvSnapshot,
    store: &'a dyn LocalStore,
    config_token: Option<&'a str>,
}

impl<'a> CredentialResolver<'a> {
    #[must_use]
    pub fn new(
        flag: Option<&'a str>,
        env: &'a EnvSnapshot,
        store: &'a dyn LocalStore,
        config_token: Option<&'a str>,
    ) -> Self {
        Self {
            flag,
            env,
            store,
            config_token,
        }
    }

    /// Returns the first credential found, in precedence order.
    ///
    /// An unreadable token file counts as absent and resolution moves on to
    /// the config file.
    #[must_use]
    pub fn resolve(&self) -> Option<Credential> {
        if let Some(token) = non_blank(self.flag) {
            return Some(self.found(token, CredentialSource::Flag));
        }
        if let Some(token) = non_blank(self.env.api_token.as_deref()) {
            return Some(self.found(token, CredentialSource::Env));
        }
        match self.store.read_token() {
            Ok(Some(token)) => {
                if let Some(token) = non_blank(Some(&token)) {
                    return Some(self.found(token, CredentialSource::File));
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "token cache unreadable, skipping"),
        }
        if let Some(token) = non_blank(self.config_token) {
            return Some(self.found(token, CredentialSource::Config));
        }
        debug!("no credential found");
        None
    }

    fn found(&self, token: &str, source: CredentialSource) -> Credential {
        debug!(%source, "credential resolved");
        Credential::new(token, source)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
