//! Command handlers.
//!
//! Each handler writes human-readable output to `out` and returns the
//! process exit code. Failures are [`LicenseError`]s so the caller can map
//! them to their documented exit codes.

use crate::cli::{Command, FingerprintArgs, GlobalArgs};
use chrono::Utc;
use keyseat_license::{
    Activator, Certificate, CertificateKind, Config, Credential, CredentialResolver, EnvSnapshot,
    FileConfig, FileStore, FingerprintStrategy, LicenseError, LicenseResult, LocalStore,
    MachineFingerprint, Overrides, SignedClient, StrategyChain, validate_key,
};
use std::cell::OnceCell;
use std::io::{BufRead, IsTerminal, Write};
use std::path::Path;
use tracing::{debug, info};

/// Exit code when a validated key is not valid for this machine.
pub const KEY_INVALID_EXIT_CODE: i32 = 1;

/// Where a missing password is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PasswordPrompt {
    /// The controlling terminal, without echo.
    Terminal,
    /// The command's input stream.
    #[default]
    Input,
}

impl PasswordPrompt {
    /// `Terminal` when standard input is a TTY, else `Input`.
    #[must_use]
    pub fn detect() -> Self {
        if std::io::stdin().is_terminal() {
            Self::Terminal
        } else {
            Self::Input
        }
    }
}

/// Everything a command needs for one invocation.
pub struct Session<S: LocalStore = FileStore> {
    config: Config,
    store: S,
    env: EnvSnapshot,
    api_token: Option<String>,
    password_prompt: PasswordPrompt,
    strategy: OnceCell<Box<dyn FingerprintStrategy>>,
}

impl Session<FileStore> {
    /// Loads configuration and opens the on-disk store.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Config`] for an unreadable config file or
    /// unusable overrides.
    pub fn open(global: &GlobalArgs, env: EnvSnapshot, cwd: &Path) -> LicenseResult<Self> {
        let config_path = global.config.clone().or_else(Config::default_path);
        let file = match &config_path {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        let overrides = Overrides {
            base_url: global.base_url.clone(),
            account_id: global.account_id.clone(),
            public_key: global.public_key.clone(),
        };
        let config = Config::resolve(file, cwd, env.api_token_file.clone(), &overrides)?;
        debug!(
            base_url = %config.client.base_url,
            data_dir = %config.data_dir.display(),
            "configuration resolved"
        );
        let store = FileStore::new(&config.token_file, &config.data_dir);
        Ok(Self::new(config, store, env, global.api_token.clone()))
    }
}

impl<S: LocalStore> Session<S> {
    #[must_use]
    pub fn new(config: Config, store: S, env: EnvSnapshot, api_token: Option<String>) -> Self {
        Self {
            config,
            store,
            env,
            api_token,
            password_prompt: PasswordPrompt::default(),
            strategy: OnceCell::new(),
        }
    }

    /// Sets how `login` asks for a password it was not given.
    #[must_use]
    pub fn with_password_prompt(mut self, prompt: PasswordPrompt) -> Self {
        self.password_prompt = prompt;
        self
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Resolves the credential, if any source provides one.
    #[must_use]
    pub fn credential(&self) -> Option<Credential> {
        CredentialResolver::new(
            self.api_token.as_deref(),
            &self.env,
            &self.store,
            self.config.file_token.as_deref(),
        )
        .resolve()
    }

    /// Like [`Self::credential`] but absence is [`LicenseError::NotLoggedIn`].
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::NotLoggedIn`] when no source has a token.
    pub fn require_credential(&self) -> LicenseResult<Credential> {
        self.credential().ok_or(LicenseError::NotLoggedIn)
    }

    fn client(&self) -> LicenseResult<SignedClient> {
        SignedClient::connect(self.config.client.clone())
    }

    /// The fingerprint strategy, resolved on first use and kept.
    fn strategy(&self) -> LicenseResult<&dyn FingerprintStrategy> {
        if let Some(strategy) = self.strategy.get() {
            return Ok(strategy.as_ref());
        }
        let resolved = StrategyChain::standard(
            self.config.fingerprint_helper.as_deref(),
            &self.config.machine_id_path,
        )
        .resolve()?;
        Ok(self.strategy.get_or_init(|| resolved).as_ref())
    }

    /// Override if given, else the computed fingerprint for the salt.
    fn fingerprint(&self, args: &FingerprintArgs) -> LicenseResult<MachineFingerprint> {
        match &args.fingerprint {
            Some(value) => MachineFingerprint::parse(value),
            None => self.strategy()?.compute_fingerprint(args.salt.as_deref()),
        }
    }

    /// Runs one command.
    ///
    /// # Errors
    ///
    /// Returns the [`LicenseError`] that ended the command.
    pub fn execute(
        &self,
        command: &Command,
        input: &mut dyn BufRead,
        out: &mut dyn Write,
    ) -> LicenseResult<i32> {
        match command {
            Command::Login {
                email,
                password,
                password_stdin,
            } => self.login(email.as_deref(), password.as_deref(), *password_stdin, input, out),
            Command::Logout => self.logout(out),
            Command::Whoami => self.whoami(out),
            Command::ListProducts => self.list_products(out),
            Command::Status => self.status(out),
            Command::Activate {
                product_id,
                fingerprint,
            } => self.activate(product_id, fingerprint, out),
            Command::Deactivate {
                product_id,
                fingerprint,
            } => self.deactivate(product_id, fingerprint, out),
            Command::ValidateKey {
                license_key,
                fingerprint,
            } => self.validate_key(license_key, fingerprint, out),
            Command::VerifyMachineFile {
                path,
                license_key,
                fingerprint,
            } => self.verify_machine_file(path, license_key, fingerprint, out),
            Command::Fingerprint { salt } => self.print_fingerprint(salt.as_deref(), out),
            Command::History => self.history(out),
        }
    }

    fn login(
        &self,
        email: Option<&str>,
        password: Option<&str>,
        password_stdin: bool,
        input: &mut dyn BufRead,
        out: &mut dyn Write,
    ) -> LicenseResult<i32> {
        let email = match email {
            Some(email) => email.trim().to_string(),
            None => prompt(input, out, "Email: ")?,
        };
        let password = if password_stdin {
            let mut buf = String::new();
            input.read_to_string(&mut buf)?;
            let password = buf.trim_end_matches(['\r', '\n']).to_string();
            if password.is_empty() {
                return Err(LicenseError::Config("empty password on stdin".to_string()));
            }
            password
        } else {
            match (password, self.password_prompt) {
                (Some(password), _) => password.to_string(),
                (None, PasswordPrompt::Terminal) => rpassword::prompt_password("Password: ")
                    .map_err(|e| LicenseError::Config(format!("cannot read password: {e}")))?,
                (None, PasswordPrompt::Input) => prompt(input, out, "Password: ")?,
            }
        };
        if email.is_empty() {
            return Err(LicenseError::Config("email is required".to_string()));
        }

        let token = self.client()?.create_token(&email, &password)?;
        self.store.write_token(&token)?;
        info!("login succeeded, token cached");
        writeln!(out, "[info] login successful; token saved")?;
        Ok(0)
    }

    fn logout(&self, out: &mut dyn Write) -> LicenseResult<i32> {
        if self.store.clear_token()? {
            writeln!(out, "[info] logged out; token removed")?;
        } else {
            writeln!(out, "[info] no cached token")?;
        }
        Ok(0)
    }

    fn whoami(&self, out: &mut dyn Write) -> LicenseResult<i32> {
        let credential = self.require_credential()?;
        let identity = self.client()?.whoami(&credential)?;
        writeln!(out, "{identity}")?;
        Ok(0)
    }

    fn list_products(&self, out: &mut dyn Write) -> LicenseResult<i32> {
        let credential = self.require_credential()?;
        let products = self.client()?.list_products(&credential)?;
        writeln!(out, "Name (id)")?;
        for product in &products {
            writeln!(out, "{}\t({})", product.name, product.id)?;
        }
        Ok(0)
    }

    fn status(&self, out: &mut dyn Write) -> LicenseResult<i32> {
        let credential = self.require_credential()?;
        let status = self.client()?.pool_status(&credential)?;
        if !status.by_product.is_empty() {
            writeln!(out, "[info] licenses by product:")?;
            for (product, counts) in &status.by_product {
                writeln!(
                    out,
                    " {product}: total={} activated={} inactive={}",
                    counts.total,
                    counts.activated,
                    counts.inactive()
                )?;
            }
        }
        writeln!(
            out,
            "[info] licenses (all): total={} activated={} inactive={}",
            status.overall.total,
            status.overall.activated,
            status.overall.inactive()
        )?;
        Ok(0)
    }

    fn activate(&self, product_id: &str, args: &FingerprintArgs, out: &mut dyn Write) -> LicenseResult<i32> {
        let credential = self.require_credential()?;
        let fingerprint = self.fingerprint(args)?;
        let client = self.client()?;
        let outcome = Activator::new(&client, &self.store, &credential).activate(product_id, &fingerprint)?;
        writeln!(out, "[{}] {outcome}", outcome.tag())?;
        if let Some(record) = outcome.record() {
            writeln!(out, "[info] activation id: {}", record.machine_id)?;
        }
        Ok(outcome.exit_code())
    }

    fn deactivate(&self, product_id: &str, args: &FingerprintArgs, out: &mut dyn Write) -> LicenseResult<i32> {
        let credential = self.require_credential()?;
        let fingerprint = self.fingerprint(args)?;
        let client = self.client()?;
        let outcome =
            Activator::new(&client, &self.store, &credential).deactivate(product_id, &fingerprint)?;
        writeln!(out, "[{}] {outcome} (fingerprint: {fingerprint})", outcome.tag())?;
        Ok(outcome.exit_code())
    }

    fn validate_key(&self, key: &str, args: &FingerprintArgs, out: &mut dyn Write) -> LicenseResult<i32> {
        let key = key.trim();
        if key.is_empty() {
            writeln!(out, "[error] license key is empty")?;
            return Ok(KEY_INVALID_EXIT_CODE);
        }
        let credential = self.credential();
        let fingerprint = self.fingerprint(args)?;
        let validation = validate_key(&self.client()?, credential.as_ref(), key, &fingerprint)?;

        if validation.valid {
            writeln!(out, "[info] license key is valid for this machine (fingerprint: {fingerprint})")?;
            return Ok(0);
        }
        let reason = validation
            .reason
            .map_or_else(|| validation.code.clone(), |r| r.to_string());
        writeln!(
            out,
            "[error] license key is NOT valid for this machine: {reason} (fingerprint: {fingerprint}, code: {})",
            validation.code
        )?;
        Ok(KEY_INVALID_EXIT_CODE)
    }

    fn verify_machine_file(
        &self,
        path: &Path,
        license_key: &str,
        args: &FingerprintArgs,
        out: &mut dyn Write,
    ) -> LicenseResult<i32> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| LicenseError::Storage(format!("read {}: {e}", path.display())))?;
        let certificate = Certificate::parse(&text)?;

        certificate.verify(&self.config.client.public_key)?;
        writeln!(out, "[info] certificate signature verification successful!")?;
        certificate.check_expiry(Utc::now())?;

        let fingerprint = match certificate.kind() {
            CertificateKind::Machine => Some(self.fingerprint(args)?),
            CertificateKind::License => None,
        };
        let payload = certificate.decrypt(
            license_key.trim(),
            fingerprint.as_ref().map(MachineFingerprint::as_str),
        )?;
        writeln!(out, "[info] decryption successful!")?;
        writeln!(out, "{}", serde_json::to_string_pretty(&payload)?)?;
        Ok(0)
    }

    fn print_fingerprint(&self, salt: Option<&str>, out: &mut dyn Write) -> LicenseResult<i32> {
        let strategy = self.strategy()?;
        let fingerprint = strategy.compute_fingerprint(salt)?;
        debug!(strategy = strategy.name(), "fingerprint computed");
        writeln!(out, "{fingerprint}")?;
        Ok(0)
    }

    fn history(&self, out: &mut dyn Write) -> LicenseResult<i32> {
        for (i, line) in self.store.load_history()?.iter().enumerate() {
            writeln!(out, "{:>4}  {line}", i + 1)?;
        }
        Ok(0)
    }
}

fn prompt(input: &mut dyn BufRead, out: &mut dyn Write, label: &str) -> LicenseResult<String> {
    write!(out, "{label}")?;
    out.flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(line.trim().to_string())
}
