//! Command-line surface.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Machine-bound license client.
#[derive(Parser, Debug)]
#[command(name = "keyseat", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Options that apply to every command.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// API token for this invocation (overrides env, token file and config)
    #[arg(long, global = true)]
    pub api_token: Option<String>,

    /// License service endpoint
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Account scope on the license service
    #[arg(long, global = true)]
    pub account_id: Option<String>,

    /// Hex-encoded Ed25519 key used to verify responses
    #[arg(long, global = true)]
    pub public_key: Option<String>,

    /// Path to the config file (default: ~/.keyseat/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Start an interactive session
    #[arg(long)]
    pub interactive: bool,
}

/// Fingerprint selection shared by machine-scoped commands.
#[derive(Args, Debug, Clone, Default)]
pub struct FingerprintArgs {
    /// Use this fingerprint instead of computing one
    #[arg(long)]
    pub fingerprint: Option<String>,

    /// Scope the computed fingerprint with a salt
    #[arg(long, conflicts_with = "fingerprint")]
    pub salt: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Exchange email and password for an API token and cache it
    Login {
        /// Account email (prompted if omitted)
        #[arg(long)]
        email: Option<String>,

        /// Account password (prefer --password-stdin)
        #[arg(long, env = "KEYSEAT_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Read the password from standard input
        #[arg(long)]
        password_stdin: bool,
    },

    /// Forget the cached API token
    Logout,

    /// Show the authenticated identity
    Whoami,

    /// List products visible to the token
    ListProducts,

    /// Show license pool usage per product
    Status,

    /// Claim a license of a product for this machine
    Activate {
        product_id: String,
        #[command(flatten)]
        fingerprint: FingerprintArgs,
    },

    /// Release this machine's license of a product
    Deactivate {
        product_id: String,
        #[command(flatten)]
        fingerprint: FingerprintArgs,
    },

    /// Check a license key against this machine
    ValidateKey {
        license_key: String,
        #[command(flatten)]
        fingerprint: FingerprintArgs,
    },

    /// Verify and decrypt an offline machine file
    VerifyMachineFile {
        /// Path to the machine file
        #[arg(long)]
        path: PathBuf,

        /// License key the file was issued for
        #[arg(long, env = "KEYSEAT_LICENSE_KEY", hide_env_values = true)]
        license_key: String,

        #[command(flatten)]
        fingerprint: FingerprintArgs,
    },

    /// Print this machine's fingerprint
    Fingerprint {
        /// Scope the fingerprint with a salt
        #[arg(long)]
        salt: Option<String>,
    },

    /// Show the interactive history
    #[command(hide = true)]
    History,
}

/// One line typed in interactive mode: a command without global options.
#[derive(Parser, Debug)]
#[command(name = "keyseat", no_binary_name = true, disable_version_flag = true)]
pub struct ReplLine {
    #[command(subcommand)]
    pub command: Command,
}
