//! keyseat command-line client.
//!
//! The binary is a thin shell over [`run`]; everything here is testable with
//! in-memory input and output.

pub mod cli;
pub mod commands;
pub mod interactive;
pub mod logging;

pub use cli::{Cli, Command, FingerprintArgs, GlobalArgs, ReplLine};
pub use commands::{KEY_INVALID_EXIT_CODE, PasswordPrompt, Session};

use clap::CommandFactory;
use keyseat_license::{EnvSnapshot, LicenseError};
use std::io::{BufRead, Write};
use std::path::Path;

/// Exit code for usage errors and failures outside the license taxonomy.
pub const USAGE_EXIT_CODE: i32 = 2;

/// Runs a parsed command line and returns the process exit code.
///
/// `prompt` decides where `login` reads a password it was not given.
///
/// # Errors
///
/// Returns the failure that ended the command; use [`exit_code_for`] to
/// map it.
pub fn run(
    cli: &Cli,
    env: EnvSnapshot,
    cwd: &Path,
    input: &mut dyn BufRead,
    out: &mut dyn Write,
    prompt: PasswordPrompt,
) -> anyhow::Result<i32> {
    let session = Session::open(&cli.global, env, cwd)?.with_password_prompt(prompt);
    if cli.global.interactive {
        return interactive::run(&session, input, out);
    }
    match &cli.command {
        Some(command) => Ok(session.execute(command, input, out)?),
        None => {
            writeln!(out, "{}", Cli::command().render_help())?;
            Ok(USAGE_EXIT_CODE)
        }
    }
}

/// Exit code for an error returned by [`run`].
#[must_use]
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<LicenseError>()
        .map_or(USAGE_EXIT_CODE, LicenseError::exit_code)
}

/// Stable tag for an error returned by [`run`].
#[must_use]
pub fn tag_for(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<LicenseError>()
        .map_or("error", LicenseError::tag)
}
