//! keyseat: machine-bound license client.
//!
//! Usage:
//!   keyseat login --email me@example.com --password-stdin
//!   keyseat activate <product-id>
//!   keyseat validate-key <key>
//!   keyseat verify-machine-file --path machine.lic --license-key <key>
//!   keyseat --interactive

use clap::Parser;
use keyseat_cli::{Cli, PasswordPrompt, exit_code_for, logging, run, tag_for};
use keyseat_license::EnvSnapshot;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.global.verbose);

    let cwd = std::env::current_dir().unwrap_or_else(|_| ".".into());
    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let mut out = std::io::stdout().lock();

    let prompt = PasswordPrompt::detect();
    let code = match run(&cli, EnvSnapshot::capture(), &cwd, &mut input, &mut out, prompt) {
        Ok(code) => code,
        Err(e) => {
            tracing::debug!(error = ?e, "command failed");
            eprintln!("[error] {}: {e:#}", tag_for(&e));
            exit_code_for(&e)
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
