//! keyseat-fingerprint: prints this machine's fingerprint.
//!
//! The native fingerprint strategy of `keyseat`. Output must match the
//! in-process computation byte for byte.

use anyhow::Context;
use clap::Parser;
use keyseat_license::{DEFAULT_MACHINE_ID_PATH, fingerprint_from_parts, read_machine_id};
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "keyseat-fingerprint", version, about = "Print the machine fingerprint")]
struct Args {
    /// Identity file to read
    #[arg(long, default_value = DEFAULT_MACHINE_ID_PATH)]
    machine_id_file: PathBuf,

    /// Scope the fingerprint with a salt
    #[arg(long)]
    salt: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let machine_id = read_machine_id(&args.machine_id_file);
    let fingerprint = fingerprint_from_parts(machine_id.as_deref(), args.salt.as_deref());
    writeln!(std::io::stdout(), "{fingerprint}").context("writing fingerprint")?;
    Ok(())
}
