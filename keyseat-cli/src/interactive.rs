//! Interactive mode.
//!
//! Reads one command per line and runs it against a single session. Lines
//! are appended to the history file with secrets masked.

use crate::cli::ReplLine;
use crate::commands::Session;
use anyhow::Context;
use clap::{CommandFactory, Parser};
use keyseat_license::LocalStore;
use std::io::{BufRead, Write};
use tracing::warn;

const PROMPT: &str = "keyseat> ";
const MASK: &str = "***";

/// Options whose value must never reach the history file.
const SECRET_OPTIONS: &[&str] = &["--api-token", "--password", "--license-key"];

/// Options that consume the following word as their value.
const VALUE_OPTIONS: &[&str] = &[
    "--api-token",
    "--password",
    "--license-key",
    "--path",
    "--email",
    "--fingerprint",
    "--salt",
    "--base-url",
    "--account-id",
    "--public-key",
    "--config",
];

/// Splits a line into words, honouring single and double quotes and
/// backslash escapes outside single quotes.
///
/// # Errors
///
/// Fails on an unterminated quote or a trailing backslash.
pub fn split_line(line: &str) -> anyhow::Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('\''), c) => current.push(c),
            (Some(_), '\\') | (None, '\\') => {
                let escaped = chars.next().context("trailing backslash")?;
                current.push(escaped);
                in_word = true;
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if let Some(q) = quote {
        anyhow::bail!("unterminated {q} quote");
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Rebuilds a command line with secret values masked.
#[must_use]
pub fn redact(words: &[String]) -> String {
    // The license key is the first positional argument of validate-key.
    let mut key_pending = words.first().is_some_and(|w| w == "validate-key");
    let mut out: Vec<String> = Vec::with_capacity(words.len());
    let mut iter = words.iter().enumerate();

    while let Some((i, word)) = iter.next() {
        if i == 0 {
            out.push(word.clone());
            continue;
        }
        if let Some((name, _)) = word.split_once('=').filter(|(n, _)| n.starts_with("--")) {
            let masked = SECRET_OPTIONS.contains(&name);
            out.push(if masked { format!("{name}={MASK}") } else { word.clone() });
            continue;
        }
        if VALUE_OPTIONS.contains(&word.as_str()) {
            out.push(word.clone());
            if let Some((_, value)) = iter.next() {
                let masked = SECRET_OPTIONS.contains(&word.as_str());
                out.push(if masked { MASK.to_string() } else { value.clone() });
            }
            continue;
        }
        if key_pending && !word.starts_with('-') {
            key_pending = false;
            out.push(MASK.to_string());
            continue;
        }
        out.push(word.clone());
    }
    out.join(" ")
}

/// Runs the read-eval loop until end of input or `exit`.
///
/// # Errors
///
/// Fails only when reading input or writing output fails.
pub fn run<S: LocalStore>(
    session: &Session<S>,
    input: &mut dyn BufRead,
    out: &mut dyn Write,
) -> anyhow::Result<i32> {
    writeln!(out, "[interactive] keyseat; type 'help' or 'exit'")?;
    loop {
        write!(out, "{PROMPT}")?;
        out.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line).context("reading command")? == 0 {
            writeln!(out)?;
            return Ok(0);
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut words = match split_line(line) {
            Ok(words) => words,
            Err(e) => {
                writeln!(out, "[error] parse: {e}")?;
                continue;
            }
        };
        if let Err(e) = session.store().append_history(&redact(&words)) {
            warn!(error = %e, "could not update history");
        }

        match words[0].to_ascii_lowercase().as_str() {
            "exit" | "quit" | "q" => return Ok(0),
            "help" | "?" if words.len() == 1 => {
                writeln!(out, "{}", ReplLine::command().render_help())?;
                continue;
            }
            "help" => {
                words.remove(0);
                words.push("--help".to_string());
            }
            _ => {}
        }

        let parsed = match ReplLine::try_parse_from(&words) {
            Ok(parsed) => parsed,
            Err(e) => {
                writeln!(out, "{}", e.render())?;
                continue;
            }
        };

        match session.execute(&parsed.command, input, out) {
            Ok(0) => {}
            Ok(code) => writeln!(out, "[status] exit code {code}")?,
            Err(e) => {
                writeln!(out, "[error] {}: {e}", e.tag())?;
                writeln!(out, "[status] exit code {}", e.exit_code())?;
            }
        }
    }
}
