//! proxywrap: run a command-line tool behind a local intercepting proxy
//!
//! This is the main entry point for the proxywrap binary. It handles CLI
//! argument parsing, configuration loading and telemetry initialization,
//! then hands over to the orchestrator.
//!
//! # I/O Architecture
//!
//! The wrapped tool inherits stdin/stdout/stderr unchanged:
//!
//! - **Audit logging**: Goes to syslog (when enabled), never to the terminal
//! - **Debug logging**: stderr, silent by default (`warn` level)

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use proxywrap::{
    cli::Cli,
    config::ConfigLoader,
    orchestrator::{EXIT_CONFIG_INVALID, Orchestrator},
    telemetry::AuditLogger,
};
use tracing::{debug, warn};

fn main() -> ExitCode {
    // Parse CLI arguments first (before any other initialization)
    let invocation = Cli::parse().into_invocation();

    if let Err(e) = init_tracing(invocation.verbosity()) {
        eprintln!("proxywrap: {:#}", e);
    }

    debug!("Parsed invocation: {:?}", invocation);

    let config = match ConfigLoader::new()
        .load(&invocation)
        .context("Failed to load configuration")
    {
        Ok(config) => config,
        Err(e) => {
            eprintln!("proxywrap: {:#}", e);
            return exit_code(EXIT_CONFIG_INVALID);
        }
    };

    debug!("Loaded configuration: {:?}", config);

    let audit = if config.syslog {
        match AuditLogger::new() {
            Ok(logger) => logger,
            Err(e) => {
                warn!("Audit logging disabled: {}", e);
                AuditLogger::new_null()
            }
        }
    } else {
        AuditLogger::new_null()
    };

    let code = Orchestrator::new(Arc::new(audit)).run(&invocation, &config);
    exit_code(code)
}

/// Process exit status for a wrapper exit code.
///
/// Codes outside `0..=255` cannot be represented and become `1`.
fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code).map(ExitCode::from).unwrap_or(ExitCode::FAILURE)
}

/// Initialize the tracing subscriber for debug/development logging.
///
/// This is separate from the audit telemetry which goes to syslog.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG`, or only warnings and errors
/// - 1 (-v): Info level
/// - 2 (-vv, --debug): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
