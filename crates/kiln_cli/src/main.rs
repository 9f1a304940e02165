//! kiln CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid arguments
//! - 3: Workflow failure
//! - 4: Template error

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kiln_core::CoreError;

mod commands;

use commands::{Cli, Commands};

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const WORKFLOW_FAILURE: u8 = 3;
    pub const TEMPLATE_ERROR: u8 = 4;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let result = match cli.command {
        Commands::Serve(args) => commands::serve::execute(args).await,
        Commands::Run(args) => commands::run::execute(args).await,
        Commands::Templates(args) => commands::templates::execute(args).await,
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            let exit_code = categorize_error(&e);
            eprintln!("❌ Error: {:#}", e);
            ExitCode::from(exit_code)
        }
    }
}

fn init_logging(verbose: bool, json: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("kiln={},tower_http={},warn", level, level)));

    let log_result = tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer().with_target(false)))
        .try_init();

    if log_result.is_err() {
        // Logging already initialized, continue
    }
}

/// Categorize error to determine exit code
fn categorize_error(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if let Some(core) = cause.downcast_ref::<CoreError>() {
            return match core {
                CoreError::UnknownTemplate(_) => ExitCodes::TEMPLATE_ERROR,
                CoreError::InvalidRequest(_) | CoreError::InvalidPattern(_) => {
                    ExitCodes::INVALID_ARGS
                }
                CoreError::RetriesExhausted { .. } => ExitCodes::WORKFLOW_FAILURE,
                _ => ExitCodes::GENERAL_ERROR,
            };
        }
    }

    let msg = e.to_string().to_lowercase();
    if msg.contains("workflow failed") {
        ExitCodes::WORKFLOW_FAILURE
    } else if msg.contains("template") {
        ExitCodes::TEMPLATE_ERROR
    } else if msg.contains("argument") || msg.contains("option") {
        ExitCodes::INVALID_ARGS
    } else {
        ExitCodes::GENERAL_ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_core_errors() {
        let e = anyhow::Error::new(CoreError::UnknownTemplate("svelte".to_string()));
        assert_eq!(categorize_error(&e), ExitCodes::TEMPLATE_ERROR);

        let e = anyhow::Error::new(CoreError::InvalidRequest("prompt is required".to_string()))
            .context("Run failed");
        assert_eq!(categorize_error(&e), ExitCodes::INVALID_ARGS);

        let e = anyhow::Error::new(CoreError::RetriesExhausted {
            attempts: 5,
            message: "quota".to_string(),
        });
        assert_eq!(categorize_error(&e), ExitCodes::WORKFLOW_FAILURE);
    }

    #[test]
    fn test_categorize_by_message() {
        let e = anyhow::anyhow!("Workflow failed after 3 attempt(s): Failed to compile");
        assert_eq!(categorize_error(&e), ExitCodes::WORKFLOW_FAILURE);

        let e = anyhow::anyhow!("something else broke");
        assert_eq!(categorize_error(&e), ExitCodes::GENERAL_ERROR);
    }
}
