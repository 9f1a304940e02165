//! CLI command definitions.

use clap::{Parser, Subcommand};

pub mod run;
pub mod serve;
pub mod templates;

/// kiln - prompt-to-running-app generation service
#[derive(Parser)]
#[command(name = "kiln")]
#[command(version, about = "kiln - turn a prompt into a running app inside a sandbox")]
#[command(long_about = r#"
kiln takes a natural-language prompt, lets a coding agent write an app inside
an isolated sandbox, starts the app's dev server and, when the launch fails,
feeds the error back to the agent and retries.

COMMANDS:
  serve      → Run the HTTP trigger API and background workflow dispatcher
  run        → Run one generation in the foreground and print the result
  templates  → List the available templates

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid arguments
  3 - Workflow failure
  4 - Template error
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "KILN_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP trigger API
    Serve(serve::ServeArgs),

    /// Run a single generation and wait for the result
    Run(run::RunArgs),

    /// List available templates
    Templates(templates::TemplatesArgs),
}
