//! Run command - one generation in the foreground.

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use kiln_cli::settings::RuntimeArgs;
use kiln_core::{GenerationRequest, WorkflowResult, DEFAULT_PORT, DEFAULT_TEMPLATE};

#[derive(Args)]
pub struct RunArgs {
    /// What to build
    prompt: String,

    /// Session to run in (a fresh one when omitted)
    #[arg(short, long)]
    session_id: Option<String>,

    /// Template id
    #[arg(short, long, default_value = DEFAULT_TEMPLATE)]
    template: String,

    /// Port the dev server should listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Use the template's own port instead of --port
    #[arg(long)]
    template_port: bool,

    /// Keep the sandbox alive until Ctrl-C
    #[arg(long)]
    hold: bool,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    runtime: RuntimeArgs,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let orchestrator = args.runtime.build_orchestrator()?;

    let mut request = GenerationRequest::new(args.prompt).with_template(args.template);
    if let Some(session_id) = args.session_id {
        request = request.with_session_id(session_id);
    }
    request = if args.template_port {
        request.with_template_port()
    } else {
        request.with_port(args.port)
    };

    info!("Running generation for session {}", request.session_id);
    let result = orchestrator.run(&request).await?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result).context("Failed to serialize result")?
        );
    } else {
        print_result(&result);
    }

    if args.hold && result.success {
        println!("\nSandbox kept alive, press Ctrl-C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
    }
    orchestrator.sessions().destroy(&result.session_id).await;

    if !result.success {
        anyhow::bail!(
            "Workflow failed after {} attempt(s): {}",
            result.attempts.unwrap_or_default(),
            result.last_error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn print_result(result: &WorkflowResult) {
    let icon = if result.success { "✅" } else { "❌" };
    println!("{} Session {} ({})", icon, result.session_id, result.template_id);
    println!("   Sandbox: {}", result.sandbox_id);
    if let Some(attempts) = result.attempts {
        println!("   Attempts: {}", attempts);
    }
    if let Some(url) = &result.preview_url {
        println!("   Preview: {}", url);
    }
    if let Some(error) = &result.last_error {
        println!("   Last error:\n{}", error);
    }
}
