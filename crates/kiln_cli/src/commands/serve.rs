//! Serve command - HTTP trigger API plus the workflow dispatcher.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use tracing::info;

use kiln_cli::server::{run_server, AppState};
use kiln_cli::settings::RuntimeArgs;
use kiln_core::{Dispatcher, DEFAULT_QUEUE_CAPACITY};

#[derive(Args)]
pub struct ServeArgs {
    /// Port the API listens on
    #[arg(short, long, env = "KILN_PORT", default_value_t = 8080)]
    port: u16,

    /// Pending events the bus holds before submissions wait
    #[arg(long, env = "KILN_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    #[command(flatten)]
    runtime: RuntimeArgs,
}

pub async fn execute(args: ServeArgs) -> Result<()> {
    let orchestrator = Arc::new(args.runtime.build_orchestrator()?);
    let sessions = orchestrator.sessions().clone();

    let (dispatcher, _dispatch_handle) = Dispatcher::spawn(orchestrator, args.queue_capacity);
    info!("Dispatcher accepting up to {} queued event(s)", args.queue_capacity);

    run_server(args.port, AppState::new(dispatcher, sessions)).await
}
