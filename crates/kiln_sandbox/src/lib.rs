//! # kiln_sandbox
//!
//! Sandbox capability set for kiln.
//!
//! A sandbox is an ephemeral, isolated execution environment with its own
//! filesystem, process space and exposed network ports. Generated projects
//! are written into a sandbox and started there.
//!
//! # Features
//!
//! - **Capability traits**: [`SandboxProvider`] creates and reconnects
//!   sandboxes, [`Sandbox`] runs commands, moves files and exposes ports
//! - **Streaming output**: command stdout/stderr is delivered line by line
//!   to caller-supplied handlers while the process is still running
//! - **Local Provider**: process-backed sandboxes rooted in a directory
//! - **Mock Provider**: scriptable, call-capturing sandboxes for tests
//!
//! # Example
//!
//! ```rust,no_run
//! use kiln_sandbox::{CommandOptions, CreateOptions, LocalSandboxProvider, SandboxProvider};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let provider = LocalSandboxProvider::new("/tmp/kiln-sandboxes", "localhost");
//!
//!     let sandbox = provider
//!         .create(CreateOptions::new("nextjs-developer").metadata("sessionId", "abc"))
//!         .await?;
//!
//!     let output = sandbox
//!         .run_command("echo hello", CommandOptions::new().timeout(Duration::from_secs(5)))
//!         .await?;
//!     println!("exit code: {}", output.exit_code);
//!
//!     sandbox.kill().await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod local;
pub mod mock;
pub mod sandbox;

pub use error::{SandboxError, SandboxResult};
pub use local::{LocalSandbox, LocalSandboxProvider, DEFAULT_CODE_TIMEOUT};
pub use mock::{CapturedCall, MockResponse, MockSandbox, MockSandboxProvider};
pub use sandbox::{
    CodeError, CodeOutput, CommandOptions, CommandOutput, CreateOptions, OutputHandler, Sandbox,
    SandboxProvider, DEFAULT_SANDBOX_TIMEOUT,
};
