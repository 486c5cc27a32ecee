//! Worker launcher.
//!
//! Started by a webworker master as
//! `webworker-child [-S <name>] <socket> <source-url> [args..]`. Runs the
//! line-oriented script at `<source-url>` until the worker closes.

use std::process::ExitCode;

use clap::Parser;
use webworker::child::{ChildArgs, LineScriptHost, run_child};

/// Environment variable holding the log filter.
const LOG_ENV: &str = "WEBWORKER_LOG";

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
	setup_tracing();
	let args = ChildArgs::parse();
	let source = args.source.clone();

	match run_child(args, &mut LineScriptHost::new()).await {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			tracing::error!(source, error = %e, "worker failed");
			ExitCode::FAILURE
		}
	}
}

fn setup_tracing() {
	use tracing_subscriber::EnvFilter;

	let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.init();
}
