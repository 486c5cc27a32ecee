use std::path::PathBuf;

use clap::Parser;

/// Command line of a worker process.
#[derive(Parser, Debug, Clone)]
#[command(name = "webworker-child")]
#[command(about = "Runs a worker script under a webworker master")]
pub struct ChildArgs {
	/// Run as the shared worker with this name
	#[arg(short = 'S', value_name = "NAME")]
	pub shared: Option<String>,

	/// Socket of the supervising master
	#[arg(value_name = "SOCKET")]
	pub socket: PathBuf,

	/// Locator of the worker script
	#[arg(value_name = "SOURCE")]
	pub source: String,

	/// Arguments made visible to the script
	#[arg(trailing_var_arg = true, allow_hyphen_values = true)]
	pub args: Vec<String>,
}
