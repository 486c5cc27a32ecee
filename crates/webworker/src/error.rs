//! Error types for worker supervision.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced to callers of the worker API.
#[derive(Debug, Error)]
pub enum Error {
	/// A shared worker for this source is registered under another name.
	#[error("shared worker with src '{locator}' already exists with a different name: '{existing}'")]
	NameConflict {
		/// Source that was requested.
		locator: String,
		/// Name the existing worker was registered with.
		existing: String,
	},

	/// A shared worker with this name is registered for another source.
	#[error("shared worker with name '{name}' already exists with a different src: '{existing}'")]
	SourceConflict {
		/// Name that was requested.
		name: String,
		/// Source the existing worker was registered with.
		existing: String,
	},

	/// The worker process has exited; it can no longer receive messages.
	#[error("worker has exited")]
	Exited,

	/// The worker source is neither a URL nor a usable path.
	#[error("invalid worker source '{0}'")]
	InvalidSource(String),

	/// No launcher program could be located.
	#[error("worker launcher not found; set WEBWORKER_LAUNCHER or WorkerOptions::launcher")]
	LauncherNotFound,

	/// The launcher process could not be spawned.
	#[error("failed to spawn worker launcher {}: {error}", launcher.display())]
	Spawn {
		/// Program that failed to start.
		launcher: PathBuf,
		/// The underlying I/O error.
		error: io::Error,
	},

	/// Supervisors must be started from within a tokio runtime.
	#[error("worker supervision requires a running tokio runtime")]
	NoRuntime,

	/// Socket setup or other I/O failure.
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),

	/// The message stream failed.
	#[error(transparent)]
	Stream(#[from] webworker_ipc::StreamError),
}

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, Error>;
