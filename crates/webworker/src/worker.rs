//! `Worker` and `SharedWorker`, the user-facing handles.

use std::os::fd::OwnedFd;

use serde_json::Value;
use url::Url;
use webworker_proto::ErrorInfo;

use crate::Result;
use crate::config::{KillTimeout, WorkerOptions, resolve_source};
use crate::event::{ExitStatus, MessageEvent};
use crate::port::Port;
use crate::registry::SharedWorkerRegistry;
use crate::supervisor::Supervisor;

/// A dedicated worker running in its own process.
///
/// The process is started on construction. Messages posted before it
/// connects are queued and delivered in order.
#[derive(Debug, Clone)]
pub struct Worker {
	port: Port,
}

impl Worker {
	/// Starts a worker running `source`, a URL or a file path.
	///
	/// Must be called from within a tokio runtime.
	///
	/// # Errors
	///
	/// Returns an error if the source is invalid or the process cannot be started.
	pub fn new(source: &str, options: &WorkerOptions) -> Result<Self> {
		let source = resolve_source(source)?;
		let supervisor = Supervisor::start(source, None, options)?;
		Ok(Self {
			port: Port::new(supervisor),
		})
	}

	/// Posts a message to the worker.
	///
	/// # Errors
	///
	/// Returns [`crate::Error::Exited`] once the worker has exited.
	pub fn post_message(&self, data: Value) -> Result<()> {
		self.port.post_message(data)
	}

	/// Posts a message together with a file descriptor.
	///
	/// # Errors
	///
	/// Returns [`crate::Error::Exited`] once the worker has exited.
	pub fn post_message_with_fd(&self, data: Value, fd: impl Into<OwnedFd>) -> Result<()> {
		self.port.post_message_with_fd(data, fd)
	}

	/// Asks the worker to close, killing it after the configured timeout.
	pub fn terminate(&self) {
		self.port.supervisor().terminate();
	}

	/// Asks the worker to close, killing it after `timeout`.
	///
	/// A zero duration waits forever.
	pub fn terminate_with(&self, timeout: impl Into<KillTimeout>) {
		self.port.supervisor().terminate_with(timeout);
	}

	/// Sets the handler for messages from the worker.
	pub fn set_onmessage(&self, handler: impl Fn(MessageEvent) + Send + Sync + 'static) {
		self.port.set_onmessage(handler);
	}

	/// Sets the handler for uncaught worker errors.
	pub fn set_onerror(&self, handler: impl Fn(ErrorInfo) + Send + Sync + 'static) {
		self.port.set_onerror(handler);
	}

	/// Sets the handler for worker exit.
	pub fn set_onexit(&self, handler: impl Fn(ExitStatus) + Send + Sync + 'static) {
		self.port.set_onexit(handler);
	}

	/// The worker's implicit port.
	#[must_use]
	pub fn port(&self) -> &Port {
		&self.port
	}

	/// The underlying supervisor.
	#[must_use]
	pub fn supervisor(&self) -> &Supervisor {
		self.port.supervisor()
	}
}

/// A worker shared by every `SharedWorker` with the same source and name.
///
/// Each handle gets its own [`Port`]; the worker script sees one `connect`
/// event when its process starts.
#[derive(Debug, Clone)]
pub struct SharedWorker {
	port: Port,
}

impl SharedWorker {
	/// Attaches to the shared worker for `(source, name)` in the global
	/// registry, starting it if needed. `name` defaults to `""`.
	///
	/// # Errors
	///
	/// Returns an identity conflict if the source or the name is already
	/// registered with a different counterpart, or any start error.
	pub fn new(source: &str, name: Option<&str>, options: &WorkerOptions) -> Result<Self> {
		Self::with_registry(SharedWorkerRegistry::global(), source, name, options)
	}

	/// Like [`SharedWorker::new`] with an explicit registry.
	///
	/// # Errors
	///
	/// See [`SharedWorker::new`].
	pub fn with_registry(
		registry: &SharedWorkerRegistry,
		source: &str,
		name: Option<&str>,
		options: &WorkerOptions,
	) -> Result<Self> {
		let source = resolve_source(source)?;
		let (_, port) = registry.get_or_create(&source, name.unwrap_or_default(), options)?;
		Ok(Self { port })
	}

	/// This handle's port.
	#[must_use]
	pub fn port(&self) -> &Port {
		&self.port
	}

	/// Name the worker is registered under.
	#[must_use]
	pub fn name(&self) -> &str {
		self.port.supervisor().name().unwrap_or_default()
	}

	/// Locator of the worker script.
	#[must_use]
	pub fn source(&self) -> &Url {
		self.port.supervisor().source()
	}

	/// Asks the shared worker to close, for every attached port.
	pub fn terminate(&self) {
		self.port.supervisor().terminate();
	}

	/// Asks the shared worker to close, killing it after `timeout`.
	pub fn terminate_with(&self, timeout: impl Into<KillTimeout>) {
		self.port.supervisor().terminate_with(timeout);
	}
}
