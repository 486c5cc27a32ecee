//! Message endpoint bound to a supervised worker.

use std::fmt;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use webworker_proto::{ErrorInfo, Message};

use crate::Result;
use crate::event::{ExitStatus, MessageEvent, WorkerObserver};
use crate::supervisor::Supervisor;

type MessageHandler = Arc<dyn Fn(MessageEvent) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(ErrorInfo) + Send + Sync>;
type ExitHandler = Arc<dyn Fn(ExitStatus) + Send + Sync>;

#[derive(Default)]
struct Handlers {
	onmessage: Option<MessageHandler>,
	onerror: Option<ErrorHandler>,
	onexit: Option<ExitHandler>,
}

#[derive(Default)]
struct PortState {
	handlers: Mutex<Handlers>,
}

// Handlers are cloned out before being called so they may replace themselves.
impl WorkerObserver for PortState {
	fn on_message(&self, event: MessageEvent) {
		let handler = self.handlers.lock().onmessage.clone();
		if let Some(handler) = handler {
			handler(event);
		}
	}

	fn on_error(&self, error: ErrorInfo) {
		let handler = self.handlers.lock().onerror.clone();
		match handler {
			Some(handler) => handler(error),
			None => tracing::warn!(%error, "uncaught worker error"),
		}
	}

	fn on_exit(&self, status: ExitStatus) {
		let handler = self.handlers.lock().onexit.clone();
		if let Some(handler) = handler {
			handler(status);
		}
	}
}

/// A message endpoint of a worker.
///
/// `USER` messages from the worker reach `onmessage`, uncaught worker errors
/// reach `onerror` and process exit reaches `onexit`. Clones share handlers.
/// Once every clone is dropped the port stops receiving events.
#[derive(Clone)]
pub struct Port {
	supervisor: Supervisor,
	state: Arc<PortState>,
}

impl Port {
	pub(crate) fn new(supervisor: Supervisor) -> Self {
		let state = Arc::new(PortState::default());
		let observer: Arc<dyn WorkerObserver> = state.clone();
		supervisor.subscribe(&observer);
		Self { supervisor, state }
	}

	/// Posts a `USER` message to the worker.
	///
	/// # Errors
	///
	/// Returns [`crate::Error::Exited`] once the worker has exited.
	pub fn post_message(&self, data: Value) -> Result<()> {
		self.supervisor.post_message(Message::user(data), None)
	}

	/// Posts a `USER` message together with a file descriptor.
	///
	/// # Errors
	///
	/// Returns [`crate::Error::Exited`] once the worker has exited.
	pub fn post_message_with_fd(&self, data: Value, fd: impl Into<OwnedFd>) -> Result<()> {
		self.supervisor.post_message(Message::user(data), Some(fd.into()))
	}

	/// Sets the handler for messages from the worker.
	pub fn set_onmessage(&self, handler: impl Fn(MessageEvent) + Send + Sync + 'static) {
		self.state.handlers.lock().onmessage = Some(Arc::new(handler));
	}

	/// Sets the handler for uncaught worker errors.
	pub fn set_onerror(&self, handler: impl Fn(ErrorInfo) + Send + Sync + 'static) {
		self.state.handlers.lock().onerror = Some(Arc::new(handler));
	}

	/// Sets the handler for worker exit.
	pub fn set_onexit(&self, handler: impl Fn(ExitStatus) + Send + Sync + 'static) {
		self.state.handlers.lock().onexit = Some(Arc::new(handler));
	}

	/// Removes every handler.
	pub fn clear_handlers(&self) {
		*self.state.handlers.lock() = Handlers::default();
	}

	/// The supervisor this port is bound to.
	#[must_use]
	pub fn supervisor(&self) -> &Supervisor {
		&self.supervisor
	}
}

impl fmt::Debug for Port {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Port").field("supervisor", &self.supervisor).finish_non_exhaustive()
	}
}
