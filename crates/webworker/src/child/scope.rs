//! Bindings visible to a worker script.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::os::fd::OwnedFd;
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use url::Url;
use webworker_ipc::Incoming;
use webworker_proto::{ErrorInfo, Message, MessageType};

use crate::event::{Descriptor, MessageEvent};

/// Outcome of running script code; `Err` is an uncaught error.
pub type ScriptResult = Result<(), ErrorInfo>;

type MessageHandler = Rc<dyn Fn(&WorkerScope, MessageEvent) -> ScriptResult>;
type ErrorHandler = Rc<dyn Fn(&WorkerScope, &ErrorInfo) -> ScriptResult>;
type CloseHandler = Rc<dyn Fn(&WorkerScope) -> ScriptResult>;
type ConnectHandler = Rc<dyn Fn(&WorkerScope, ChildPort<'_>) -> ScriptResult>;
type TimerCallback = Box<dyn FnOnce(&WorkerScope) -> ScriptResult>;

/// Handle returned by [`WorkerScope::set_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Global scope of a running worker script.
///
/// Single threaded: the runtime drives it from one task and handlers receive
/// it by reference.
pub struct WorkerScope {
	name: Option<String>,
	location: Url,
	args: Vec<String>,
	outbox: RefCell<VecDeque<(Message, Option<OwnedFd>)>>,
	onmessage: RefCell<Option<MessageHandler>>,
	onerror: RefCell<Option<ErrorHandler>>,
	onclose: RefCell<Option<CloseHandler>>,
	onconnect: RefCell<Option<ConnectHandler>>,
	timers: RefCell<BTreeMap<(Instant, u64), TimerCallback>>,
	next_timer: Cell<u64>,
	in_error_handler: Cell<bool>,
	closing: Cell<bool>,
	closed: Cell<bool>,
}

impl WorkerScope {
	/// Creates the scope for a worker loaded from `location`.
	pub fn new(name: Option<String>, location: Url, args: Vec<String>) -> Self {
		Self {
			name,
			location,
			args,
			outbox: RefCell::default(),
			onmessage: RefCell::default(),
			onerror: RefCell::default(),
			onclose: RefCell::default(),
			onconnect: RefCell::default(),
			timers: RefCell::default(),
			next_timer: Cell::new(1),
			in_error_handler: Cell::new(false),
			closing: Cell::new(false),
			closed: Cell::new(false),
		}
	}

	/// Shared worker name; `None` for dedicated workers.
	pub fn name(&self) -> Option<&str> {
		self.name.as_deref()
	}

	/// Where the script was loaded from.
	pub fn location(&self) -> &Url {
		&self.location
	}

	/// Extra arguments given to the worker process.
	pub fn args(&self) -> &[String] {
		&self.args
	}

	/// Whether the master asked this worker to close.
	pub fn is_closing(&self) -> bool {
		self.closing.get()
	}

	pub(crate) fn is_closed(&self) -> bool {
		self.closed.get()
	}

	/// Posts a message to the master.
	pub fn post_message(&self, data: Value) {
		self.send(Message::user(data), None);
	}

	/// Posts a message to the master together with a descriptor.
	pub fn post_message_with_fd(&self, data: Value, fd: impl Into<OwnedFd>) {
		self.send(Message::user(data), Some(fd.into()));
	}

	fn send(&self, message: Message, fd: Option<OwnedFd>) {
		self.outbox.borrow_mut().push_back((message, fd));
	}

	pub fn set_onmessage(&self, handler: impl Fn(&WorkerScope, MessageEvent) -> ScriptResult + 'static) {
		*self.onmessage.borrow_mut() = Some(Rc::new(handler));
	}

	pub fn set_onerror(&self, handler: impl Fn(&WorkerScope, &ErrorInfo) -> ScriptResult + 'static) {
		*self.onerror.borrow_mut() = Some(Rc::new(handler));
	}

	pub fn set_onclose(&self, handler: impl Fn(&WorkerScope) -> ScriptResult + 'static) {
		*self.onclose.borrow_mut() = Some(Rc::new(handler));
	}

	/// Sets the handler for the `connect` event of a shared worker.
	pub fn set_onconnect(&self, handler: impl Fn(&WorkerScope, ChildPort<'_>) -> ScriptResult + 'static) {
		*self.onconnect.borrow_mut() = Some(Rc::new(handler));
	}

	/// Runs `callback` once after `delay`.
	pub fn set_timeout(&self, delay: Duration, callback: impl FnOnce(&WorkerScope) -> ScriptResult + 'static) -> TimerId {
		let id = self.next_timer.get();
		self.next_timer.set(id + 1);
		self.timers.borrow_mut().insert((Instant::now() + delay, id), Box::new(callback));
		TimerId(id)
	}

	/// Cancels a pending timer.
	pub fn clear_timeout(&self, timer: TimerId) {
		self.timers.borrow_mut().retain(|&(_, id), _| id != timer.0);
	}

	/// Ends the worker once pending output is flushed.
	pub fn close(&self) {
		self.closed.set(true);
	}

	pub(crate) fn take_outbox(&self) -> VecDeque<(Message, Option<OwnedFd>)> {
		std::mem::take(&mut *self.outbox.borrow_mut())
	}

	pub(crate) fn has_timers(&self) -> bool {
		!self.timers.borrow().is_empty()
	}

	pub(crate) fn next_deadline(&self) -> Option<Instant> {
		self.timers.borrow().keys().next().map(|&(at, _)| at)
	}

	pub(crate) fn run_due_timers(&self) {
		let now = Instant::now();
		loop {
			let due = {
				let mut timers = self.timers.borrow_mut();
				match timers.first_key_value() {
					Some((&(at, _), _)) if at <= now => timers.pop_first(),
					_ => None,
				}
			};
			let Some((_, callback)) = due else {
				break;
			};
			if let Err(error) = callback(self) {
				self.report(error);
			}
		}
	}

	/// Routes an uncaught error to `onerror`, or to the master when there is
	/// no handler or the handler itself failed.
	pub(crate) fn report(&self, error: ErrorInfo) {
		let handler = if self.in_error_handler.get() {
			None
		} else {
			self.onerror.borrow().clone()
		};
		match handler {
			Some(handler) => {
				self.in_error_handler.set(true);
				if let Err(nested) = handler(self, &error) {
					self.report(nested);
				}
				self.in_error_handler.set(false);
			}
			None => {
				tracing::debug!(%error, "reporting uncaught error to master");
				self.send(Message::error(&error), None);
			}
		}
	}

	pub(crate) fn dispatch(&self, Incoming { message, fd }: Incoming) {
		let result = match message.kind() {
			Some(MessageType::Noop) => Ok(()),
			Some(MessageType::Close) => {
				self.closing.set(true);
				let handler = self.onclose.borrow().clone();
				handler.map_or(Ok(()), |handler| handler(self))
			}
			Some(MessageType::User) => {
				let handler = self.onmessage.borrow().clone();
				match handler {
					Some(handler) => handler(
						self,
						MessageEvent {
							data: message.payload,
							descriptor: fd.map(Descriptor::from),
						},
					),
					None => {
						tracing::debug!("no onmessage handler, message dropped");
						Ok(())
					}
				}
			}
			kind => {
				tracing::debug!(code = message.code, ?kind, "unexpected message from master");
				Ok(())
			}
		};
		if let Err(error) = result {
			self.report(error);
		}
	}

	/// Delivers the `connect` event of a shared worker.
	pub(crate) fn connect(&self) {
		let handler = self.onconnect.borrow().clone();
		if let Some(handler) = handler
			&& let Err(error) = handler(self, ChildPort { scope: self })
		{
			self.report(error);
		}
	}
}

impl fmt::Debug for WorkerScope {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WorkerScope")
			.field("name", &self.name)
			.field("location", &self.location.as_str())
			.field("closing", &self.closing.get())
			.field("closed", &self.closed.get())
			.finish_non_exhaustive()
	}
}

/// The port handed to a shared worker's `connect` handler.
///
/// A worker process has one connection to its master, so the port is a view
/// of the scope's own channel.
#[derive(Debug, Clone, Copy)]
pub struct ChildPort<'a> {
	scope: &'a WorkerScope,
}

impl ChildPort<'_> {
	pub fn post_message(&self, data: Value) {
		self.scope.post_message(data);
	}

	pub fn set_onmessage(&self, handler: impl Fn(&WorkerScope, MessageEvent) -> ScriptResult + 'static) {
		self.scope.set_onmessage(handler);
	}
}
