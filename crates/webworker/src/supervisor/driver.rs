//! The task that owns a worker process and its transport.

use std::io;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::net::{UnixListener, UnixStream};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use webworker_ipc::{FdSocket, Incoming, MessageReceiver, MessageSender, message_stream};
use webworker_proto::{ErrorInfo, Message, MessageType, paths};

use super::Observers;
use super::lifecycle::{AcceptAction, Lifecycle, Phase, PostAction, TerminateAction};
use crate::config::KillTimeout;
use crate::event::{Descriptor, ExitStatus, MessageEvent};

/// Upper bound on reading messages the child wrote before exiting.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// A message waiting to be written, with its descriptor.
#[derive(Debug)]
pub(crate) struct Outbound {
	pub message: Message,
	pub fd: Option<OwnedFd>,
}

/// Requests from worker handles to the driver.
#[derive(Debug)]
pub(crate) enum Command {
	Post(Outbound),
	Terminate(KillTimeout),
}

pub(crate) struct Driver {
	pub pid: u32,
	pub socket_path: PathBuf,
	pub listener: Option<UnixListener>,
	pub child: Child,
	pub lifecycle: Lifecycle<Outbound>,
	pub sender: Option<MessageSender>,
	pub receiver: Option<MessageReceiver>,
	pub kill_deadline: Option<Instant>,
	pub commands: mpsc::UnboundedReceiver<Command>,
	pub phase: watch::Sender<Phase>,
	pub observers: Observers,
}

impl Driver {
	/// Runs until the child process exits.
	pub async fn run(mut self) {
		let mut commands_open = true;
		loop {
			tokio::select! {
				biased;
				incoming = recv_next(self.receiver.as_mut()) => self.on_incoming(incoming),
				accepted = accept_next(self.listener.as_ref()) => self.on_accept(accepted),
				command = self.commands.recv(), if commands_open => match command {
					Some(command) => self.on_command(command),
					None => commands_open = false,
				},
				() = kill_timer(self.kill_deadline) => self.on_kill_timer(),
				status = self.child.wait() => {
					self.on_exit(status).await;
					return;
				}
			}
		}
	}

	fn publish(&self) {
		self.phase.send_replace(self.lifecycle.phase());
	}

	fn on_accept(&mut self, accepted: io::Result<UnixStream>) {
		let stream = match accepted {
			Ok(stream) => stream,
			Err(e) => {
				tracing::warn!(pid = self.pid, error = %e, "accept failed");
				return;
			}
		};
		match self.lifecycle.accepted() {
			AcceptAction::Attach(flush) => {
				tracing::info!(pid = self.pid, queued = flush.len(), "worker connected");
				let (sender, receiver) = message_stream(FdSocket::new(stream));
				self.sender = Some(sender);
				self.receiver = Some(receiver);
				self.publish();
				for outbound in flush {
					self.write(outbound);
				}
			}
			AcceptAction::Reject => {
				tracing::warn!(pid = self.pid, "rejecting extra connection");
			}
		}
	}

	fn on_command(&mut self, command: Command) {
		match command {
			Command::Post(outbound) => self.post(outbound),
			Command::Terminate(timeout) => match self.lifecycle.terminate(timeout) {
				TerminateAction::Ignore => {}
				TerminateAction::Close { kill_after } => {
					tracing::info!(pid = self.pid, ?kill_after, "terminating worker");
					self.kill_deadline = kill_after.map(|after| Instant::now() + after);
					self.publish();
					self.post(Outbound {
						message: Message::close(),
						fd: None,
					});
				}
			},
		}
	}

	fn post(&mut self, outbound: Outbound) {
		match self.lifecycle.post(outbound) {
			PostAction::Send(outbound) => self.write(outbound),
			PostAction::Queued => {
				tracing::trace!(pid = self.pid, queued = self.lifecycle.queued(), "queued until connect");
			}
			PostAction::Rejected(outbound) => {
				tracing::debug!(pid = self.pid, code = outbound.message.code, "dropping message for exited worker");
			}
		}
	}

	/// Queues a message on the writer task; never waits for the worker to read.
	fn write(&mut self, outbound: Outbound) {
		let Some(sender) = self.sender.as_mut() else {
			return;
		};
		let code = outbound.message.code;
		if let Err(e) = sender.send(outbound.message, outbound.fd) {
			tracing::warn!(pid = self.pid, code, error = %e, "failed to write message");
		}
	}

	fn on_kill_timer(&mut self) {
		self.kill_deadline = None;
		if !self.lifecycle.kill_timer_fired() {
			return;
		}
		let Some(pid) = self.child.id().and_then(|pid| i32::try_from(pid).ok()) else {
			return;
		};
		tracing::info!(pid, "kill timeout elapsed, sending SIGTERM");
		if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
			tracing::warn!(pid, error = %e, "failed to signal worker");
		}
	}

	fn on_incoming(&mut self, incoming: webworker_ipc::Result<Option<Incoming>>) {
		match incoming {
			Ok(Some(incoming)) => self.dispatch(incoming),
			Ok(None) => {
				tracing::debug!(pid = self.pid, "worker closed its stream");
				self.receiver = None;
			}
			Err(e) => {
				tracing::error!(pid = self.pid, error = %e, "worker stream failed, dropping connection");
				self.receiver = None;
				self.sender = None;
			}
		}
	}

	fn dispatch(&self, Incoming { message, fd }: Incoming) {
		match message.kind() {
			Some(MessageType::User) => self.observers.message(MessageEvent {
				data: message.payload,
				descriptor: fd.map(Descriptor::from),
			}),
			Some(MessageType::Error) => self.observers.error(ErrorInfo::from_value(&message.payload)),
			Some(MessageType::Noop) => {}
			Some(kind) => tracing::warn!(pid = self.pid, ?kind, "unexpected message from worker"),
			None => tracing::warn!(pid = self.pid, code = message.code, "unknown message type from worker"),
		}
	}

	async fn on_exit(&mut self, status: io::Result<std::process::ExitStatus>) {
		let status = match status {
			Ok(status) => ExitStatus::from(status),
			Err(e) => {
				tracing::error!(pid = self.pid, error = %e, "failed to wait on worker");
				ExitStatus { code: None, signal: None }
			}
		};
		let queued = self.lifecycle.queued();
		let action = self.lifecycle.exited();
		if action.cancel_kill {
			self.kill_deadline = None;
		}
		if queued > 0 {
			tracing::debug!(pid = self.pid, queued, "worker exited before connecting");
		}

		if let Some(mut receiver) = self.receiver.take() {
			let deadline = Instant::now() + DRAIN_GRACE;
			while let Ok(Ok(Some(incoming))) = tokio::time::timeout_at(deadline, receiver.recv()).await {
				self.dispatch(incoming);
			}
		}
		if action.close_transport {
			self.sender = None;
		}
		self.listener = None;
		paths::release_socket_path(&self.socket_path);

		tracing::info!(pid = self.pid, code = ?status.code, signal = ?status.signal, "worker exited");
		if action.notify {
			self.observers.exit(status);
		}
		self.publish();
	}
}

async fn recv_next(receiver: Option<&mut MessageReceiver>) -> webworker_ipc::Result<Option<Incoming>> {
	match receiver {
		Some(receiver) => receiver.recv().await,
		None => std::future::pending().await,
	}
}

async fn accept_next(listener: Option<&UnixListener>) -> io::Result<UnixStream> {
	match listener {
		Some(listener) => listener.accept().await.map(|(stream, _)| stream),
		None => std::future::pending().await,
	}
}

async fn kill_timer(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}
