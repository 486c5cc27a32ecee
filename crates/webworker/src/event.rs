//! Events delivered from a worker to its observers.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;

use serde_json::Value;
use webworker_proto::ErrorInfo;

/// A file descriptor received alongside a message.
///
/// Cloning shares the same descriptor; it is closed when the last clone is
/// dropped. Use [`Descriptor::try_clone_owned`] to obtain an independent copy.
#[derive(Debug, Clone)]
pub struct Descriptor(Arc<OwnedFd>);

impl Descriptor {
	/// Duplicates the descriptor.
	///
	/// # Errors
	///
	/// Returns an error if the descriptor cannot be duplicated.
	pub fn try_clone_owned(&self) -> io::Result<OwnedFd> {
		self.0.try_clone()
	}
}

impl From<OwnedFd> for Descriptor {
	fn from(fd: OwnedFd) -> Self {
		Self(Arc::new(fd))
	}
}

impl AsFd for Descriptor {
	fn as_fd(&self) -> BorrowedFd<'_> {
		self.0.as_fd()
	}
}

impl AsRawFd for Descriptor {
	fn as_raw_fd(&self) -> RawFd {
		self.0.as_raw_fd()
	}
}

/// A `USER` message delivered to `onmessage`.
#[derive(Debug, Clone)]
pub struct MessageEvent {
	/// Payload posted by the other side.
	pub data: Value,
	/// Descriptor posted together with the payload.
	pub descriptor: Option<Descriptor>,
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
	/// Exit code, when the process exited normally.
	pub code: Option<i32>,
	/// Signal number, when the process was killed by a signal.
	pub signal: Option<i32>,
}

impl From<std::process::ExitStatus> for ExitStatus {
	fn from(status: std::process::ExitStatus) -> Self {
		use std::os::unix::process::ExitStatusExt;

		Self {
			code: status.code(),
			signal: status.signal(),
		}
	}
}

/// Receiver of worker events, one method per event kind.
///
/// Methods run on the supervisor's task and should not block.
pub trait WorkerObserver: Send + Sync + 'static {
	/// A `USER` message arrived.
	fn on_message(&self, event: MessageEvent) {
		let _ = event;
	}

	/// The worker reported an uncaught script error.
	fn on_error(&self, error: ErrorInfo) {
		let _ = error;
	}

	/// The worker process exited. Delivered exactly once.
	fn on_exit(&self, status: ExitStatus) {
		let _ = status;
	}
}
