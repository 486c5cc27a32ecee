//! Worker process supervision.
//!
//! A [`Supervisor`] is a cheap handle to a driver task that owns one worker
//! process, its listening socket and its message stream. Handles talk to the
//! driver over a command channel and observe its [`Phase`] through a watch
//! channel.

mod driver;
mod lifecycle;

use std::os::fd::OwnedFd;
use std::{fmt, io};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::net::UnixListener;
use tokio::process::Command as ProcessCommand;
use tokio::sync::{mpsc, watch};
use url::Url;
use webworker_proto::{ErrorInfo, Message, paths};

use self::driver::{Command, Driver, Outbound};
pub use self::lifecycle::Phase;
use self::lifecycle::Lifecycle;
use crate::config::{KillTimeout, WorkerOptions};
use crate::event::{ExitStatus, MessageEvent, WorkerObserver};
use crate::{Error, Result};

/// Handle to a supervised worker process.
///
/// Clones refer to the same process.
#[derive(Clone)]
pub struct Supervisor {
	inner: Arc<Inner>,
}

struct Inner {
	pid: u32,
	source: Url,
	name: Option<String>,
	socket_path: PathBuf,
	kill_timeout: KillTimeout,
	commands: mpsc::UnboundedSender<Command>,
	phase: watch::Receiver<Phase>,
	observers: Observers,
}

impl Supervisor {
	/// Binds a socket, spawns the worker process and starts its driver task.
	///
	/// A `name` marks the worker as shared and is passed to the child as
	/// `-S <name>`.
	///
	/// # Errors
	///
	/// Fails outside a tokio runtime, when no launcher can be found, or when
	/// the socket or the process cannot be created.
	pub fn start(source: Url, name: Option<&str>, options: &WorkerOptions) -> Result<Self> {
		tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
		let launcher = options.resolve_launcher()?;
		let (socket_path, listener) = bind_socket(&options.resolve_socket_root(), paths::allocate_socket_path)?;

		let mut command = ProcessCommand::new(&launcher);
		command.args(&options.launcher_args);
		if let Some(name) = name {
			command.arg("-S").arg(name);
		}
		command
			.arg(&socket_path)
			.arg(source.as_str())
			.args(&options.child_args)
			.stdin(Stdio::null())
			.stdout(Stdio::inherit())
			.stderr(Stdio::inherit());
		let child = match command.spawn() {
			Ok(child) => child,
			Err(error) => {
				drop(listener);
				paths::release_socket_path(&socket_path);
				return Err(Error::Spawn { launcher, error });
			}
		};
		let pid = child.id().unwrap_or_default();
		tracing::info!(pid, source = %source, socket = %socket_path.display(), "worker spawned");

		let mut lifecycle = Lifecycle::new();
		lifecycle.spawned();
		let (phase_tx, phase_rx) = watch::channel(lifecycle.phase());
		let (commands_tx, commands_rx) = mpsc::unbounded_channel();
		let observers = Observers::default();

		let driver = Driver {
			pid,
			socket_path: socket_path.clone(),
			listener: Some(listener),
			child,
			lifecycle,
			sender: None,
			receiver: None,
			kill_deadline: None,
			commands: commands_rx,
			phase: phase_tx,
			observers: observers.clone(),
		};
		tokio::spawn(driver.run());

		Ok(Self {
			inner: Arc::new(Inner {
				pid,
				source,
				name: name.map(str::to_string),
				socket_path,
				kill_timeout: options.kill_timeout,
				commands: commands_tx,
				phase: phase_rx,
				observers,
			}),
		})
	}

	/// Posts a message, queueing it if the worker has not connected yet.
	///
	/// # Errors
	///
	/// Returns [`Error::Exited`] once the worker process has exited.
	pub fn post_message(&self, message: Message, fd: Option<OwnedFd>) -> Result<()> {
		if self.is_exited() {
			return Err(Error::Exited);
		}
		self.inner
			.commands
			.send(Command::Post(Outbound { message, fd }))
			.map_err(|_| Error::Exited)
	}

	/// Requests termination with the timeout from [`WorkerOptions`].
	pub fn terminate(&self) {
		self.terminate_with(self.inner.kill_timeout);
	}

	/// Requests termination: sends `CLOSE`, then `SIGTERM` after `timeout`.
	///
	/// Repeated calls while terminating have no effect.
	pub fn terminate_with(&self, timeout: impl Into<KillTimeout>) {
		let _ = self.inner.commands.send(Command::Terminate(timeout.into()));
	}

	/// Current lifecycle phase.
	#[must_use]
	pub fn phase(&self) -> Phase {
		*self.inner.phase.borrow()
	}

	/// Whether the worker process has exited.
	#[must_use]
	pub fn is_exited(&self) -> bool {
		self.phase() == Phase::Exited
	}

	/// Waits until the worker process has exited and its exit was reported.
	pub async fn exited(&self) {
		let mut phase = self.inner.phase.clone();
		let _ = phase.wait_for(|phase| *phase == Phase::Exited).await;
	}

	/// OS process id of the worker.
	#[must_use]
	pub fn pid(&self) -> u32 {
		self.inner.pid
	}

	/// Locator the worker was started with.
	#[must_use]
	pub fn source(&self) -> &Url {
		&self.inner.source
	}

	/// Shared worker name, `None` for dedicated workers.
	#[must_use]
	pub fn name(&self) -> Option<&str> {
		self.inner.name.as_deref()
	}

	/// Path of the listening socket.
	#[must_use]
	pub fn socket_path(&self) -> &Path {
		&self.inner.socket_path
	}

	/// Registers an observer. Only a weak reference is kept.
	pub fn subscribe(&self, observer: &Arc<dyn WorkerObserver>) {
		self.inner.observers.add(observer);
	}

	/// Whether both handles refer to the same worker.
	#[must_use]
	pub fn ptr_eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}
}

impl fmt::Debug for Supervisor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Supervisor")
			.field("pid", &self.inner.pid)
			.field("source", &self.inner.source.as_str())
			.field("name", &self.inner.name)
			.field("phase", &self.phase())
			.finish_non_exhaustive()
	}
}

/// Allocation attempts before giving up on binding a socket.
const BIND_ATTEMPTS: usize = 4;

/// Allocates a socket path under `root` and binds a listener to it.
///
/// Another worker releasing its socket may remove the shared directory
/// between allocation and bind; that case is retried with a fresh path.
fn bind_socket(root: &Path, mut allocate: impl FnMut(&Path) -> io::Result<PathBuf>) -> Result<(PathBuf, UnixListener)> {
	let mut attempt = 1;
	loop {
		let path = allocate(root)?;
		match UnixListener::bind(&path) {
			Ok(listener) => return Ok((path, listener)),
			Err(e) if e.kind() == io::ErrorKind::NotFound && attempt < BIND_ATTEMPTS => {
				tracing::debug!(path = %path.display(), attempt, "socket directory vanished before bind, retrying");
				attempt += 1;
			}
			Err(e) => {
				paths::release_socket_path(&path);
				return Err(e.into());
			}
		}
	}
}

/// Weakly held observers of one worker.
#[derive(Clone, Default)]
pub(crate) struct Observers(Arc<Mutex<Vec<Weak<dyn WorkerObserver>>>>);

impl Observers {
	fn add(&self, observer: &Arc<dyn WorkerObserver>) {
		let mut list = self.0.lock();
		list.retain(|weak| weak.strong_count() > 0);
		list.push(Arc::downgrade(observer));
	}

	/// Upgrades live observers so callbacks run without the lock held.
	fn live(&self) -> Vec<Arc<dyn WorkerObserver>> {
		self.0.lock().iter().filter_map(Weak::upgrade).collect()
	}

	pub(crate) fn message(&self, event: MessageEvent) {
		let live = self.live();
		if live.is_empty() {
			tracing::debug!("message dropped, no observers");
		}
		for observer in live {
			observer.on_message(event.clone());
		}
	}

	pub(crate) fn error(&self, error: ErrorInfo) {
		let live = self.live();
		if live.is_empty() {
			tracing::warn!(%error, "uncaught worker error");
		}
		for observer in live {
			observer.on_error(error.clone());
		}
	}

	pub(crate) fn exit(&self, status: ExitStatus) {
		for observer in self.live() {
			observer.on_exit(status);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn bind_retries_when_directory_vanishes() {
		let dir = tempfile::tempdir().unwrap();
		let root = dir.path().join("sockets");
		let mut calls = 0;
		let allocate = |root: &Path| -> io::Result<PathBuf> {
			calls += 1;
			let path = paths::allocate_socket_path(root)?;
			if calls == 1 {
				std::fs::remove_dir_all(root)?;
			}
			Ok(path)
		};

		let (path, _listener) = bind_socket(&root, allocate).unwrap();
		assert_eq!(calls, 2);
		assert!(path.exists());
	}

	#[tokio::test]
	async fn bind_gives_up_after_repeated_failures() {
		let dir = tempfile::tempdir().unwrap();
		let root = dir.path().join("sockets");
		let mut calls = 0;
		let allocate = |root: &Path| -> io::Result<PathBuf> {
			calls += 1;
			let path = paths::allocate_socket_path(root)?;
			std::fs::remove_dir_all(root)?;
			Ok(path)
		};

		assert!(matches!(bind_socket(&root, allocate), Err(Error::Io(_))));
		assert_eq!(calls, BIND_ATTEMPTS);
	}
}
