//! Worker construction options.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;
use webworker_proto::paths;

use crate::{Error, Result};

/// Timeout applied by `terminate` when none is given.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Environment variable naming the launcher program.
pub const LAUNCHER_ENV: &str = "WEBWORKER_LAUNCHER";

/// File name of the bundled launcher, looked up next to the current executable.
pub const LAUNCHER_NAME: &str = "webworker-child";

/// How long a terminating worker may take before it is killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillTimeout {
	/// Send `SIGTERM` if the worker is still alive after this long.
	After(Duration),
	/// Wait for the worker indefinitely.
	Never,
}

impl Default for KillTimeout {
	fn default() -> Self {
		Self::After(DEFAULT_KILL_TIMEOUT)
	}
}

impl From<Duration> for KillTimeout {
	/// A zero duration means "never kill".
	fn from(timeout: Duration) -> Self {
		if timeout.is_zero() { Self::Never } else { Self::After(timeout) }
	}
}

/// Options for spawning a worker process.
///
/// The child is started as
/// `<launcher> [launcher_args..] [-S <name>] <socket> <source> [child_args..]`.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
	pub(crate) launcher: Option<PathBuf>,
	pub(crate) launcher_args: Vec<OsString>,
	pub(crate) child_args: Vec<OsString>,
	pub(crate) kill_timeout: KillTimeout,
	pub(crate) socket_root: Option<PathBuf>,
}

impl WorkerOptions {
	/// Creates default options.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Sets the program used to run the worker.
	#[must_use]
	pub fn launcher(mut self, launcher: impl Into<PathBuf>) -> Self {
		self.launcher = Some(launcher.into());
		self
	}

	/// Adds an argument placed before the worker arguments, e.g. an interpreter flag.
	#[must_use]
	pub fn launcher_arg(mut self, arg: impl Into<OsString>) -> Self {
		self.launcher_args.push(arg.into());
		self
	}

	/// Adds an argument passed after the source, visible to the worker script.
	#[must_use]
	pub fn child_arg(mut self, arg: impl Into<OsString>) -> Self {
		self.child_args.push(arg.into());
		self
	}

	/// Sets the default timeout used by `terminate`.
	#[must_use]
	pub fn kill_timeout(mut self, timeout: impl Into<KillTimeout>) -> Self {
		self.kill_timeout = timeout.into();
		self
	}

	/// Sets the directory under which socket directories are created.
	#[must_use]
	pub fn socket_root(mut self, root: impl Into<PathBuf>) -> Self {
		self.socket_root = Some(root.into());
		self
	}

	/// Resolves the launcher program.
	///
	/// # Resolution Order
	///
	/// 1. [`WorkerOptions::launcher`].
	/// 2. `WEBWORKER_LAUNCHER` environment variable.
	/// 3. `webworker-child` next to the current executable.
	pub(crate) fn resolve_launcher(&self) -> Result<PathBuf> {
		if let Some(launcher) = &self.launcher {
			return Ok(launcher.clone());
		}
		if let Some(launcher) = std::env::var_os(LAUNCHER_ENV) {
			return Ok(PathBuf::from(launcher));
		}
		std::env::current_exe()
			.ok()
			.map(|exe| exe.with_file_name(LAUNCHER_NAME))
			.filter(|candidate| candidate.is_file())
			.ok_or(Error::LauncherNotFound)
	}

	pub(crate) fn resolve_socket_root(&self) -> PathBuf {
		self.socket_root.clone().unwrap_or_else(paths::default_socket_root)
	}
}

/// Turns a worker source into the locator handed to the child.
///
/// Strings that parse as URLs are kept; anything else is treated as a file
/// path and made absolute.
pub fn resolve_source(source: &str) -> Result<Url> {
	if source.is_empty() {
		return Err(Error::InvalidSource(source.to_string()));
	}
	// Single letter schemes are drive letters, not URLs.
	if let Ok(url) = Url::parse(source)
		&& url.scheme().len() > 1
	{
		return Ok(url);
	}
	let path = std::path::absolute(Path::new(source))?;
	Url::from_file_path(&path).map_err(|()| Error::InvalidSource(source.to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn zero_timeout_never_kills() {
		assert_eq!(KillTimeout::from(Duration::ZERO), KillTimeout::Never);
		assert_eq!(KillTimeout::from(Duration::from_millis(50)), KillTimeout::After(Duration::from_millis(50)));
		assert_eq!(KillTimeout::default(), KillTimeout::After(DEFAULT_KILL_TIMEOUT));
	}

	#[test]
	fn paths_become_file_urls() {
		let url = resolve_source("/srv/workers/echo.js").unwrap();
		assert_eq!(url.as_str(), "file:///srv/workers/echo.js");

		let relative = resolve_source("echo.js").unwrap();
		assert_eq!(relative.scheme(), "file");
		assert!(relative.path().ends_with("/echo.js"));

		let kept = resolve_source("file:///already/a/url.js").unwrap();
		assert_eq!(kept.as_str(), "file:///already/a/url.js");

		assert!(matches!(resolve_source(""), Err(Error::InvalidSource(_))));
	}

	#[test]
	fn explicit_launcher_wins() {
		let options = WorkerOptions::new().launcher("/opt/bin/runner");
		assert_eq!(options.resolve_launcher().unwrap(), PathBuf::from("/opt/bin/runner"));
	}
}
