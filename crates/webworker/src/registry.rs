//! Process-wide identity table of shared workers.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use url::Url;

use crate::config::WorkerOptions;
use crate::port::Port;
use crate::supervisor::Supervisor;
use crate::{Error, Result};

/// Shared workers indexed by source and by name.
///
/// Both indices always point at the same supervisor. Entries whose worker
/// has exited are evicted on the next lookup, so asking again for the same
/// identity starts a fresh worker.
#[derive(Clone, Default)]
pub struct SharedWorkerRegistry {
	inner: Arc<Mutex<Entries>>,
}

#[derive(Default)]
struct Entries {
	by_source: HashMap<String, Supervisor>,
	by_name: HashMap<String, Supervisor>,
}

impl Entries {
	fn evict_exited(&mut self) {
		self.by_source.retain(|_, supervisor| !supervisor.is_exited());
		self.by_name.retain(|_, supervisor| !supervisor.is_exited());
	}
}

impl SharedWorkerRegistry {
	/// Creates an empty registry.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// The registry used by [`crate::SharedWorker::new`].
	pub fn global() -> &'static Self {
		static GLOBAL: OnceLock<SharedWorkerRegistry> = OnceLock::new();
		GLOBAL.get_or_init(Self::new)
	}

	/// Returns the shared worker for `(source, name)`, starting it if needed,
	/// together with a new port bound to it.
	///
	/// # Errors
	///
	/// Returns [`Error::NameConflict`] if `source` is registered under another
	/// name, [`Error::SourceConflict`] if `name` is registered for another
	/// source, or any error from starting the worker.
	pub fn get_or_create(&self, source: &Url, name: &str, options: &WorkerOptions) -> Result<(Supervisor, Port)> {
		let mut entries = self.inner.lock();
		entries.evict_exited();

		if let Some(existing) = entries.by_source.get(source.as_str()) {
			let existing_name = existing.name().unwrap_or_default();
			if existing_name != name {
				return Err(Error::NameConflict {
					locator: source.to_string(),
					existing: existing_name.to_string(),
				});
			}
			let supervisor = existing.clone();
			tracing::debug!(pid = supervisor.pid(), source = %source, name, "reusing shared worker");
			let port = Port::new(supervisor.clone());
			return Ok((supervisor, port));
		}
		if let Some(existing) = entries.by_name.get(name) {
			return Err(Error::SourceConflict {
				name: name.to_string(),
				existing: existing.source().to_string(),
			});
		}

		let supervisor = Supervisor::start(source.clone(), Some(name), options)?;
		entries.by_source.insert(source.to_string(), supervisor.clone());
		entries.by_name.insert(name.to_string(), supervisor.clone());
		let port = Port::new(supervisor.clone());
		Ok((supervisor, port))
	}

	/// Live shared worker registered for `source`.
	#[must_use]
	pub fn lookup(&self, source: &Url) -> Option<Supervisor> {
		self.inner
			.lock()
			.by_source
			.get(source.as_str())
			.filter(|supervisor| !supervisor.is_exited())
			.cloned()
	}

	/// Number of registered workers that have not exited.
	#[must_use]
	pub fn len(&self) -> usize {
		self.inner.lock().by_source.values().filter(|supervisor| !supervisor.is_exited()).count()
	}

	/// Whether no live worker is registered.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl fmt::Debug for SharedWorkerRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let entries = self.inner.lock();
		f.debug_struct("SharedWorkerRegistry")
			.field("by_source", &entries.by_source)
			.field("by_name", &entries.by_name.keys().collect::<Vec<_>>())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn start_outside_runtime_registers_nothing() {
		let registry = SharedWorkerRegistry::new();
		let source = Url::parse("file:///srv/a.js").unwrap();
		let options = WorkerOptions::new().launcher("/nonexistent/webworker-child");

		let result = registry.get_or_create(&source, "X", &options);
		assert!(matches!(result, Err(Error::NoRuntime)));
		assert!(registry.is_empty());
		assert!(registry.lookup(&source).is_none());
	}

	#[tokio::test]
	async fn spawn_failure_registers_nothing() {
		let root = tempfile::tempdir().unwrap();
		let registry = SharedWorkerRegistry::new();
		let source = Url::parse("file:///srv/a.js").unwrap();
		let options = WorkerOptions::new()
			.launcher(root.path().join("missing-launcher"))
			.socket_root(root.path());

		let result = registry.get_or_create(&source, "X", &options);
		assert!(matches!(result, Err(Error::Spawn { .. })));
		assert!(registry.is_empty());
	}
}
