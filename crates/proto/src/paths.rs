//! Socket path allocation for per-worker listening endpoints.
//!
//! Each master process owns a private directory `<root>/webworker-<pid>/` and
//! hands out socket paths inside it using a process-wide ordinal, so workers of
//! one master never collide with each other or with their own children.

use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Environment variable overriding the socket root directory.
pub const SOCKET_DIR_ENV: &str = "WEBWORKER_SOCKET_DIR";

static NEXT_ORDINAL: AtomicU64 = AtomicU64::new(0);

/// Returns the root under which socket directories are created.
///
/// # Resolution Order
///
/// 1. `WEBWORKER_SOCKET_DIR` environment variable.
/// 2. System temp directory (e.g. `/tmp`).
#[must_use]
pub fn default_socket_root() -> PathBuf {
	std::env::var_os(SOCKET_DIR_ENV)
		.map(PathBuf::from)
		.unwrap_or_else(std::env::temp_dir)
}

/// Directory holding this process's worker sockets.
#[must_use]
pub fn socket_dir(root: &Path) -> PathBuf {
	root.join(format!("webworker-{}", std::process::id()))
}

/// Allocates a fresh socket path, creating the private directory if needed.
///
/// A stale file left at the allocated path is removed.
///
/// # Errors
///
/// Returns an error if the directory cannot be created.
pub fn allocate_socket_path(root: &Path) -> io::Result<PathBuf> {
	let dir = socket_dir(root);
	DirBuilder::new().recursive(true).mode(0o700).create(&dir)?;

	let ordinal = NEXT_ORDINAL.fetch_add(1, Ordering::Relaxed);
	let path = dir.join(ordinal.to_string());
	match std::fs::remove_file(&path) {
		Ok(()) => {}
		Err(e) if e.kind() == io::ErrorKind::NotFound => {}
		Err(e) => return Err(e),
	}
	Ok(path)
}

/// Removes a socket file and, when it is the last one, its directory.
pub fn release_socket_path(path: &Path) {
	let _ = std::fs::remove_file(path);
	if let Some(dir) = path.parent() {
		// Fails while other workers still have sockets there.
		let _ = std::fs::remove_dir(dir);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn allocated_paths_are_unique_and_private() {
		let root = tempfile::tempdir().unwrap();
		let a = allocate_socket_path(root.path()).unwrap();
		let b = allocate_socket_path(root.path()).unwrap();

		assert_ne!(a, b);
		assert_eq!(a.parent(), b.parent());
		assert_eq!(a.parent(), Some(socket_dir(root.path()).as_path()));

		let mode = std::fs::metadata(a.parent().unwrap()).unwrap().permissions();
		assert_eq!(std::os::unix::fs::PermissionsExt::mode(&mode) & 0o777, 0o700);
	}

	#[test]
	fn release_removes_empty_directory_only() {
		let root = tempfile::tempdir().unwrap();
		let a = allocate_socket_path(root.path()).unwrap();
		let b = allocate_socket_path(root.path()).unwrap();
		std::fs::write(&a, b"").unwrap();
		std::fs::write(&b, b"").unwrap();

		release_socket_path(&a);
		assert!(!a.exists());
		assert!(socket_dir(root.path()).exists());

		release_socket_path(&b);
		assert!(!socket_dir(root.path()).exists());
	}
}
