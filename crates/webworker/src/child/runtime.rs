use tokio::time::Instant;
use url::Url;
use webworker_ipc::{FdSocket, MessageReceiver, MessageSender, message_stream};

use super::args::ChildArgs;
use super::scope::{ScriptResult, WorkerScope};
use crate::{Error, Result};

/// Executes worker source code against a scope of bindings.
pub trait ScriptHost {
	/// Runs `source` as the top level of the worker.
	///
	/// Handlers registered on `scope` stay active after this returns. An
	/// `Err` is reported like any other uncaught error.
	fn run(&mut self, scope: &WorkerScope, source: &str, location: &Url) -> ScriptResult;
}

/// Reads the script behind a locator. Only `file:` URLs are supported.
///
/// # Errors
///
/// Returns [`Error::InvalidSource`] for other schemes and an I/O error when
/// the file cannot be read.
pub fn load_source(locator: &str) -> Result<(Url, String)> {
	let location = Url::parse(locator).map_err(|_| Error::InvalidSource(locator.to_string()))?;
	if location.scheme() != "file" {
		return Err(Error::InvalidSource(locator.to_string()));
	}
	let path = location
		.to_file_path()
		.map_err(|()| Error::InvalidSource(locator.to_string()))?;
	let source = std::fs::read_to_string(path)?;
	Ok((location, source))
}

/// Runs a worker process to completion.
///
/// Loads the script, connects to the master, runs the script through `host`
/// and then serves master messages and timers. Returns once the script
/// called `close()`, once a `CLOSE` left no timers pending, or once the
/// master went away.
///
/// # Errors
///
/// Fails if the script cannot be loaded, the socket cannot be reached, or
/// the stream breaks.
pub async fn run_child(args: ChildArgs, host: &mut impl ScriptHost) -> Result<()> {
	let (location, source) = load_source(&args.source)?;
	let socket = FdSocket::connect(&args.socket).await?;
	let (mut sender, mut receiver) = message_stream(socket);
	tracing::debug!(socket = %args.socket.display(), source = %location, "worker connected");

	let scope = WorkerScope::new(args.shared, location.clone(), args.args);
	if let Err(error) = host.run(&scope, &source, &location) {
		scope.report(error);
	}
	if scope.name().is_some() {
		scope.connect();
	}

	let result = serve(&scope, &mut sender, &mut receiver).await;
	sender.close().await;
	result
}

/// Dispatches master messages and timers until the worker is done.
async fn serve(scope: &WorkerScope, sender: &mut MessageSender, receiver: &mut MessageReceiver) -> Result<()> {
	loop {
		flush(scope, sender)?;
		if scope.is_closed() {
			tracing::debug!("worker closed itself");
			return Ok(());
		}
		if scope.is_closing() && !scope.has_timers() {
			tracing::debug!("worker closed by master");
			return Ok(());
		}

		let reading = !scope.is_closing();
		tokio::select! {
			incoming = receiver.recv(), if reading => match incoming? {
				Some(incoming) => scope.dispatch(incoming),
				None => {
					tracing::debug!("master went away");
					return Ok(());
				}
			},
			() = sleep_until(scope.next_deadline()) => scope.run_due_timers(),
		}
	}
}

fn flush(scope: &WorkerScope, sender: &mut MessageSender) -> Result<()> {
	for (message, fd) in scope.take_outbox() {
		sender.send(message, fd)?;
	}
	Ok(())
}

async fn sleep_until(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use serde_json::{Value, json};
	use tokio::net::UnixListener;
	use webworker_ipc::MessageReceiver;
	use webworker_proto::{ErrorInfo, Message, MessageType};

	use super::*;

	/// Host driven by a closure instead of a script language.
	struct FnHost<F>(F);

	impl<F: FnMut(&WorkerScope) -> ScriptResult> ScriptHost for FnHost<F> {
		fn run(&mut self, scope: &WorkerScope, _source: &str, _location: &Url) -> ScriptResult {
			(self.0)(scope)
		}
	}

	struct Fixture {
		_dir: tempfile::TempDir,
		listener: UnixListener,
		args: ChildArgs,
	}

	fn fixture(shared: Option<&str>) -> Fixture {
		let dir = tempfile::tempdir().unwrap();
		let script = dir.path().join("worker.js");
		std::fs::write(&script, "// test").unwrap();
		let socket = dir.path().join("sock");
		let listener = UnixListener::bind(&socket).unwrap();
		let args = ChildArgs {
			shared: shared.map(str::to_string),
			socket,
			source: Url::from_file_path(&script).unwrap().to_string(),
			args: Vec::new(),
		};
		Fixture {
			_dir: dir,
			listener,
			args,
		}
	}

	async fn accept(listener: &UnixListener) -> (MessageSender, MessageReceiver) {
		let (stream, _) = listener.accept().await.unwrap();
		message_stream(FdSocket::new(stream))
	}

	async fn next_message(rx: &mut MessageReceiver) -> Message {
		rx.recv().await.unwrap().expect("stream ended early").message
	}

	#[test]
	fn only_file_urls_load() {
		assert!(matches!(load_source("http://example.com/w.js"), Err(Error::InvalidSource(_))));
		assert!(matches!(load_source("not a url"), Err(Error::InvalidSource(_))));
		assert!(matches!(load_source("file:///nonexistent/w.js"), Err(Error::Io(_))));

		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("w.js");
		std::fs::write(&path, "post 1").unwrap();
		let (location, source) = load_source(Url::from_file_path(&path).unwrap().as_str()).unwrap();
		assert_eq!(location.scheme(), "file");
		assert_eq!(source, "post 1");
	}

	#[tokio::test]
	async fn echo_until_close() {
		let fx = fixture(None);
		let mut host = FnHost(|scope: &WorkerScope| {
			scope.post_message(json!("ready"));
			scope.set_onmessage(|scope, event| {
				scope.post_message(event.data);
				Ok(())
			});
			Ok(())
		});
		let master = async {
			let (mut tx, mut rx) = accept(&fx.listener).await;
			assert_eq!(next_message(&mut rx).await.payload, json!("ready"));
			tx.send(Message::user(json!({"n": 1})), None).unwrap();
			assert_eq!(next_message(&mut rx).await.payload, json!({"n": 1}));
			tx.send(Message::close(), None).unwrap();
			(tx, rx)
		};

		let (result, (_tx, mut rx)) = tokio::join!(run_child(fx.args.clone(), &mut host), master);
		result.unwrap();
		assert!(rx.recv().await.unwrap().is_none(), "worker should hang up after CLOSE");
	}

	#[tokio::test]
	async fn script_error_is_reported_to_master() {
		let fx = fixture(None);
		let mut host = FnHost(|_: &WorkerScope| Err(ErrorInfo::new("boom", "/w/worker.js", 5)));
		let master = async {
			let (tx, mut rx) = accept(&fx.listener).await;
			let message = next_message(&mut rx).await;
			drop((tx, rx));
			message
		};

		let (result, message) = tokio::join!(run_child(fx.args.clone(), &mut host), master);
		result.unwrap();
		assert_eq!(message.kind(), Some(MessageType::Error));
		let info = ErrorInfo::from_value(&message.payload);
		assert_eq!((info.message.as_str(), info.line), ("boom", 5));
	}

	#[tokio::test]
	async fn shared_worker_gets_connect_after_script() {
		let fx = fixture(Some("X"));
		let mut host = FnHost(|scope: &WorkerScope| {
			scope.post_message(json!("script"));
			scope.set_onconnect(|scope, port| {
				port.post_message(json!({"connected": scope.name()}));
				Ok(())
			});
			Ok(())
		});
		let master = async {
			let (tx, mut rx) = accept(&fx.listener).await;
			let first = next_message(&mut rx).await.payload;
			let second = next_message(&mut rx).await.payload;
			drop((tx, rx));
			(first, second)
		};

		let (result, payloads) = tokio::join!(run_child(fx.args.clone(), &mut host), master);
		result.unwrap();
		assert_eq!(payloads, (json!("script"), json!({"connected": "X"})));
	}

	#[tokio::test]
	async fn close_waits_for_pending_timers() {
		let fx = fixture(None);
		let mut host = FnHost(|scope: &WorkerScope| {
			scope.set_onclose(|scope| {
				scope.set_timeout(Duration::from_millis(10), |scope| {
					scope.post_message(json!("bye"));
					Ok(())
				});
				Ok(())
			});
			Ok(())
		});
		let master = async {
			let (mut tx, mut rx) = accept(&fx.listener).await;
			tx.send(Message::close(), None).unwrap();
			let mut seen: Vec<Value> = Vec::new();
			while let Some(incoming) = rx.recv().await.unwrap() {
				seen.push(incoming.message.payload);
			}
			seen
		};

		let (result, seen) = tokio::join!(run_child(fx.args.clone(), &mut host), master);
		result.unwrap();
		assert_eq!(seen, vec![json!("bye")]);
	}
}
