//! Out-of-process Web Workers.
//!
//! A [`Worker`] runs a script in a separate OS process and exchanges
//! structured messages with it over a private Unix domain socket. Messages
//! may carry a file descriptor. A [`SharedWorker`] is one such process shared
//! by every handle created with the same source and name.
//!
//! # Architecture
//!
//! * [`supervisor`]: one driver task per worker process owning the listener,
//!   the child and the message stream
//! * [`SharedWorkerRegistry`]: identity table of shared workers
//! * [`Port`], [`Worker`], [`SharedWorker`]: the handles applications use
//! * [`child`]: the runtime inside the worker process, used by the bundled
//!   `webworker-child` launcher
//!
//! # Example
//!
//! ```no_run
//! # async fn demo() -> webworker::Result<()> {
//! use webworker::{Worker, WorkerOptions};
//!
//! let worker = Worker::new("workers/echo.txt", &WorkerOptions::new())?;
//! worker.set_onmessage(|event| println!("worker said {}", event.data));
//! worker.post_message(serde_json::json!("Hello, World!"))?;
//! worker.terminate();
//! worker.supervisor().exited().await;
//! # Ok(())
//! # }
//! ```

pub mod child;
pub mod config;
pub mod error;
pub mod event;
pub mod port;
pub mod registry;
pub mod supervisor;
pub mod worker;

pub use config::{DEFAULT_KILL_TIMEOUT, KillTimeout, WorkerOptions, resolve_source};
pub use error::{Error, Result};
pub use event::{Descriptor, ExitStatus, MessageEvent, WorkerObserver};
pub use port::Port;
pub use registry::SharedWorkerRegistry;
pub use supervisor::{Phase, Supervisor};
pub use webworker_proto::ErrorInfo;
pub use worker::{SharedWorker, Worker};
