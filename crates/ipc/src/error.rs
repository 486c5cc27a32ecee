//! Error types for the message stream.

use std::io;

use thiserror::Error;
use webworker_proto::FrameError;

/// Errors that end a message stream.
#[derive(Debug, Error)]
pub enum StreamError {
	/// Input/output error from the underlying socket.
	#[error("transport error: {0}")]
	Io(#[from] io::Error),
	/// Framing was lost or a value could not be encoded.
	#[error(transparent)]
	Frame(#[from] FrameError),
	/// The writer task has stopped; nothing more can be sent.
	#[error("message stream closed")]
	Closed,
}

/// Result type for message stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;
