//! Message and envelope types for the webworker protocol.
//!
//! A [`Message`] is the 2-element array `[type, payload]`. An [`Envelope`]
//! wraps it as `[fd_seq, message]` so that a descriptor sent out-of-band can be
//! matched with the message it accompanies. `fd_seq == 0` means the message
//! carries no descriptor.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// Closed set of message types understood by masters and workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
	/// No-op. The payload is discarded.
	Noop,
	/// Identifies the connecting process. Only used by the single-socket model.
	Handshake,
	/// An uncaught error bubbled up from a worker.
	Error,
	/// Graceful shutdown request from the master.
	Close,
	/// A user message posted through `postMessage`.
	User,
}

impl MessageType {
	/// Wire code of this message type.
	#[must_use]
	pub const fn code(self) -> u64 {
		match self {
			Self::Noop => 0,
			Self::Handshake => 1,
			Self::Error => 2,
			Self::Close => 3,
			Self::User => 100,
		}
	}

	/// Maps a wire code back to a known message type.
	#[must_use]
	pub const fn from_code(code: u64) -> Option<Self> {
		match code {
			0 => Some(Self::Noop),
			1 => Some(Self::Handshake),
			2 => Some(Self::Error),
			3 => Some(Self::Close),
			100 => Some(Self::User),
			_ => None,
		}
	}
}

/// Why a decoded value was rejected as a message or envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidShape {
	/// The value is not a 2-element array.
	#[error("expected a 2-element array")]
	NotPair,
	/// The message type is not an unsigned integer.
	#[error("message type is not an unsigned integer")]
	BadType,
	/// The descriptor sequence is not an unsigned integer.
	#[error("descriptor sequence is not an unsigned integer")]
	BadSequence,
}

/// A typed message: `(type, payload)`.
///
/// The type is kept as its raw wire code so that messages with codes unknown
/// to this build still pass through the stream and can be reported by the
/// receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
	/// Raw wire code, see [`MessageType::code`].
	pub code: u64,
	/// Opaque structured payload.
	pub payload: Value,
}

impl Message {
	/// Creates a message of a known type.
	#[must_use]
	pub fn new(kind: MessageType, payload: Value) -> Self {
		Self {
			code: kind.code(),
			payload,
		}
	}

	/// Creates a `USER` message.
	#[must_use]
	pub fn user(payload: Value) -> Self {
		Self::new(MessageType::User, payload)
	}

	/// Creates a `CLOSE` message.
	#[must_use]
	pub fn close() -> Self {
		Self::new(MessageType::Close, Value::Null)
	}

	/// Creates an `ERROR` message describing an uncaught script error.
	#[must_use]
	pub fn error(info: &ErrorInfo) -> Self {
		Self::new(MessageType::Error, info.to_value())
	}

	/// Known type of this message, if any.
	#[must_use]
	pub fn kind(&self) -> Option<MessageType> {
		MessageType::from_code(self.code)
	}

	/// Validates a decoded value as a message.
	pub fn from_value(value: Value) -> Result<Self, InvalidShape> {
		let [code, payload] = take_pair(value)?;
		let code = code.as_u64().ok_or(InvalidShape::BadType)?;
		Ok(Self { code, payload })
	}
}

impl Serialize for Message {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		(self.code, &self.payload).serialize(serializer)
	}
}

/// Wire-level wrapper pairing a descriptor sequence number with a message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
	/// Descriptor sequence number; `0` when no descriptor accompanies the message.
	pub fd_seq: u64,
	/// The wrapped message.
	pub message: Message,
}

impl Envelope {
	/// Wraps a message that carries no descriptor.
	#[must_use]
	pub fn plain(message: Message) -> Self {
		Self { fd_seq: 0, message }
	}

	/// Returns true if a descriptor travels alongside this envelope.
	#[must_use]
	pub fn expects_descriptor(&self) -> bool {
		self.fd_seq > 0
	}

	/// Validates a decoded value as an envelope.
	pub fn from_value(value: Value) -> Result<Self, InvalidShape> {
		let [seq, message] = take_pair(value)?;
		let fd_seq = seq.as_u64().ok_or(InvalidShape::BadSequence)?;
		Ok(Self {
			fd_seq,
			message: Message::from_value(message)?,
		})
	}
}

impl Serialize for Envelope {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		(self.fd_seq, &self.message).serialize(serializer)
	}
}

fn take_pair(value: Value) -> Result<[Value; 2], InvalidShape> {
	match value {
		Value::Array(items) => <[Value; 2]>::try_from(items).map_err(|_| InvalidShape::NotPair),
		_ => Err(InvalidShape::NotPair),
	}
}

/// Payload of an `ERROR` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorInfo {
	/// Human readable error message.
	pub message: String,
	/// Location of the script that raised the error.
	pub filename: String,
	/// 1-based line number, `0` when unknown.
	pub line: u32,
}

impl ErrorInfo {
	/// Creates error information for a script location.
	pub fn new(message: impl Into<String>, filename: impl Into<String>, line: u32) -> Self {
		Self {
			message: message.into(),
			filename: filename.into(),
			line,
		}
	}

	/// Converts into a message payload.
	#[must_use]
	pub fn to_value(&self) -> Value {
		serde_json::json!({
			"message": self.message,
			"filename": self.filename,
			"line": self.line,
		})
	}

	/// Reads error information out of a payload, tolerating missing fields.
	#[must_use]
	pub fn from_value(value: &Value) -> Self {
		match value {
			Value::Object(_) => serde_json::from_value(value.clone()).unwrap_or_default(),
			Value::String(message) => Self {
				message: message.clone(),
				..Self::default()
			},
			_ => Self::default(),
		}
	}
}

impl std::fmt::Display for ErrorInfo {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{} ({}:{})", self.message, self.filename, self.line)
	}
}
