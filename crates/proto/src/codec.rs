//! Length-prefixed MessagePack framing.
//!
//! Each frame is a little-endian `u32` body length followed by a MessagePack
//! body. Decoding is incremental: bytes are pushed as they arrive and complete
//! frames are pulled out one at a time, so a partial frame is never surfaced.

use bytes::{Buf, BytesMut};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Size of the length prefix in bytes.
pub const LEN_PREFIX: usize = 4;

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum FrameError {
	/// The length prefix exceeds [`MAX_FRAME_LEN`]; frame boundaries are lost.
	#[error("frame length {0} exceeds the 16 MiB maximum")]
	TooLarge(usize),
	/// A complete frame body was not valid MessagePack.
	#[error("malformed frame body: {0}")]
	Decode(#[from] rmp_serde::decode::Error),
	/// A value could not be serialized.
	#[error("failed to encode frame: {0}")]
	Encode(#[from] rmp_serde::encode::Error),
}

impl FrameError {
	/// Returns true if the stream cannot continue after this error.
	///
	/// A malformed body is skipped since its length was known; an oversized
	/// length prefix leaves no way to find the next frame.
	#[must_use]
	pub fn is_fatal(&self) -> bool {
		matches!(self, Self::TooLarge(_))
	}
}

/// Encodes a value into a single frame.
pub fn encode_frame<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, FrameError> {
	let mut buf = vec![0u8; LEN_PREFIX];
	rmp_serde::encode::write(&mut buf, value)?;
	let len = buf.len() - LEN_PREFIX;
	if len > MAX_FRAME_LEN {
		return Err(FrameError::TooLarge(len));
	}
	buf[..LEN_PREFIX].copy_from_slice(&(len as u32).to_le_bytes());
	Ok(buf)
}

/// Incremental frame decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
	buf: BytesMut,
	oversized: Option<usize>,
}

impl FrameDecoder {
	/// Creates an empty decoder.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Appends received bytes.
	pub fn extend(&mut self, bytes: &[u8]) {
		self.buf.extend_from_slice(bytes);
	}

	/// Number of buffered bytes not yet consumed by a complete frame.
	#[must_use]
	pub fn buffered(&self) -> usize {
		self.buf.len()
	}

	/// Pulls the next complete frame.
	///
	/// Returns `Ok(None)` when more bytes are needed. A [`FrameError::Decode`]
	/// consumes the offending frame, so calling again resumes with the next one.
	/// After [`FrameError::TooLarge`] the decoder keeps failing.
	pub fn next_frame(&mut self) -> Result<Option<Value>, FrameError> {
		if let Some(len) = self.oversized {
			return Err(FrameError::TooLarge(len));
		}
		if self.buf.len() < LEN_PREFIX {
			return Ok(None);
		}

		let mut prefix = [0u8; LEN_PREFIX];
		prefix.copy_from_slice(&self.buf[..LEN_PREFIX]);
		let len = u32::from_le_bytes(prefix) as usize;
		if len > MAX_FRAME_LEN {
			self.oversized = Some(len);
			return Err(FrameError::TooLarge(len));
		}
		if self.buf.len() < LEN_PREFIX + len {
			return Ok(None);
		}

		self.buf.advance(LEN_PREFIX);
		let body = self.buf.split_to(len);
		Ok(Some(rmp_serde::from_slice(&body)?))
	}

	/// Iterates over the frames that are complete right now.
	pub fn frames(&mut self) -> Frames<'_> {
		Frames { decoder: self, done: false }
	}
}

/// Iterator returned by [`FrameDecoder::frames`].
///
/// Ends when more bytes are needed or after yielding a fatal error.
pub struct Frames<'a> {
	decoder: &'a mut FrameDecoder,
	done: bool,
}

impl Iterator for Frames<'_> {
	type Item = Result<Value, FrameError>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.done {
			return None;
		}
		match self.decoder.next_frame() {
			Ok(Some(value)) => Some(Ok(value)),
			Ok(None) => None,
			Err(e) => {
				self.done = e.is_fatal();
				Some(Err(e))
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::{Envelope, ErrorInfo, Message, MessageType};

	fn decode_all(bytes: &[u8]) -> Vec<Value> {
		let mut decoder = FrameDecoder::new();
		decoder.extend(bytes);
		decoder.frames().map(|f| f.unwrap()).collect()
	}

	#[test]
	fn messages_survive_framing() {
		let messages = [
			Message::user(json!("Hello, World!")),
			Message::user(json!({"foo": "bar", "n": [1, 2.5, -3], "nested": {"ok": true}})),
			Message::close(),
			Message::new(MessageType::Noop, json!(null)),
			Message::error(&ErrorInfo::new("boom", "worker.js", 5)),
		];

		for message in messages {
			let frame = encode_frame(&Envelope::plain(message.clone())).unwrap();
			let values = decode_all(&frame);
			assert_eq!(values.len(), 1);
			let env = Envelope::from_value(values[0].clone()).unwrap();
			assert_eq!(env.fd_seq, 0);
			assert_eq!(env.message, message);
		}
	}

	#[test]
	fn partial_frames_wait_for_remaining_bytes() {
		let mut bytes = encode_frame(&Envelope::plain(Message::user(json!("first")))).unwrap();
		bytes.extend(encode_frame(&Envelope::plain(Message::user(json!("second")))).unwrap());

		let mut decoder = FrameDecoder::new();
		let mut out = Vec::new();
		for byte in &bytes {
			decoder.extend(std::slice::from_ref(byte));
			while let Some(value) = decoder.next_frame().unwrap() {
				out.push(Envelope::from_value(value).unwrap().message.payload);
			}
		}

		assert_eq!(out, vec![json!("first"), json!("second")]);
		assert_eq!(decoder.buffered(), 0);
	}

	#[test]
	fn malformed_body_is_skipped() {
		let mut bytes = Vec::new();
		bytes.extend(2u32.to_le_bytes());
		bytes.extend([0xc1, 0xc1]);
		bytes.extend(encode_frame(&json!([0, [100, "after"]])).unwrap());

		let mut decoder = FrameDecoder::new();
		decoder.extend(&bytes);
		let first = decoder.next_frame();
		assert!(matches!(first, Err(ref e) if !e.is_fatal()), "{first:?}");
		assert_eq!(decoder.next_frame().unwrap(), Some(json!([0, [100, "after"]])));
	}

	#[test]
	fn oversized_prefix_poisons_decoder() {
		let mut decoder = FrameDecoder::new();
		decoder.extend(&((MAX_FRAME_LEN as u32) + 1).to_le_bytes());
		decoder.extend(&[0; 16]);

		let results: Vec<_> = decoder.frames().collect();
		assert_eq!(results.len(), 1);
		assert!(results[0].as_ref().is_err_and(FrameError::is_fatal));
		assert!(decoder.next_frame().is_err());
	}
}
