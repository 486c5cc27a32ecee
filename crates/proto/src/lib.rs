//! Shared wire types for webworker IPC.
//!
//! This crate defines the messages exchanged between a master process and its
//! worker processes over per-worker Unix domain sockets. Every message travels
//! as a length-prefixed MessagePack frame carrying an [`Envelope`].

#![warn(missing_docs)]

pub mod codec;
pub mod paths;
pub mod types;

pub use codec::{FrameDecoder, FrameError, MAX_FRAME_LEN, encode_frame};
pub use types::*;
