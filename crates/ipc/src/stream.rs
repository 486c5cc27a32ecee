//! Message stream over an [`FdSocket`].
//!
//! The stream is split into a send half that numbers descriptor-carrying
//! envelopes and a receive half that decodes frames and reconciles them with
//! descriptor arrivals into `(message, descriptor)` pairs.
//!
//! Frames are written by a dedicated writer task fed through an unbounded
//! queue, so sending never waits for the peer to read.

use std::collections::VecDeque;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webworker_proto::{Envelope, FrameDecoder, Message, encode_frame};

use crate::correlate::{FdReconciler, FdSequencer};
use crate::transport::FdSocket;
use crate::{Result, StreamError};

const READ_CHUNK: usize = 64 * 1024;

/// A received message with the descriptor that accompanied it.
#[derive(Debug)]
pub struct Incoming {
	/// The decoded message.
	pub message: Message,
	/// Descriptor sent alongside the message, if any.
	pub fd: Option<OwnedFd>,
}

/// An encoded frame waiting for the writer task.
#[derive(Debug)]
struct Outgoing {
	frame: Vec<u8>,
	fd: Option<OwnedFd>,
}

/// Splits a connected socket into the two halves of a message stream.
///
/// Spawns the writer task, so it must be called within a tokio runtime.
#[must_use]
pub fn message_stream(socket: FdSocket) -> (MessageSender, MessageReceiver) {
	let socket = Arc::new(socket);
	let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
	let writer = tokio::spawn(run_writer(Arc::clone(&socket), outbound_rx));
	let sender = MessageSender {
		outbound: outbound_tx,
		sequencer: FdSequencer::new(),
		writer,
	};
	let receiver = MessageReceiver {
		socket,
		decoder: FrameDecoder::new(),
		reconciler: FdReconciler::new(),
		ready: VecDeque::new(),
		buf: vec![0u8; READ_CHUNK].into_boxed_slice(),
		eof: false,
	};
	(sender, receiver)
}

/// Writes queued frames in order until the queue closes or a write fails.
async fn run_writer(socket: Arc<FdSocket>, mut outbound_rx: mpsc::UnboundedReceiver<Outgoing>) {
	while let Some(out) = outbound_rx.recv().await {
		if let Err(e) = socket.send(&out.frame, out.fd.as_ref().map(AsFd::as_fd)).await {
			tracing::warn!(error = %e, queued = outbound_rx.len(), "outbound write failed; stopping writer");
			return;
		}
	}
}

/// Send half of a message stream.
#[derive(Debug)]
pub struct MessageSender {
	outbound: mpsc::UnboundedSender<Outgoing>,
	sequencer: FdSequencer,
	writer: JoinHandle<()>,
}

impl MessageSender {
	/// Queues one message, optionally with a descriptor.
	///
	/// Returns as soon as the frame is queued. Frames are written whole and in
	/// queue order, and the descriptor is closed once it has been sent.
	///
	/// # Errors
	///
	/// Returns an error if the message cannot be encoded or the writer has
	/// stopped after a failed write.
	pub fn send(&mut self, message: Message, fd: Option<OwnedFd>) -> Result<()> {
		let fd_seq = if fd.is_some() { self.sequencer.next() } else { 0 };
		let frame = encode_frame(&Envelope { fd_seq, message })?;
		tracing::trace!(seq = fd_seq, len = frame.len(), "queueing frame");
		self.outbound
			.send(Outgoing { frame, fd })
			.map_err(|_| StreamError::Closed)
	}

	/// Stops accepting messages and waits until every queued frame is written
	/// or the writer gave up.
	pub async fn close(self) {
		let Self { outbound, writer, .. } = self;
		drop(outbound);
		if let Err(e) = writer.await {
			tracing::warn!(error = %e, "writer task failed");
		}
	}
}

/// Receive half of a message stream.
#[derive(Debug)]
pub struct MessageReceiver {
	socket: Arc<FdSocket>,
	decoder: FrameDecoder,
	reconciler: FdReconciler<OwnedFd>,
	ready: VecDeque<Incoming>,
	buf: Box<[u8]>,
	eof: bool,
}

impl MessageReceiver {
	/// Waits for the next message.
	///
	/// Returns `Ok(None)` once the peer has closed its end and every complete
	/// message has been handed out. Cancel safe: no received data is lost if
	/// the returned future is dropped.
	///
	/// # Errors
	///
	/// Returns an error if the socket fails or frame boundaries are lost.
	pub async fn recv(&mut self) -> Result<Option<Incoming>> {
		loop {
			if let Some(incoming) = self.ready.pop_front() {
				return Ok(Some(incoming));
			}
			if self.eof {
				return Ok(None);
			}

			let (n, fds) = self.socket.recv(&mut self.buf).await?;
			for fd in fds {
				self.reconciler.on_descriptor(fd);
			}
			if n == 0 {
				self.eof = true;
				let (pending, partial) = (self.reconciler.pending(), self.decoder.buffered());
				if pending > 0 || partial > 0 {
					tracing::warn!(pending, partial, "peer closed with incomplete messages");
				}
			} else {
				self.decoder.extend(&self.buf[..n]);
				self.decode_frames()?;
			}
			while let Some((message, fd)) = self.reconciler.pop_ready() {
				self.ready.push_back(Incoming { message, fd });
			}
		}
	}

	fn decode_frames(&mut self) -> Result<()> {
		loop {
			match self.decoder.next_frame() {
				Ok(Some(value)) => match Envelope::from_value(value) {
					Ok(envelope) => self.reconciler.on_envelope(envelope),
					Err(e) => tracing::warn!(error = %e, "discarding invalid envelope"),
				},
				Ok(None) => return Ok(()),
				Err(e) if e.is_fatal() => return Err(StreamError::Frame(e)),
				Err(e) => tracing::warn!(error = %e, "discarding malformed frame"),
			}
		}
	}
}
