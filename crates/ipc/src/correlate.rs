//! Pairing of out-of-band descriptors with in-band envelopes.
//!
//! The sender numbers every envelope that carries a descriptor with a
//! per-stream sequence. The receiver counts descriptor arrivals; the `n`-th
//! descriptor belongs to the envelope with `fd_seq == n`. Envelopes and
//! descriptors are independent streams, so either side may show up first.

use std::collections::{HashMap, VecDeque};

use webworker_proto::{Envelope, Message};

/// Send-side descriptor sequence.
///
/// Sequence numbers start at 1; `0` is reserved for "no descriptor".
#[derive(Debug, Default, Clone, Copy)]
pub struct FdSequencer(u64);

impl FdSequencer {
	/// Creates a sequencer whose first number is 1.
	#[must_use]
	pub const fn new() -> Self {
		Self(0)
	}

	/// Returns the next sequence number.
	#[allow(clippy::should_implement_trait, reason = "convention")]
	pub fn next(&mut self) -> u64 {
		self.0 += 1;
		self.0
	}
}

#[derive(Debug)]
struct Slot<F> {
	fd_seq: u64,
	message: Message,
	fd: Option<F>,
}

impl<F> Slot<F> {
	fn is_ready(&self) -> bool {
		self.fd_seq == 0 || self.fd.is_some()
	}
}

/// Receive-side reconciliation of envelopes and descriptors.
///
/// Messages are released in envelope arrival order; a message waiting for its
/// descriptor holds back the ones behind it. Every buffered envelope and
/// descriptor is released exactly once.
#[derive(Debug)]
pub struct FdReconciler<F> {
	received_fds: u64,
	queue: VecDeque<Slot<F>>,
	fds_awaiting_message: HashMap<u64, F>,
}

impl<F> Default for FdReconciler<F> {
	fn default() -> Self {
		Self {
			received_fds: 0,
			queue: VecDeque::new(),
			fds_awaiting_message: HashMap::new(),
		}
	}
}

impl<F> FdReconciler<F> {
	/// Creates an empty reconciler.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Records a decoded envelope.
	pub fn on_envelope(&mut self, envelope: Envelope) {
		let Envelope { fd_seq, message } = envelope;
		let fd = if fd_seq > 0 {
			self.fds_awaiting_message.remove(&fd_seq)
		} else {
			None
		};
		if fd_seq > 0 && fd.is_none() {
			tracing::trace!(seq = fd_seq, "message waiting for descriptor");
		}
		self.queue.push_back(Slot { fd_seq, message, fd });
	}

	/// Records a descriptor arrival.
	pub fn on_descriptor(&mut self, fd: F) {
		self.received_fds += 1;
		let seq = self.received_fds;
		match self.queue.iter_mut().find(|slot| slot.fd_seq == seq) {
			Some(slot) if slot.fd.is_none() => slot.fd = Some(fd),
			_ => {
				tracing::trace!(seq, "descriptor waiting for message");
				self.fds_awaiting_message.insert(seq, fd);
			}
		}
	}

	/// Pops the next message whose descriptor, if any, has arrived.
	pub fn pop_ready(&mut self) -> Option<(Message, Option<F>)> {
		if !self.queue.front()?.is_ready() {
			return None;
		}
		let slot = self.queue.pop_front()?;
		Some((slot.message, slot.fd))
	}

	/// Number of messages and descriptors still waiting for their counterpart.
	#[must_use]
	pub fn pending(&self) -> usize {
		self.queue.iter().filter(|slot| !slot.is_ready()).count() + self.fds_awaiting_message.len()
	}

	/// Number of messages buffered, ready or not.
	#[must_use]
	pub fn buffered(&self) -> usize {
		self.queue.len()
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;
	use serde_json::json;

	use super::*;

	fn env(seq: u64, tag: u64) -> Envelope {
		Envelope {
			fd_seq: seq,
			message: Message::user(json!(tag)),
		}
	}

	fn drain(r: &mut FdReconciler<u64>) -> Vec<(u64, Option<u64>)> {
		std::iter::from_fn(|| r.pop_ready())
			.map(|(m, fd)| (m.payload.as_u64().unwrap(), fd))
			.collect()
	}

	#[test]
	fn sequencer_skips_zero() {
		let mut seq = FdSequencer::new();
		assert_eq!(seq.next(), 1);
		assert_eq!(seq.next(), 2);
	}

	#[test]
	fn plain_envelopes_are_ready_immediately() {
		let mut r = FdReconciler::<u64>::new();
		r.on_envelope(env(0, 7));
		assert_eq!(drain(&mut r), vec![(7, None)]);
		assert_eq!(r.pending(), 0);
	}

	#[test]
	fn message_before_descriptor() {
		let mut r = FdReconciler::new();
		r.on_envelope(env(1, 10));
		assert!(r.pop_ready().is_none());
		assert_eq!(r.pending(), 1);

		r.on_descriptor(100);
		assert_eq!(drain(&mut r), vec![(10, Some(100))]);
		assert_eq!(r.pending(), 0);
	}

	#[test]
	fn descriptor_before_message() {
		let mut r = FdReconciler::new();
		r.on_descriptor(100);
		assert!(r.pop_ready().is_none());
		assert_eq!(r.pending(), 1);

		r.on_envelope(env(1, 10));
		assert_eq!(drain(&mut r), vec![(10, Some(100))]);
		assert_eq!(r.pending(), 0);
	}

	#[test]
	fn waiting_message_holds_back_later_ones() {
		let mut r = FdReconciler::new();
		r.on_envelope(env(1, 1));
		r.on_envelope(env(0, 2));
		assert!(r.pop_ready().is_none());
		assert_eq!(r.buffered(), 2);

		r.on_descriptor(50);
		assert_eq!(drain(&mut r), vec![(1, Some(50)), (2, None)]);
	}

	#[test]
	fn scrambled_arrival_of_five() {
		let mut r = FdReconciler::new();
		r.on_descriptor(1001);
		r.on_descriptor(1002);
		r.on_envelope(env(1, 1));
		r.on_envelope(env(2, 2));
		r.on_envelope(env(3, 3));
		r.on_envelope(env(4, 4));
		r.on_descriptor(1003);
		r.on_envelope(env(5, 5));
		r.on_descriptor(1004);
		r.on_descriptor(1005);

		assert_eq!(
			drain(&mut r),
			vec![(1, Some(1001)), (2, Some(1002)), (3, Some(1003)), (4, Some(1004)), (5, Some(1005))]
		);
		assert_eq!(r.pending(), 0);
		assert_eq!(r.buffered(), 0);
	}

	proptest! {
		#[test]
		fn every_interleaving_pairs_correctly(order in Just([true, true, true, true, true, false, false, false, false, false].to_vec()).prop_shuffle()) {
			let mut r = FdReconciler::new();
			let (mut next_env, mut next_fd) = (1u64, 1u64);
			let mut out = Vec::new();
			for is_envelope in order {
				if is_envelope {
					r.on_envelope(env(next_env, next_env));
					next_env += 1;
				} else {
					r.on_descriptor(next_fd * 1000);
					next_fd += 1;
				}
				out.extend(drain(&mut r));
			}

			prop_assert_eq!(out.len(), 5);
			for (i, (tag, fd)) in out.into_iter().enumerate() {
				let n = i as u64 + 1;
				prop_assert_eq!(tag, n);
				prop_assert_eq!(fd, Some(n * 1000));
			}
			prop_assert_eq!(r.pending(), 0);
		}
	}
}
