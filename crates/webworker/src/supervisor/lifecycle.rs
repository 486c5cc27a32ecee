//! Pure lifecycle state machine of a supervised worker.
//!
//! The driver feeds discrete events in (posted message, accepted connection,
//! terminate request, timer expiry, process exit) and performs the effect each
//! transition returns. No I/O happens here.

use std::collections::VecDeque;
use std::time::Duration;

use crate::config::KillTimeout;

/// Observable lifecycle phase of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
	/// Constructed; no process yet.
	Created,
	/// Listening and the child has been spawned.
	Starting,
	/// The child connected; messages flow directly.
	Connected,
	/// `CLOSE` was requested; waiting for the child to exit.
	Terminating,
	/// The child exited. Final.
	Exited,
}

/// Effect of posting a message.
#[derive(Debug)]
pub(crate) enum PostAction<T> {
	/// Write it to the stream now.
	Send(T),
	/// Held until the child connects.
	Queued,
	/// The worker is gone.
	Rejected(T),
}

/// Effect of an accepted connection.
#[derive(Debug)]
pub(crate) enum AcceptAction<T> {
	/// Attach the stream, then send the queued messages in order.
	Attach(Vec<T>),
	/// A connection already exists or the worker exited; drop it.
	Reject,
}

/// Effect of a terminate request.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TerminateAction {
	/// Already terminating or exited.
	Ignore,
	/// Post `CLOSE` and, when set, arm the kill timer.
	Close { kill_after: Option<Duration> },
}

/// Effect of the process exit notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExitAction {
	pub cancel_kill: bool,
	pub close_transport: bool,
	pub notify: bool,
}

/// Lifecycle of one worker; `T` is the outbound message type.
#[derive(Debug)]
pub(crate) struct Lifecycle<T> {
	phase: Phase,
	connected: bool,
	/// Bridges Starting to Connected; `None` once retired.
	queue: Option<VecDeque<T>>,
	kill_armed: bool,
}

impl<T> Default for Lifecycle<T> {
	fn default() -> Self {
		Self {
			phase: Phase::Created,
			connected: false,
			queue: Some(VecDeque::new()),
			kill_armed: false,
		}
	}
}

impl<T> Lifecycle<T> {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn phase(&self) -> Phase {
		self.phase
	}

	pub fn is_connected(&self) -> bool {
		self.connected
	}

	pub fn queued(&self) -> usize {
		self.queue.as_ref().map_or(0, VecDeque::len)
	}

	pub fn spawned(&mut self) {
		if self.phase == Phase::Created {
			self.phase = Phase::Starting;
		}
	}

	pub fn post(&mut self, item: T) -> PostAction<T> {
		if self.phase == Phase::Exited {
			return PostAction::Rejected(item);
		}
		match &mut self.queue {
			Some(queue) => {
				queue.push_back(item);
				PostAction::Queued
			}
			None => PostAction::Send(item),
		}
	}

	pub fn accepted(&mut self) -> AcceptAction<T> {
		if self.connected || self.phase == Phase::Exited {
			return AcceptAction::Reject;
		}
		self.connected = true;
		if self.phase < Phase::Connected {
			self.phase = Phase::Connected;
		}
		let flush = self.queue.take().map(Vec::from).unwrap_or_default();
		AcceptAction::Attach(flush)
	}

	pub fn terminate(&mut self, timeout: KillTimeout) -> TerminateAction {
		if self.phase >= Phase::Terminating {
			return TerminateAction::Ignore;
		}
		self.phase = Phase::Terminating;
		let kill_after = match timeout {
			KillTimeout::After(after) => Some(after),
			KillTimeout::Never => None,
		};
		self.kill_armed = kill_after.is_some();
		TerminateAction::Close { kill_after }
	}

	/// Returns true if the child should be killed now.
	pub fn kill_timer_fired(&mut self) -> bool {
		let fire = self.kill_armed && self.phase != Phase::Exited;
		self.kill_armed = false;
		fire
	}

	pub fn exited(&mut self) -> ExitAction {
		if self.phase == Phase::Exited {
			return ExitAction {
				cancel_kill: false,
				close_transport: false,
				notify: false,
			};
		}
		let action = ExitAction {
			cancel_kill: self.kill_armed,
			close_transport: self.connected,
			notify: true,
		};
		self.phase = Phase::Exited;
		self.connected = false;
		self.kill_armed = false;
		self.queue = None;
		action
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn assert_exclusive(l: &Lifecycle<u32>) {
		assert!(l.queued() == 0 || !l.is_connected(), "queue and stream active together");
	}

	#[test]
	fn queued_messages_flush_in_order_on_connect() {
		let mut l = Lifecycle::new();
		l.spawned();
		assert_eq!(l.phase(), Phase::Starting);

		for i in 0..3 {
			assert!(matches!(l.post(i), PostAction::Queued));
			assert_exclusive(&l);
		}

		let AcceptAction::Attach(flush) = l.accepted() else {
			panic!("first connection must attach");
		};
		assert_eq!(flush, vec![0, 1, 2]);
		assert_eq!(l.phase(), Phase::Connected);
		assert_exclusive(&l);

		assert!(matches!(l.post(3), PostAction::Send(3)));
		assert_eq!(l.queued(), 0);
		assert_exclusive(&l);
	}

	#[test]
	fn second_connection_is_rejected() {
		let mut l = Lifecycle::<u32>::new();
		l.spawned();
		assert!(matches!(l.accepted(), AcceptAction::Attach(_)));
		assert!(matches!(l.accepted(), AcceptAction::Reject));
	}

	#[test]
	fn terminate_is_idempotent() {
		let mut l = Lifecycle::<u32>::new();
		l.spawned();
		let timeout = KillTimeout::After(Duration::from_millis(50));
		assert_eq!(
			l.terminate(timeout),
			TerminateAction::Close {
				kill_after: Some(Duration::from_millis(50))
			}
		);
		assert_eq!(l.terminate(timeout), TerminateAction::Ignore);
		assert_eq!(l.phase(), Phase::Terminating);
	}

	#[test]
	fn never_timeout_arms_no_timer() {
		let mut l = Lifecycle::<u32>::new();
		l.spawned();
		assert_eq!(l.terminate(KillTimeout::Never), TerminateAction::Close { kill_after: None });
		assert!(!l.kill_timer_fired());
	}

	#[test]
	fn terminate_before_connect_keeps_close_queued() {
		let mut l = Lifecycle::new();
		l.spawned();
		l.post(1);
		assert!(matches!(l.terminate(KillTimeout::Never), TerminateAction::Close { .. }));
		assert!(matches!(l.post(2), PostAction::Queued));

		let AcceptAction::Attach(flush) = l.accepted() else {
			panic!("connection must attach while terminating");
		};
		assert_eq!(flush, vec![1, 2]);
		assert_eq!(l.phase(), Phase::Terminating);
	}

	#[test]
	fn exit_cancels_pending_kill() {
		let mut l = Lifecycle::<u32>::new();
		l.spawned();
		l.accepted();
		l.terminate(KillTimeout::After(Duration::from_millis(50)));

		let action = l.exited();
		assert_eq!(
			action,
			ExitAction {
				cancel_kill: true,
				close_transport: true,
				notify: true,
			}
		);
		assert!(!l.kill_timer_fired(), "kill must not fire after exit");
	}

	#[test]
	fn kill_timer_fires_once() {
		let mut l = Lifecycle::<u32>::new();
		l.spawned();
		l.terminate(KillTimeout::After(Duration::from_millis(50)));
		assert!(l.kill_timer_fired());
		assert!(!l.kill_timer_fired());

		let action = l.exited();
		assert!(!action.cancel_kill);
		assert!(!action.close_transport, "never connected");
	}

	#[test]
	fn exit_before_connect_notifies_once_and_is_final() {
		let mut l = Lifecycle::new();
		l.spawned();
		l.post(7);

		assert!(l.exited().notify);
		assert!(!l.exited().notify);
		assert_eq!(l.phase(), Phase::Exited);
		assert!(matches!(l.post(8), PostAction::Rejected(8)));
		assert!(matches!(l.accepted(), AcceptAction::Reject));
		assert_eq!(l.terminate(KillTimeout::Never), TerminateAction::Ignore);
	}
}
