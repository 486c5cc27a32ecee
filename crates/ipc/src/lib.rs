//! Descriptor-correlated message stream for webworker IPC.
//!
//! * [`FdSocket`]: Unix stream socket carrying bytes plus `SCM_RIGHTS` descriptors
//! * [`FdReconciler`]: pairs out-of-band descriptors with the envelopes that expect them
//! * [`MessageSender`] / [`MessageReceiver`]: the two halves of a message stream

#![warn(missing_docs)]

pub mod correlate;
pub mod error;
pub mod stream;
pub mod transport;

pub use correlate::{FdReconciler, FdSequencer};
pub use error::{Result, StreamError};
pub use stream::{Incoming, MessageReceiver, MessageSender, message_stream};
pub use transport::FdSocket;
