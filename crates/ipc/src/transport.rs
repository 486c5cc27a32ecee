//! Unix stream socket with a descriptor side channel.
//!
//! Bytes flow through the socket as an ordinary stream. Descriptors ride along
//! as `SCM_RIGHTS` ancillary data attached to the first byte of the write that
//! carries them, so they are observed by the reader no later than the bytes
//! they were sent with.

use std::io::{self, IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::Path;

use rustix::net::{
	RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, ReturnFlags, SendAncillaryBuffer, SendAncillaryMessage, SendFlags,
};
use tokio::io::Interest;
use tokio::net::UnixStream;

/// Most descriptors accepted from a single read.
const MAX_FDS_PER_READ: usize = 8;

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const RECV_FLAGS: RecvFlags = RecvFlags::CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const RECV_FLAGS: RecvFlags = RecvFlags::empty();

/// A connected Unix stream socket that can pass file descriptors.
#[derive(Debug)]
pub struct FdSocket {
	stream: UnixStream,
}

impl FdSocket {
	/// Wraps an already connected stream.
	#[must_use]
	pub fn new(stream: UnixStream) -> Self {
		Self { stream }
	}

	/// Connects to a listening socket.
	///
	/// # Errors
	///
	/// Returns an error if the connection cannot be established.
	pub async fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
		Ok(Self::new(UnixStream::connect(path).await?))
	}

	/// Creates a connected pair of sockets.
	///
	/// # Errors
	///
	/// Returns an error if the socket pair cannot be created.
	pub fn pair() -> io::Result<(Self, Self)> {
		let (a, b) = UnixStream::pair()?;
		Ok((Self::new(a), Self::new(b)))
	}

	/// Writes all of `data`, attaching `fd` to the first byte.
	///
	/// # Errors
	///
	/// Returns an error if the peer is gone or the write fails.
	pub async fn send(&self, data: &[u8], fd: Option<BorrowedFd<'_>>) -> io::Result<()> {
		let mut sent = 0;
		let mut fd = fd;
		while sent < data.len() {
			let n = self
				.stream
				.async_io(Interest::WRITABLE, || send_chunk(&self.stream, &data[sent..], fd))
				.await?;
			if n == 0 {
				return Err(io::Error::new(io::ErrorKind::WriteZero, "socket accepted no bytes"));
			}
			sent += n;
			// The descriptor went out with the first chunk.
			fd = None;
		}
		Ok(())
	}

	/// Reads the next chunk of bytes together with any descriptors that arrived.
	///
	/// A zero byte count means the peer closed its end.
	///
	/// # Errors
	///
	/// Returns an error if the read fails.
	pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
		self.stream.async_io(Interest::READABLE, || recv_chunk(&self.stream, &mut buf[..])).await
	}
}

fn send_chunk(socket: &UnixStream, data: &[u8], fd: Option<BorrowedFd<'_>>) -> io::Result<usize> {
	let fds: Vec<BorrowedFd<'_>> = fd.into_iter().collect();
	let mut space = [MaybeUninit::<u8>::uninit(); rustix::cmsg_space!(ScmRights(1))];
	let mut control = SendAncillaryBuffer::new(&mut space);
	if !fds.is_empty() && !control.push(SendAncillaryMessage::ScmRights(&fds)) {
		return Err(io::Error::other("ancillary buffer too small for descriptor"));
	}
	Ok(rustix::net::sendmsg(socket.as_fd(), &[IoSlice::new(data)], &mut control, SendFlags::NOSIGNAL)?)
}

fn recv_chunk(socket: &UnixStream, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
	let mut space = [MaybeUninit::<u8>::uninit(); rustix::cmsg_space!(ScmRights(MAX_FDS_PER_READ))];
	let mut control = RecvAncillaryBuffer::new(&mut space);
	let msg = rustix::net::recvmsg(socket.as_fd(), &mut [IoSliceMut::new(buf)], &mut control, RECV_FLAGS)?;

	let mut fds = Vec::new();
	for message in control.drain() {
		if let RecvAncillaryMessage::ScmRights(received) = message {
			fds.extend(received);
		}
	}
	if msg.flags.contains(ReturnFlags::CTRUNC) {
		tracing::warn!(kept = fds.len(), "ancillary data truncated; extra descriptors were dropped by the kernel");
	}
	Ok((msg.bytes, fds))
}
