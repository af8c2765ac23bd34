//! TCP stream wrapper for mio-based I/O.
//!
//! [`TcpConnection`] owns a non-blocking [`mio::net::TcpStream`] plus a
//! private [`Poll`], and presents blocking-with-timeout [`Read`] and
//! [`Write`] on top of it. A read that sees no data within the idle timeout
//! fails with `WouldBlock`, which the frame reader turns into an idle tick.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use mio::net::TcpStream as MioTcpStream;
use mio::{Events, Interest, Poll, Token};

const STREAM: Token = Token(0);

/// A TCP stream with poll-driven blocking reads and writes.
pub struct TcpConnection {
    inner: MioTcpStream,
    poll: Poll,
    events: Events,
    idle_timeout: Duration,
}

impl TcpConnection {
    /// Wraps an already connected (or accepted) non-blocking stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be registered with a poller.
    pub fn new(mut inner: MioTcpStream, idle_timeout: Duration) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut inner, STREAM, Interest::READABLE | Interest::WRITABLE)?;
        Ok(Self {
            inner,
            poll,
            events: Events::with_capacity(8),
            idle_timeout,
        })
    }

    /// Connects to `addr`, blocking until the TCP handshake completes.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is refused or cannot be set up.
    pub fn connect(addr: SocketAddr, idle_timeout: Duration) -> io::Result<Self> {
        let std_stream = std::net::TcpStream::connect(addr)?;
        std_stream.set_nonblocking(true)?;
        Self::new(MioTcpStream::from_std(std_stream), idle_timeout)
    }

    /// Returns the address of the remote peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer address cannot be retrieved.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    /// Returns the local address of the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Sets how long a read waits for data before reporting `WouldBlock`.
    pub fn set_idle_timeout(&mut self, idle_timeout: Duration) {
        self.idle_timeout = idle_timeout;
    }

    /// Disables Nagle's algorithm so small frames go out immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.inner.set_nodelay(nodelay)
    }

    /// Sets the socket's send buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        rustix::net::sockopt::set_socket_send_buffer_size(self.inner.as_fd(), size)?;
        Ok(())
    }

    /// Sets the socket's receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        rustix::net::sockopt::set_socket_recv_buffer_size(self.inner.as_fd(), size)?;
        Ok(())
    }

    /// Gets the socket's send buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be retrieved.
    pub fn send_buffer_size(&self) -> io::Result<usize> {
        Ok(rustix::net::sockopt::socket_send_buffer_size(
            self.inner.as_fd(),
        )?)
    }

    /// Gets the socket's receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be retrieved.
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        Ok(rustix::net::sockopt::socket_recv_buffer_size(
            self.inner.as_fd(),
        )?)
    }

    /// Shuts down both halves of the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is already disconnected.
    pub fn shutdown(&self) -> io::Result<()> {
        self.inner.shutdown(Shutdown::Both)
    }

    /// Waits for any readiness event. Returns `false` on timeout.
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => return Ok(!self.events.is_empty()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

impl Read for TcpConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if !self.wait(Some(self.idle_timeout))? {
                        return Err(ErrorKind::WouldBlock.into());
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                other => return other,
            }
        }
    }
}

impl Write for TcpConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match self.inner.write(buf) {
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.wait(None)?;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                other => return other,
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl AsFd for TcpConnection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    fn pair() -> (TcpConnection, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = TcpConnection::connect(addr, Duration::from_millis(20)).unwrap();
        let (peer, _) = listener.accept().unwrap();
        (conn, peer)
    }

    #[test]
    fn read_times_out_with_would_block() {
        let (mut conn, _peer) = pair();
        let mut buf = [0u8; 16];
        let err = conn.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn write_and_read_loopback() {
        let (mut conn, mut peer) = pair();
        conn.write_all(b"hello").unwrap();
        conn.flush().unwrap();

        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        peer.write_all(b"world").unwrap();
        let mut got = Vec::new();
        while got.len() < 5 {
            let mut chunk = [0u8; 8];
            match conn.read(&mut chunk) {
                Ok(n) => got.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => panic!("read failed: {e}"),
            }
        }
        assert_eq!(got, b"world");
    }

    #[test]
    fn peer_close_reads_eof() {
        let (mut conn, peer) = pair();
        drop(peer);
        let mut buf = [0u8; 4];
        let n = loop {
            match conn.read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => panic!("read failed: {e}"),
            }
        };
        assert_eq!(n, 0);
    }

    #[test]
    fn buffer_sizes_are_adjustable() {
        let (conn, _peer) = pair();
        let before = conn.recv_buffer_size().unwrap();
        assert!(before > 0);
        conn.set_recv_buffer_size(256 * 1024).unwrap();
        conn.set_send_buffer_size(256 * 1024).unwrap();
        assert!(conn.send_buffer_size().unwrap() > 0);
    }
}
