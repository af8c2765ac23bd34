//! TCP server: an accept thread plus one thread per connection.
//!
//! ```text
//!   amqp-accept ──accept──▶ amqp-conn-<peer>  (Connection::run)
//!        │                  amqp-conn-<peer>
//!        │                  ...
//!        └── shutdown flag ─┴─ every connection closes with
//!                              amqp:connection:forced
//! ```
//!
//! Connections share nothing but the [`LinkFactory`].

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use thiserror::Error;

use crate::connection::{Connection, ConnectionConfig};
use crate::factory::LinkFactory;
use crate::net::TcpConnection;
use crate::trace::{debug, error, info, warn};

const LISTENER: Token = Token(0);

/// How often the accept thread checks the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Configuration for the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on. Port 0 picks a free port.
    pub bind_addr: SocketAddr,
    /// Settings for every accepted connection.
    pub connection: ConnectionConfig,
    /// Send and receive buffer size for accepted sockets.
    pub socket_buffer_size: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            connection: ConnectionConfig::default(),
            socket_buffer_size: None,
        }
    }
}

/// Error starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind the listener.
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Bad command-line input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Handle to a running server.
///
/// Dropping the handle signals shutdown but does not wait for threads to
/// exit. Use [`Server::shutdown`] to wait.
pub struct Server {
    local_addr: SocketAddr,
    shutdown_flag: Arc<AtomicBool>,
    accept_handle: Option<JoinHandle<()>>,
}

impl Server {
    /// Binds the listener and spawns the accept thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound or the accept thread
    /// cannot be started.
    pub fn spawn(config: ServerConfig, factory: Arc<dyn LinkFactory>) -> Result<Self, ServerError> {
        info!(
            bind_addr = %config.bind_addr,
            container_id = %config.connection.container_id,
            max_frame_size = config.connection.max_frame_size,
            prefetch = config.connection.prefetch,
            "server starting"
        );

        let addr = config.bind_addr;
        let mut listener = TcpListener::bind(addr).map_err(|source| {
            error!(bind_addr = %addr, error = %source, "failed to bind listener");
            ServerError::Bind { addr, source }
        })?;
        let local_addr = listener.local_addr()?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let acceptor = Acceptor {
            listener,
            poll,
            events: Events::with_capacity(64),
            config,
            factory,
            shutdown: Arc::clone(&shutdown_flag),
            connections: Vec::new(),
        };

        debug!("spawning accept thread");
        let accept_handle = thread::Builder::new()
            .name("amqp-accept".into())
            .spawn(move || {
                info!("accept thread started");
                acceptor.run();
                info!("accept thread exiting");
            })?;

        info!(local_addr = %local_addr, "server started");
        Ok(Self {
            local_addr,
            shutdown_flag,
            accept_handle: Some(accept_handle),
        })
    }

    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns a clone of the shutdown flag for external signal handling.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_flag)
    }

    /// Closes every connection and waits for all threads to exit.
    pub fn shutdown(mut self) {
        info!("server shutdown initiated");
        self.shutdown_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.accept_handle.take() {
            debug!("waiting for accept thread to exit");
            let _ = handle.join();
        }
        info!("server shutdown complete");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }
}

/// State owned by the accept thread.
struct Acceptor {
    listener: TcpListener,
    poll: Poll,
    events: Events,
    config: ServerConfig,
    factory: Arc<dyn LinkFactory>,
    shutdown: Arc<AtomicBool>,
    connections: Vec<JoinHandle<()>>,
}

impl Acceptor {
    fn run(mut self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.poll.poll(&mut self.events, Some(ACCEPT_POLL)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_e) => {
                    error!(error = %_e, "listener poll failed");
                    break;
                }
            }
            if !self.events.is_empty() {
                self.accept_pending();
            }
            self.connections.retain(|handle| !handle.is_finished());
        }

        // A stop for any reason other than the flag must still close
        // connections, or the joins below would wait forever.
        self.shutdown.store(true, Ordering::Relaxed);
        debug!(connections = self.connections.len(), "waiting for connections to close");
        for handle in self.connections.drain(..) {
            let _ = handle.join();
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.spawn_connection(stream, peer),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_e) => {
                    warn!(error = %_e, "accept failed");
                    break;
                }
            }
        }
    }

    fn spawn_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        let transport = match self.configure(stream) {
            Ok(transport) => transport,
            Err(_e) => {
                warn!(peer = %peer, error = %_e, "failed to set up connection");
                return;
            }
        };
        let config = self.config.connection.clone();
        let factory = Arc::clone(&self.factory);
        let shutdown = Arc::clone(&self.shutdown);

        let spawned = thread::Builder::new()
            .name(format!("amqp-conn-{peer}"))
            .spawn(move || serve(transport, peer, config, factory, shutdown));
        match spawned {
            Ok(handle) => self.connections.push(handle),
            Err(_e) => warn!(peer = %_peer, error = %_e, "failed to spawn connection thread"),
        }
    }

    fn configure(&self, stream: TcpStream) -> io::Result<TcpConnection> {
        let transport = TcpConnection::new(stream, self.config.connection.idle_timeout)?;
        transport.set_nodelay(true)?;
        if let Some(size) = self.config.socket_buffer_size {
            transport.set_send_buffer_size(size)?;
            transport.set_recv_buffer_size(size)?;
        }
        Ok(transport)
    }
}

fn serve(
    transport: TcpConnection,
    _peer: SocketAddr,
    config: ConnectionConfig,
    factory: Arc<dyn LinkFactory>,
    shutdown: Arc<AtomicBool>,
) {
    info!(peer = %_peer, "connection accepted");
    let mut connection = Connection::new(transport, config, Some(factory)).with_shutdown(shutdown);
    match connection.run() {
        Ok(()) => info!(peer = %_peer, "connection closed"),
        Err(_e) => warn!(peer = %peer, error = %_e, "connection ended with error"),
    }
    let _ = connection.stream().shutdown();
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;
    use std::time::Instant;

    use super::*;
    use crate::factory::QueueRegistry;

    fn spawn() -> Server {
        Server::spawn(ServerConfig::default(), Arc::new(QueueRegistry::new())).unwrap()
    }

    #[test]
    fn binds_an_ephemeral_port_and_shuts_down() {
        let server = spawn();
        assert_ne!(server.local_addr().port(), 0);

        let flag = server.shutdown_flag();
        let started = Instant::now();
        server.shutdown();
        assert!(flag.load(Ordering::Relaxed));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn bad_protocol_header_drops_the_connection() {
        let server = spawn();
        let mut stream = StdTcpStream::connect(server.local_addr()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(b"HTTP/1.1").unwrap();

        let mut buf = [0u8; 16];
        // The server hangs up without answering.
        let n = stream.read(&mut buf).unwrap_or(0);
        assert_eq!(n, 0);
        server.shutdown();
    }

    #[test]
    fn bind_conflict_is_reported() {
        let server = spawn();
        let config = ServerConfig {
            bind_addr: server.local_addr(),
            ..ServerConfig::default()
        };
        let err = Server::spawn(config, Arc::new(QueueRegistry::new()))
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
        server.shutdown();
    }
}
