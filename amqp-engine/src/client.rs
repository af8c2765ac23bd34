//! Blocking client over one TCP connection and one session.
//!
//! Every call pumps inbound frames on the caller's thread until its
//! condition is met or [`ClientConfig::operation_timeout`] runs out:
//!
//! ```text
//!   send ──────▶ wait for credit ──▶ transfer ──▶ delivery id
//!   settlements ◀──────────────────── disposition from the peer
//!   receive ───▶ wait for a buffered transfer ──▶ take (may re-grant credit)
//!   accept / reject / release / modify ──▶ disposition
//! ```

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::connection::{Connection, ConnectionConfig, ConnectionError, Pump};
use crate::delivery::Settlement;
use crate::link::{Link, LinkId, LinkState, ReceivedMessage};
use crate::net::TcpConnection;
use crate::protocol::{AmqpError, ChannelId, DeliveryId, DeliveryState, SettleMode};
use crate::session::SessionError;
use crate::trace::{debug, info, warn};

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    /// Sent in `open`.
    pub hostname: Option<String>,
    /// Longest any single call waits on the peer.
    pub operation_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            hostname: None,
            operation_timeout: Duration::from_secs(5),
        }
    }
}

/// Errors from [`Client`] calls.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("connection is closed")]
    Closed,
    #[error("link {0} was refused by the peer")]
    LinkRefused(String),
}

impl From<SessionError> for ClientError {
    fn from(e: SessionError) -> Self {
        Self::Connection(e.into())
    }
}

/// A sending link created by [`Client::create_sender`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(LinkId);

/// A receiving link created by [`Client::create_receiver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverId(LinkId);

/// Blocking client. Dropping it closes the connection.
pub struct Client {
    connection: Connection<TcpConnection>,
    channel: ChannelId,
    timeout: Duration,
    next_correlation: u64,
    closed: bool,
}

impl Client {
    /// Connects, opens the connection and begins one session.
    ///
    /// # Errors
    ///
    /// Connection failures, a bad protocol header from the peer, or no
    /// `begin` answer within the operation timeout.
    pub fn connect(addr: SocketAddr, config: ClientConfig) -> Result<Self, ClientError> {
        let stream = TcpConnection::connect(addr, config.connection.idle_timeout)?;
        stream.set_nodelay(true)?;
        let mut connection = Connection::new(stream, config.connection, None);
        let channel = connection.start(config.hostname.as_deref())?;

        let mut client = Self {
            connection,
            channel,
            timeout: config.operation_timeout,
            next_correlation: 0,
            closed: false,
        };
        client.wait_for("begin", |c| {
            c.connection
                .handler()
                .session(c.channel)
                .is_some_and(|s| s.remote_channel().is_some())
        })?;
        info!(
            peer = %addr,
            container_id = ?client.connection.handler().peer_open().map(|o| &o.container_id),
            "client connected"
        );
        Ok(client)
    }

    /// Container id the peer announced.
    #[must_use]
    pub fn peer_container_id(&self) -> Option<&str> {
        self.connection
            .handler()
            .peer_open()
            .map(|o| o.container_id.as_str())
    }

    /// Attaches an at-least-once sender to `address`.
    pub fn create_sender(&mut self, address: &str) -> Result<SenderId, ClientError> {
        self.create_sender_with_mode(address, SettleMode::AtLeastOnce)
    }

    /// Attaches a sender to `address` and waits for the peer to answer.
    ///
    /// # Errors
    ///
    /// [`ClientError::LinkRefused`] if the peer has no such node.
    pub fn create_sender_with_mode(
        &mut self,
        address: &str,
        settle_mode: SettleMode,
    ) -> Result<SenderId, ClientError> {
        let (id, name) = self.attach(address, |session, out, name| {
            session.attach_sender(out, name, address, settle_mode, None)
        })?;
        self.wait_attached(id, name)?;
        Ok(SenderId(id))
    }

    /// Attaches an at-least-once receiver to `address`.
    pub fn create_receiver(&mut self, address: &str) -> Result<ReceiverId, ClientError> {
        self.create_receiver_with_mode(address, SettleMode::AtLeastOnce)
    }

    /// Attaches a receiver to `address` and waits for the peer to answer.
    /// Credit is granted as soon as it does.
    pub fn create_receiver_with_mode(
        &mut self,
        address: &str,
        settle_mode: SettleMode,
    ) -> Result<ReceiverId, ClientError> {
        self.open_receiver(address, settle_mode, None)
    }

    /// Attaches an at-least-once receiver whose credit window is `prefetch`
    /// instead of the connection's.
    pub fn create_receiver_with_prefetch(
        &mut self,
        address: &str,
        prefetch: u32,
    ) -> Result<ReceiverId, ClientError> {
        self.open_receiver(address, SettleMode::AtLeastOnce, Some(prefetch))
    }

    fn open_receiver(
        &mut self,
        address: &str,
        settle_mode: SettleMode,
        prefetch: Option<u32>,
    ) -> Result<ReceiverId, ClientError> {
        let (id, name) = self.attach(address, |session, out, name| {
            let id = session.attach_receiver(out, name, address, settle_mode, None)?;
            if let Some(prefetch) = prefetch {
                session.set_prefetch(id, prefetch)?;
            }
            Ok(id)
        })?;
        self.wait_attached(id, name)?;
        Ok(ReceiverId(id))
    }

    /// Sends one message, waiting for credit first.
    pub fn send(&mut self, sender: SenderId, payload: &[u8]) -> Result<DeliveryId, ClientError> {
        self.wait_for("credit", |c| {
            c.link(sender.0)
                .and_then(Link::as_sender)
                .is_none_or(|s| s.credit().has_credit())
        })?;

        let correlation_id = self.next_correlation;
        self.next_correlation += 1;
        let channel = self.channel;
        let delivery_id = self
            .connection
            .handler_mut()
            .with_session(channel, |session, out| {
                let mut reader = payload;
                session.transfer(out, sender.0, correlation_id, &mut reader)
            })?;
        self.connection.flush()?;
        Ok(delivery_id)
    }

    /// Credit the sender holds right now.
    #[must_use]
    pub fn credit(&self, sender: SenderId) -> u64 {
        self.link(sender.0)
            .and_then(Link::as_sender)
            .map_or(0, |s| s.credit().link_credit())
    }

    /// Outcomes reported since the last call, without waiting.
    pub fn settlements(&mut self, sender: SenderId) -> Result<Vec<Settlement>, ClientError> {
        let channel = self.channel;
        Ok(self
            .connection
            .handler_mut()
            .with_session(channel, |session, _| session.take_settlements(sender.0))?)
    }

    /// Waits until at least `count` outcomes have been reported.
    pub fn wait_for_settlements(
        &mut self,
        sender: SenderId,
        count: usize,
    ) -> Result<Vec<Settlement>, ClientError> {
        let deadline = Instant::now() + self.timeout;
        let mut collected = Vec::new();
        loop {
            collected.extend(self.settlements(sender)?);
            if collected.len() >= count {
                return Ok(collected);
            }
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout("settlements"));
            }
            self.pump()?;
        }
    }

    /// Takes the next message, waiting up to `timeout` for one to arrive.
    pub fn receive(
        &mut self,
        receiver: ReceiverId,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, ClientError> {
        let deadline = Instant::now() + timeout;
        let channel = self.channel;
        loop {
            let message = self
                .connection
                .handler_mut()
                .with_session(channel, |session, out| session.take(out, receiver.0))?;
            if let Some(message) = message {
                self.connection.flush()?;
                return Ok(Some(message));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            self.pump()?;
        }
    }

    pub fn accept(&mut self, delivery_id: DeliveryId) -> Result<(), ClientError> {
        self.settle(delivery_id, DeliveryState::Accepted)
    }

    /// Rejects with `amqp:rejected` and `description`.
    pub fn reject(&mut self, delivery_id: DeliveryId, description: &str) -> Result<(), ClientError> {
        let error = Some(AmqpError::rejected(description));
        self.settle(delivery_id, DeliveryState::Rejected { error })
    }

    pub fn release(&mut self, delivery_id: DeliveryId) -> Result<(), ClientError> {
        self.settle(delivery_id, DeliveryState::Released)
    }

    pub fn modify(
        &mut self,
        delivery_id: DeliveryId,
        delivery_failed: bool,
        undeliverable_here: bool,
    ) -> Result<(), ClientError> {
        self.settle(
            delivery_id,
            DeliveryState::Modified {
                delivery_failed,
                undeliverable_here,
            },
        )
    }

    /// Reports an outcome for a received delivery.
    pub fn settle(&mut self, delivery_id: DeliveryId, state: DeliveryState) -> Result<(), ClientError> {
        let channel = self.channel;
        self.connection
            .handler_mut()
            .with_session(channel, |session, out| session.settle(out, delivery_id, state))?;
        self.connection.flush()?;
        Ok(())
    }

    /// Detaches a sender. Unsettled deliveries resolve as released.
    pub fn close_sender(&mut self, sender: SenderId) -> Result<(), ClientError> {
        self.detach(sender.0)
    }

    /// Detaches a receiver.
    pub fn close_receiver(&mut self, receiver: ReceiverId) -> Result<(), ClientError> {
        self.detach(receiver.0)
    }

    /// Ends the session, closes the connection and waits for the peer's
    /// `close`. Idempotent.
    pub fn close(&mut self) -> Result<(), ClientError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.connection.handler().is_closed() {
            return Ok(());
        }
        self.connection.close(None)?;
        let result = self.wait_for("close", |c| c.connection.handler().is_closed());
        self.connection.handler_mut().fail();
        let _ = self.connection.stream().shutdown();
        debug!("client closed");
        match result {
            Err(ClientError::Closed) => Ok(()),
            other => other,
        }
    }

    fn attach<F>(&mut self, address: &str, f: F) -> Result<(LinkId, String), ClientError>
    where
        F: FnOnce(
            &mut crate::session::Session,
            &mut dyn crate::transport::FrameSink,
            &str,
        ) -> Result<LinkId, SessionError>,
    {
        self.ensure_open()?;
        let channel = self.channel;
        let result = self
            .connection
            .handler_mut()
            .with_session(channel, |session, out| {
                let name = format!("client-{address}-{}", session.next_handle());
                f(session, out, &name).map(|id| (id, name))
            })?;
        self.connection.flush()?;
        Ok(result)
    }

    fn detach(&mut self, id: LinkId) -> Result<(), ClientError> {
        let channel = self.channel;
        self.connection
            .handler_mut()
            .with_session(channel, |session, out| session.detach(out, id, None))?;
        self.connection.flush()?;
        self.wait_for("detach", |c| c.link(id).is_none())
    }

    fn wait_attached(&mut self, id: LinkId, name: String) -> Result<(), ClientError> {
        self.wait_for("attach", |c| {
            c.link(id).map(|l| l.core().state()) != Some(LinkState::Attaching)
        })?;
        match self.link(id).map(|l| l.core().state()) {
            Some(LinkState::Attached) => Ok(()),
            _ => {
                warn!(name = %name, "link refused");
                Err(ClientError::LinkRefused(name))
            }
        }
    }

    fn link(&self, id: LinkId) -> Option<&Link> {
        self.connection.handler().session(self.channel)?.link(id)
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.closed || self.connection.handler().is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    /// Pumps until `done` holds.
    fn wait_for(
        &mut self,
        what: &'static str,
        done: impl Fn(&Self) -> bool,
    ) -> Result<(), ClientError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if done(self) {
                return Ok(());
            }
            if self.connection.handler().is_closed() {
                return Err(ClientError::Closed);
            }
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout(what));
            }
            self.pump()?;
        }
    }

    fn pump(&mut self) -> Result<Pump, ClientError> {
        match self.connection.pump() {
            Ok(pump) => Ok(pump),
            Err(e) => {
                self.connection.handler_mut().fail();
                Err(e.into())
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(_e) = self.close() {
            debug!(error = %_e, "close on drop failed");
        }
    }
}
