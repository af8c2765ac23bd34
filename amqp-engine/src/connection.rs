//! Connections: the frame dispatcher and the read loop around it.
//!
//! [`ConnectionHandler`] owns every session on one connection and turns each
//! inbound performative into calls on them. It never touches the stream; all
//! replies are queued on its [`FrameWriter`]. [`Connection`] binds a handler
//! to a duplex byte stream and drives it one frame at a time.
//!
//! ```text
//!   stream ──read──▶ FrameReader ──▶ ConnectionHandler::dispatch
//!                                        │ open / begin / end / close
//!                                        │ attach / flow / transfer / ...
//!                                        ▼
//!                                     Session ──▶ Link ──▶ UnsettledWindow
//!                                        │
//!   stream ◀─flush── FrameWriter ◀───────┘
//! ```
//!
//! Everything for one connection runs on the thread that calls
//! [`Connection::pump`]; there is no locking inside a connection.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::factory::LinkFactory;
use crate::protocol::{
    AmqpError, Begin, ChannelId, Close, DEFAULT_MAX_FRAME_SIZE, End, MIN_MAX_FRAME_SIZE, Open,
    Performative, condition,
};
use crate::session::{Session, SessionConfig, SessionError};
use crate::trace::{debug, error, info, trace, warn};
use crate::transport::{FrameReader, FrameSink, FrameWriter, ReadOutcome, TransportError};

/// How long a connection closed on shutdown waits for the peer's `close`.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Settings for one connection, on either side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Announced in our `open`.
    pub container_id: String,
    /// Largest frame we accept. Clamped to at least 512.
    pub max_frame_size: u32,
    /// Highest channel number we assign.
    pub channel_max: u16,
    /// Credit window of each receiving link.
    pub prefetch: u32,
    /// Cap on each session's unsettled outgoing deliveries.
    pub max_unsettled: Option<usize>,
    /// Highest link handle we assign per session.
    pub handle_max: u32,
    /// How long a read waits before the loop pumps senders and checks for
    /// shutdown.
    pub idle_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            container_id: format!("amqp-engine-{:08x}", rand::random::<u32>()),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            channel_max: u16::MAX,
            prefetch: 64,
            max_unsettled: None,
            handle_max: u32::MAX,
            idle_timeout: Duration::from_millis(10),
        }
    }
}

impl ConnectionConfig {
    /// Limits handed to every session on the connection.
    #[must_use]
    pub const fn session_config(&self) -> SessionConfig {
        SessionConfig {
            prefetch: self.prefetch,
            max_unsettled: self.max_unsettled,
            handle_max: self.handle_max,
        }
    }

    fn frame_limit(&self) -> u32 {
        self.max_frame_size.max(MIN_MAX_FRAME_SIZE)
    }
}

/// Errors that end a connection, or local misuse of one.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Session(SessionError),
    #[error("no session on channel {0}")]
    UnknownSession(ChannelId),
    #[error("all channels up to {0} are in use")]
    ChannelsExhausted(u16),
    #[error("connection is closed")]
    Closed,
}

impl From<SessionError> for ConnectionError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Transport(e) => Self::Transport(e),
            other => Self::Session(other),
        }
    }
}

/// Frame dispatcher for one connection.
///
/// Sessions are keyed by the channel we send on; `by_remote` maps the
/// channel the peer sends on to ours.
pub struct ConnectionHandler {
    config: ConnectionConfig,
    writer: FrameWriter,
    factory: Option<Arc<dyn LinkFactory>>,
    sessions: HashMap<ChannelId, Session>,
    by_remote: HashMap<ChannelId, ChannelId>,
    /// Local channels we sent `end` on.
    ending: HashSet<ChannelId>,
    peer_open: Option<Open>,
    open_sent: bool,
    close_sent: bool,
    close_received: bool,
    failed: bool,
}

impl ConnectionHandler {
    /// Creates a handler. Without a factory every peer-initiated attach is
    /// refused.
    #[must_use]
    pub fn new(config: ConnectionConfig, factory: Option<Arc<dyn LinkFactory>>) -> Self {
        let writer = FrameWriter::new(config.frame_limit());
        Self {
            config,
            writer,
            factory,
            sessions: HashMap::new(),
            by_remote: HashMap::new(),
            ending: HashSet::new(),
            peer_open: None,
            open_sent: false,
            close_sent: false,
            close_received: false,
            failed: false,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The peer's `open`, once received.
    #[must_use]
    pub const fn peer_open(&self) -> Option<&Open> {
        self.peer_open.as_ref()
    }

    /// Frame size limit for what we send, after negotiation.
    #[must_use]
    pub const fn max_frame_size(&self) -> u32 {
        self.writer.max_frame_size()
    }

    #[must_use]
    pub fn session(&self, channel: ChannelId) -> Option<&Session> {
        self.sessions.get(&channel)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub const fn close_sent(&self) -> bool {
        self.close_sent
    }

    /// Closed in both directions, or failed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.failed || (self.close_sent && self.close_received)
    }

    pub(crate) fn writer_mut(&mut self) -> &mut FrameWriter {
        &mut self.writer
    }

    /// Queues our `open`. Does nothing if it was already sent.
    pub fn open(&mut self, hostname: Option<&str>) -> Result<(), ConnectionError> {
        if self.open_sent {
            return Ok(());
        }
        let open = Open {
            container_id: self.config.container_id.clone(),
            hostname: hostname.map(str::to_owned),
            max_frame_size: self.config.frame_limit(),
            channel_max: self.config.channel_max,
        };
        self.writer.queue(ChannelId(0), &Performative::Open(open))?;
        self.open_sent = true;
        debug!(container_id = %self.config.container_id, "open sent");
        Ok(())
    }

    /// Starts a session and queues its `begin`. Returns the local channel.
    pub fn begin(&mut self) -> Result<ChannelId, ConnectionError> {
        if self.close_sent {
            return Err(ConnectionError::Closed);
        }
        let channel = self.allocate_channel()?;
        let session = Session::new(
            channel,
            self.config.session_config(),
            self.factory.clone(),
        );
        self.writer
            .queue(channel, &Performative::Begin(session.begin_frame()))?;
        self.sessions.insert(channel, session);
        debug!(channel = %channel, "begin sent");
        Ok(channel)
    }

    /// Runs `f` against a local session, with the writer as its frame sink.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::UnknownSession`] if there is no such session, or
    /// whatever `f` returns.
    pub fn with_session<T>(
        &mut self,
        channel: ChannelId,
        f: impl FnOnce(&mut Session, &mut dyn FrameSink) -> Result<T, SessionError>,
    ) -> Result<T, ConnectionError> {
        let session = self
            .sessions
            .get_mut(&channel)
            .ok_or(ConnectionError::UnknownSession(channel))?;
        Ok(f(session, &mut self.writer)?)
    }

    /// Routes one inbound performative. `channel` is the channel the frame
    /// arrived on.
    ///
    /// # Errors
    ///
    /// Only transport errors are returned; they are fatal to the connection.
    /// Frames that make no sense in the current state are logged and dropped.
    pub fn dispatch(
        &mut self,
        channel: ChannelId,
        performative: Performative,
        payload: &mut dyn Read,
    ) -> Result<(), ConnectionError> {
        let performative = match performative {
            Performative::Open(open) => return self.on_open(open),
            Performative::Close(close) => return self.on_close(close),
            _ if self.peer_open.is_none() => {
                warn!(
                    channel = %channel,
                    frame = performative.name(),
                    "frame before open, dropping"
                );
                return Ok(());
            }
            Performative::Begin(begin) => return self.on_begin(channel, begin),
            Performative::End(end) => return self.on_end(channel, end),
            other => other,
        };

        let Some(local) = self.by_remote.get(&channel).copied() else {
            warn!(
                channel = %channel,
                frame = performative.name(),
                "frame for unknown channel, dropping"
            );
            return Ok(());
        };
        let Some(session) = self.sessions.get_mut(&local) else {
            return Ok(());
        };
        let out = &mut self.writer;
        let result = match performative {
            Performative::Attach(attach) => session.on_attach(out, attach),
            Performative::Flow(flow) => session.on_flow(out, flow),
            Performative::Transfer(transfer) => session.on_transfer(out, transfer, payload),
            Performative::Disposition(disposition) => session.on_disposition(out, disposition),
            Performative::Detach(detach) => session.on_detach(out, detach),
            Performative::Open(_)
            | Performative::Begin(_)
            | Performative::End(_)
            | Performative::Close(_) => Ok(()),
        };
        absorb(local, result)
    }

    fn on_open(&mut self, open: Open) -> Result<(), ConnectionError> {
        if self.peer_open.is_some() {
            warn!(container_id = %open.container_id, "duplicate open, dropping");
            return Ok(());
        }
        let limit = self
            .config
            .frame_limit()
            .min(open.max_frame_size)
            .max(MIN_MAX_FRAME_SIZE);
        self.writer.set_max_frame_size(limit);
        info!(
            container_id = %open.container_id,
            hostname = ?open.hostname,
            max_frame_size = limit,
            "connection opened"
        );
        self.peer_open = Some(open);
        self.open(None)
    }

    fn on_begin(&mut self, channel: ChannelId, begin: Begin) -> Result<(), ConnectionError> {
        if let Some(local) = begin.remote_channel {
            // Answer to a begin of ours.
            let Some(session) = self.sessions.get_mut(&local) else {
                warn!(channel = %channel, local = %local, "begin answers an unknown session, dropping");
                return Ok(());
            };
            if session.remote_channel().is_none() {
                session.set_remote_channel(channel);
                self.by_remote.insert(channel, local);
                info!(channel = %local, remote_channel = %channel, "session begun");
            }
            return Ok(());
        }

        if self.by_remote.contains_key(&channel) {
            debug!(channel = %channel, "duplicate begin, ignoring");
            return Ok(());
        }
        let local = self.allocate_channel()?;
        let mut session = Session::new(local, self.config.session_config(), self.factory.clone());
        session.set_remote_channel(channel);
        self.writer
            .queue(local, &Performative::Begin(session.begin_frame()))?;
        self.sessions.insert(local, session);
        self.by_remote.insert(channel, local);
        info!(channel = %local, remote_channel = %channel, "session begun");
        Ok(())
    }

    fn on_end(&mut self, channel: ChannelId, _end: End) -> Result<(), ConnectionError> {
        let Some(local) = self.by_remote.remove(&channel) else {
            warn!(channel = %channel, "end for unknown channel, dropping");
            return Ok(());
        };
        if !self.ending.remove(&local) {
            self.writer.queue(local, &Performative::End(End::default()))?;
        }
        if let Some(mut session) = self.sessions.remove(&local) {
            let _links = session.release_all();
            info!(
                channel = %local,
                links = _links,
                error = ?_end.error,
                "session ended"
            );
        }
        Ok(())
    }

    fn on_close(&mut self, _close: Close) -> Result<(), ConnectionError> {
        self.close_received = true;
        if !self.close_sent {
            self.writer
                .queue(ChannelId(0), &Performative::Close(Close::default()))?;
            self.close_sent = true;
        }
        info!(error = ?_close.error, "connection closed by peer");
        self.release_sessions();
        Ok(())
    }

    /// Queues `end` for a local session. It is released once the peer answers.
    pub fn end_session(
        &mut self,
        channel: ChannelId,
        error: Option<AmqpError>,
    ) -> Result<(), ConnectionError> {
        if !self.sessions.contains_key(&channel) {
            return Err(ConnectionError::UnknownSession(channel));
        }
        if !self.ending.insert(channel) {
            return Ok(());
        }
        self.writer
            .queue(channel, &Performative::End(End { error }))?;
        debug!(channel = %channel, "end sent");
        Ok(())
    }

    /// Ends every session and queues `close`. Idempotent.
    pub fn close(&mut self, error: Option<AmqpError>) -> Result<(), ConnectionError> {
        if self.close_sent {
            return Ok(());
        }
        let mut channels: Vec<ChannelId> = self.sessions.keys().copied().collect();
        channels.sort_unstable_by_key(|c| c.0);
        for channel in channels {
            self.end_session(channel, None)?;
        }
        self.writer
            .queue(ChannelId(0), &Performative::Close(Close { error }))?;
        self.close_sent = true;
        info!("close sent");
        Ok(())
    }

    /// Tears everything down after the transport is lost.
    pub fn fail(&mut self) {
        if self.failed {
            return;
        }
        self.failed = true;
        self.release_sessions();
    }

    /// Pumps every session's sources.
    pub fn on_idle(&mut self) -> Result<(), ConnectionError> {
        if self.peer_open.is_none() || self.close_sent {
            return Ok(());
        }
        for (channel, session) in &mut self.sessions {
            absorb(*channel, session.on_idle(&mut self.writer))?;
        }
        Ok(())
    }

    /// Writes queued frames to `stream`.
    pub fn flush_to<W: Write + ?Sized>(&mut self, stream: &mut W) -> Result<(), TransportError> {
        self.writer.flush_to(stream)
    }

    fn release_sessions(&mut self) {
        for (_channel, mut session) in self.sessions.drain() {
            let _links = session.release_all();
            debug!(channel = %_channel, links = _links, "session released");
        }
        self.by_remote.clear();
        self.ending.clear();
    }

    fn allocate_channel(&self) -> Result<ChannelId, ConnectionError> {
        (0..=self.config.channel_max)
            .map(ChannelId)
            .find(|c| !self.sessions.contains_key(c))
            .ok_or(ConnectionError::ChannelsExhausted(self.config.channel_max))
    }
}

/// Escalates transport errors from a session; anything else is a peer
/// mistake already handled by the session.
fn absorb(_channel: ChannelId, result: Result<(), SessionError>) -> Result<(), ConnectionError> {
    match result {
        Ok(()) => Ok(()),
        Err(SessionError::Transport(e)) => Err(e.into()),
        Err(_e) => {
            warn!(channel = %_channel, error = %_e, "session error, frame dropped");
            Ok(())
        }
    }
}

/// Result of one [`Connection::pump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    /// A frame (or the protocol header) was processed.
    Frame,
    /// Nothing arrived within the idle timeout.
    Idle,
    /// The connection is finished.
    Closed,
}

/// A [`ConnectionHandler`] bound to a duplex byte stream.
pub struct Connection<S> {
    stream: S,
    reader: FrameReader,
    handler: ConnectionHandler,
    header_sent: bool,
    header_received: bool,
    shutdown: Option<Arc<AtomicBool>>,
    closing_since: Option<Instant>,
}

impl<S: Read + Write> Connection<S> {
    #[must_use]
    pub fn new(stream: S, config: ConnectionConfig, factory: Option<Arc<dyn LinkFactory>>) -> Self {
        let reader = FrameReader::new(config.frame_limit());
        Self {
            stream,
            reader,
            handler: ConnectionHandler::new(config, factory),
            header_sent: false,
            header_received: false,
            shutdown: None,
            closing_since: None,
        }
    }

    /// Closes the connection with `amqp:connection:forced` once `flag` is set.
    #[must_use]
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    #[must_use]
    pub const fn handler(&self) -> &ConnectionHandler {
        &self.handler
    }

    pub const fn handler_mut(&mut self) -> &mut ConnectionHandler {
        &mut self.handler
    }

    #[must_use]
    pub const fn stream(&self) -> &S {
        &self.stream
    }

    /// Opens the connection from the initiating side: protocol header,
    /// `open`, and one session. Returns the session's local channel.
    pub fn start(&mut self, hostname: Option<&str>) -> Result<ChannelId, ConnectionError> {
        self.send_header();
        self.handler.open(hostname)?;
        let channel = self.handler.begin()?;
        self.flush()?;
        Ok(channel)
    }

    /// Writes everything queued.
    pub fn flush(&mut self) -> Result<(), ConnectionError> {
        self.handler.flush_to(&mut self.stream)?;
        Ok(())
    }

    /// Queues `close` and flushes it.
    pub fn close(&mut self, error: Option<AmqpError>) -> Result<(), ConnectionError> {
        self.handler.close(error)?;
        self.closing_since.get_or_insert_with(Instant::now);
        self.flush()
    }

    /// Reads and handles at most one frame.
    ///
    /// # Errors
    ///
    /// Transport failures. The handler is not failed here; [`run`](Self::run)
    /// does that, and callers pumping by hand should call
    /// [`ConnectionHandler::fail`] themselves.
    pub fn pump(&mut self) -> Result<Pump, ConnectionError> {
        if self.handler.is_closed() {
            return Ok(Pump::Closed);
        }

        if !self.header_received {
            return match self.reader.read_protocol_header(&mut self.stream)? {
                ReadOutcome::Ready(()) => {
                    self.header_received = true;
                    self.send_header();
                    debug!("protocol header received");
                    self.flush()?;
                    Ok(Pump::Frame)
                }
                ReadOutcome::Idle => self.idle(),
                ReadOutcome::Eof => Ok(self.hang_up()),
            };
        }

        let outcome = match self.reader.read_frame(&mut self.stream) {
            Ok(outcome) => outcome,
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "malformed frame, dropping");
                return Ok(Pump::Frame);
            }
            Err(e) => return Err(e.into()),
        };
        let frame = match outcome {
            ReadOutcome::Ready(frame) => frame,
            ReadOutcome::Idle => return self.idle(),
            ReadOutcome::Eof => return Ok(self.hang_up()),
        };

        let channel = frame.channel;
        let Some(performative) = frame.performative else {
            trace!(channel = %channel, "heartbeat");
            return Ok(Pump::Frame);
        };
        trace!(channel = %channel, frame = performative.name(), "frame received");
        let mut payload = frame.payload;
        self.handler.dispatch(channel, performative, &mut payload)?;
        self.handler.flush_to(&mut self.stream)?;
        Ok(Pump::Frame)
    }

    /// Pumps until the connection closes.
    ///
    /// # Errors
    ///
    /// The transport error that ended the connection. Every session has
    /// been released by then.
    pub fn run(&mut self) -> Result<(), ConnectionError> {
        loop {
            match self.pump() {
                Ok(Pump::Closed) => return Ok(()),
                Ok(Pump::Frame | Pump::Idle) => {}
                Err(e) => {
                    error!(error = %e, "connection failed");
                    self.handler.fail();
                    return Err(e);
                }
            }
        }
    }

    fn send_header(&mut self) {
        if !self.header_sent {
            self.handler.writer_mut().queue_protocol_header();
            self.header_sent = true;
        }
    }

    fn idle(&mut self) -> Result<Pump, ConnectionError> {
        let shutdown = self
            .shutdown
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed));
        if shutdown && !self.handler.close_sent() {
            info!("shutdown requested, closing connection");
            let error = AmqpError::new(condition::CONNECTION_FORCED, "shutting down");
            self.handler.close(Some(error))?;
            self.closing_since = Some(Instant::now());
        }
        if self
            .closing_since
            .is_some_and(|since| since.elapsed() >= CLOSE_GRACE)
        {
            warn!("peer did not answer close, giving up");
            self.flush()?;
            self.handler.fail();
            return Ok(Pump::Closed);
        }

        self.handler.on_idle()?;
        self.flush()?;
        Ok(if self.handler.is_closed() {
            Pump::Closed
        } else {
            Pump::Idle
        })
    }

    fn hang_up(&mut self) -> Pump {
        if !self.handler.is_closed() {
            info!("peer hung up");
        }
        self.handler.fail();
        Pump::Closed
    }
}
