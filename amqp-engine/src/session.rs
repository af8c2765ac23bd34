//! Sessions: link multiplexing, delivery ids and per-handle routing.
//!
//! A session owns its links (in a [`LinkArena`]), the maps from each peer's
//! handles to them, and one [`UnsettledWindow`] per direction. All frames it
//! produces go through the [`FrameSink`] handed to each call, so the caller
//! decides when they reach the wire.
//!
//! # Settlement
//!
//! ```text
//!  sender side                              receiver side
//!  ───────────                              ─────────────
//!  transfer ── id N, settled=false ───────▶ record N (incoming)
//!                                           outcome from sink / application
//!  resolve N ◀── disposition(N, state) ──── AtLeastOnce: settled=true, drop N
//!                                           ExactlyOnce: settled=false, keep N
//!  ExactlyOnce only:
//!            ─── disposition(N, settled) ─▶ drop N
//! ```
//!
//! Detaching a link, ending its session or losing the connection resolves
//! every delivery it still has in flight as released.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use thiserror::Error;

use crate::delivery::{DeliveryRecord, Settlement, UnsettledWindow, WindowError};
use crate::factory::{LinkEndpoint, LinkFactory, LinkRefusal, LinkRequest, MessageSink, MessageSource};
use crate::link::{
    Link, LinkArena, LinkCore, LinkId, LinkState, ReceivedMessage, ReceiverLink, SenderLink,
};
use crate::protocol::{
    AmqpError, Attach, Begin, ChannelId, DeliveryId, DeliveryState, Detach, Disposition, Flow,
    Handle, Performative, Role, SettleMode, Source, Target, Transfer, condition,
};
use crate::trace::{debug, info, trace, warn};
use crate::transport::{FrameSink, TransportError};

/// Per-session limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Credit window each receiving link keeps open.
    pub prefetch: u32,
    /// Cap on unsettled outgoing deliveries; `None` grows with demand.
    pub max_unsettled: Option<usize>,
    /// Highest handle this side assigns.
    pub handle_max: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prefetch: 64,
            max_unsettled: None,
            handle_max: u32::MAX,
        }
    }
}

/// Local misuse of a session. Peer mistakes are logged and dropped instead.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no link {0}")]
    UnknownLink(LinkId),
    #[error("link {link} is a {role}")]
    WrongRole { link: String, role: Role },
    #[error("link {0} is not attached")]
    NotAttached(String),
    #[error("link {0} has no credit")]
    NoCredit(String),
    #[error("unsettled window full ({limit} deliveries)")]
    UnsettledWindowFull { limit: usize },
    #[error("all handles up to {0} are in use")]
    HandlesExhausted(u32),
    #[error("link name {0} is already attached")]
    DuplicateName(String),
    #[error("no unsettled delivery {0}")]
    UnknownDelivery(DeliveryId),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<WindowError> for SessionError {
    fn from(e: WindowError) -> Self {
        match e {
            WindowError::Full { limit } => Self::UnsettledWindowFull { limit },
            WindowError::OutOfOrder { id, .. } => Self::UnknownDelivery(id),
        }
    }
}

/// One session on a connection.
pub struct Session {
    /// Channel we send on.
    channel: ChannelId,
    /// Channel the peer sends on; known once its `begin` is seen.
    remote_channel: Option<ChannelId>,
    config: SessionConfig,
    factory: Option<Arc<dyn LinkFactory>>,
    links: LinkArena,
    by_incoming: HashMap<Handle, LinkId>,
    by_outgoing: HashMap<Handle, LinkId>,
    by_name: HashMap<String, LinkId>,
    /// Handles are never reused within a session.
    next_handle: u64,
    outgoing: UnsettledWindow,
    incoming: UnsettledWindow,
}

impl Session {
    #[must_use]
    pub fn new(
        channel: ChannelId,
        config: SessionConfig,
        factory: Option<Arc<dyn LinkFactory>>,
    ) -> Self {
        Self {
            channel,
            remote_channel: None,
            config,
            factory,
            links: LinkArena::new(),
            by_incoming: HashMap::new(),
            by_outgoing: HashMap::new(),
            by_name: HashMap::new(),
            next_handle: 0,
            outgoing: UnsettledWindow::new(config.max_unsettled),
            incoming: UnsettledWindow::default(),
        }
    }

    #[must_use]
    pub const fn channel(&self) -> ChannelId {
        self.channel
    }

    #[must_use]
    pub const fn remote_channel(&self) -> Option<ChannelId> {
        self.remote_channel
    }

    pub(crate) const fn set_remote_channel(&mut self, channel: ChannelId) {
        self.remote_channel = Some(channel);
    }

    #[must_use]
    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.links.get(id)
    }

    /// Finds a live link by name.
    #[must_use]
    pub fn link_id(&self, name: &str) -> Option<LinkId> {
        self.by_name.get(name).copied()
    }

    #[must_use]
    pub const fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Handle the next locally attached link will get.
    #[must_use]
    pub const fn next_handle(&self) -> u64 {
        self.next_handle
    }

    /// Unsettled deliveries we sent.
    #[must_use]
    pub const fn unsettled_outgoing(&self) -> usize {
        self.outgoing.len()
    }

    /// Unsettled deliveries we received.
    #[must_use]
    pub const fn unsettled_incoming(&self) -> usize {
        self.incoming.len()
    }

    /// `begin` announcing this session, or answering the peer's.
    #[must_use]
    pub fn begin_frame(&self) -> Begin {
        Begin {
            remote_channel: self.remote_channel,
            next_outgoing_id: self.outgoing.next_id(),
            incoming_window: u32::MAX,
            outgoing_window: u32::MAX,
            handle_max: self.config.handle_max,
        }
    }

    // ---- local link lifecycle ----

    /// Attaches a sending link. With no `source`, messages are sent through
    /// [`transfer`](Self::transfer) and settlements collected with
    /// [`take_settlements`](Self::take_settlements). An empty address asks
    /// the peer for a dynamic node.
    pub fn attach_sender(
        &mut self,
        out: &mut dyn FrameSink,
        name: &str,
        address: &str,
        settle_mode: SettleMode,
        source: Option<Box<dyn MessageSource>>,
    ) -> Result<LinkId, SessionError> {
        let core = LinkCore::new(name, address, Role::Sender, self.channel, settle_mode);
        self.attach_local(out, Link::Sender(SenderLink::new(core, 0, source)))
    }

    /// Attaches a receiving link. With no `sink`, messages are buffered and
    /// handed out by [`take`](Self::take). Credit is granted once the peer
    /// answers.
    pub fn attach_receiver(
        &mut self,
        out: &mut dyn FrameSink,
        name: &str,
        address: &str,
        settle_mode: SettleMode,
        sink: Option<Box<dyn MessageSink>>,
    ) -> Result<LinkId, SessionError> {
        let core = LinkCore::new(name, address, Role::Receiver, self.channel, settle_mode);
        let link = ReceiverLink::new(core, self.config.prefetch, sink);
        self.attach_local(out, Link::Receiver(link))
    }

    /// Changes a receiving link's credit window. Takes effect at the next
    /// grant, which for a link still attaching is its first.
    pub fn set_prefetch(&mut self, id: LinkId, prefetch: u32) -> Result<(), SessionError> {
        receiver_mut(&mut self.links, id)?.credit_mut().set_prefetch(prefetch);
        Ok(())
    }

    fn attach_local(&mut self, out: &mut dyn FrameSink, mut link: Link) -> Result<LinkId, SessionError> {
        if self.by_name.contains_key(link.core().name()) {
            return Err(SessionError::DuplicateName(link.core().name().to_owned()));
        }
        let handle = self.allocate_handle()?;
        link.core_mut().set_outgoing_handle(handle);

        let attach = attach_frame(link.core(), handle);
        out.queue(self.channel, &Performative::Attach(attach))?;

        debug!(
            channel = %self.channel,
            handle = %handle,
            name = link.core().name(),
            address = link.core().address(),
            role = %link.role(),
            "attaching link"
        );
        let name = link.core().name().to_owned();
        let id = self.links.insert(link);
        self.by_outgoing.insert(handle, id);
        self.by_name.insert(name, id);
        Ok(id)
    }

    /// Starts detaching a link. It stays in the session, still receiving
    /// frames, until the peer's `detach` arrives.
    pub fn detach(
        &mut self,
        out: &mut dyn FrameSink,
        id: LinkId,
        error: Option<AmqpError>,
    ) -> Result<(), SessionError> {
        let link = self.links.get_mut(id).ok_or(SessionError::UnknownLink(id))?;
        if link.core().state() == LinkState::Detaching {
            return Ok(());
        }
        let handle = link
            .core()
            .outgoing_handle()
            .ok_or_else(|| SessionError::NotAttached(link.core().name().to_owned()))?;
        link.core_mut().set_state(LinkState::Detaching);

        let detach = Detach {
            handle,
            closed: true,
            error,
        };
        out.queue(self.channel, &Performative::Detach(detach))?;
        debug!(channel = %self.channel, handle = %handle, "detaching link");
        Ok(())
    }

    // ---- sending ----

    /// Sends one transfer on a sending link.
    ///
    /// # Errors
    ///
    /// [`SessionError::NoCredit`] if the peer has not granted credit, and
    /// [`SessionError::UnsettledWindowFull`] if the unsettled cap is reached.
    /// No delivery id is consumed in either case.
    pub fn transfer(
        &mut self,
        out: &mut dyn FrameSink,
        id: LinkId,
        correlation_id: u64,
        payload: &mut dyn Read,
    ) -> Result<DeliveryId, SessionError> {
        let sender = sender_mut(&mut self.links, id)?;
        let core = sender.core();
        let handle = match core.outgoing_handle() {
            Some(handle) if core.is_attached() => handle,
            _ => return Err(SessionError::NotAttached(core.name().to_owned())),
        };
        if !sender.credit().has_credit() {
            return Err(SessionError::NoCredit(core.name().to_owned()));
        }
        let settle_mode = core.settle_mode();

        let delivery_id = self.outgoing.add_delivery(id, correlation_id, settle_mode)?;
        let transfer = Transfer {
            handle,
            delivery_id: Some(delivery_id),
            delivery_tag: sender.next_delivery_tag(),
            message_format: 0,
            settled: settle_mode.is_presettled(),
        };
        if let Err(e) =
            out.queue_with_payload(self.channel, &Performative::Transfer(transfer), payload)
        {
            self.outgoing.remove(delivery_id);
            return Err(e.into());
        }
        sender.credit_mut().on_send();

        trace!(
            channel = %self.channel,
            handle = %handle,
            delivery_id = %delivery_id,
            credit = sender.credit().link_credit(),
            "transfer sent"
        );
        Ok(delivery_id)
    }

    /// Sends from attached sources while they have messages and credit.
    pub fn pump_sources(&mut self, out: &mut dyn FrameSink) -> Result<usize, SessionError> {
        let mut sent = 0;
        for id in self.links.ids() {
            sent += self.pump(out, id)?;
        }
        Ok(sent)
    }

    fn pump(&mut self, out: &mut dyn FrameSink, id: LinkId) -> Result<usize, SessionError> {
        let mut sent = 0;
        loop {
            let Some(Link::Sender(sender)) = self.links.get_mut(id) else {
                break;
            };
            let ready = sender.core().is_attached()
                && sender.credit().has_credit()
                && self.outgoing.has_room(sender.core().settle_mode());
            if !ready {
                break;
            }
            let Some(message) = sender.source_mut().and_then(|s| s.next_message()) else {
                break;
            };

            let delivery_id = self.outgoing.next_id();
            match self.transfer(out, id, message.correlation_id, &mut message.payload.as_slice()) {
                Ok(_) => sent += 1,
                Err(SessionError::Transport(TransportError::Protocol(error))) => {
                    warn!(
                        channel = %self.channel,
                        correlation_id = message.correlation_id,
                        error = %error,
                        "message cannot be framed, rejecting"
                    );
                    let rejected = Settlement {
                        delivery_id,
                        correlation_id: message.correlation_id,
                        txn_id: None,
                        state: DeliveryState::Rejected {
                            error: Some(AmqpError::new(condition::INTERNAL_ERROR, error.to_string())),
                        },
                    };
                    if let Some(sender) = self.links.get_mut(id).and_then(Link::as_sender_mut) {
                        sender.settle(rejected);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(sent)
    }

    /// Settlements queued on a source-less sending link.
    pub fn take_settlements(&mut self, id: LinkId) -> Result<Vec<Settlement>, SessionError> {
        Ok(sender_mut(&mut self.links, id)?.take_settlements())
    }

    // ---- receiving ----

    /// Hands the next buffered message of a sink-less receiving link to the
    /// application, re-announcing credit when due.
    pub fn take(
        &mut self,
        out: &mut dyn FrameSink,
        id: LinkId,
    ) -> Result<Option<ReceivedMessage>, SessionError> {
        let receiver = receiver_mut(&mut self.links, id)?;
        let Some(message) = receiver.pop_backlog() else {
            return Ok(None);
        };
        if receiver.credit_mut().on_take() {
            self.grant_credit(out, id)?;
        }
        Ok(Some(message))
    }

    /// Reports the outcome of a received delivery to its sender.
    ///
    /// Under [`SettleMode::ExactlyOnce`] the delivery stays unsettled until
    /// the sender confirms.
    pub fn settle(
        &mut self,
        out: &mut dyn FrameSink,
        delivery_id: DeliveryId,
        state: DeliveryState,
    ) -> Result<(), SessionError> {
        let record = self
            .incoming
            .get(delivery_id)
            .ok_or(SessionError::UnknownDelivery(delivery_id))?;
        let settled = record.settle_mode() != SettleMode::ExactlyOnce;
        if settled {
            self.incoming.remove(delivery_id);
        }

        trace!(
            channel = %self.channel,
            delivery_id = %delivery_id,
            state = state.name(),
            settled,
            "disposition sent"
        );
        let disposition = Disposition {
            role: Role::Receiver,
            first: delivery_id,
            last: None,
            settled,
            state: Some(state),
        };
        out.queue(self.channel, &Performative::Disposition(disposition))?;
        Ok(())
    }

    /// Sends a `flow` reopening a receiving link's credit window.
    pub fn grant_credit(&mut self, out: &mut dyn FrameSink, id: LinkId) -> Result<(), SessionError> {
        let receiver = receiver_mut(&mut self.links, id)?;
        let Some(handle) = receiver.core().outgoing_handle() else {
            return Err(SessionError::NotAttached(receiver.core().name().to_owned()));
        };
        let grant = receiver.credit_mut().grant();

        debug!(
            channel = %self.channel,
            handle = %handle,
            delivery_count = grant.delivery_count,
            link_credit = grant.link_credit,
            "granting credit"
        );
        let flow = Flow {
            handle: Some(handle),
            delivery_count: Some(grant.delivery_count),
            link_credit: grant.link_credit,
            echo: false,
        };
        out.queue(self.channel, &Performative::Flow(flow))?;
        Ok(())
    }

    // ---- inbound frames ----

    /// Handles a peer `attach`: either the answer to one of ours, or a new
    /// link resolved through the factory.
    pub fn on_attach(&mut self, out: &mut dyn FrameSink, attach: Attach) -> Result<(), SessionError> {
        if let Some(&id) = self.by_name.get(&attach.name) {
            return self.complete_attach(out, id, attach);
        }
        if self.by_incoming.contains_key(&attach.handle) {
            warn!(
                channel = %self.channel,
                handle = %attach.handle,
                name = %attach.name,
                "attach reuses a live handle, dropping"
            );
            return Ok(());
        }
        self.accept_attach(out, attach)
    }

    fn complete_attach(
        &mut self,
        out: &mut dyn FrameSink,
        id: LinkId,
        attach: Attach,
    ) -> Result<(), SessionError> {
        let Some(link) = self.links.get_mut(id) else {
            return Ok(());
        };
        if link.core().state() != LinkState::Attaching || link.role() != attach.role.opposite() {
            warn!(channel = %self.channel, name = %attach.name, "attach for a name already in use");
            let error = AmqpError::new(condition::INTERNAL_ERROR, "link name already attached");
            return self.refuse_attach(out, &attach, error);
        }

        let core = link.core_mut();
        core.set_incoming_handle(attach.handle);
        if attach.source.is_none() && attach.target.is_none() {
            // Refused; the peer's detach follows and removes the link.
            debug!(channel = %self.channel, name = %attach.name, "attach refused by peer");
            self.by_incoming.insert(attach.handle, id);
            return Ok(());
        }
        core.set_state(LinkState::Attached);
        if core.address().is_empty() {
            if let Some(address) = attach.node_address() {
                core.set_address(address);
            }
        }
        let is_receiver = match link {
            Link::Receiver(receiver) => {
                let initial = attach.initial_delivery_count.unwrap_or(0);
                receiver.credit_mut().set_initial_delivery_count(initial);
                true
            }
            Link::Sender(_) => false,
        };
        self.by_incoming.insert(attach.handle, id);

        info!(channel = %self.channel, handle = %attach.handle, name = %attach.name, "link attached");
        if is_receiver {
            self.grant_credit(out, id)?;
        }
        Ok(())
    }

    fn accept_attach(&mut self, out: &mut dyn FrameSink, attach: Attach) -> Result<(), SessionError> {
        let role = attach.role.opposite();
        let settle_mode = SettleMode::from_peer(attach.snd_settle_mode, attach.rcv_settle_mode);

        if self.next_handle > u64::from(self.config.handle_max) {
            let error = AmqpError::new(condition::INTERNAL_ERROR, "handle limit reached");
            return self.refuse_attach(out, &attach, error);
        }

        let request = LinkRequest {
            name: attach.name.clone(),
            address: attach.node_address().map(str::to_owned),
            dynamic: attach.wants_dynamic_node(),
            role,
            settle_mode,
        };
        let resolved = match &self.factory {
            Some(factory) => factory.resolve(&request),
            None => Err(LinkRefusal::Other("this endpoint accepts no links".into())),
        };
        let resolved = match resolved {
            Ok(resolved) => resolved,
            Err(refusal) => {
                warn!(
                    channel = %self.channel,
                    name = %attach.name,
                    error = %refusal,
                    "refusing attach"
                );
                return self.refuse_attach(out, &attach, refusal.to_amqp_error());
            }
        };

        let core = LinkCore::new(&attach.name, resolved.address, role, self.channel, settle_mode);
        let mut link = match (role, resolved.endpoint) {
            (Role::Receiver, LinkEndpoint::Sink(sink)) => {
                let mut receiver = ReceiverLink::new(core, self.config.prefetch, Some(sink));
                let initial = attach.initial_delivery_count.unwrap_or(0);
                receiver.credit_mut().set_initial_delivery_count(initial);
                Link::Receiver(receiver)
            }
            (Role::Sender, LinkEndpoint::Source(source)) => {
                Link::Sender(SenderLink::new(core, 0, Some(source)))
            }
            (_, endpoint) => {
                match endpoint {
                    LinkEndpoint::Sink(mut sink) => sink.close(),
                    LinkEndpoint::Source(mut source) => source.close(),
                }
                let error = AmqpError::new(condition::INTERNAL_ERROR, "no endpoint for this role");
                return self.refuse_attach(out, &attach, error);
            }
        };

        let handle = self.allocate_handle()?;
        let core = link.core_mut();
        core.set_incoming_handle(attach.handle);
        core.set_outgoing_handle(handle);
        core.set_state(LinkState::Attached);

        let reply = attach_frame(link.core(), handle);
        out.queue(self.channel, &Performative::Attach(reply))?;

        info!(
            channel = %self.channel,
            handle = %handle,
            name = %attach.name,
            address = link.core().address(),
            role = %role,
            "link attached"
        );
        let id = self.links.insert(link);
        self.by_incoming.insert(attach.handle, id);
        self.by_outgoing.insert(handle, id);
        self.by_name.insert(attach.name, id);

        if role == Role::Receiver {
            self.grant_credit(out, id)?;
        }
        Ok(())
    }

    /// Answers an attach with an empty echo and an immediate closing detach.
    /// Nothing is recorded, so other links are unaffected.
    fn refuse_attach(
        &mut self,
        out: &mut dyn FrameSink,
        attach: &Attach,
        error: AmqpError,
    ) -> Result<(), SessionError> {
        let handle = Handle(u32::try_from(self.next_handle).unwrap_or(u32::MAX));
        let echo = Attach {
            name: attach.name.clone(),
            handle,
            role: attach.role.opposite(),
            snd_settle_mode: attach.snd_settle_mode,
            rcv_settle_mode: attach.rcv_settle_mode,
            source: None,
            target: None,
            initial_delivery_count: None,
        };
        out.queue(self.channel, &Performative::Attach(echo))?;
        let detach = Detach {
            handle,
            closed: true,
            error: Some(error),
        };
        out.queue(self.channel, &Performative::Detach(detach))?;
        Ok(())
    }

    /// Handles a peer `transfer`, streaming the payload to the link.
    pub fn on_transfer(
        &mut self,
        out: &mut dyn FrameSink,
        transfer: Transfer,
        payload: &mut dyn Read,
    ) -> Result<(), SessionError> {
        let Some(&id) = self.by_incoming.get(&transfer.handle) else {
            warn!(channel = %self.channel, handle = %transfer.handle, "transfer for unknown handle, dropping");
            return Ok(());
        };
        let Some(Link::Receiver(receiver)) = self.links.get_mut(id) else {
            warn!(channel = %self.channel, handle = %transfer.handle, "transfer on a sending link, dropping");
            return Ok(());
        };
        let Some(delivery_id) = transfer.delivery_id else {
            warn!(channel = %self.channel, handle = %transfer.handle, "transfer without delivery id, dropping");
            return Ok(());
        };
        if !receiver.credit().can_accept() {
            warn!(
                channel = %self.channel,
                handle = %transfer.handle,
                delivery_id = %delivery_id,
                "transfer exceeds granted credit, dropping"
            );
            return Ok(());
        }
        receiver.credit_mut().on_transfer();
        trace!(channel = %self.channel, handle = %transfer.handle, delivery_id = %delivery_id, "transfer received");

        if !transfer.settled {
            let mode = match receiver.core().settle_mode() {
                SettleMode::Always => SettleMode::AtLeastOnce,
                mode => mode,
            };
            let record = DeliveryRecord::new(delivery_id, id, delivery_id.as_u64(), mode);
            if let Err(_e) = self.incoming.insert(record) {
                warn!(
                    channel = %self.channel,
                    error = %_e,
                    "duplicate or out-of-order delivery, dropping"
                );
                // The transfer spent credit but will never be taken.
                if receiver.credit_mut().on_take() {
                    self.grant_credit(out, id)?;
                }
                return Ok(());
            }
        }

        let outcome = match receiver.deliver(delivery_id, transfer.delivery_tag, transfer.settled, payload) {
            Ok(outcome) => outcome,
            Err(_e) => {
                warn!(channel = %self.channel, delivery_id = %delivery_id, error = %_e, "payload read failed");
                Some(DeliveryState::Modified {
                    delivery_failed: true,
                    undeliverable_here: false,
                })
            }
        };
        // Buffered messages are taken later through `take`.
        let Some(state) = outcome else {
            return Ok(());
        };
        let reannounce = receiver.credit_mut().on_take();

        if !transfer.settled {
            self.settle(out, delivery_id, state)?;
        }
        if reannounce {
            self.grant_credit(out, id)?;
        }
        Ok(())
    }

    /// Handles a peer `flow` for one of our links.
    pub fn on_flow(&mut self, out: &mut dyn FrameSink, flow: Flow) -> Result<(), SessionError> {
        let Some(handle) = flow.handle else {
            trace!(channel = %self.channel, "session flow");
            return Ok(());
        };
        let Some(&id) = self.by_incoming.get(&handle) else {
            warn!(channel = %self.channel, handle = %handle, "flow for unknown handle, dropping");
            return Ok(());
        };

        match self.links.get_mut(id) {
            Some(Link::Sender(sender)) => {
                sender.credit_mut().on_flow(flow.delivery_count, flow.link_credit);
                debug!(
                    channel = %self.channel,
                    handle = %handle,
                    link_credit = sender.credit().link_credit(),
                    "credit received"
                );
                if flow.echo {
                    let Some(outgoing) = sender.core().outgoing_handle() else {
                        return Ok(());
                    };
                    let state = Flow {
                        handle: Some(outgoing),
                        delivery_count: Some(sender.credit().delivery_count()),
                        link_credit: u32::try_from(sender.credit().link_credit()).unwrap_or(u32::MAX),
                        echo: false,
                    };
                    out.queue(self.channel, &Performative::Flow(state))?;
                }
                self.pump(out, id)?;
            }
            Some(Link::Receiver(_)) if flow.echo => self.grant_credit(out, id)?,
            Some(Link::Receiver(_)) | None => {}
        }
        Ok(())
    }

    /// Handles a peer `disposition`.
    ///
    /// From a receiver it settles deliveries we sent; from a sender it
    /// confirms deliveries we received. Either way the range is resolved
    /// against the matching window, and ids not in it are ignored.
    pub fn on_disposition(
        &mut self,
        out: &mut dyn FrameSink,
        disposition: Disposition,
    ) -> Result<(), SessionError> {
        let first = disposition.first;
        let last = disposition.last_or_first();
        if last < first {
            warn!(channel = %self.channel, first = %first, last = %last, "inverted disposition range, dropping");
            return Ok(());
        }
        match disposition.role {
            Role::Receiver => self.on_receiver_disposition(
                out,
                first,
                last,
                disposition.settled,
                disposition.state,
            ),
            Role::Sender => {
                self.on_sender_disposition(first, last, disposition.state);
                Ok(())
            }
        }
    }

    fn on_receiver_disposition(
        &mut self,
        out: &mut dyn FrameSink,
        first: DeliveryId,
        last: DeliveryId,
        settled: bool,
        state: Option<DeliveryState>,
    ) -> Result<(), SessionError> {
        // A disposition without a state reports the default outcome.
        let state = state.unwrap_or(DeliveryState::Accepted);
        let links = &mut self.links;
        let mut confirm = false;
        let _resolved = self.outgoing.on_disposition(first, last, |record| {
            confirm |= !settled && record.settle_mode() == SettleMode::ExactlyOnce;
            if let Some(sender) = links.get_mut(record.link()).and_then(Link::as_sender_mut) {
                sender.settle(Settlement::resolve(&record, state.clone()));
            }
        });
        trace!(
            channel = %self.channel,
            first = %first,
            last = %last,
            state = state.name(),
            resolved = _resolved,
            "disposition received"
        );

        if confirm {
            let disposition = Disposition {
                role: Role::Sender,
                first,
                last: (last != first).then_some(last),
                settled: true,
                state: Some(state),
            };
            out.queue(self.channel, &Performative::Disposition(disposition))?;
        }
        Ok(())
    }

    fn on_sender_disposition(
        &mut self,
        first: DeliveryId,
        last: DeliveryId,
        state: Option<DeliveryState>,
    ) {
        let links = &mut self.links;
        self.incoming.on_disposition(first, last, |record| {
            let Some(state) = &state else { return };
            let sink = links
                .get_mut(record.link())
                .and_then(Link::as_receiver_mut)
                .and_then(ReceiverLink::sink_mut);
            if let Some(sink) = sink {
                sink.settled(&Settlement::resolve(&record, state.clone()));
            }
        });
    }

    /// Handles a peer `detach`: acknowledges it unless we started the
    /// detach, then releases the link.
    pub fn on_detach(&mut self, out: &mut dyn FrameSink, detach: Detach) -> Result<(), SessionError> {
        let Some(&id) = self.by_incoming.get(&detach.handle) else {
            warn!(channel = %self.channel, handle = %detach.handle, "detach for unknown handle, dropping");
            return Ok(());
        };
        let Some(link) = self.links.get(id) else {
            return Ok(());
        };
        if let Some(_error) = &detach.error {
            info!(channel = %self.channel, name = link.core().name(), error = %_error, "peer detached with error");
        }

        if link.core().state() != LinkState::Detaching {
            if let Some(handle) = link.core().outgoing_handle() {
                let ack = Detach {
                    handle,
                    closed: detach.closed,
                    error: None,
                };
                out.queue(self.channel, &Performative::Detach(ack))?;
            }
        }
        self.release_link(id);
        Ok(())
    }

    /// Pumps sources on an idle tick.
    pub fn on_idle(&mut self, out: &mut dyn FrameSink) -> Result<(), SessionError> {
        self.pump_sources(out).map(drop)
    }

    /// Removes every link, releasing what they have in flight.
    pub fn release_all(&mut self) -> usize {
        let ids = self.links.ids();
        let released = ids.into_iter().filter(|id| self.release_link(*id).is_some()).count();
        self.outgoing.drain(drop);
        self.incoming.drain(drop);
        released
    }

    /// Resolves a link's unsettled deliveries as released, closes its
    /// endpoint and drops it from every map.
    fn release_link(&mut self, id: LinkId) -> Option<Link> {
        let links = &mut self.links;
        let _released = self.outgoing.release_link(id, |record| {
            if let Some(sender) = links.get_mut(id).and_then(Link::as_sender_mut) {
                sender.settle(Settlement::released(&record));
            }
        });
        self.incoming.release_link(id, |record| {
            let sink = links
                .get_mut(id)
                .and_then(Link::as_receiver_mut)
                .and_then(ReceiverLink::sink_mut);
            if let Some(sink) = sink {
                sink.settled(&Settlement::released(&record));
            }
        });

        let mut link = self.links.remove(id)?;
        link.close_endpoint();
        let core = link.core();
        if let Some(handle) = core.incoming_handle() {
            self.by_incoming.remove(&handle);
        }
        if let Some(handle) = core.outgoing_handle() {
            self.by_outgoing.remove(&handle);
        }
        self.by_name.remove(core.name());

        info!(
            channel = %self.channel,
            name = core.name(),
            released = _released,
            "link detached"
        );
        Some(link)
    }

    fn allocate_handle(&mut self) -> Result<Handle, SessionError> {
        let handle = u32::try_from(self.next_handle)
            .ok()
            .filter(|h| *h <= self.config.handle_max)
            .ok_or(SessionError::HandlesExhausted(self.config.handle_max))?;
        self.next_handle += 1;
        Ok(Handle(handle))
    }
}

/// Our `attach` for a link: the address goes on both termini, and a link
/// without one asks for a dynamic node.
fn attach_frame(core: &LinkCore, handle: Handle) -> Attach {
    let (snd_settle_mode, rcv_settle_mode) = core.settle_mode().attach_modes();
    let address = Some(core.address().to_owned()).filter(|a| !a.is_empty());
    let dynamic = address.is_none();
    let (source, target) = match core.role() {
        Role::Sender => (
            Source {
                address: address.clone(),
                dynamic: false,
            },
            Target { address, dynamic },
        ),
        Role::Receiver => (
            Source {
                address: address.clone(),
                dynamic,
            },
            Target {
                address,
                dynamic: false,
            },
        ),
    };
    Attach {
        name: core.name().to_owned(),
        handle,
        role: core.role(),
        snd_settle_mode,
        rcv_settle_mode,
        source: Some(source),
        target: Some(target),
        initial_delivery_count: (core.role() == Role::Sender).then_some(0),
    }
}

fn sender_mut(links: &mut LinkArena, id: LinkId) -> Result<&mut SenderLink, SessionError> {
    match links.get_mut(id) {
        Some(Link::Sender(sender)) => Ok(sender),
        Some(Link::Receiver(receiver)) => Err(SessionError::WrongRole {
            link: receiver.core().name().to_owned(),
            role: Role::Receiver,
        }),
        None => Err(SessionError::UnknownLink(id)),
    }
}

fn receiver_mut(links: &mut LinkArena, id: LinkId) -> Result<&mut ReceiverLink, SessionError> {
    match links.get_mut(id) {
        Some(Link::Receiver(receiver)) => Ok(receiver),
        Some(Link::Sender(sender)) => Err(SessionError::WrongRole {
            link: sender.core().name().to_owned(),
            role: Role::Sender,
        }),
        None => Err(SessionError::UnknownLink(id)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex;

    use super::*;
    use crate::factory::{InboundDelivery, OutboundMessage, QueueRegistry};
    use crate::protocol::{ReceiverSettleMode, SenderSettleMode};
    use crate::transport::testing::RecordingSink;

    /// Feeds every frame queued in `from` into `to`. Returns how many.
    fn deliver(from: &mut RecordingSink, to: &mut Session, out: &mut RecordingSink) -> usize {
        let frames: Vec<_> = from.frames.drain(..).collect();
        let n = frames.len();
        for (_, performative, payload) in frames {
            let result = match performative {
                Performative::Attach(a) => to.on_attach(out, a),
                Performative::Flow(f) => to.on_flow(out, f),
                Performative::Transfer(t) => to.on_transfer(out, t, &mut payload.as_slice()),
                Performative::Disposition(d) => to.on_disposition(out, d),
                Performative::Detach(d) => to.on_detach(out, d),
                other => panic!("unexpected {}", other.name()),
            };
            result.unwrap();
        }
        n
    }

    struct Pair {
        client: Session,
        server: Session,
        client_out: RecordingSink,
        server_out: RecordingSink,
    }

    impl Pair {
        fn new(registry: &QueueRegistry, config: SessionConfig) -> Self {
            let factory: Arc<dyn LinkFactory> = Arc::new(registry.clone());
            Self {
                client: Session::new(ChannelId(0), config, None),
                server: Session::new(ChannelId(0), config, Some(factory)),
                client_out: RecordingSink::default(),
                server_out: RecordingSink::default(),
            }
        }

        /// Passes frames both ways until neither side has anything to say.
        fn exchange(&mut self) {
            loop {
                let up = deliver(&mut self.client_out, &mut self.server, &mut self.server_out);
                let down = deliver(&mut self.server_out, &mut self.client, &mut self.client_out);
                if up + down == 0 {
                    break;
                }
            }
        }
    }

    #[derive(Clone, Default)]
    struct Recorder {
        queue: Arc<Mutex<VecDeque<OutboundMessage>>>,
        settled: Arc<Mutex<Vec<Settlement>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl Recorder {
        fn with_messages(n: u64) -> Self {
            let recorder = Self::default();
            recorder.queue.lock().unwrap().extend((0..n).map(|i| OutboundMessage {
                correlation_id: 100 + i,
                payload: vec![i as u8],
            }));
            recorder
        }
    }

    impl MessageSource for Recorder {
        fn next_message(&mut self) -> Option<OutboundMessage> {
            self.queue.lock().unwrap().pop_front()
        }

        fn settled(&mut self, settlement: &Settlement) {
            self.settled.lock().unwrap().push(settlement.clone());
        }

        fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    /// Peer answer to a local sender attach.
    fn receiver_reply(name: &str, handle: u32) -> Attach {
        Attach {
            name: name.into(),
            handle: Handle(handle),
            role: Role::Receiver,
            snd_settle_mode: SenderSettleMode::Unsettled,
            rcv_settle_mode: ReceiverSettleMode::Second,
            source: None,
            target: Some(Target {
                address: Some("q".into()),
                dynamic: false,
            }),
            initial_delivery_count: None,
        }
    }

    fn flow(handle: u32, delivery_count: Option<u64>, link_credit: u32, echo: bool) -> Flow {
        Flow {
            handle: Some(Handle(handle)),
            delivery_count,
            link_credit,
            echo,
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum SinkEvent {
        Received(DeliveryId),
        Settled(DeliveryId, DeliveryState),
        Closed,
    }

    #[derive(Clone, Default)]
    struct SinkLog(Arc<Mutex<Vec<SinkEvent>>>);

    impl SinkLog {
        fn events(&self) -> Vec<SinkEvent> {
            self.0.lock().unwrap().clone()
        }
    }

    impl MessageSink for SinkLog {
        fn receive(&mut self, delivery: &InboundDelivery<'_>, payload: &mut dyn Read) -> DeliveryState {
            io::copy(payload, &mut io::sink()).unwrap();
            self.0.lock().unwrap().push(SinkEvent::Received(delivery.delivery_id));
            DeliveryState::Accepted
        }

        fn settled(&mut self, settlement: &Settlement) {
            let event = SinkEvent::Settled(settlement.delivery_id, settlement.state.clone());
            self.0.lock().unwrap().push(event);
        }

        fn close(&mut self) {
            self.0.lock().unwrap().push(SinkEvent::Closed);
        }
    }

    /// Peer answer to a local receiver attach.
    fn sender_reply(name: &str, handle: u32) -> Attach {
        Attach {
            name: name.into(),
            handle: Handle(handle),
            role: Role::Sender,
            snd_settle_mode: SenderSettleMode::Unsettled,
            rcv_settle_mode: ReceiverSettleMode::First,
            source: Some(Source {
                address: Some("q".into()),
                dynamic: false,
            }),
            target: None,
            initial_delivery_count: Some(0),
        }
    }

    fn unsettled_transfer(handle: u32, delivery_id: u64) -> Transfer {
        Transfer {
            handle: Handle(handle),
            delivery_id: Some(DeliveryId(delivery_id)),
            delivery_tag: delivery_id.to_be_bytes().to_vec(),
            message_format: 0,
            settled: false,
        }
    }

    /// Local receiver with `sink`, attached to a peer sender on handle 3.
    fn attached_receiver(
        settle_mode: SettleMode,
        prefetch: u32,
        sink: SinkLog,
    ) -> (Session, RecordingSink, LinkId) {
        let config = SessionConfig {
            prefetch,
            ..SessionConfig::default()
        };
        let mut session = Session::new(ChannelId(0), config, None);
        let mut out = RecordingSink::default();
        let id = session
            .attach_receiver(&mut out, "r", "q", settle_mode, Some(Box::new(sink)))
            .unwrap();
        session.on_attach(&mut out, sender_reply("r", 3)).unwrap();
        out.frames.clear();
        (session, out, id)
    }

    #[test]
    fn sender_gets_credit_and_delivers_to_queue() {
        let registry = QueueRegistry::new();
        registry.declare("q");
        let mut pair = Pair::new(&registry, SessionConfig::default());

        let id = pair
            .client
            .attach_sender(&mut pair.client_out, "s", "q", SettleMode::AtLeastOnce, None)
            .unwrap();
        pair.exchange();

        let sender = pair.client.link(id).and_then(Link::as_sender).unwrap();
        assert!(sender.core().is_attached());
        assert_eq!(sender.credit().link_credit(), 64);

        let delivery_id = pair
            .client
            .transfer(&mut pair.client_out, id, 42, &mut &b"hello"[..])
            .unwrap();
        assert_eq!(delivery_id, DeliveryId(0));
        assert_eq!(pair.client.unsettled_outgoing(), 1);
        pair.exchange();

        assert_eq!(registry.queue_len("q"), Some(1));
        assert_eq!(pair.client.unsettled_outgoing(), 0);
        let settlements = pair.client.take_settlements(id).unwrap();
        assert_eq!(settlements.len(), 1);
        assert_eq!(settlements[0].correlation_id, 42);
        assert_eq!(settlements[0].state, DeliveryState::Accepted);
    }

    #[test]
    fn exactly_once_waits_for_sender_confirmation() {
        let registry = QueueRegistry::new();
        registry.declare("q");
        let mut pair = Pair::new(&registry, SessionConfig::default());
        let id = pair
            .client
            .attach_sender(&mut pair.client_out, "s", "q", SettleMode::ExactlyOnce, None)
            .unwrap();
        pair.exchange();

        pair.client
            .transfer(&mut pair.client_out, id, 1, &mut &b"x"[..])
            .unwrap();
        deliver(&mut pair.client_out, &mut pair.server, &mut pair.server_out);
        assert_eq!(pair.server.unsettled_incoming(), 1);

        pair.exchange();
        assert_eq!(pair.server.unsettled_incoming(), 0);
        assert_eq!(pair.client.unsettled_outgoing(), 0);
        assert_eq!(pair.client.take_settlements(id).unwrap().len(), 1);
    }

    #[test]
    fn refused_attach_records_nothing() {
        let registry = QueueRegistry::new();
        let mut pair = Pair::new(&registry, SessionConfig::default());
        pair.client
            .attach_receiver(&mut pair.client_out, "r", "missing", SettleMode::AtLeastOnce, None)
            .unwrap();
        deliver(&mut pair.client_out, &mut pair.server, &mut pair.server_out);

        let frames: Vec<_> = pair.server_out.frames.iter().map(|(_, p, _)| p.clone()).collect();
        assert_eq!(frames.len(), 2);
        let Performative::Attach(echo) = &frames[0] else {
            panic!("expected attach echo");
        };
        assert_eq!(echo.role, Role::Sender);
        assert!(echo.source.is_none() && echo.target.is_none());
        let Performative::Detach(detach) = &frames[1] else {
            panic!("expected detach");
        };
        assert!(detach.closed);
        assert_eq!(
            detach.error.as_ref().map(|e| e.condition.as_str()),
            Some(condition::NOT_FOUND)
        );
        assert_eq!(pair.server.link_count(), 0);

        // No credit is granted on a refused link; only the detach is answered.
        deliver(&mut pair.server_out, &mut pair.client, &mut pair.client_out);
        let answers: Vec<_> = pair.client_out.frames.iter().map(|(_, p, _)| p.name()).collect();
        assert_eq!(answers, vec!["detach"]);
        pair.exchange();
        assert_eq!(pair.client.link_count(), 0);
        assert_eq!(pair.server.link_count(), 0);
    }

    #[test]
    fn window_cap_refuses_before_allocating_an_id() {
        let registry = QueueRegistry::new();
        registry.declare("q");
        let config = SessionConfig {
            max_unsettled: Some(1),
            ..SessionConfig::default()
        };
        let mut pair = Pair::new(&registry, config);
        let id = pair
            .client
            .attach_sender(&mut pair.client_out, "s", "q", SettleMode::AtLeastOnce, None)
            .unwrap();

        let early = pair.client.transfer(&mut pair.client_out, id, 0, &mut &b""[..]);
        assert!(matches!(early, Err(SessionError::NotAttached(_))));
        pair.exchange();

        pair.client
            .transfer(&mut pair.client_out, id, 0, &mut &b"a"[..])
            .unwrap();
        let full = pair.client.transfer(&mut pair.client_out, id, 1, &mut &b"b"[..]);
        assert!(matches!(full, Err(SessionError::UnsettledWindowFull { limit: 1 })));
        assert_eq!(pair.client.begin_frame().next_outgoing_id, DeliveryId(1));

        pair.exchange();
        assert_eq!(
            pair.client.transfer(&mut pair.client_out, id, 1, &mut &b"b"[..]).unwrap(),
            DeliveryId(1)
        );
    }

    #[test]
    fn transfer_without_credit_is_refused() {
        let registry = QueueRegistry::new();
        registry.declare("q");
        let config = SessionConfig {
            prefetch: 0,
            ..SessionConfig::default()
        };
        let mut pair = Pair::new(&registry, config);
        let id = pair
            .client
            .attach_sender(&mut pair.client_out, "s", "q", SettleMode::AtLeastOnce, None)
            .unwrap();
        pair.exchange();

        let result = pair.client.transfer(&mut pair.client_out, id, 0, &mut &b"a"[..]);
        assert!(matches!(result, Err(SessionError::NoCredit(_))));
        assert_eq!(pair.client.begin_frame().next_outgoing_id, DeliveryId(0));
    }

    #[test]
    fn flow_charges_transfers_the_peer_has_not_seen() {
        let mut session = Session::new(ChannelId(0), SessionConfig::default(), None);
        let mut out = RecordingSink::default();
        let id = session
            .attach_sender(&mut out, "s", "q", SettleMode::AtLeastOnce, None)
            .unwrap();
        session.on_attach(&mut out, receiver_reply("s", 7)).unwrap();

        session.on_flow(&mut out, flow(7, None, 5, false)).unwrap();
        let credit = |s: &Session| s.link(id).and_then(Link::as_sender).unwrap().credit().link_credit();
        assert_eq!(credit(&session), 5);

        for n in 0..3 {
            session.transfer(&mut out, id, n, &mut &b"m"[..]).unwrap();
        }
        session.on_flow(&mut out, flow(7, Some(0), 5, false)).unwrap();
        assert_eq!(credit(&session), 2);

        out.frames.clear();
        session.on_flow(&mut out, flow(7, Some(3), 5, true)).unwrap();
        let frames = out.take();
        assert_eq!(
            frames,
            vec![Performative::Flow(Flow {
                handle: Some(Handle(0)),
                delivery_count: Some(3),
                link_credit: 5,
                echo: false,
            })]
        );
    }

    #[test]
    fn detach_releases_unsettled_deliveries() {
        let mut session = Session::new(ChannelId(0), SessionConfig::default(), None);
        let mut out = RecordingSink::default();
        let recorder = Recorder::with_messages(2);
        let id = session
            .attach_sender(
                &mut out,
                "s",
                "q",
                SettleMode::AtLeastOnce,
                Some(Box::new(recorder.clone())),
            )
            .unwrap();
        session.on_attach(&mut out, receiver_reply("s", 7)).unwrap();
        session.on_flow(&mut out, flow(7, None, 5, false)).unwrap();
        assert_eq!(session.unsettled_outgoing(), 2);

        session.detach(&mut out, id, None).unwrap();
        assert_eq!(session.unsettled_outgoing(), 2);
        assert!(recorder.settled.lock().unwrap().is_empty());

        out.frames.clear();
        let ack = Detach {
            handle: Handle(7),
            closed: true,
            error: None,
        };
        session.on_detach(&mut out, ack).unwrap();

        // We started the detach, so nothing is sent back.
        assert!(out.frames.is_empty());
        let settled = recorder.settled.lock().unwrap().clone();
        assert_eq!(settled.len(), 2);
        assert!(settled.iter().all(|s| s.state == DeliveryState::Released));
        assert_eq!(
            settled.iter().map(|s| s.correlation_id).collect::<Vec<_>>(),
            vec![100, 101]
        );
        assert!(*recorder.closed.lock().unwrap());
        assert_eq!(session.link_count(), 0);
        assert_eq!(session.unsettled_outgoing(), 0);
    }

    #[test]
    fn peer_detach_is_acknowledged_before_release() {
        let mut session = Session::new(ChannelId(0), SessionConfig::default(), None);
        let mut out = RecordingSink::default();
        session
            .attach_sender(&mut out, "s", "q", SettleMode::AtLeastOnce, None)
            .unwrap();
        session.on_attach(&mut out, receiver_reply("s", 7)).unwrap();
        out.frames.clear();

        let detach = Detach {
            handle: Handle(7),
            closed: true,
            error: None,
        };
        session.on_detach(&mut out, detach).unwrap();
        assert!(matches!(
            out.take().as_slice(),
            [Performative::Detach(Detach {
                handle: Handle(0),
                closed: true,
                ..
            })]
        ));
        assert_eq!(session.link_count(), 0);
        assert!(session.link_id("s").is_none());
    }

    #[test]
    fn frames_for_unknown_handles_are_dropped() {
        let mut session = Session::new(ChannelId(0), SessionConfig::default(), None);
        let mut out = RecordingSink::default();

        session.on_flow(&mut out, flow(9, None, 10, true)).unwrap();
        let transfer = Transfer {
            handle: Handle(9),
            delivery_id: Some(DeliveryId(0)),
            delivery_tag: vec![0],
            message_format: 0,
            settled: false,
        };
        session.on_transfer(&mut out, transfer, &mut &b"x"[..]).unwrap();
        let detach = Detach {
            handle: Handle(9),
            closed: true,
            error: None,
        };
        session.on_detach(&mut out, detach).unwrap();
        let disposition = Disposition {
            role: Role::Receiver,
            first: DeliveryId(3),
            last: Some(DeliveryId(8)),
            settled: true,
            state: Some(DeliveryState::Accepted),
        };
        session.on_disposition(&mut out, disposition).unwrap();

        assert!(out.frames.is_empty());
        assert_eq!(session.unsettled_incoming(), 0);
    }

    #[test]
    fn buffered_receiver_reannounces_credit_on_take() {
        let registry = QueueRegistry::new();
        registry.declare("q");
        for payload in [b"a", b"b", b"c"] {
            registry.publish("q", payload.to_vec());
        }
        let config = SessionConfig {
            prefetch: 4,
            ..SessionConfig::default()
        };
        let mut pair = Pair::new(&registry, config);
        let id = pair
            .client
            .attach_receiver(&mut pair.client_out, "r", "q", SettleMode::AtLeastOnce, None)
            .unwrap();
        pair.exchange();

        let receiver = pair.client.link(id).and_then(Link::as_receiver).unwrap();
        assert_eq!(receiver.backlog_len(), 3);
        assert_eq!(receiver.credit().backlog(), 3);
        assert_eq!(pair.client.unsettled_incoming(), 3);

        let message = pair.client.take(&mut pair.client_out, id).unwrap().unwrap();
        assert_eq!(message.payload, b"a");
        assert!(
            pair.client_out
                .frames
                .iter()
                .any(|(_, p, _)| matches!(p, Performative::Flow(_)))
        );

        pair.client
            .settle(&mut pair.client_out, message.delivery_id, DeliveryState::Accepted)
            .unwrap();
        pair.exchange();
        assert_eq!(pair.client.unsettled_incoming(), 2);
        assert_eq!(pair.server.unsettled_outgoing(), 2);
        assert!(matches!(
            pair.client.settle(&mut pair.client_out, message.delivery_id, DeliveryState::Accepted),
            Err(SessionError::UnknownDelivery(_))
        ));
    }

    #[test]
    fn receiver_teardown_releases_unsettled_incoming() {
        let log = SinkLog::default();
        let (mut session, mut out, _) =
            attached_receiver(SettleMode::ExactlyOnce, 8, log.clone());

        session.on_transfer(&mut out, unsettled_transfer(3, 0), &mut &b"x"[..]).unwrap();
        assert_eq!(session.unsettled_incoming(), 1);

        let detach = Detach {
            handle: Handle(3),
            closed: true,
            error: None,
        };
        session.on_detach(&mut out, detach).unwrap();
        assert_eq!(
            log.events(),
            vec![
                SinkEvent::Received(DeliveryId(0)),
                SinkEvent::Settled(DeliveryId(0), DeliveryState::Released),
                SinkEvent::Closed,
            ]
        );
        assert_eq!(session.unsettled_incoming(), 0);
        assert_eq!(session.link_count(), 0);
    }

    #[test]
    fn duplicate_delivery_is_dropped_and_credit_reannounced() {
        let log = SinkLog::default();
        let (mut session, mut out, id) =
            attached_receiver(SettleMode::AtLeastOnce, 1, log.clone());

        session.on_transfer(&mut out, unsettled_transfer(3, 0), &mut &b"x"[..]).unwrap();
        assert!(matches!(
            out.take().as_slice(),
            [Performative::Disposition(_), Performative::Flow(_)]
        ));

        session.on_transfer(&mut out, unsettled_transfer(3, 0), &mut &b"x"[..]).unwrap();
        assert_eq!(log.events(), vec![SinkEvent::Received(DeliveryId(0))]);
        let frames = out.take();
        assert!(matches!(frames.as_slice(), [Performative::Flow(Flow { link_credit: 1, .. })]));

        // The window is open again for the next real delivery.
        let receiver = session.link(id).and_then(Link::as_receiver).unwrap();
        assert!(receiver.credit().can_accept());
        session.on_transfer(&mut out, unsettled_transfer(3, 1), &mut &b"y"[..]).unwrap();
        assert_eq!(
            log.events(),
            vec![SinkEvent::Received(DeliveryId(0)), SinkEvent::Received(DeliveryId(1))]
        );
    }

    #[test]
    fn disposition_without_state_counts_as_accepted() {
        let mut session = Session::new(ChannelId(0), SessionConfig::default(), None);
        let mut out = RecordingSink::default();
        let id = session
            .attach_sender(&mut out, "s", "q", SettleMode::AtLeastOnce, None)
            .unwrap();
        session.on_attach(&mut out, receiver_reply("s", 7)).unwrap();
        session.on_flow(&mut out, flow(7, None, 5, false)).unwrap();
        session.transfer(&mut out, id, 9, &mut &b"m"[..]).unwrap();

        let disposition = Disposition {
            role: Role::Receiver,
            first: DeliveryId(0),
            last: None,
            settled: true,
            state: None,
        };
        session.on_disposition(&mut out, disposition).unwrap();
        let settlements = session.take_settlements(id).unwrap();
        assert_eq!(settlements.len(), 1);
        assert_eq!(settlements[0].correlation_id, 9);
        assert_eq!(settlements[0].state, DeliveryState::Accepted);
        assert_eq!(session.unsettled_outgoing(), 0);
    }

    #[test]
    fn prefetch_set_before_the_answer_shapes_the_first_grant() {
        let mut session = Session::new(ChannelId(0), SessionConfig::default(), None);
        let mut out = RecordingSink::default();
        let id = session
            .attach_receiver(&mut out, "r", "q", SettleMode::AtLeastOnce, None)
            .unwrap();
        session.set_prefetch(id, 5).unwrap();
        out.frames.clear();

        session.on_attach(&mut out, sender_reply("r", 3)).unwrap();
        assert!(matches!(
            out.take().as_slice(),
            [Performative::Flow(Flow { link_credit: 5, .. })]
        ));

        let sender = session
            .attach_sender(&mut out, "s", "q", SettleMode::AtLeastOnce, None)
            .unwrap();
        assert!(matches!(
            session.set_prefetch(sender, 5),
            Err(SessionError::WrongRole { .. })
        ));
    }
}
