//! Receiving side of a link and its prefetch window.

use std::collections::VecDeque;
use std::io::{self, Read};

use super::LinkCore;
use crate::factory::{InboundDelivery, MessageSink};
use crate::protocol::{DeliveryId, DeliveryState};

/// Takes between forced credit re-announcements.
const TAKE_BATCH: u64 = 64;

/// Below this prefetch every take re-announces credit.
const SMALL_PREFETCH: u32 = 8;

/// Values for an outgoing `flow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditGrant {
    /// Our estimate of the sender's delivery-count.
    pub delivery_count: u64,
    pub link_credit: u32,
}

/// Receiver-side credit window.
///
/// ```text
///   take_count      transfer_count         delivery_limit
///       │                 │                      │
///   ────┼─────────────────┼──────────────────────┼────▶ transfers
///       │◀── backlog ────▶│◀── remaining ───────▶│
/// ```
///
/// Invariant: `backlog() <= prefetch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverCredit {
    prefetch: u32,
    transfer_count: u64,
    /// `transfer_count` at the last grant.
    transfer_count_snapshot: u64,
    peer_delivery_count: u64,
    delivery_limit: u64,
    take_count: u64,
}

impl ReceiverCredit {
    /// Starts with no credit granted. `initial_delivery_count` is the
    /// sender's count from its `attach`.
    #[must_use]
    pub const fn new(prefetch: u32, initial_delivery_count: u64) -> Self {
        Self {
            prefetch,
            transfer_count: 0,
            transfer_count_snapshot: 0,
            peer_delivery_count: initial_delivery_count,
            delivery_limit: 0,
            take_count: 0,
        }
    }

    /// Rebases on the sender's count once its `attach` arrives.
    pub const fn set_initial_delivery_count(&mut self, delivery_count: u64) {
        self.peer_delivery_count = delivery_count;
        self.transfer_count_snapshot = self.transfer_count;
    }

    pub const fn set_prefetch(&mut self, prefetch: u32) {
        self.prefetch = prefetch;
    }

    #[must_use]
    pub const fn prefetch(&self) -> u32 {
        self.prefetch
    }

    #[must_use]
    pub const fn transfer_count(&self) -> u64 {
        self.transfer_count
    }

    #[must_use]
    pub const fn take_count(&self) -> u64 {
        self.take_count
    }

    #[must_use]
    pub const fn delivery_limit(&self) -> u64 {
        self.delivery_limit
    }

    #[must_use]
    pub const fn peer_delivery_count(&self) -> u64 {
        self.peer_delivery_count
    }

    /// Transfers received but not yet taken.
    #[must_use]
    pub const fn backlog(&self) -> u64 {
        self.transfer_count - self.take_count
    }

    /// Transfers the sender may still send under the last grant.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.delivery_limit.saturating_sub(self.transfer_count)
    }

    /// Whether one more transfer fits both the grant and the prefetch window.
    #[must_use]
    pub const fn can_accept(&self) -> bool {
        self.transfer_count < self.delivery_limit && self.backlog() < self.prefetch as u64
    }

    /// Counts a transfer that arrived on the link.
    pub const fn on_transfer(&mut self) {
        self.transfer_count += 1;
    }

    /// Counts a transfer handed to the application. Returns whether credit
    /// should be re-announced now.
    ///
    /// Re-announcing on every take would cost one `flow` per message, so it
    /// happens every [`TAKE_BATCH`] takes, when less than half the window is
    /// left, or always for very small windows.
    pub const fn on_take(&mut self) -> bool {
        if self.take_count < self.transfer_count {
            self.take_count += 1;
        }
        self.take_count % TAKE_BATCH == 0
            || self.remaining() < (self.prefetch / 2) as u64
            || self.prefetch < SMALL_PREFETCH
    }

    /// Computes a new grant: the window is reopened to `prefetch` past what
    /// has arrived, minus what is still buffered locally.
    pub fn grant(&mut self) -> CreditGrant {
        let received = self.transfer_count - self.transfer_count_snapshot;
        self.peer_delivery_count = self.peer_delivery_count.wrapping_add(received);
        self.transfer_count_snapshot = self.transfer_count;
        self.delivery_limit = self.transfer_count + u64::from(self.prefetch);

        let link_credit = u64::from(self.prefetch).saturating_sub(self.backlog());
        CreditGrant {
            delivery_count: self.peer_delivery_count,
            link_credit: u32::try_from(link_credit).unwrap_or(u32::MAX),
        }
    }
}

/// A transfer waiting in a receiver's backlog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub delivery_id: DeliveryId,
    pub delivery_tag: Vec<u8>,
    /// Pre-settled by the sender; no outcome is expected.
    pub settled: bool,
    pub payload: Vec<u8>,
}

/// A link that receives transfers.
///
/// With a [`MessageSink`] attached each transfer is streamed straight into
/// the sink and taken at once. Without one, transfers are buffered and
/// handed out by [`Session::take`](crate::session::Session::take).
pub struct ReceiverLink {
    core: LinkCore,
    credit: ReceiverCredit,
    sink: Option<Box<dyn MessageSink>>,
    backlog: VecDeque<ReceivedMessage>,
}

impl ReceiverLink {
    #[must_use]
    pub fn new(core: LinkCore, prefetch: u32, sink: Option<Box<dyn MessageSink>>) -> Self {
        Self {
            core,
            credit: ReceiverCredit::new(prefetch, 0),
            sink,
            backlog: VecDeque::new(),
        }
    }

    #[must_use]
    pub const fn core(&self) -> &LinkCore {
        &self.core
    }

    pub(crate) const fn core_mut(&mut self) -> &mut LinkCore {
        &mut self.core
    }

    #[must_use]
    pub const fn credit(&self) -> &ReceiverCredit {
        &self.credit
    }

    pub(crate) const fn credit_mut(&mut self) -> &mut ReceiverCredit {
        &mut self.credit
    }

    pub(crate) fn sink_mut(&mut self) -> Option<&mut (dyn MessageSink + 'static)> {
        self.sink.as_deref_mut()
    }

    /// Streams a transfer into the sink, or buffers it when there is none.
    ///
    /// Returns the sink's outcome, or `None` if the message was buffered.
    pub(crate) fn deliver(
        &mut self,
        delivery_id: DeliveryId,
        delivery_tag: Vec<u8>,
        settled: bool,
        payload: &mut dyn Read,
    ) -> io::Result<Option<DeliveryState>> {
        if let Some(sink) = self.sink.as_deref_mut() {
            let delivery = InboundDelivery {
                link_name: &self.core.name,
                address: &self.core.address,
                delivery_id,
                delivery_tag: &delivery_tag,
                settled,
            };
            return Ok(Some(sink.receive(&delivery, payload)));
        }

        let mut bytes = Vec::new();
        payload.read_to_end(&mut bytes)?;
        self.backlog.push_back(ReceivedMessage {
            delivery_id,
            delivery_tag,
            settled,
            payload: bytes,
        });
        Ok(None)
    }

    /// Messages buffered for the application.
    #[must_use]
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub(crate) fn pop_backlog(&mut self) -> Option<ReceivedMessage> {
        self.backlog.pop_front()
    }

    pub(crate) fn close_sink(&mut self) {
        if let Some(sink) = self.sink.as_deref_mut() {
            sink.close();
        }
    }
}
