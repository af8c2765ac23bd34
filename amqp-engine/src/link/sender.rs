//! Sending side of a link.

use std::collections::VecDeque;

use super::LinkCore;
use crate::delivery::Settlement;
use crate::factory::MessageSource;

/// Credit a sender holds, as granted by the receiver's `flow` frames.
///
/// Invariant: transfers are only sent while `delivery_count < delivery_limit`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderCredit {
    delivery_count: u64,
    delivery_limit: u64,
    /// Credit in the last `flow`, before adjusting for transfers in flight.
    peer_link_credit: u32,
}

impl SenderCredit {
    /// No credit until the receiver's first `flow`.
    #[must_use]
    pub const fn new(initial_delivery_count: u64) -> Self {
        Self {
            delivery_count: initial_delivery_count,
            delivery_limit: initial_delivery_count,
            peer_link_credit: 0,
        }
    }

    /// Applies a `flow` from the receiver.
    ///
    /// `peer_delivery_count` is the receiver's view of our delivery-count.
    /// Transfers sent after that snapshot are charged against the new credit.
    /// When the receiver does not know the count yet, our own count is the
    /// baseline.
    pub fn on_flow(&mut self, peer_delivery_count: Option<u64>, link_credit: u32) {
        self.peer_link_credit = link_credit;
        let credit = match peer_delivery_count {
            None => u64::from(link_credit),
            Some(peer_count) => {
                let in_flight = self.delivery_count.saturating_sub(peer_count);
                u64::from(link_credit).saturating_sub(in_flight)
            }
        };
        self.delivery_limit = self.delivery_count.saturating_add(credit);
    }

    /// Transfers that may be sent right now. Never negative.
    #[inline]
    #[must_use]
    pub const fn link_credit(&self) -> u64 {
        self.delivery_limit.saturating_sub(self.delivery_count)
    }

    #[inline]
    #[must_use]
    pub const fn has_credit(&self) -> bool {
        self.link_credit() > 0
    }

    /// Spends one credit. Returns `false`, leaving the count alone, when
    /// there is none.
    pub fn on_send(&mut self) -> bool {
        if !self.has_credit() {
            return false;
        }
        self.delivery_count += 1;
        true
    }

    #[must_use]
    pub const fn delivery_count(&self) -> u64 {
        self.delivery_count
    }

    #[must_use]
    pub const fn delivery_limit(&self) -> u64 {
        self.delivery_limit
    }

    #[must_use]
    pub const fn peer_link_credit(&self) -> u32 {
        self.peer_link_credit
    }
}

/// A link that sends transfers.
///
/// Messages come either from an attached [`MessageSource`], which the session
/// pumps whenever there is credit, or from direct calls to
/// [`Session::transfer`](crate::session::Session::transfer). Settlements go
/// back to the source, or queue on the link when there is none.
pub struct SenderLink {
    core: LinkCore,
    credit: SenderCredit,
    source: Option<Box<dyn MessageSource>>,
    settlements: VecDeque<Settlement>,
    next_tag: u64,
}

impl SenderLink {
    #[must_use]
    pub fn new(
        core: LinkCore,
        initial_delivery_count: u64,
        source: Option<Box<dyn MessageSource>>,
    ) -> Self {
        Self {
            core,
            credit: SenderCredit::new(initial_delivery_count),
            source,
            settlements: VecDeque::new(),
            next_tag: 0,
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
    pub const fn credit(&self) -> &SenderCredit {
        &self.credit
    }

    pub(crate) const fn credit_mut(&mut self) -> &mut SenderCredit {
        &mut self.credit
    }

    #[must_use]
    pub const fn has_source(&self) -> bool {
        self.source.is_some()
    }

    pub(crate) fn source_mut(&mut self) -> Option<&mut (dyn MessageSource + 'static)> {
        self.source.as_deref_mut()
    }

    /// Tag for the next transfer, unique on this link.
    pub(crate) fn next_delivery_tag(&mut self) -> Vec<u8> {
        let tag = self.next_tag;
        self.next_tag += 1;
        tag.to_be_bytes().to_vec()
    }

    /// Hands a settlement to the source, or queues it for
    /// [`take_settlements`](Self::take_settlements).
    pub(crate) fn settle(&mut self, settlement: Settlement) {
        match self.source.as_deref_mut() {
            Some(source) => source.settled(&settlement),
            None => self.settlements.push_back(settlement),
        }
    }

    /// Drains settlements queued since the last call.
    pub fn take_settlements(&mut self) -> Vec<Settlement> {
        self.settlements.drain(..).collect()
    }

    pub(crate) fn close_source(&mut self) {
        if let Some(source) = self.source.as_deref_mut() {
            source.close();
        }
    }
}
