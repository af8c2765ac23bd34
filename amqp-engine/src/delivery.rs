//! In-flight delivery tracking.
//!
//! Every unsettled transfer a session sends or receives is held as a
//! [`DeliveryRecord`] in an [`UnsettledWindow`] until a disposition covering
//! its id settles it, or until its link goes away.
//!
//! # Window Layout
//!
//! ```text
//!   head                                   tail
//!    │                                       │
//!    ▼                                       ▼
//!  ┌────┬────┬────┬────┬────┬────┬────┬────┐
//!  │ 4  │ -- │ 6  │ 7  │ -- │ -- │ 10 │ 11 │   ids ascend left to right
//!  └────┴────┴────┴────┴────┴────┴────┴────┘
//!         ▲                 ▲
//!         settled slots are cleared in place
//! ```
//!
//! Records are appended at the tail in ascending id order. A disposition for
//! `[first, last]` scans from the head, clears matching slots, and stops at
//! the first id past `last`. Cleared slots at the head are popped, so the ring
//! only grows with the number of deliveries that are actually outstanding.
//! Pre-settled deliveries consume an id but never enter the window.

use std::collections::VecDeque;

use thiserror::Error;

use crate::link::LinkId;
use crate::protocol::{DeliveryId, DeliveryState, SettleMode};

/// One in-flight transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    delivery_id: DeliveryId,
    link: LinkId,
    correlation_id: u64,
    settle_mode: SettleMode,
}

impl DeliveryRecord {
    #[must_use]
    pub const fn new(
        delivery_id: DeliveryId,
        link: LinkId,
        correlation_id: u64,
        settle_mode: SettleMode,
    ) -> Self {
        Self {
            delivery_id,
            link,
            correlation_id,
            settle_mode,
        }
    }

    #[inline]
    #[must_use]
    pub const fn delivery_id(&self) -> DeliveryId {
        self.delivery_id
    }

    /// Link the delivery travelled on.
    #[inline]
    #[must_use]
    pub const fn link(&self) -> LinkId {
        self.link
    }

    /// Application-supplied id used to map back to the message.
    #[inline]
    #[must_use]
    pub const fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    #[inline]
    #[must_use]
    pub const fn settle_mode(&self) -> SettleMode {
        self.settle_mode
    }
}

/// Terminal outcome of a delivery, as handed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub delivery_id: DeliveryId,
    pub correlation_id: u64,
    /// Transaction the outcome was reported under, passed through as-is.
    pub txn_id: Option<Vec<u8>>,
    /// Never [`DeliveryState::Transactional`]; the id is split off into `txn_id`.
    pub state: DeliveryState,
}

impl Settlement {
    /// Resolves `record` with `state`.
    #[must_use]
    pub fn resolve(record: &DeliveryRecord, state: DeliveryState) -> Self {
        let (txn_id, state) = state.into_outcome();
        Self {
            delivery_id: record.delivery_id,
            correlation_id: record.correlation_id,
            txn_id,
            state,
        }
    }

    /// Outcome for a delivery whose link or session was torn down.
    #[must_use]
    pub fn released(record: &DeliveryRecord) -> Self {
        Self::resolve(record, DeliveryState::Released)
    }
}

/// Errors adding to an [`UnsettledWindow`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    /// The configured cap on outstanding deliveries is reached.
    #[error("unsettled window full ({limit} deliveries)")]
    Full { limit: usize },
    /// An incoming delivery id did not ascend.
    #[error("delivery {id} is not after the window tail {tail}")]
    OutOfOrder { id: DeliveryId, tail: DeliveryId },
}

/// Ordered ring of unsettled deliveries for one session direction.
#[derive(Debug)]
pub struct UnsettledWindow {
    entries: VecDeque<Option<DeliveryRecord>>,
    /// Occupied slots in `entries`.
    pending: usize,
    next_id: DeliveryId,
    /// Highest id accepted by [`insert`](UnsettledWindow::insert), settled or not.
    highest_inserted: Option<DeliveryId>,
    limit: Option<usize>,
}

impl Default for UnsettledWindow {
    fn default() -> Self {
        Self::new(None)
    }
}

impl UnsettledWindow {
    /// Creates an empty window. `limit` caps outstanding records; `None`
    /// lets the window grow with demand.
    #[must_use]
    pub const fn new(limit: Option<usize>) -> Self {
        Self {
            entries: VecDeque::new(),
            pending: 0,
            next_id: DeliveryId::ZERO,
            highest_inserted: None,
            limit,
        }
    }

    /// Number of unsettled records.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.pending
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pending == 0
    }

    /// Id the next [`add_delivery`](Self::add_delivery) will hand out.
    #[must_use]
    pub const fn next_id(&self) -> DeliveryId {
        self.next_id
    }

    /// Whether a delivery under `settle_mode` can be added right now.
    #[must_use]
    pub fn has_room(&self, settle_mode: SettleMode) -> bool {
        settle_mode.is_presettled() || self.limit.is_none_or(|limit| self.pending < limit)
    }

    /// Allocates the next delivery id and records the delivery unless it is
    /// pre-settled.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError::Full`] if the window is at its limit. No id is
    /// consumed in that case.
    pub fn add_delivery(
        &mut self,
        link: LinkId,
        correlation_id: u64,
        settle_mode: SettleMode,
    ) -> Result<DeliveryId, WindowError> {
        if !self.has_room(settle_mode) {
            return Err(WindowError::Full {
                limit: self.limit.unwrap_or(self.pending),
            });
        }

        let delivery_id = self.next_id;
        self.next_id = delivery_id.next();
        if !settle_mode.is_presettled() {
            self.push(DeliveryRecord::new(
                delivery_id,
                link,
                correlation_id,
                settle_mode,
            ));
        }
        Ok(delivery_id)
    }

    /// Records a delivery whose id was assigned by the peer.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError::OutOfOrder`] if the id is not above every id
    /// inserted before, including ones already settled.
    pub fn insert(&mut self, record: DeliveryRecord) -> Result<(), WindowError> {
        if let Some(tail) = self.highest_inserted {
            if record.delivery_id <= tail {
                return Err(WindowError::OutOfOrder {
                    id: record.delivery_id,
                    tail,
                });
            }
        }
        self.highest_inserted = Some(record.delivery_id);
        self.next_id = record.delivery_id.next();
        self.push(record);
        Ok(())
    }

    /// Looks up an unsettled record.
    #[must_use]
    pub fn get(&self, delivery_id: DeliveryId) -> Option<&DeliveryRecord> {
        self.entries
            .iter()
            .flatten()
            .take_while(|r| r.delivery_id <= delivery_id)
            .find(|r| r.delivery_id == delivery_id)
    }

    /// Resolves every record with an id in `[first, last]`, in id order.
    ///
    /// Ids already resolved, or never recorded, are skipped, so a repeated
    /// disposition resolves nothing. Returns the number of records resolved.
    pub fn on_disposition<F>(&mut self, first: DeliveryId, last: DeliveryId, mut resolve: F) -> usize
    where
        F: FnMut(DeliveryRecord),
    {
        let mut resolved = 0;
        for slot in &mut self.entries {
            let Some(id) = slot.as_ref().map(DeliveryRecord::delivery_id) else {
                continue;
            };
            if id > last {
                break;
            }
            if id < first {
                continue;
            }
            if let Some(record) = slot.take() {
                resolved += 1;
                resolve(record);
            }
        }
        self.pending -= resolved;
        self.compact();
        resolved
    }

    /// Removes a single record.
    pub fn remove(&mut self, delivery_id: DeliveryId) -> Option<DeliveryRecord> {
        let mut removed = None;
        self.on_disposition(delivery_id, delivery_id, |r| removed = Some(r));
        removed
    }

    /// Removes every record belonging to `link`, in id order.
    pub fn release_link<F>(&mut self, link: LinkId, mut release: F) -> usize
    where
        F: FnMut(DeliveryRecord),
    {
        let mut released = 0;
        for slot in &mut self.entries {
            if !slot.as_ref().is_some_and(|r| r.link == link) {
                continue;
            }
            if let Some(record) = slot.take() {
                released += 1;
                release(record);
            }
        }
        self.pending -= released;
        self.compact();
        released
    }

    /// Removes every record, in id order.
    pub fn drain<F>(&mut self, mut release: F) -> usize
    where
        F: FnMut(DeliveryRecord),
    {
        let drained = self.pending;
        for record in self.entries.drain(..).flatten() {
            release(record);
        }
        self.pending = 0;
        drained
    }

    fn push(&mut self, record: DeliveryRecord) {
        self.entries.push_back(Some(record));
        self.pending += 1;
    }

    /// Pops cleared slots off the head.
    fn compact(&mut self) {
        while matches!(self.entries.front(), Some(None)) {
            self.entries.pop_front();
        }
        if self.pending == 0 {
            self.entries.clear();
        }
    }
}
