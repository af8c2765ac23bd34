//! Identifiers and enums shared by frames, links and sessions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Link handle, scoped to one session.
///
/// Each peer assigns its own handles; a link therefore has an outgoing handle
/// (ours) and an incoming handle (the peer's), which need not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(pub u32);

impl From<u32> for Handle {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<Handle> for u32 {
    fn from(h: Handle) -> Self {
        h.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel number a session occupies on one side of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u16);

impl From<u16> for ChannelId {
    fn from(v: u16) -> Self {
        Self(v)
    }
}

impl From<ChannelId> for u16 {
    fn from(c: ChannelId) -> Self {
        c.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery identifier assigned by the sending session.
///
/// Monotonically increasing per session direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryId(pub u64);

impl DeliveryId {
    /// First id handed out by a fresh session.
    pub const ZERO: Self = Self(0);

    /// The id following this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for DeliveryId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl From<DeliveryId> for u64 {
    fn from(d: DeliveryId) -> Self {
        d.0
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of a link endpoint. Fixed when the link is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    /// The role the other end of a link must have.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Sender => Self::Receiver,
            Self::Receiver => Self::Sender,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sender => f.write_str("sender"),
            Self::Receiver => f.write_str("receiver"),
        }
    }
}

/// Settlement behaviour a sender declares on attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SenderSettleMode {
    /// Every transfer is sent unsettled.
    Unsettled,
    /// Every transfer is sent pre-settled.
    Settled,
    /// The sender decides per transfer.
    #[default]
    Mixed,
}

/// Settlement behaviour a receiver declares on attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReceiverSettleMode {
    #[default]
    First,
    Second,
}

/// Settlement policy of a link, derived from the attach settle modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettleMode {
    /// Fire and forget. Transfers are pre-settled and never tracked.
    Always,
    /// Receiver settles with a single disposition.
    AtLeastOnce,
    /// Receiver reports an outcome, then the sender settles it.
    ExactlyOnce,
}

impl SettleMode {
    /// Derives the policy from a peer's declared settle modes.
    ///
    /// A settled or mixed sender maps to [`SettleMode::Always`]; otherwise a
    /// `first` receiver maps to [`SettleMode::ExactlyOnce`] and anything else
    /// to [`SettleMode::AtLeastOnce`].
    #[must_use]
    pub const fn from_peer(snd: SenderSettleMode, rcv: ReceiverSettleMode) -> Self {
        match (snd, rcv) {
            (SenderSettleMode::Settled | SenderSettleMode::Mixed, _) => Self::Always,
            (SenderSettleMode::Unsettled, ReceiverSettleMode::First) => Self::ExactlyOnce,
            (SenderSettleMode::Unsettled, ReceiverSettleMode::Second) => Self::AtLeastOnce,
        }
    }

    /// Settle modes to announce so that the peer derives this same policy.
    #[must_use]
    pub const fn attach_modes(self) -> (SenderSettleMode, ReceiverSettleMode) {
        match self {
            Self::Always => (SenderSettleMode::Settled, ReceiverSettleMode::First),
            Self::AtLeastOnce => (SenderSettleMode::Unsettled, ReceiverSettleMode::Second),
            Self::ExactlyOnce => (SenderSettleMode::Unsettled, ReceiverSettleMode::First),
        }
    }

    #[must_use]
    pub const fn is_presettled(self) -> bool {
        matches!(self, Self::Always)
    }
}

/// Well-known error conditions.
pub mod condition {
    pub const INTERNAL_ERROR: &str = "amqp:internal-error";
    pub const NOT_FOUND: &str = "amqp:not-found";
    pub const REJECTED: &str = "amqp:rejected";
    pub const DETACH_FORCED: &str = "amqp:link:detach-forced";
    pub const CONNECTION_FORCED: &str = "amqp:connection:forced";
}

/// Error carried by `detach`, `end`, `close` and the rejected outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmqpError {
    pub condition: String,
    pub description: Option<String>,
}

impl AmqpError {
    #[must_use]
    pub fn new(condition: &str, description: impl Into<String>) -> Self {
        Self {
            condition: condition.to_owned(),
            description: Some(description.into()),
        }
    }

    #[must_use]
    pub fn not_found(description: impl Into<String>) -> Self {
        Self::new(condition::NOT_FOUND, description)
    }

    #[must_use]
    pub fn rejected(description: impl Into<String>) -> Self {
        Self::new(condition::REJECTED, description)
    }
}

impl fmt::Display for AmqpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(d) => write!(f, "{}: {d}", self.condition),
            None => f.write_str(&self.condition),
        }
    }
}

/// State of a delivery as reported in a disposition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    Accepted,
    Rejected {
        error: Option<AmqpError>,
    },
    Released,
    Modified {
        delivery_failed: bool,
        undeliverable_here: bool,
    },
    /// Outcome scoped to a transaction. The id is passed through untouched.
    Transactional {
        txn_id: Vec<u8>,
        outcome: Option<Box<DeliveryState>>,
    },
}

impl DeliveryState {
    /// Splits off any transaction id, returning it with the terminal outcome.
    ///
    /// A transactional state without an outcome resolves as
    /// [`DeliveryState::Released`]. Nested transactional states keep the
    /// innermost id.
    #[must_use]
    pub fn into_outcome(self) -> (Option<Vec<u8>>, Self) {
        match self {
            Self::Transactional { txn_id, outcome } => match outcome {
                Some(inner) => {
                    let (inner_txn, state) = inner.into_outcome();
                    (Some(inner_txn.unwrap_or(txn_id)), state)
                }
                None => (Some(txn_id), Self::Released),
            },
            other => (None, other),
        }
    }

    /// Short lowercase name, used in log fields.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected { .. } => "rejected",
            Self::Released => "released",
            Self::Modified { .. } => "modified",
            Self::Transactional { .. } => "transactional",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settled_or_mixed_sender_is_always() {
        for rcv in [ReceiverSettleMode::First, ReceiverSettleMode::Second] {
            assert_eq!(
                SettleMode::from_peer(SenderSettleMode::Settled, rcv),
                SettleMode::Always
            );
            assert_eq!(
                SettleMode::from_peer(SenderSettleMode::Mixed, rcv),
                SettleMode::Always
            );
        }
    }

    #[test]
    fn unsettled_sender_depends_on_receiver_mode() {
        assert_eq!(
            SettleMode::from_peer(SenderSettleMode::Unsettled, ReceiverSettleMode::First),
            SettleMode::ExactlyOnce
        );
        assert_eq!(
            SettleMode::from_peer(SenderSettleMode::Unsettled, ReceiverSettleMode::Second),
            SettleMode::AtLeastOnce
        );
    }

    #[test]
    fn attach_modes_derive_back_to_same_policy() {
        for mode in [
            SettleMode::Always,
            SettleMode::AtLeastOnce,
            SettleMode::ExactlyOnce,
        ] {
            let (snd, rcv) = mode.attach_modes();
            assert_eq!(SettleMode::from_peer(snd, rcv), mode);
        }
    }

    #[test]
    fn transactional_state_passes_txn_through() {
        let state = DeliveryState::Transactional {
            txn_id: vec![7, 7],
            outcome: Some(Box::new(DeliveryState::Accepted)),
        };
        assert_eq!(
            state.into_outcome(),
            (Some(vec![7, 7]), DeliveryState::Accepted)
        );

        let bare = DeliveryState::Transactional {
            txn_id: vec![1],
            outcome: None,
        };
        assert_eq!(bare.into_outcome(), (Some(vec![1]), DeliveryState::Released));

        assert_eq!(
            DeliveryState::Released.into_outcome(),
            (None, DeliveryState::Released)
        );
    }

    #[test]
    fn delivery_id_next_wraps() {
        assert_eq!(DeliveryId(u64::MAX).next(), DeliveryId::ZERO);
        assert_eq!(DeliveryId(41).next(), DeliveryId(42));
    }
}
