//! Link endpoints and the per-session arena that owns them.
//!
//! A link has one fixed [`Role`]. Fields both roles share live in
//! [`LinkCore`]; the role-specific credit state lives in [`SenderLink`] or
//! [`ReceiverLink`], wrapped by the [`Link`] enum.
//!
//! Sessions own their links in a [`LinkArena`] and everything else (handle
//! maps, delivery records) refers to them by [`LinkId`]. Ids are
//! generational, so an id held across a detach never resolves to the link
//! that later reuses its slot.

pub mod receiver;
pub mod sender;

use std::fmt;

pub use receiver::{CreditGrant, ReceivedMessage, ReceiverCredit, ReceiverLink};
pub use sender::{SenderCredit, SenderLink};

use crate::protocol::{ChannelId, Handle, Role, SettleMode};

/// Index of a link in its session's [`LinkArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId {
    index: u32,
    generation: u32,
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Attach progress of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// We sent `attach` and wait for the peer's.
    Attaching,
    /// Both `attach` frames exchanged.
    Attached,
    /// We sent `detach` and wait for the peer's.
    Detaching,
}

/// Fields shared by both link roles.
#[derive(Debug)]
pub struct LinkCore {
    name: String,
    address: String,
    role: Role,
    /// Peer-assigned handle; `None` until the peer's attach is seen.
    incoming_handle: Option<Handle>,
    /// Our handle; assigned when our attach is sent.
    outgoing_handle: Option<Handle>,
    /// Owning session, by local channel. Fixed for the life of the link.
    session: ChannelId,
    settle_mode: SettleMode,
    state: LinkState,
}

impl LinkCore {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        role: Role,
        session: ChannelId,
        settle_mode: SettleMode,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            role,
            incoming_handle: None,
            outgoing_handle: None,
            session,
            settle_mode,
            state: LinkState::Attaching,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub const fn incoming_handle(&self) -> Option<Handle> {
        self.incoming_handle
    }

    #[must_use]
    pub const fn outgoing_handle(&self) -> Option<Handle> {
        self.outgoing_handle
    }

    #[must_use]
    pub const fn session(&self) -> ChannelId {
        self.session
    }

    #[must_use]
    pub const fn settle_mode(&self) -> SettleMode {
        self.settle_mode
    }

    #[must_use]
    pub const fn state(&self) -> LinkState {
        self.state
    }

    #[must_use]
    pub const fn is_attached(&self) -> bool {
        matches!(self.state, LinkState::Attached)
    }

    pub(crate) fn set_address(&mut self, address: impl Into<String>) {
        self.address = address.into();
    }

    pub(crate) const fn set_incoming_handle(&mut self, handle: Handle) {
        self.incoming_handle = Some(handle);
    }

    pub(crate) const fn set_outgoing_handle(&mut self, handle: Handle) {
        self.outgoing_handle = Some(handle);
    }

    pub(crate) const fn set_state(&mut self, state: LinkState) {
        self.state = state;
    }
}

/// A link endpoint of either role.
pub enum Link {
    Sender(SenderLink),
    Receiver(ReceiverLink),
}

impl Link {
    #[must_use]
    pub const fn core(&self) -> &LinkCore {
        match self {
            Self::Sender(s) => s.core(),
            Self::Receiver(r) => r.core(),
        }
    }

    pub(crate) const fn core_mut(&mut self) -> &mut LinkCore {
        match self {
            Self::Sender(s) => s.core_mut(),
            Self::Receiver(r) => r.core_mut(),
        }
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.core().role()
    }

    #[must_use]
    pub const fn as_sender(&self) -> Option<&SenderLink> {
        match self {
            Self::Sender(s) => Some(s),
            Self::Receiver(_) => None,
        }
    }

    pub const fn as_sender_mut(&mut self) -> Option<&mut SenderLink> {
        match self {
            Self::Sender(s) => Some(s),
            Self::Receiver(_) => None,
        }
    }

    #[must_use]
    pub const fn as_receiver(&self) -> Option<&ReceiverLink> {
        match self {
            Self::Receiver(r) => Some(r),
            Self::Sender(_) => None,
        }
    }

    pub const fn as_receiver_mut(&mut self) -> Option<&mut ReceiverLink> {
        match self {
            Self::Receiver(r) => Some(r),
            Self::Sender(_) => None,
        }
    }

    /// Tells the application endpoint the link is gone.
    pub(crate) fn close_endpoint(&mut self) {
        match self {
            Self::Sender(s) => s.close_source(),
            Self::Receiver(r) => r.close_sink(),
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sender(s) => f.debug_tuple("Sender").field(s.core()).finish(),
            Self::Receiver(r) => f.debug_tuple("Receiver").field(r.core()).finish(),
        }
    }
}

enum Slot {
    Occupied { generation: u32, link: Link },
    Free { next: Option<u32>, generation: u32 },
}

/// Growable generational arena of links.
#[derive(Default)]
pub struct LinkArena {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    len: usize,
}

impl LinkArena {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores a link, reusing a freed slot when one exists.
    pub fn insert(&mut self, link: Link) -> LinkId {
        self.len += 1;
        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            if let Slot::Free { next, generation } = *slot {
                self.free_head = next;
                *slot = Slot::Occupied { generation, link };
                return LinkId { index, generation };
            }
        }

        // Handles are u32 on the wire, so the slot count never outgrows u32.
        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied {
            generation: 0,
            link,
        });
        LinkId {
            index,
            generation: 0,
        }
    }

    /// Removes a link, invalidating `id`.
    pub fn remove(&mut self, id: LinkId) -> Option<Link> {
        let slot = self.slots.get_mut(id.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == id.generation => {}
            _ => return None,
        }
        let freed = std::mem::replace(
            slot,
            Slot::Free {
                next: self.free_head,
                generation: id.generation.wrapping_add(1),
            },
        );
        self.free_head = Some(id.index);
        self.len -= 1;
        match freed {
            Slot::Occupied { link, .. } => Some(link),
            Slot::Free { .. } => None,
        }
    }

    #[must_use]
    pub fn get(&self, id: LinkId) -> Option<&Link> {
        match self.slots.get(id.index as usize)? {
            Slot::Occupied { generation, link } if *generation == id.generation => Some(link),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: LinkId) -> Option<&mut Link> {
        match self.slots.get_mut(id.index as usize)? {
            Slot::Occupied { generation, link } if *generation == id.generation => Some(link),
            _ => None,
        }
    }

    /// Ids of every live link, in slot order.
    #[must_use]
    pub fn ids(&self) -> Vec<LinkId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, .. } => Some(LinkId {
                    index: index as u32,
                    generation: *generation,
                }),
                Slot::Free { .. } => None,
            })
            .collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (LinkId, &mut Link)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, link } => Some((
                    LinkId {
                        index: index as u32,
                        generation: *generation,
                    },
                    link,
                )),
                Slot::Free { .. } => None,
            })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sender_link(name: &str) -> Link {
        Link::Sender(SenderLink::new(
            LinkCore::new(
                name,
                "queue",
                Role::Sender,
                ChannelId(0),
                SettleMode::AtLeastOnce,
            ),
            0,
            None,
        ))
    }

    pub(crate) fn receiver_link(name: &str, prefetch: u32) -> Link {
        Link::Receiver(ReceiverLink::new(
            LinkCore::new(
                name,
                "queue",
                Role::Receiver,
                ChannelId(0),
                SettleMode::AtLeastOnce,
            ),
            prefetch,
            None,
        ))
    }

    #[test]
    fn removed_id_goes_stale_when_slot_is_reused() {
        let mut arena = LinkArena::new();
        let a = arena.insert(sender_link("a"));
        assert_eq!(arena.remove(a).map(|l| l.core().name().to_owned()), Some("a".into()));
        assert!(arena.get(a).is_none());
        assert!(arena.remove(a).is_none());

        let b = arena.insert(sender_link("b"));
        assert_ne!(a, b);
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(b).map(|l| l.core().name()), Some("b"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn arena_grows_past_initial_slots() {
        let mut arena = LinkArena::new();
        let ids: Vec<_> = (0..100)
            .map(|i| arena.insert(receiver_link(&format!("r{i}"), 8)))
            .collect();
        assert_eq!(arena.len(), 100);
        assert_eq!(arena.ids(), ids);
        for id in &ids[..50] {
            arena.remove(*id);
        }
        assert_eq!(arena.iter_mut().count(), 50);
    }

    #[test]
    fn role_checked_accessors() {
        let mut link = receiver_link("r", 8);
        assert_eq!(link.role(), Role::Receiver);
        assert!(link.as_sender().is_none());
        assert!(link.as_sender_mut().is_none());
        assert!(link.as_receiver().is_some());

        let core = link.core_mut();
        core.set_incoming_handle(Handle(4));
        core.set_state(LinkState::Attached);
        assert_eq!(link.core().incoming_handle(), Some(Handle(4)));
        assert!(link.core().is_attached());
        assert_eq!(link.core().session(), ChannelId(0));
    }
}
