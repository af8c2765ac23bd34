//! AMQP 1.0 framing: protocol header, frame envelope and performatives.
//!
//! # Connection Flow
//!
//! ```text
//! Client                                  Server
//!    │  AMQP 0 1 0 0                         │
//!    │──────────────────────────────────────>│
//!    │  AMQP 0 1 0 0                         │
//!    │<──────────────────────────────────────│
//!    │  open / begin(ch 0)                   │
//!    │──────────────────────────────────────>│
//!    │  open / begin(ch N, remote=0)         │
//!    │<──────────────────────────────────────│
//!    │  attach(name, handle, role)           │
//!    │──────────────────────────────────────>│
//!    │  attach(name, handle', role')         │
//!    │<──────────────────────────────────────│
//!    │  flow(handle, delivery-count, credit) │  receiver grants credit
//!    │<─────────────────────────────────────>│
//!    │  transfer(handle, delivery-id, ...)   │  sender spends credit
//!    │──────────────────────────────────────>│
//!    │  disposition(first, last, state)      │  settlement
//!    │<──────────────────────────────────────│
//!    │  detach / end / close                 │  each acknowledged in kind
//!    │<─────────────────────────────────────>│
//! ```

pub mod frame;
pub mod types;

pub use frame::{
    Attach, Begin, Close, DEFAULT_MAX_FRAME_SIZE, Detach, Disposition, End, FRAME_HEADER_SIZE,
    Flow, FrameHeader, MIN_MAX_FRAME_SIZE, Open, PROTOCOL_HEADER, Performative, ProtocolError,
    Source, Target, Transfer,
};
pub use types::{
    AmqpError, ChannelId, DeliveryId, DeliveryState, Handle, ReceiverSettleMode, Role,
    SenderSettleMode, SettleMode, condition,
};
