//! Performatives and the frame envelope that carries them.
//!
//! # Wire Format
//!
//! A connection starts with an 8-byte protocol header, then a sequence of
//! frames sharing a common 8-byte header:
//!
//! ```text
//! ┌───────────────────┬─────────┬─────────┬───────────────┐
//! │ Size (4, BE)      │ DOFF(1) │ Type(1) │ Channel (2,BE)│
//! └───────────────────┴─────────┴─────────┴───────────────┘
//! ```
//!
//! - Size counts the whole frame, header included.
//! - DOFF is the data offset in 4-byte words; always 2 (no extended header).
//! - Type is 0 for AMQP frames.
//!
//! The body is one encoded [`Performative`] followed, for `transfer` only, by
//! the message payload. A frame with an empty body is a heartbeat.
//!
//! Performative bodies use a compact serde encoding (postcard) rather than
//! the AMQP type system; peers of this engine share the encoding.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{
    AmqpError, ChannelId, DeliveryId, DeliveryState, Handle, ReceiverSettleMode, Role,
    SenderSettleMode,
};

/// Protocol header: `AMQP`, protocol id 0, version 1.0.0.
pub const PROTOCOL_HEADER: [u8; 8] = *b"AMQP\x00\x01\x00\x00";

/// Size of the common frame header.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Smallest `max_frame_size` a peer may announce.
pub const MIN_MAX_FRAME_SIZE: u32 = 512;

/// Frame size used when neither side asks for anything else.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024;

/// Data offset in 4-byte words; 2 means no extended header.
const DATA_OFFSET: u8 = 2;

/// Frame type byte of an AMQP frame.
const FRAME_TYPE_AMQP: u8 = 0x00;

/// `open`: first frame on a connection, in each direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Open {
    pub container_id: String,
    pub hostname: Option<String>,
    pub max_frame_size: u32,
    pub channel_max: u16,
}

/// `begin`: opens a session on the frame's channel.
///
/// `remote_channel` is set when answering a peer's `begin`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Begin {
    pub remote_channel: Option<ChannelId>,
    pub next_outgoing_id: DeliveryId,
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub handle_max: u32,
}

/// Source terminus of a link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub address: Option<String>,
    /// Ask the peer to create a temporary node and report its address.
    pub dynamic: bool,
}

/// Target terminus of a link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub address: Option<String>,
    pub dynamic: bool,
}

/// `attach`: attaches a link endpoint to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attach {
    pub name: String,
    pub handle: Handle,
    /// Role of the endpoint that sent this frame.
    pub role: Role,
    pub snd_settle_mode: SenderSettleMode,
    pub rcv_settle_mode: ReceiverSettleMode,
    pub source: Option<Source>,
    pub target: Option<Target>,
    /// Sender's delivery-count at attach time. Only meaningful from a sender.
    pub initial_delivery_count: Option<u64>,
}

impl Attach {
    /// Address of the node the attaching endpoint is talking to.
    ///
    /// A sender addresses the target; a receiver addresses the source.
    #[must_use]
    pub fn node_address(&self) -> Option<&str> {
        match self.role {
            Role::Sender => self.target.as_ref().and_then(|t| t.address.as_deref()),
            Role::Receiver => self.source.as_ref().and_then(|s| s.address.as_deref()),
        }
    }

    /// Whether the attaching endpoint asks for a dynamically created node.
    #[must_use]
    pub fn wants_dynamic_node(&self) -> bool {
        match self.role {
            Role::Sender => self.target.as_ref().is_some_and(|t| t.dynamic),
            Role::Receiver => self.source.as_ref().is_some_and(|s| s.dynamic),
        }
    }
}

/// `flow`: link credit update, or a session-level window update when
/// `handle` is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    pub handle: Option<Handle>,
    /// Sender's delivery-count as known by the frame's author. `None` means
    /// unknown, which tells a sender to use its own count as the baseline.
    pub delivery_count: Option<u64>,
    pub link_credit: u32,
    /// Request that the peer answer with its own link state.
    pub echo: bool,
}

/// `transfer`: one delivery. The payload follows the performative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub handle: Handle,
    pub delivery_id: Option<DeliveryId>,
    pub delivery_tag: Vec<u8>,
    pub message_format: u32,
    /// Pre-settled: the sender forgets the delivery once sent.
    pub settled: bool,
}

/// `disposition`: reports state for the closed range `[first, last]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disposition {
    /// Role of the endpoint that sent this frame.
    pub role: Role,
    pub first: DeliveryId,
    /// Defaults to `first` when absent.
    pub last: Option<DeliveryId>,
    pub settled: bool,
    pub state: Option<DeliveryState>,
}

impl Disposition {
    /// Inclusive upper bound of the range.
    #[must_use]
    pub fn last_or_first(&self) -> DeliveryId {
        self.last.unwrap_or(self.first)
    }
}

/// `detach`: detaches a link endpoint; `closed` also destroys the link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detach {
    pub handle: Handle,
    pub closed: bool,
    pub error: Option<AmqpError>,
}

/// `end`: ends the session on the frame's channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct End {
    pub error: Option<AmqpError>,
}

/// `close`: closes the connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Close {
    pub error: Option<AmqpError>,
}

/// All performatives a frame body can carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Performative {
    Open(Open),
    Begin(Begin),
    Attach(Attach),
    Flow(Flow),
    Transfer(Transfer),
    Disposition(Disposition),
    Detach(Detach),
    End(End),
    Close(Close),
}

impl Performative {
    /// Lowercase performative name, as used in log fields.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Open(_) => "open",
            Self::Begin(_) => "begin",
            Self::Attach(_) => "attach",
            Self::Flow(_) => "flow",
            Self::Transfer(_) => "transfer",
            Self::Disposition(_) => "disposition",
            Self::Detach(_) => "detach",
            Self::End(_) => "end",
            Self::Close(_) => "close",
        }
    }
}

/// Errors while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Buffer too small to decode.
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
    /// The peer does not speak AMQP.
    #[error("unknown protocol header {0:?}")]
    UnknownProtocol([u8; 4]),
    /// AMQP, but a protocol id other than plain AMQP (e.g. SASL or TLS).
    #[error("unsupported protocol id {0}")]
    UnsupportedProtocolId(u8),
    /// AMQP, but not version 1.0.0.
    #[error("unsupported version {major}.{minor}.{revision}")]
    UnsupportedVersion { major: u8, minor: u8, revision: u8 },
    /// Frame size exceeds what this side accepts.
    #[error("frame of {size} bytes exceeds max frame size {max}")]
    FrameTooLarge { size: usize, max: u32 },
    /// Frame size smaller than its own header.
    #[error("frame size {0} smaller than header")]
    FrameTooSmall(u32),
    /// Data offset pointing inside the fixed header.
    #[error("invalid data offset {0}")]
    InvalidDataOffset(u8),
    /// Frame type other than AMQP.
    #[error("unknown frame type: 0x{0:02x}")]
    UnknownFrameType(u8),
    /// Performative body failed to encode or decode.
    #[error("malformed performative: {0}")]
    Body(#[from] postcard::Error),
}

/// Validates the 8-byte protocol header sent by a peer.
pub fn check_protocol_header(bytes: &[u8]) -> Result<(), ProtocolError> {
    let header: &[u8; 8] = bytes
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or(ProtocolError::BufferTooSmall {
            need: 8,
            have: bytes.len(),
        })?;

    if header[..4] != PROTOCOL_HEADER[..4] {
        let mut name = [0u8; 4];
        name.copy_from_slice(&header[..4]);
        return Err(ProtocolError::UnknownProtocol(name));
    }
    if header[4] != 0 {
        return Err(ProtocolError::UnsupportedProtocolId(header[4]));
    }
    if header[5..] != PROTOCOL_HEADER[5..] {
        return Err(ProtocolError::UnsupportedVersion {
            major: header[5],
            minor: header[6],
            revision: header[7],
        });
    }
    Ok(())
}

/// Decoded common frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame size, header included.
    pub size: u32,
    /// Offset of the body from the start of the frame, in bytes.
    pub body_offset: usize,
    pub channel: ChannelId,
}

impl FrameHeader {
    /// Decodes and validates a frame header against `max_frame_size`.
    pub fn decode(bytes: &[u8], max_frame_size: u32) -> Result<Self, ProtocolError> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::BufferTooSmall {
                need: FRAME_HEADER_SIZE,
                have: bytes.len(),
            });
        }
        let size = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let doff = bytes[4];
        let frame_type = bytes[5];
        let channel = ChannelId(u16::from_be_bytes([bytes[6], bytes[7]]));

        if (size as usize) < FRAME_HEADER_SIZE {
            return Err(ProtocolError::FrameTooSmall(size));
        }
        if size > max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: size as usize,
                max: max_frame_size,
            });
        }
        if doff < DATA_OFFSET || usize::from(doff) * 4 > size as usize {
            return Err(ProtocolError::InvalidDataOffset(doff));
        }
        if frame_type != FRAME_TYPE_AMQP {
            return Err(ProtocolError::UnknownFrameType(frame_type));
        }

        Ok(Self {
            size,
            body_offset: usize::from(doff) * 4,
            channel,
        })
    }

    /// Appends a header with a zero size, returning the position to patch.
    pub(crate) fn write_placeholder(buf: &mut Vec<u8>, channel: ChannelId) -> usize {
        let start = buf.len();
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.push(DATA_OFFSET);
        buf.push(FRAME_TYPE_AMQP);
        buf.extend_from_slice(&channel.0.to_be_bytes());
        start
    }

    /// Patches the size of the frame that starts at `start` and runs to the
    /// end of `buf`.
    pub(crate) fn patch_size(buf: &mut [u8], start: usize) {
        let size = (buf.len() - start) as u32;
        buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
    }
}

/// Appends the encoded performative to `buf`.
pub fn encode_performative(
    performative: &Performative,
    buf: &mut Vec<u8>,
) -> Result<(), ProtocolError> {
    let encoded = postcard::to_allocvec(performative)?;
    buf.extend_from_slice(&encoded);
    Ok(())
}

/// Decodes a frame body into its performative and trailing payload.
///
/// Returns `None` for an empty body (heartbeat).
pub fn decode_body(body: &[u8]) -> Result<Option<(Performative, &[u8])>, ProtocolError> {
    if body.is_empty() {
        return Ok(None);
    }
    let (performative, payload) = postcard::take_from_bytes::<Performative>(body)?;
    Ok(Some((performative, payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(channel: ChannelId, performative: &Performative, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        let start = FrameHeader::write_placeholder(&mut buf, channel);
        encode_performative(performative, &mut buf).unwrap();
        buf.extend_from_slice(payload);
        FrameHeader::patch_size(&mut buf, start);
        buf
    }

    #[test]
    fn transfer_frame_carries_payload_after_performative() {
        let transfer = Performative::Transfer(Transfer {
            handle: Handle(3),
            delivery_id: Some(DeliveryId(9)),
            delivery_tag: vec![9],
            message_format: 0,
            settled: false,
        });
        let bytes = frame_bytes(ChannelId(5), &transfer, b"hello");

        let header = FrameHeader::decode(&bytes, DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(header.size as usize, bytes.len());
        assert_eq!(header.channel, ChannelId(5));

        let (decoded, payload) = decode_body(&bytes[header.body_offset..])
            .unwrap()
            .unwrap();
        assert_eq!(decoded, transfer);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn empty_body_is_heartbeat() {
        let mut buf = Vec::new();
        let start = FrameHeader::write_placeholder(&mut buf, ChannelId(0));
        FrameHeader::patch_size(&mut buf, start);
        assert_eq!(buf.len(), FRAME_HEADER_SIZE);

        let header = FrameHeader::decode(&buf, DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert!(decode_body(&buf[header.body_offset..]).unwrap().is_none());
    }

    #[test]
    fn header_rejects_oversized_frame() {
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&1024u32.to_be_bytes());
        bytes[4] = 2;
        let result = FrameHeader::decode(&bytes, 512);
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTooLarge { size: 1024, max: 512 })
        ));
    }

    #[test]
    fn header_rejects_bad_offset_and_type() {
        let mut bytes = [0u8, 0, 0, 8, 1, 0, 0, 0];
        assert!(matches!(
            FrameHeader::decode(&bytes, 512),
            Err(ProtocolError::InvalidDataOffset(1))
        ));

        bytes[4] = 2;
        bytes[5] = 0x01;
        assert!(matches!(
            FrameHeader::decode(&bytes, 512),
            Err(ProtocolError::UnknownFrameType(0x01))
        ));
    }

    #[test]
    fn header_rejects_short_buffer() {
        assert!(matches!(
            FrameHeader::decode(&[0, 0, 0], 512),
            Err(ProtocolError::BufferTooSmall { need: 8, have: 3 })
        ));
    }

    #[test]
    fn protocol_header_validation() {
        assert!(check_protocol_header(&PROTOCOL_HEADER).is_ok());
        assert!(matches!(
            check_protocol_header(b"HTTP/1.1"),
            Err(ProtocolError::UnknownProtocol(_))
        ));
        assert!(matches!(
            check_protocol_header(b"AMQP\x03\x01\x00\x00"),
            Err(ProtocolError::UnsupportedProtocolId(3))
        ));
        assert!(matches!(
            check_protocol_header(b"AMQP\x00\x00\x09\x01"),
            Err(ProtocolError::UnsupportedVersion {
                major: 0,
                minor: 9,
                revision: 1
            })
        ));
    }

    #[test]
    fn attach_node_address_follows_role() {
        let mut attach = Attach {
            name: "l".into(),
            handle: Handle(0),
            role: Role::Sender,
            snd_settle_mode: SenderSettleMode::Unsettled,
            rcv_settle_mode: ReceiverSettleMode::First,
            source: Some(Source {
                address: Some("src".into()),
                dynamic: false,
            }),
            target: Some(Target {
                address: Some("dst".into()),
                dynamic: true,
            }),
            initial_delivery_count: Some(0),
        };
        assert_eq!(attach.node_address(), Some("dst"));
        assert!(attach.wants_dynamic_node());

        attach.role = Role::Receiver;
        assert_eq!(attach.node_address(), Some("src"));
        assert!(!attach.wants_dynamic_node());
    }

    #[test]
    fn garbage_body_is_malformed() {
        let result = decode_body(&[0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(ProtocolError::Body(_))));
    }
}
