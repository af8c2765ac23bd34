//! Frame transport over a duplex byte stream.
//!
//! [`FrameReader`] pulls whole frames out of any [`Read`]. Reads are
//! resumable: when the stream reports `WouldBlock` or `TimedOut` the partial
//! frame stays buffered and the caller gets [`ReadOutcome::Idle`], which the
//! connection loop uses to pump senders and check for shutdown.
//!
//! [`FrameWriter`] queues encoded frames in memory until flushed to a
//! [`Write`]. Sessions and links only ever see the [`FrameSink`] trait, so a
//! frame counts as sent once it is queued.

use std::io::{self, ErrorKind, Read, Write};

use thiserror::Error;

use crate::protocol::frame::{
    FRAME_HEADER_SIZE, FrameHeader, PROTOCOL_HEADER, ProtocolError, check_protocol_header,
    decode_body, encode_performative,
};
use crate::protocol::{ChannelId, Performative};

/// Bytes requested from the stream per read call, beyond what is needed.
const READ_CHUNK: usize = 8 * 1024;

/// Errors on the byte stream. All of them are fatal to the connection except
/// those for which [`TransportError::is_recoverable`] holds.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// The peer hung up in the middle of a frame.
    #[error("stream ended mid-frame with {buffered} bytes buffered")]
    Truncated { buffered: usize },
}

impl TransportError {
    /// Whether framing is still intact after this error.
    ///
    /// A performative that fails to decode has already been consumed, so the
    /// frame can be dropped and reading can go on.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Protocol(ProtocolError::Body(_)))
    }
}

/// Result of a read attempt.
#[derive(Debug)]
pub enum ReadOutcome<T> {
    /// A complete item was read.
    Ready(T),
    /// The stream has nothing more right now; any partial frame is kept.
    Idle,
    /// The peer closed the stream cleanly between frames.
    Eof,
}

/// One decoded frame, borrowing its payload from the reader's buffer.
#[derive(Debug)]
pub struct Frame<'a> {
    pub channel: ChannelId,
    /// `None` for an empty (heartbeat) frame.
    pub performative: Option<Performative>,
    /// Bytes after the performative. Only `transfer` carries any.
    pub payload: &'a [u8],
}

/// Incremental frame decoder over a byte stream.
pub struct FrameReader {
    buf: Vec<u8>,
    /// Bytes at the front of `buf` belonging to the frame last returned.
    consumed: usize,
    max_frame_size: u32,
}

impl FrameReader {
    #[must_use]
    pub const fn new(max_frame_size: u32) -> Self {
        Self {
            buf: Vec::new(),
            consumed: 0,
            max_frame_size,
        }
    }

    #[must_use]
    pub const fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Bytes read from the stream but not yet returned as a frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.consumed
    }

    /// Reads and validates the peer's 8-byte protocol header.
    pub fn read_protocol_header<R: Read + ?Sized>(
        &mut self,
        stream: &mut R,
    ) -> Result<ReadOutcome<()>, TransportError> {
        self.discard_consumed();
        match self.fill(stream, PROTOCOL_HEADER.len())? {
            ReadOutcome::Ready(()) => {}
            ReadOutcome::Idle => return Ok(ReadOutcome::Idle),
            ReadOutcome::Eof => return Ok(ReadOutcome::Eof),
        }
        self.consumed = PROTOCOL_HEADER.len();
        check_protocol_header(&self.buf[..PROTOCOL_HEADER.len()])?;
        Ok(ReadOutcome::Ready(()))
    }

    /// Reads the next complete frame.
    ///
    /// # Errors
    ///
    /// Header errors and I/O failures lose framing and are fatal. A body that
    /// fails to decode is reported after the frame has been consumed; see
    /// [`TransportError::is_recoverable`].
    pub fn read_frame<R: Read + ?Sized>(
        &mut self,
        stream: &mut R,
    ) -> Result<ReadOutcome<Frame<'_>>, TransportError> {
        self.discard_consumed();
        match self.fill(stream, FRAME_HEADER_SIZE)? {
            ReadOutcome::Ready(()) => {}
            ReadOutcome::Idle => return Ok(ReadOutcome::Idle),
            ReadOutcome::Eof => return Ok(ReadOutcome::Eof),
        }

        let header = FrameHeader::decode(&self.buf, self.max_frame_size)?;
        let size = header.size as usize;
        match self.fill(stream, size)? {
            ReadOutcome::Ready(()) => {}
            ReadOutcome::Idle => return Ok(ReadOutcome::Idle),
            ReadOutcome::Eof => {
                return Err(TransportError::Truncated {
                    buffered: self.buf.len(),
                });
            }
        }

        self.consumed = size;
        let frame = match decode_body(&self.buf[header.body_offset..size])? {
            Some((performative, payload)) => Frame {
                channel: header.channel,
                performative: Some(performative),
                payload,
            },
            None => Frame {
                channel: header.channel,
                performative: None,
                payload: &[],
            },
        };
        Ok(ReadOutcome::Ready(frame))
    }

    fn discard_consumed(&mut self) {
        if self.consumed > 0 {
            self.buf.drain(..self.consumed);
            self.consumed = 0;
        }
    }

    /// Reads until at least `need` bytes are buffered.
    fn fill<R: Read + ?Sized>(
        &mut self,
        stream: &mut R,
        need: usize,
    ) -> Result<ReadOutcome<()>, TransportError> {
        while self.buf.len() < need {
            let start = self.buf.len();
            self.buf.resize(start + (need - start).max(READ_CHUNK), 0);
            let result = stream.read(&mut self.buf[start..]);
            match result {
                Ok(0) => {
                    self.buf.truncate(start);
                    if start == 0 {
                        return Ok(ReadOutcome::Eof);
                    }
                    return Err(TransportError::Truncated { buffered: start });
                }
                Ok(n) => self.buf.truncate(start + n),
                Err(e) => {
                    self.buf.truncate(start);
                    match e.kind() {
                        ErrorKind::Interrupted => {}
                        ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                            return Ok(ReadOutcome::Idle);
                        }
                        _ => return Err(e.into()),
                    }
                }
            }
        }
        Ok(ReadOutcome::Ready(()))
    }
}

/// Destination for outbound frames.
///
/// Queuing a frame is the point of no return: once `queue` succeeds the frame
/// is ordered ahead of anything queued later.
pub trait FrameSink {
    /// Queues a frame whose body is `performative` followed by `payload`.
    fn queue_with_payload(
        &mut self,
        channel: ChannelId,
        performative: &Performative,
        payload: &mut dyn Read,
    ) -> Result<(), TransportError>;

    /// Queues a frame with no payload.
    fn queue(
        &mut self,
        channel: ChannelId,
        performative: &Performative,
    ) -> Result<(), TransportError> {
        self.queue_with_payload(channel, performative, &mut io::empty())
    }
}

/// Frame encoder with an in-memory write queue.
pub struct FrameWriter {
    buf: Vec<u8>,
    max_frame_size: u32,
}

impl FrameWriter {
    #[must_use]
    pub const fn new(max_frame_size: u32) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_size,
        }
    }

    /// Caps outgoing frames, typically at the peer's announced limit.
    pub fn set_max_frame_size(&mut self, max_frame_size: u32) {
        self.max_frame_size = max_frame_size;
    }

    #[must_use]
    pub const fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    pub fn queue_protocol_header(&mut self) {
        self.buf.extend_from_slice(&PROTOCOL_HEADER);
    }

    /// Queues an empty frame.
    pub fn queue_heartbeat(&mut self) {
        let start = FrameHeader::write_placeholder(&mut self.buf, ChannelId(0));
        FrameHeader::patch_size(&mut self.buf, start);
    }

    /// Number of queued bytes not yet flushed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Writes every queued byte to `stream` and flushes it.
    pub fn flush_to<W: Write + ?Sized>(&mut self, stream: &mut W) -> Result<(), TransportError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        stream.write_all(&self.buf)?;
        self.buf.clear();
        stream.flush()?;
        Ok(())
    }
}

impl FrameSink for FrameWriter {
    fn queue_with_payload(
        &mut self,
        channel: ChannelId,
        performative: &Performative,
        payload: &mut dyn Read,
    ) -> Result<(), TransportError> {
        let start = FrameHeader::write_placeholder(&mut self.buf, channel);
        let max = self.max_frame_size as usize;

        if let Err(e) = encode_performative(performative, &mut self.buf) {
            self.buf.truncate(start);
            return Err(e.into());
        }

        // Read at most one byte past the limit so oversized payloads are caught.
        let room = (max + 1).saturating_sub(self.buf.len() - start);
        if let Err(e) = payload.take(room as u64).read_to_end(&mut self.buf) {
            self.buf.truncate(start);
            return Err(e.into());
        }

        let size = self.buf.len() - start;
        if size > max {
            self.buf.truncate(start);
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            }
            .into());
        }

        FrameHeader::patch_size(&mut self.buf, start);
        Ok(())
    }
}
