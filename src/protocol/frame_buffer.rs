//! Frame reassembly across partial reads.
//!
//! Uses `bytes::BytesMut` to accumulate a frame whose payload has not fully
//! arrived. The state machine is an explicit owned value:
//! - `Idle`: on a frame boundary, nothing held
//! - `AwaitingHeader`: a length prefix was split, its first bytes are held
//! - `AwaitingBody`: a payload is incomplete, `remaining` bytes still missing
//! - `Overflow`: a frame declared more than the limit; terminal
//!
//! Frames completed before an oversized one are still returned, so the
//! sequence handed out never depends on how the input was chunked.
//!
//! [`reassemble`] is the pure transition; [`FrameBuffer`] owns the state for
//! a session.
//!
//! # Example
//!
//! ```
//! use milterwire::protocol::{encode_frame, command, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new();
//! let frame = encode_frame(command::HELO, &[b"example.com\0"]);
//!
//! assert!(buffer.push(&frame[..9]).unwrap().is_empty());
//! let payloads = buffer.push(&frame[9..]).unwrap();
//! assert_eq!(&payloads[0][..], b"Hexample.com\0");
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::frame::parse_packet;
use super::wire_format::DEFAULT_MAX_FRAME_SIZE;
use crate::error::{MilterError, Result};

/// Reassembly state carried between reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReassemblyState {
    /// On a frame boundary.
    #[default]
    Idle,
    /// Fewer than 4 prefix bytes arrived; they are prepended to the next read.
    AwaitingHeader(Bytes),
    /// A payload is incomplete.
    AwaitingBody {
        /// Bytes still missing.
        remaining: usize,
        /// Payload bytes received so far.
        partial: BytesMut,
    },
    /// A frame exceeded the limit. Every later chunk is rejected.
    Overflow {
        /// Declared frame length.
        size: usize,
        /// Configured limit.
        max: usize,
    },
}

impl ReassemblyState {
    /// Number of bytes held in this state.
    pub fn held_len(&self) -> usize {
        match self {
            ReassemblyState::Idle => 0,
            ReassemblyState::AwaitingHeader(header) => header.len(),
            ReassemblyState::AwaitingBody { partial, .. } => partial.len(),
            ReassemblyState::Overflow { .. } => 0,
        }
    }

    /// State name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            ReassemblyState::Idle => "Idle",
            ReassemblyState::AwaitingHeader(_) => "AwaitingHeader",
            ReassemblyState::AwaitingBody { .. } => "AwaitingBody",
            ReassemblyState::Overflow { .. } => "Overflow",
        }
    }

    /// The error this state stands for, if it is `Overflow`.
    pub fn error(&self) -> Option<MilterError> {
        match self {
            ReassemblyState::Overflow { size, max } => Some(MilterError::FrameTooLarge {
                size: *size,
                max: *max,
            }),
            _ => None,
        }
    }
}

/// Feed one chunk through the reassembler.
///
/// Returns the next state and every payload completed by this chunk, in
/// arrival order. When a frame declares more than `max_frame_size` bytes,
/// the payloads before it are returned and the next state is `Overflow`.
///
/// # Errors
///
/// `FrameTooLarge` when called in the `Overflow` state.
pub fn reassemble(
    state: ReassemblyState,
    chunk: &[u8],
    max_frame_size: usize,
) -> Result<(ReassemblyState, Vec<Bytes>)> {
    let mut ready = Vec::new();

    let data = match state {
        ReassemblyState::Overflow { size, max } => {
            return Err(MilterError::FrameTooLarge { size, max });
        }
        ReassemblyState::Idle => Bytes::copy_from_slice(chunk),
        ReassemblyState::AwaitingHeader(header) => {
            let mut joined = BytesMut::with_capacity(header.len() + chunk.len());
            joined.put_slice(&header);
            joined.put_slice(chunk);
            joined.freeze()
        }
        ReassemblyState::AwaitingBody {
            remaining,
            mut partial,
        } => {
            let take = remaining.min(chunk.len());
            partial.extend_from_slice(&chunk[..take]);

            if take < remaining {
                let next = ReassemblyState::AwaitingBody {
                    remaining: remaining - take,
                    partial,
                };
                return Ok((next, ready));
            }

            ready.push(partial.freeze());
            Bytes::copy_from_slice(&chunk[take..])
        }
    };

    let (mut commands, remaining, held_header) = match parse_packet(&data) {
        Ok(packet) => (packet.commands, packet.remaining, None),
        Err(partial) => (partial.commands, 0, Some(partial.header)),
    };

    let complete = commands.len().saturating_sub(usize::from(remaining > 0));
    if let Some(pos) = commands[..complete]
        .iter()
        .position(|payload| payload.len() > max_frame_size)
    {
        let size = commands[pos].len();
        commands.truncate(pos);
        ready.extend(commands);
        return Ok((overflow(size, max_frame_size), ready));
    }

    let next = match (remaining, held_header) {
        (0, Some(header)) => ReassemblyState::AwaitingHeader(header),
        (0, None) => ReassemblyState::Idle,
        (remaining, _) => match commands.pop() {
            Some(last) if last.len() + remaining > max_frame_size => {
                overflow(last.len() + remaining, max_frame_size)
            }
            Some(last) => {
                let mut partial = BytesMut::with_capacity(last.len() + remaining);
                partial.put_slice(&last);
                ReassemblyState::AwaitingBody { remaining, partial }
            }
            None => ReassemblyState::Idle,
        },
    };

    ready.extend(commands);
    Ok((next, ready))
}

fn overflow(size: usize, max: usize) -> ReassemblyState {
    ReassemblyState::Overflow { size, max }
}

/// Per-session reassembly buffer.
///
/// Wraps [`ReassemblyState`] so the session can push chunks as they arrive.
#[derive(Debug)]
pub struct FrameBuffer {
    /// Current reassembly state.
    state: ReassemblyState,
    /// Maximum allowed frame length.
    max_frame_size: usize,
}

impl FrameBuffer {
    /// Create a new frame buffer with the default frame limit (16 MiB).
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new frame buffer with a custom frame limit.
    pub fn with_max_frame(max_frame_size: usize) -> Self {
        Self {
            state: ReassemblyState::Idle,
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete payloads.
    ///
    /// Partial prefixes and partial payloads are held for the next push.
    ///
    /// # Errors
    ///
    /// Returns [`MilterError::FrameTooLarge`] if a frame exceeds the limit
    /// and no complete payload precedes it in `data`. Otherwise those
    /// payloads are returned and [`FrameBuffer::check`] reports the error.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.check()?;
        let state = std::mem::take(&mut self.state);
        let (next, payloads) = reassemble(state, data, self.max_frame_size)?;
        self.state = next;
        if payloads.is_empty() {
            self.check()?;
        }
        Ok(payloads)
    }

    /// Fails once a frame has exceeded the limit.
    pub fn check(&self) -> Result<()> {
        match self.state.error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of held bytes.
    pub fn len(&self) -> usize {
        self.state.held_len()
    }

    /// True when nothing is held between reads.
    pub fn is_empty(&self) -> bool {
        self.state == ReassemblyState::Idle
    }

    /// The current state.
    pub fn state(&self) -> &ReassemblyState {
        &self.state
    }

    /// Drop held bytes and return to `Idle`.
    pub fn clear(&mut self) {
        self.state = ReassemblyState::Idle;
    }

    /// Configured frame limit.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
