//! Ordered frame writer for one session.
//!
//! Replies must reach the MTA in the order their commands arrived, and the
//! reply for command N must be flushed before command N+1 is dispatched.
//! The writer therefore owns the write half directly and every
//! [`FrameWriter::send`] completes only after the frame is flushed.
//!
//! Each frame is written with scatter/gather I/O: the 5-byte head (length
//! prefix plus code) and the body go out in one `write_vectored` call when
//! the kernel buffer allows it.

use std::io::IoSlice;
use std::pin::Pin;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{MilterError, Result};
use crate::protocol::{encode_length, LENGTH_PREFIX_SIZE};

/// Length prefix plus command code.
pub const HEAD_SIZE: usize = LENGTH_PREFIX_SIZE + 1;

/// Type-erased write half of a transport.
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A frame ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Pre-encoded length prefix and code.
    pub head: [u8; HEAD_SIZE],
    /// Body bytes (empty for bare replies like CONTINUE).
    pub body: Bytes,
}

impl OutboundFrame {
    /// Create a new outbound frame.
    #[inline]
    pub fn new(code: u8, body: Bytes) -> Self {
        let length = encode_length(1 + body.len() as u32);
        Self {
            head: [length[0], length[1], length[2], length[3], code],
            body,
        }
    }

    /// Create a frame with no body.
    #[inline]
    pub fn empty(code: u8) -> Self {
        Self::new(code, Bytes::new())
    }

    /// The command or reply code.
    #[inline]
    pub fn code(&self) -> u8 {
        self.head[LENGTH_PREFIX_SIZE]
    }

    /// Total size of this frame on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        HEAD_SIZE + self.body.len()
    }

    /// Contiguous copy of the whole frame.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = Vec::with_capacity(self.size());
        buf.extend_from_slice(&self.head);
        buf.extend_from_slice(&self.body);
        Bytes::from(buf)
    }
}

/// Writes frames to the transport in order, flushing each one.
pub struct FrameWriter {
    inner: Option<BoxedWriter>,
    frames_written: u64,
}

impl FrameWriter {
    /// Wrap a transport write half.
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        Self {
            inner: Some(Box::pin(writer)),
            frames_written: 0,
        }
    }

    /// Write and flush one frame.
    ///
    /// # Errors
    ///
    /// `ConnectionClosed` after [`FrameWriter::shutdown`], otherwise any I/O error.
    pub async fn send(&mut self, frame: OutboundFrame) -> Result<()> {
        let writer = self.inner.as_mut().ok_or(MilterError::ConnectionClosed)?;
        write_frame(writer, &frame).await?;
        self.frames_written += 1;
        Ok(())
    }

    /// Shut the write half down. Later sends fail with `ConnectionClosed`.
    pub async fn shutdown(&mut self) -> Result<()> {
        match self.inner.take() {
            Some(mut writer) => {
                writer.shutdown().await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// True once shut down.
    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Number of frames written so far.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

/// Write one frame using scatter/gather I/O, then flush.
async fn write_frame<W>(writer: &mut W, frame: &OutboundFrame) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let total_size = frame.size();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = remaining_slices(frame, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(MilterError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the part of `frame` not yet written.
fn remaining_slices(frame: &OutboundFrame, skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(2);

    if skip_bytes < HEAD_SIZE {
        slices.push(IoSlice::new(&frame.head[skip_bytes..]));
    }

    if !frame.body.is_empty() {
        let start_in_body = skip_bytes.saturating_sub(HEAD_SIZE);
        if start_in_body < frame.body.len() {
            slices.push(IoSlice::new(&frame.body[start_in_body..]));
        }
    }

    slices
}
