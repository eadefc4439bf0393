//! Frame-at-a-time reading from an async byte stream.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt};

use super::frame::Frame;
use super::frame_buffer::FrameBuffer;
use crate::error::Result;

/// Default read buffer size.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Reads bytes from `R` and yields complete frames.
pub struct FrameReader<R> {
    reader: R,
    frames: FrameBuffer,
    queued: VecDeque<Frame>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_buffer_size(reader, DEFAULT_READ_BUFFER_SIZE)
    }

    pub fn with_buffer_size(reader: R, buffer_size: usize) -> Self {
        Self {
            reader,
            frames: FrameBuffer::new(),
            queued: VecDeque::new(),
            buf: vec![0u8; buffer_size.max(1)],
        }
    }

    /// Next complete frame, or `None` once the peer closed the stream.
    ///
    /// Cancel-safe: frames parsed before cancellation stay queued.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.queued.pop_front() {
                return Ok(Some(frame));
            }

            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.queued.extend(self.frames.push(&self.buf[..n])?);
        }
    }

    /// Frames parsed but not yet handed out.
    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}
