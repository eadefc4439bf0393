//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented telegrams:
//! - `WaitingForHeader`: Need the 4-byte TPKT header
//! - `WaitingForBody`: Header parsed, need the rest of the telegram
//!
//! COTP data TPDUs without the end-of-transmission bit are collected until
//! the final segment arrives, so callers only ever see complete S7 PDUs.
//!
//! # Example
//!
//! ```ignore
//! use s7wire_client::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//!
//! // Data arrives in chunks from socket
//! let frames = buffer.push(&chunk).unwrap();
//!
//! for frame in frames {
//!     println!("Got frame for reference {:?}", frame.pdu_ref());
//! }
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{decode_tpkt_length, tpdu, TPKT_HEADER_SIZE};
use super::Frame;
use crate::error::{Result, S7Error};

/// Default limit for a reassembled S7 PDU.
pub const DEFAULT_MAX_PDU_SIZE: usize = 64 * 1024;

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the TPKT header.
    WaitingForHeader,
    /// TPKT header parsed, waiting for the remaining telegram bytes.
    WaitingForBody { length: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// COTP DT segments seen so far (no EOT yet).
    segments: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed reassembled PDU size.
    max_pdu_size: usize,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_PDU_SIZE, DEFAULT_MAX_PDU_SIZE)
    }

    /// Create a new frame buffer with custom capacity and PDU limit.
    pub fn with_capacity(capacity: usize, max_pdu_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            segments: BytesMut::new(),
            state: State::WaitingForHeader,
            max_pdu_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial telegrams and unfinished DT segment chains stay buffered
    /// for the next push.
    ///
    /// # Errors
    ///
    /// Returns error on an invalid TPKT header, a malformed COTP header,
    /// or a reassembled PDU above the configured limit. The stream cannot
    /// be resynchronised after such an error.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }

        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.state {
                State::WaitingForHeader => {
                    let length = match decode_tpkt_length(&self.buffer)? {
                        Some(length) => length,
                        None => return Ok(None),
                    };
                    self.state = State::WaitingForBody { length };
                }

                State::WaitingForBody { length } => {
                    if self.buffer.len() < length {
                        return Ok(None);
                    }

                    let mut telegram = self.buffer.split_to(length);
                    let _ = telegram.split_to(TPKT_HEADER_SIZE);
                    self.state = State::WaitingForHeader;

                    if let Some(frame) = self.accept_tpdu(telegram.freeze())? {
                        return Ok(Some(frame));
                    }
                }
            }
        }
    }

    /// Parse one COTP TPDU; returns `None` while a DT chain is incomplete.
    fn accept_tpdu(&mut self, mut body: Bytes) -> Result<Option<Frame>> {
        let li = body[0] as usize;
        if li == 0 || li + 1 > body.len() {
            return Err(S7Error::protocol(format!(
                "COTP length indicator {} exceeds telegram of {} bytes",
                li,
                body.len()
            )));
        }

        let mut header = body.split_to(li + 1);
        let code = header[1] & 0xF0;
        let variable = header.split_off(2);

        if code != tpdu::DATA {
            return Ok(Some(Frame::new(code, variable, body)));
        }

        let eot = variable.first().is_some_and(|nr| nr & tpdu::EOT != 0);
        if self.segments.len() + body.len() > self.max_pdu_size {
            self.segments.clear();
            return Err(S7Error::protocol(format!(
                "Reassembled PDU exceeds maximum {}",
                self.max_pdu_size
            )));
        }

        if !eot {
            self.segments.extend_from_slice(&body);
            return Ok(None);
        }

        let payload = if self.segments.is_empty() {
            body
        } else {
            self.segments.extend_from_slice(&body);
            self.segments.split().freeze()
        };

        Ok(Some(Frame::new(code, variable, payload)))
    }

    /// Get the number of buffered bytes (not counting DT segments).
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.segments.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.segments.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
