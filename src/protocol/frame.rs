//! Frame struct with typed accessors.
//!
//! A frame is one complete COTP TPDU with its TPKT envelope removed. For
//! data TPDUs the payload is the reassembled S7 PDU; for connection
//! request/confirm TPDUs the variable header part carries the parameters.
//!
//! # Example
//!
//! ```
//! use s7wire_client::protocol::{build_data_frame, Frame};
//!
//! let pdu = [0x32, 0x03, 0x00, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
//! let bytes = build_data_frame(&pdu);
//! assert_eq!(bytes.len(), 7 + pdu.len());
//!
//! let frame = Frame::data(bytes::Bytes::copy_from_slice(&pdu));
//! assert_eq!(frame.pdu_ref(), Some(5));
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{
    encode_tpkt_header, peek_pdu_ref, tpdu, S7Header, ISO_HEADER_SIZE, MAX_TPKT_LENGTH,
};
use crate::error::{Result, S7Error};

/// A complete COTP TPDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// TPDU code (high nibble of the COTP type byte).
    pub tpdu_code: u8,
    /// Variable part of the COTP header (after the TPDU code byte).
    pub variable: Bytes,
    /// User data. For DT TPDUs this is the S7 PDU.
    pub payload: Bytes,
}

impl Frame {
    /// Create a data frame carrying an S7 PDU.
    pub fn data(payload: Bytes) -> Self {
        Self {
            tpdu_code: tpdu::DATA,
            variable: Bytes::from_static(&[tpdu::EOT]),
            payload,
        }
    }

    /// Create a frame from raw COTP parts.
    pub fn new(tpdu_code: u8, variable: Bytes, payload: Bytes) -> Self {
        Self {
            tpdu_code,
            variable,
            payload,
        }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Check if this is a data TPDU.
    #[inline]
    pub fn is_data(&self) -> bool {
        self.tpdu_code == tpdu::DATA
    }

    /// Check if this is a connection confirm TPDU.
    #[inline]
    pub fn is_connection_confirm(&self) -> bool {
        self.tpdu_code == tpdu::CONNECTION_CONFIRM
    }

    /// Check if this is a disconnect request TPDU.
    #[inline]
    pub fn is_disconnect(&self) -> bool {
        self.tpdu_code == tpdu::DISCONNECT_REQUEST
    }

    /// PDU reference of the carried S7 PDU, if readable.
    #[inline]
    pub fn pdu_ref(&self) -> Option<u16> {
        if !self.is_data() {
            return None;
        }
        peek_pdu_ref(&self.payload)
    }

    /// Decode the S7 header and check the declared lengths against the payload.
    pub fn s7_header(&self) -> Result<S7Header> {
        if !self.is_data() {
            return Err(S7Error::malformed(format!(
                "Expected data TPDU, got 0x{:02X}",
                self.tpdu_code
            )));
        }
        let header = S7Header::decode(&self.payload)?;
        if header.pdu_length() > self.payload.len() {
            return Err(S7Error::malformed(format!(
                "S7 PDU declares {} bytes, frame carries {}",
                header.pdu_length(),
                self.payload.len()
            )));
        }
        Ok(header)
    }

    /// Parameter section of the S7 PDU.
    pub fn parameter(&self, header: &S7Header) -> &[u8] {
        let start = header.size();
        let end = start + header.param_length as usize;
        self.payload.get(start..end).unwrap_or(&[])
    }

    /// Data section of the S7 PDU.
    pub fn data_section(&self, header: &S7Header) -> &[u8] {
        let start = header.size() + header.param_length as usize;
        let end = start + header.data_length as usize;
        self.payload.get(start..end).unwrap_or(&[])
    }
}

/// Wrap an S7 PDU into TPKT + COTP DT as a single byte buffer.
///
/// The PDU must fit into one TPKT; the caller checks the negotiated
/// PDU size beforehand.
pub fn build_data_frame(pdu: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ISO_HEADER_SIZE + pdu.len());
    encode_data_frame_into(pdu, &mut buf);
    buf.freeze()
}

/// Append TPKT + COTP DT + `pdu` to `dst`.
pub fn encode_data_frame_into(pdu: &[u8], dst: &mut BytesMut) {
    let total = (ISO_HEADER_SIZE + pdu.len()).min(MAX_TPKT_LENGTH) as u16;
    dst.reserve(ISO_HEADER_SIZE + pdu.len());
    dst.put_slice(&encode_tpkt_header(total));
    dst.put_u8(0x02);
    dst.put_u8(tpdu::DATA);
    dst.put_u8(tpdu::EOT);
    dst.put_slice(pdu);
}
