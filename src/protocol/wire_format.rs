//! Wire format encoding and decoding.
//!
//! Every message travels as ISO-on-TCP (RFC 1006):
//! ```text
//! ┌──────────────────────┬──────────────────────┬─────────────────────┐
//! │ TPKT                 │ COTP                 │ S7 PDU              │
//! │ 0x03 0x00 len(u16 BE)│ LI, TPDU code, params│ header, param, data │
//! │ 4 bytes              │ 3 bytes for DT       │                     │
//! └──────────────────────┴──────────────────────┴─────────────────────┘
//! ```
//!
//! The S7 header is 10 bytes for jobs and userdata and 12 bytes for acks:
//! ```text
//! ┌──────┬────────┬──────────┬─────────┬─────────┬─────────┬─────────────┐
//! │ 0x32 │ ROSCTR │ reserved │ PDU ref │ param   │ data    │ error class │
//! │      │        │ 2 bytes  │ u16 BE  │ len u16 │ len u16 │ + code (ack)│
//! └──────┴────────┴──────────┴─────────┴─────────┴─────────┴─────────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

use bytes::{BufMut, BytesMut};

use crate::error::{Result, S7Error};

/// TPKT header size in bytes.
pub const TPKT_HEADER_SIZE: usize = 4;

/// COTP data (DT) header size in bytes.
pub const COTP_DATA_HEADER_SIZE: usize = 3;

/// Combined TPKT + COTP DT header size.
pub const ISO_HEADER_SIZE: usize = TPKT_HEADER_SIZE + COTP_DATA_HEADER_SIZE;

/// RFC 1006 version byte.
pub const TPKT_VERSION: u8 = 0x03;

/// Largest telegram a TPKT length field can describe.
pub const MAX_TPKT_LENGTH: usize = u16::MAX as usize;

/// Smallest legal TPKT telegram (header + COTP length indicator + TPDU code).
pub const MIN_TPKT_LENGTH: usize = TPKT_HEADER_SIZE + 2;

/// S7 protocol identifier.
pub const S7_PROTOCOL_ID: u8 = 0x32;

/// S7 header size for jobs and userdata.
pub const JOB_HEADER_SIZE: usize = 10;

/// S7 header size for acks (adds error class and code).
pub const ACK_HEADER_SIZE: usize = 12;

/// Offset of the PDU reference inside the S7 header.
pub const PDU_REF_OFFSET: usize = 4;

/// PDU size requested during communication setup unless configured otherwise.
pub const DEFAULT_PDU_SIZE: u16 = 960;

/// COTP TPDU codes.
pub mod tpdu {
    /// Connection request (CR).
    pub const CONNECTION_REQUEST: u8 = 0xE0;
    /// Connection confirm (CC).
    pub const CONNECTION_CONFIRM: u8 = 0xD0;
    /// Disconnect request (DR).
    pub const DISCONNECT_REQUEST: u8 = 0x80;
    /// Data (DT).
    pub const DATA: u8 = 0xF0;
    /// End-of-transmission bit in the DT TPDU-NR byte.
    pub const EOT: u8 = 0x80;
}

/// S7 ROSCTR (remote operating service control) values.
pub mod rosctr {
    /// Job request.
    pub const JOB: u8 = 0x01;
    /// Ack without data.
    pub const ACK: u8 = 0x02;
    /// Ack with data.
    pub const ACK_DATA: u8 = 0x03;
    /// Userdata (CPU functions, alarms).
    pub const USER_DATA: u8 = 0x07;

    /// Check whether headers with this ROSCTR carry error class/code.
    #[inline]
    pub fn has_error_fields(rosctr: u8) -> bool {
        rosctr == ACK || rosctr == ACK_DATA
    }
}

/// Decoded S7 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S7Header {
    /// ROSCTR (see `rosctr` module).
    pub rosctr: u8,
    /// PDU reference, echoed by the PLC in the matching ack.
    pub pdu_ref: u16,
    /// Length of the parameter section.
    pub param_length: u16,
    /// Length of the data section.
    pub data_length: u16,
    /// Error class (acks only, 0 otherwise).
    pub error_class: u8,
    /// Error code (acks only, 0 otherwise).
    pub error_code: u8,
}

impl S7Header {
    /// Create a header without error fields.
    pub fn new(rosctr: u8, pdu_ref: u16, param_length: u16, data_length: u16) -> Self {
        Self {
            rosctr,
            pdu_ref,
            param_length,
            data_length,
            error_class: 0,
            error_code: 0,
        }
    }

    /// Set the error class and code (only encoded for acks).
    pub fn with_error(mut self, class: u8, code: u8) -> Self {
        self.error_class = class;
        self.error_code = code;
        self
    }

    /// Encoded header size for this ROSCTR.
    #[inline]
    pub fn size(&self) -> usize {
        header_size(self.rosctr)
    }

    /// Total PDU length described by this header.
    #[inline]
    pub fn pdu_length(&self) -> usize {
        self.size() + self.param_length as usize + self.data_length as usize
    }

    /// Check if the ack reports an error.
    #[inline]
    pub fn has_error(&self) -> bool {
        self.error_class != 0 || self.error_code != 0
    }

    /// Encode the header into `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.size());
        dst.put_u8(S7_PROTOCOL_ID);
        dst.put_u8(self.rosctr);
        dst.put_u16(0);
        dst.put_u16(self.pdu_ref);
        dst.put_u16(self.param_length);
        dst.put_u16(self.data_length);
        if rosctr::has_error_fields(self.rosctr) {
            dst.put_u8(self.error_class);
            dst.put_u8(self.error_code);
        }
    }

    /// Decode a header from the start of an S7 PDU.
    pub fn decode(pdu: &[u8]) -> Result<Self> {
        if pdu.len() < JOB_HEADER_SIZE {
            return Err(S7Error::malformed(format!(
                "S7 header needs {} bytes, got {}",
                JOB_HEADER_SIZE,
                pdu.len()
            )));
        }
        if pdu[0] != S7_PROTOCOL_ID {
            return Err(S7Error::malformed(format!(
                "Invalid S7 protocol id 0x{:02X}",
                pdu[0]
            )));
        }

        let rosctr = pdu[1];
        let mut header = Self::new(
            rosctr,
            u16::from_be_bytes([pdu[4], pdu[5]]),
            u16::from_be_bytes([pdu[6], pdu[7]]),
            u16::from_be_bytes([pdu[8], pdu[9]]),
        );

        if rosctr::has_error_fields(rosctr) {
            if pdu.len() < ACK_HEADER_SIZE {
                return Err(S7Error::malformed("Ack header truncated"));
            }
            header.error_class = pdu[10];
            header.error_code = pdu[11];
        }

        Ok(header)
    }
}

/// Header size for the given ROSCTR.
#[inline]
pub fn header_size(rosctr: u8) -> usize {
    if rosctr::has_error_fields(rosctr) {
        ACK_HEADER_SIZE
    } else {
        JOB_HEADER_SIZE
    }
}

/// Read the PDU reference without validating the rest of the PDU.
///
/// Used to route a malformed response to its waiter.
#[inline]
pub fn peek_pdu_ref(pdu: &[u8]) -> Option<u16> {
    if pdu.len() < PDU_REF_OFFSET + 2 || pdu[0] != S7_PROTOCOL_ID {
        return None;
    }
    Some(u16::from_be_bytes([
        pdu[PDU_REF_OFFSET],
        pdu[PDU_REF_OFFSET + 1],
    ]))
}

/// Encode a TPKT header for a telegram of `total_length` bytes (header included).
#[inline]
pub fn encode_tpkt_header(total_length: u16) -> [u8; TPKT_HEADER_SIZE] {
    let [hi, lo] = total_length.to_be_bytes();
    [TPKT_VERSION, 0x00, hi, lo]
}

/// Decode the telegram length from a TPKT header.
///
/// Returns `Ok(None)` if fewer than 4 bytes are available.
pub fn decode_tpkt_length(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < TPKT_HEADER_SIZE {
        return Ok(None);
    }
    if buf[0] != TPKT_VERSION {
        return Err(S7Error::protocol(format!(
            "Invalid TPKT version 0x{:02X}",
            buf[0]
        )));
    }
    let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if length < MIN_TPKT_LENGTH {
        return Err(S7Error::protocol(format!(
            "TPKT length {} below minimum {}",
            length, MIN_TPKT_LENGTH
        )));
    }
    Ok(Some(length))
}
