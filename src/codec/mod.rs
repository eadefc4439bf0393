//! Codec module - S7 message kinds and their encoders/decoders.
//!
//! Every message kind implements [`Datagram`]: it knows how to write its S7
//! PDU (header, parameter and data sections) and how to rebuild itself from
//! a decoded header plus the two sections. The TPKT/COTP envelope is added
//! by [`encode`] and removed by the frame buffer before [`decode`].
//!
//! - [`setup`] - communication setup (PDU size and job capacity negotiation)
//! - [`read_write`] - read/write variable jobs with any-pointer addressing
//! - [`alarms`] - pending-alarm query, alarm update subscription, indications
//!
//! # Example
//!
//! ```
//! use s7wire_client::codec::{decode, encode, setup::CommunicationSetup};
//! use s7wire_client::protocol::FrameBuffer;
//!
//! let request = CommunicationSetup::new(10, 10, 960);
//! let bytes = encode(&request, 1).unwrap();
//!
//! let mut buffer = FrameBuffer::new();
//! let frames = buffer.push(&bytes).unwrap();
//! let decoded: CommunicationSetup = decode(&frames[0]).unwrap();
//! assert_eq!(decoded, request);
//! ```

pub mod alarms;
mod data_item;
pub mod read_write;
pub mod setup;
mod userdata;

pub use data_item::{return_code, transport_size, DataItem};
pub use userdata::{subfunction, UserDataParam, UserDataTail};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, S7Error};
use crate::protocol::{
    encode_tpkt_header, rosctr, tpdu, Frame, S7Header, ISO_HEADER_SIZE, MAX_TPKT_LENGTH,
};

/// Job function codes (first parameter byte).
pub mod function {
    /// Read variable.
    pub const READ_VAR: u8 = 0x04;
    /// Write variable.
    pub const WRITE_VAR: u8 = 0x05;
    /// Setup communication.
    pub const SETUP_COMMUNICATION: u8 = 0xF0;
}

/// Every message kind the engine can tell apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    CommunicationSetup,
    CommunicationSetupAck,
    ReadRequest,
    ReadAck,
    WriteRequest,
    WriteAck,
    PendingAlarmsRequest,
    PendingAlarmsAck,
    AlarmUpdateRequest,
    AlarmUpdateAck,
    AlarmIndication,
    Unknown,
}

impl MessageKind {
    /// Classify a PDU by its ROSCTR and parameter section.
    pub fn classify(header: &S7Header, param: &[u8]) -> Self {
        match header.rosctr {
            rosctr::JOB => match param.first() {
                Some(&function::SETUP_COMMUNICATION) => Self::CommunicationSetup,
                Some(&function::READ_VAR) => Self::ReadRequest,
                Some(&function::WRITE_VAR) => Self::WriteRequest,
                _ => Self::Unknown,
            },
            rosctr::ACK | rosctr::ACK_DATA => match param.first() {
                Some(&function::SETUP_COMMUNICATION) => Self::CommunicationSetupAck,
                Some(&function::READ_VAR) => Self::ReadAck,
                Some(&function::WRITE_VAR) => Self::WriteAck,
                _ => Self::Unknown,
            },
            rosctr::USER_DATA => match UserDataParam::decode(param) {
                Ok(param) => param.kind(),
                Err(_) => Self::Unknown,
            },
            _ => Self::Unknown,
        }
    }

    /// Unsolicited messages that go to subscribers instead of a waiter.
    #[inline]
    pub fn is_indication(self) -> bool {
        self == Self::AlarmIndication
    }
}

/// A message kind with a fixed wire layout.
pub trait Datagram: Sized {
    /// Kind this datagram decodes from.
    const KIND: MessageKind;
    /// Smallest valid S7 PDU length (header included).
    const MIN_SIZE: usize;
    /// Largest valid S7 PDU length (header included).
    const MAX_SIZE: usize = u16::MAX as usize;

    /// Append the S7 PDU (header, parameter, data) to `dst`.
    fn encode_pdu(&self, pdu_ref: u16, dst: &mut BytesMut);

    /// Rebuild the datagram from its header and sections.
    fn decode_pdu(header: &S7Header, param: &[u8], data: &[u8]) -> Result<Self>;
}

/// A datagram that expects a correlated response.
pub trait Request: Datagram {
    /// The datagram the PLC answers with.
    type Response: Datagram;
}

/// Encode a datagram into a complete TPKT telegram.
pub fn encode<D: Datagram>(datagram: &D, pdu_ref: u16) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(ISO_HEADER_SIZE + D::MIN_SIZE);
    buf.put_bytes(0, ISO_HEADER_SIZE);
    datagram.encode_pdu(pdu_ref, &mut buf);

    let total = buf.len();
    if total > MAX_TPKT_LENGTH {
        return Err(S7Error::protocol(format!(
            "Telegram of {} bytes exceeds TPKT maximum",
            total
        )));
    }
    buf[..4].copy_from_slice(&encode_tpkt_header(total as u16));
    buf[4..ISO_HEADER_SIZE].copy_from_slice(&[0x02, tpdu::DATA, tpdu::EOT]);
    Ok(buf.freeze())
}

/// Encode only the S7 PDU of a datagram.
pub fn encode_pdu<D: Datagram>(datagram: &D, pdu_ref: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(D::MIN_SIZE);
    datagram.encode_pdu(pdu_ref, &mut buf);
    buf.freeze()
}

/// Decode a data frame as datagram `D`.
///
/// An ack with a non-zero error class/code yields `Plc`; any mismatch
/// (wrong kind, bad lengths, truncated sections) yields `MalformedResponse`.
pub fn decode<D: Datagram>(frame: &Frame) -> Result<D> {
    let header = frame.s7_header()?;
    if header.has_error() {
        return Err(S7Error::Plc {
            class: header.error_class,
            code: header.error_code,
        });
    }
    let length = header.pdu_length();
    if length < D::MIN_SIZE || length > D::MAX_SIZE {
        return Err(S7Error::malformed(format!(
            "{:?} PDU of {} bytes outside {}..={}",
            D::KIND,
            length,
            D::MIN_SIZE,
            D::MAX_SIZE
        )));
    }

    let param = frame.parameter(&header);
    let kind = MessageKind::classify(&header, param);
    if kind != D::KIND {
        return Err(S7Error::malformed(format!(
            "Expected {:?}, got {:?}",
            D::KIND,
            kind
        )));
    }

    D::decode_pdu(&header, param, frame.data_section(&header))
}

/// Write an S7 header whose lengths are patched once the sections are known.
pub(crate) struct PduWriter {
    start: usize,
    param_start: usize,
    data_start: Option<usize>,
}

impl PduWriter {
    /// Write a header with zero lengths; parameter bytes follow.
    pub(crate) fn begin(header: S7Header, dst: &mut BytesMut) -> Self {
        let start = dst.len();
        header.encode_into(dst);
        Self {
            start,
            param_start: dst.len(),
            data_start: None,
        }
    }

    /// Mark the end of the parameter section.
    pub(crate) fn data(&mut self, dst: &BytesMut) {
        self.data_start = Some(dst.len());
    }

    /// Patch the parameter and data lengths into the header.
    pub(crate) fn finish(self, dst: &mut BytesMut) {
        let data_start = self.data_start.unwrap_or(dst.len());
        let param_length = (data_start - self.param_start) as u16;
        let data_length = (dst.len() - data_start) as u16;
        dst[self.start + 6..self.start + 8].copy_from_slice(&param_length.to_be_bytes());
        dst[self.start + 8..self.start + 10].copy_from_slice(&data_length.to_be_bytes());
    }
}

/// Fail with `MalformedResponse` unless `buf` holds at least `needed` bytes.
#[inline]
pub(crate) fn ensure_len(buf: &[u8], needed: usize, what: &str) -> Result<()> {
    if buf.len() < needed {
        return Err(S7Error::malformed(format!(
            "{} needs {} bytes, got {}",
            what,
            needed,
            buf.len()
        )));
    }
    Ok(())
}
