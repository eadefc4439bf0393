//! Communication setup job.
//!
//! Negotiates the PDU size and the number of parallel jobs (AmQ). The
//! parameter section is identical in request and ack:
//! `F0 00 | max AmQ calling u16 | max AmQ called u16 | PDU size u16`.

use bytes::{BufMut, BytesMut};

use super::{ensure_len, function, Datagram, MessageKind, PduWriter, Request};
use crate::error::Result;
use crate::protocol::{rosctr, S7Header, ACK_HEADER_SIZE, JOB_HEADER_SIZE};

const PARAM_SIZE: usize = 8;

fn encode_param(calling: u16, called: u16, pdu_size: u16, dst: &mut BytesMut) {
    dst.put_u8(function::SETUP_COMMUNICATION);
    dst.put_u8(0x00);
    dst.put_u16(calling);
    dst.put_u16(called);
    dst.put_u16(pdu_size);
}

fn decode_param(param: &[u8]) -> Result<(u16, u16, u16)> {
    ensure_len(param, PARAM_SIZE, "Communication setup parameter")?;
    Ok((
        u16::from_be_bytes([param[2], param[3]]),
        u16::from_be_bytes([param[4], param[5]]),
        u16::from_be_bytes([param[6], param[7]]),
    ))
}

/// Communication setup request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommunicationSetup {
    /// Parallel jobs we want to issue.
    pub max_amq_calling: u16,
    /// Parallel jobs we accept.
    pub max_amq_called: u16,
    /// Requested PDU size.
    pub pdu_size: u16,
}

impl CommunicationSetup {
    pub fn new(max_amq_calling: u16, max_amq_called: u16, pdu_size: u16) -> Self {
        Self {
            max_amq_calling,
            max_amq_called,
            pdu_size,
        }
    }
}

impl Datagram for CommunicationSetup {
    const KIND: MessageKind = MessageKind::CommunicationSetup;
    const MIN_SIZE: usize = JOB_HEADER_SIZE + PARAM_SIZE;
    const MAX_SIZE: usize = JOB_HEADER_SIZE + PARAM_SIZE;

    fn encode_pdu(&self, pdu_ref: u16, dst: &mut BytesMut) {
        let writer = PduWriter::begin(S7Header::new(rosctr::JOB, pdu_ref, 0, 0), dst);
        encode_param(
            self.max_amq_calling,
            self.max_amq_called,
            self.pdu_size,
            dst,
        );
        writer.finish(dst);
    }

    fn decode_pdu(_header: &S7Header, param: &[u8], _data: &[u8]) -> Result<Self> {
        let (calling, called, pdu_size) = decode_param(param)?;
        Ok(Self::new(calling, called, pdu_size))
    }
}

impl Request for CommunicationSetup {
    type Response = CommunicationSetupAck;
}

/// Communication setup ack with the values granted by the PLC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommunicationSetupAck {
    /// Parallel jobs the PLC accepts from us.
    pub max_amq_calling: u16,
    /// Parallel jobs the PLC may issue to us.
    pub max_amq_called: u16,
    /// Negotiated PDU size.
    pub pdu_size: u16,
}

impl CommunicationSetupAck {
    pub fn new(max_amq_calling: u16, max_amq_called: u16, pdu_size: u16) -> Self {
        Self {
            max_amq_calling,
            max_amq_called,
            pdu_size,
        }
    }
}

impl Datagram for CommunicationSetupAck {
    const KIND: MessageKind = MessageKind::CommunicationSetupAck;
    const MIN_SIZE: usize = ACK_HEADER_SIZE + PARAM_SIZE;
    const MAX_SIZE: usize = ACK_HEADER_SIZE + PARAM_SIZE;

    fn encode_pdu(&self, pdu_ref: u16, dst: &mut BytesMut) {
        let writer = PduWriter::begin(S7Header::new(rosctr::ACK_DATA, pdu_ref, 0, 0), dst);
        encode_param(
            self.max_amq_calling,
            self.max_amq_called,
            self.pdu_size,
            dst,
        );
        writer.finish(dst);
    }

    fn decode_pdu(_header: &S7Header, param: &[u8], _data: &[u8]) -> Result<Self> {
        let (calling, called, pdu_size) = decode_param(param)?;
        Ok(Self::new(calling, called, pdu_size))
    }
}
