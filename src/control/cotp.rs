//! COTP connection request and confirm TPDUs.
//!
//! ```text
//! TPKT(4) | LI | E0/D0 | dst-ref u16 | src-ref u16 | class | params...
//! params: C0 01 <tpdu size> | C1 02 <local TSAP> | C2 02 <remote TSAP>
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, S7Error};
use crate::protocol::{encode_tpkt_header, tpdu, Frame, TPKT_HEADER_SIZE};

/// TSAP of the calling side.
pub const LOCAL_TSAP: u16 = 0x0100;

/// TPDU size code for 1024 bytes.
pub const TPDU_SIZE_1024: u8 = 0x0A;

/// Fixed part after the length indicator: code, refs, class.
const FIXED_PART_SIZE: usize = 6;

/// Parameter codes.
pub mod param {
    pub const TPDU_SIZE: u8 = 0xC0;
    pub const SRC_TSAP: u8 = 0xC1;
    pub const DST_TSAP: u8 = 0xC2;
}

/// Parameters common to request and confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tpdu {
    dst_ref: u16,
    src_ref: u16,
    tpdu_size: Option<u8>,
    src_tsap: Option<u16>,
    dst_tsap: Option<u16>,
}

impl Tpdu {
    fn encode(&self, code: u8) -> Bytes {
        let mut params = BytesMut::with_capacity(11);
        if let Some(size) = self.tpdu_size {
            params.put_slice(&[param::TPDU_SIZE, 0x01, size]);
        }
        if let Some(tsap) = self.src_tsap {
            params.put_slice(&[param::SRC_TSAP, 0x02]);
            params.put_u16(tsap);
        }
        if let Some(tsap) = self.dst_tsap {
            params.put_slice(&[param::DST_TSAP, 0x02]);
            params.put_u16(tsap);
        }

        let li = FIXED_PART_SIZE + params.len();
        let total = TPKT_HEADER_SIZE + 1 + li;
        let mut buf = BytesMut::with_capacity(total);
        buf.put_slice(&encode_tpkt_header(total as u16));
        buf.put_u8(li as u8);
        buf.put_u8(code);
        buf.put_u16(self.dst_ref);
        buf.put_u16(self.src_ref);
        buf.put_u8(0x00);
        buf.put_slice(&params);
        buf.freeze()
    }

    fn decode(frame: &Frame, code: u8, what: &str) -> Result<Self> {
        if frame.tpdu_code != code {
            return Err(S7Error::protocol(format!(
                "Expected COTP {}, got TPDU 0x{:02X}",
                what, frame.tpdu_code
            )));
        }
        let variable = &frame.variable[..];
        if variable.len() < FIXED_PART_SIZE - 1 {
            return Err(S7Error::protocol(format!("Truncated COTP {}", what)));
        }

        let mut tpdu = Self {
            dst_ref: u16::from_be_bytes([variable[0], variable[1]]),
            src_ref: u16::from_be_bytes([variable[2], variable[3]]),
            tpdu_size: None,
            src_tsap: None,
            dst_tsap: None,
        };

        let mut params = &variable[FIXED_PART_SIZE - 1..];
        while !params.is_empty() {
            let [code, len, ..] = params else {
                return Err(S7Error::protocol(format!("Truncated parameter in COTP {}", what)));
            };
            let (code, len) = (*code, *len as usize);
            let value = params
                .get(2..2 + len)
                .ok_or_else(|| S7Error::protocol(format!("Truncated parameter in COTP {}", what)))?;
            match (code, value) {
                (param::TPDU_SIZE, [size]) => tpdu.tpdu_size = Some(*size),
                (param::SRC_TSAP, [hi, lo]) => tpdu.src_tsap = Some(u16::from_be_bytes([*hi, *lo])),
                (param::DST_TSAP, [hi, lo]) => tpdu.dst_tsap = Some(u16::from_be_bytes([*hi, *lo])),
                _ => tracing::debug!(code, len, "Ignoring COTP parameter"),
            }
            params = &params[2 + len..];
        }
        Ok(tpdu)
    }
}

/// COTP connection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub src_ref: u16,
    pub tpdu_size: u8,
    pub local_tsap: u16,
    pub remote_tsap: u16,
}

impl ConnectionRequest {
    /// Request towards `remote_tsap` from the default local TSAP.
    pub fn new(remote_tsap: u16) -> Self {
        Self {
            src_ref: 0x0001,
            tpdu_size: TPDU_SIZE_1024,
            local_tsap: LOCAL_TSAP,
            remote_tsap,
        }
    }

    /// Encode as a complete TPKT telegram.
    pub fn encode(&self) -> Bytes {
        Tpdu {
            dst_ref: 0,
            src_ref: self.src_ref,
            tpdu_size: Some(self.tpdu_size),
            src_tsap: Some(self.local_tsap),
            dst_tsap: Some(self.remote_tsap),
        }
        .encode(tpdu::CONNECTION_REQUEST)
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        let tpdu = Tpdu::decode(frame, tpdu::CONNECTION_REQUEST, "connection request")?;
        Ok(Self {
            src_ref: tpdu.src_ref,
            tpdu_size: tpdu.tpdu_size.unwrap_or(TPDU_SIZE_1024),
            local_tsap: tpdu.src_tsap.unwrap_or(LOCAL_TSAP),
            remote_tsap: tpdu
                .dst_tsap
                .ok_or_else(|| S7Error::protocol("Connection request without remote TSAP"))?,
        })
    }
}

/// COTP connection confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfirm {
    pub dst_ref: u16,
    pub src_ref: u16,
    pub tpdu_size: Option<u8>,
}

impl ConnectionConfirm {
    /// Confirm answering `request`.
    pub fn answer(request: &ConnectionRequest) -> Self {
        Self {
            dst_ref: request.src_ref,
            src_ref: 0x0044,
            tpdu_size: Some(request.tpdu_size),
        }
    }

    pub fn encode(&self) -> Bytes {
        Tpdu {
            dst_ref: self.dst_ref,
            src_ref: self.src_ref,
            tpdu_size: self.tpdu_size,
            src_tsap: None,
            dst_tsap: None,
        }
        .encode(tpdu::CONNECTION_CONFIRM)
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        if frame.is_disconnect() {
            return Err(S7Error::protocol("PLC refused the connection request"));
        }
        let tpdu = Tpdu::decode(frame, tpdu::CONNECTION_CONFIRM, "connection confirm")?;
        Ok(Self {
            dst_ref: tpdu.dst_ref,
            src_ref: tpdu.src_ref,
            tpdu_size: tpdu.tpdu_size,
        })
    }
}
