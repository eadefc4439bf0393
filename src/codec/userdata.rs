//! Userdata parameter section.
//!
//! ```text
//! ┌──────────┬─────┬────────┬──────────────┬─────────────┬─────┬──────────────────────────────┐
//! │ 00 01 12 │ len │ method │ type │ group │ subfunction │ seq │ [dur, last unit, error u16]  │
//! └──────────┴─────┴────────┴──────────────┴─────────────┴─────┴──────────────────────────────┘
//! ```
//!
//! `len` counts the bytes after it: 4 for a plain request, 8 when the
//! response tail (data unit reference, last-data-unit flag, error code) is
//! present.

use bytes::{BufMut, BytesMut};

use super::{ensure_len, MessageKind};
use crate::error::{Result, S7Error};

/// Fixed head of every userdata parameter.
pub const PARAM_HEAD: [u8; 3] = [0x00, 0x01, 0x12];

/// Parameter size without the response tail.
pub const PARAM_SIZE: usize = 8;

/// Parameter size with the response tail.
pub const PARAM_SIZE_WITH_TAIL: usize = 12;

/// Method byte of a request.
pub const METHOD_REQUEST: u8 = 0x11;

/// Method byte of a response or follow-up request.
pub const METHOD_RESPONSE: u8 = 0x12;

/// Type nibble: unsolicited push.
pub const TYPE_PUSH: u8 = 0x0;

/// Type nibble: request.
pub const TYPE_REQUEST: u8 = 0x4;

/// Type nibble: response.
pub const TYPE_RESPONSE: u8 = 0x8;

/// Function group: CPU functions.
pub const GROUP_CPU: u8 = 0x4;

/// `last data unit` value announcing more fragments.
pub const MORE_DATA_UNITS: u8 = 0x01;

/// CPU group subfunctions.
pub mod subfunction {
    /// Message service (alarm update enable/disable).
    pub const MESSAGE_SERVICE: u8 = 0x02;
    /// ALARM_SQ indication.
    pub const ALARM_SQ_INDICATION: u8 = 0x11;
    /// ALARM_S indication.
    pub const ALARM_S_INDICATION: u8 = 0x12;
    /// Pending-alarm query.
    pub const ALARM_QUERY: u8 = 0x13;
}

/// Response tail of a userdata parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UserDataTail {
    /// Data unit reference.
    pub data_unit_ref: u8,
    /// `0x01` while more data units follow, `0x00` on the last one.
    pub last_data_unit: u8,
    /// Error code, zero on success.
    pub error_code: u16,
}

/// Decoded userdata parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserDataParam {
    pub method: u8,
    /// Type nibble (push, request, response).
    pub type_code: u8,
    /// Function group nibble.
    pub group: u8,
    pub subfunction: u8,
    pub sequence_number: u8,
    pub tail: Option<UserDataTail>,
}

impl UserDataParam {
    /// A CPU-group request parameter.
    pub fn cpu_request(subfunction: u8, sequence_number: u8) -> Self {
        Self {
            method: METHOD_REQUEST,
            type_code: TYPE_REQUEST,
            group: GROUP_CPU,
            subfunction,
            sequence_number,
            tail: None,
        }
    }

    /// A CPU-group response parameter.
    pub fn cpu_response(subfunction: u8, sequence_number: u8, tail: UserDataTail) -> Self {
        Self {
            method: METHOD_RESPONSE,
            type_code: TYPE_RESPONSE,
            group: GROUP_CPU,
            subfunction,
            sequence_number,
            tail: Some(tail),
        }
    }

    /// True when more data units follow this one.
    #[inline]
    pub fn has_more(&self) -> bool {
        self.tail
            .is_some_and(|tail| tail.last_data_unit == MORE_DATA_UNITS)
    }

    /// Error code of the tail, zero without tail.
    #[inline]
    pub fn error_code(&self) -> u16 {
        self.tail.map(|tail| tail.error_code).unwrap_or(0)
    }

    /// Message kind this parameter announces.
    pub fn kind(&self) -> MessageKind {
        if self.group != GROUP_CPU {
            return MessageKind::Unknown;
        }
        match (self.type_code, self.subfunction) {
            (TYPE_REQUEST, subfunction::ALARM_QUERY) => MessageKind::PendingAlarmsRequest,
            (TYPE_REQUEST, subfunction::MESSAGE_SERVICE) => MessageKind::AlarmUpdateRequest,
            (TYPE_RESPONSE, subfunction::ALARM_QUERY) => MessageKind::PendingAlarmsAck,
            (TYPE_RESPONSE, subfunction::MESSAGE_SERVICE) => MessageKind::AlarmUpdateAck,
            (
                TYPE_PUSH,
                subfunction::ALARM_S_INDICATION | subfunction::ALARM_SQ_INDICATION,
            ) => MessageKind::AlarmIndication,
            _ => MessageKind::Unknown,
        }
    }

    /// Append the parameter to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.put_slice(&PARAM_HEAD);
        dst.put_u8(if self.tail.is_some() { 8 } else { 4 });
        dst.put_u8(self.method);
        dst.put_u8((self.type_code << 4) | (self.group & 0x0F));
        dst.put_u8(self.subfunction);
        dst.put_u8(self.sequence_number);
        if let Some(tail) = self.tail {
            dst.put_u8(tail.data_unit_ref);
            dst.put_u8(tail.last_data_unit);
            dst.put_u16(tail.error_code);
        }
    }

    /// Decode a userdata parameter section.
    pub fn decode(param: &[u8]) -> Result<Self> {
        ensure_len(param, PARAM_SIZE, "Userdata parameter")?;
        if param[..3] != PARAM_HEAD {
            return Err(S7Error::malformed("Invalid userdata parameter head"));
        }

        let tail = match param[3] {
            4 => None,
            8 => {
                ensure_len(param, PARAM_SIZE_WITH_TAIL, "Userdata parameter tail")?;
                Some(UserDataTail {
                    data_unit_ref: param[8],
                    last_data_unit: param[9],
                    error_code: u16::from_be_bytes([param[10], param[11]]),
                })
            }
            other => {
                return Err(S7Error::malformed(format!(
                    "Unsupported userdata parameter length {}",
                    other
                )))
            }
        };

        Ok(Self {
            method: param[4],
            type_code: param[5] >> 4,
            group: param[5] & 0x0F,
            subfunction: param[6],
            sequence_number: param[7],
            tail,
        })
    }
}
