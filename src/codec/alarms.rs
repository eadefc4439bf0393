//! Alarm userdata messages.
//!
//! Three services of the CPU function group:
//! - pending-alarm query (subfunction 0x13), answered in one or more data
//!   units that together form an alarm listing
//! - alarm update enable/disable through the message service (0x02)
//! - unsolicited alarm indications pushed while updates are enabled
//!
//! The alarm listing reassembled from all data units looks like:
//! ```text
//! ┌────────┬──────┬─────────────┬──────────────────┬─────────────────┐
//! │ format │ 0x00 │ entries u16 │ remaining len u16│ entries ...     │
//! └────────┴──────┴─────────────┴──────────────────┴─────────────────┘
//! ```
//! and every entry:
//! ```text
//! ┌─────┬──────┬────────────┬────────┬───────┬────────┬───────┬────────────┐
//! │ len │ type │ msg no u32 │ id u16 │ state │ ack in │ ack out│ values ... │
//! └─────┴──────┴────────────┴────────┴───────┴────────┴───────┴────────────┘
//! ```
//! where `len` counts the bytes after itself.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::userdata::{
    UserDataParam, UserDataTail, GROUP_CPU, METHOD_REQUEST, METHOD_RESPONSE, MORE_DATA_UNITS,
    PARAM_SIZE, PARAM_SIZE_WITH_TAIL, TYPE_PUSH,
};
use super::{
    ensure_len, return_code, subfunction, DataItem, Datagram, MessageKind, PduWriter, Request,
};
use crate::error::{Result, S7Error};
use crate::protocol::{rosctr, S7Header, JOB_HEADER_SIZE};

/// Size of the alarm listing header.
pub const LISTING_HEADER_SIZE: usize = 6;

/// Smallest value of an entry's length byte.
pub const MIN_ENTRY_LENGTH: usize = 10;

/// Query object selecting all pending ALARM_S messages.
pub const ALARM_QUERY: [u8; 12] = [
    0x00, 0x01, 0x12, 0x08, 0x1A, 0x00, 0x01, 0x34, 0x00, 0x00, 0x00, 0x04,
];

/// Event mask enabling alarm updates.
pub const EVENTS_ENABLE: u8 = 0x86;

/// Event mask disabling alarm updates.
pub const EVENTS_DISABLE: u8 = 0x00;

/// Alarm type requested by the message service.
pub const ALARM_TYPE_ALARM_S: u8 = 0x08;

/// Station name sent with the message service request.
pub const USERNAME: &[u8; 8] = b"S7WIRE  ";

/// One alarm as reported by the PLC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlcAlarm {
    pub alarm_type: u8,
    pub msg_number: u32,
    pub id: u16,
    /// Bit 0 set while the alarm is coming.
    pub event_state: u8,
    pub ack_state_coming: u8,
    pub ack_state_going: u8,
    pub associated_values: Vec<u8>,
}

impl PlcAlarm {
    /// Alarm is currently active.
    #[inline]
    pub fn is_coming(&self) -> bool {
        self.event_state & 0x01 != 0
    }

    /// The current transition has been acknowledged.
    #[inline]
    pub fn is_ack(&self) -> bool {
        let state = if self.is_coming() {
            self.ack_state_coming
        } else {
            self.ack_state_going
        };
        state & 0x01 != 0
    }

    /// Encoded entry size, length byte included.
    pub fn encoded_len(&self) -> usize {
        1 + MIN_ENTRY_LENGTH + self.associated_values.len()
    }

    /// Append the entry to `dst`.
    ///
    /// Fails with `Protocol` when the associated values overflow the
    /// entry's length byte.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<()> {
        let length = u8::try_from(MIN_ENTRY_LENGTH + self.associated_values.len()).map_err(|_| {
            S7Error::protocol(format!(
                "Alarm {} carries {} associated value bytes, at most {}",
                self.id,
                self.associated_values.len(),
                u8::MAX as usize - MIN_ENTRY_LENGTH
            ))
        })?;
        dst.put_u8(length);
        dst.put_u8(self.alarm_type);
        dst.put_u32(self.msg_number);
        dst.put_u16(self.id);
        dst.put_u8(self.event_state);
        dst.put_u8(self.ack_state_coming);
        dst.put_u8(self.ack_state_going);
        dst.put_slice(&self.associated_values);
        Ok(())
    }

    /// Decode one entry, returning it and the bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        ensure_len(buf, 1, "Alarm entry")?;
        let length = buf[0] as usize;
        if length < MIN_ENTRY_LENGTH {
            return Err(S7Error::malformed(format!(
                "Alarm entry length {} below minimum {}",
                length, MIN_ENTRY_LENGTH
            )));
        }
        ensure_len(buf, 1 + length, "Alarm entry")?;
        let alarm = Self {
            alarm_type: buf[1],
            msg_number: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            id: u16::from_be_bytes([buf[6], buf[7]]),
            event_state: buf[8],
            ack_state_coming: buf[9],
            ack_state_going: buf[10],
            associated_values: buf[11..1 + length].to_vec(),
        };
        Ok((alarm, 1 + length))
    }
}

fn decode_entries(mut buf: &[u8], count: usize) -> Result<Vec<PlcAlarm>> {
    let mut alarms = Vec::with_capacity(count);
    for _ in 0..count {
        let (alarm, consumed) = PlcAlarm::decode(buf)?;
        alarms.push(alarm);
        buf = &buf[consumed..];
    }
    if !buf.is_empty() {
        return Err(S7Error::malformed(format!(
            "{} trailing bytes after {} alarm entries",
            buf.len(),
            count
        )));
    }
    Ok(alarms)
}

/// Total listing length announced by the first data unit.
pub fn listing_total_length(first_unit: &[u8]) -> Result<usize> {
    ensure_len(first_unit, LISTING_HEADER_SIZE, "Alarm listing header")?;
    Ok(u16::from_be_bytes([first_unit[4], first_unit[5]]) as usize + LISTING_HEADER_SIZE)
}

/// Decode a complete alarm listing.
pub fn decode_alarm_listing(listing: &[u8]) -> Result<Vec<PlcAlarm>> {
    let total = listing_total_length(listing)?;
    if listing.len() != total {
        return Err(S7Error::malformed(format!(
            "Alarm listing announces {} bytes, got {}",
            total,
            listing.len()
        )));
    }
    let count = u16::from_be_bytes([listing[2], listing[3]]) as usize;
    decode_entries(&listing[LISTING_HEADER_SIZE..], count)
}

/// Encode an alarm listing (header plus entries).
///
/// Fails with `Protocol` when the entry count or the body length do not
/// fit their u16 fields.
pub fn encode_alarm_listing(alarms: &[PlcAlarm]) -> Result<Bytes> {
    let body: usize = alarms.iter().map(PlcAlarm::encoded_len).sum();
    let count = u16::try_from(alarms.len()).map_err(|_| {
        S7Error::protocol(format!("{} alarms exceed the listing maximum", alarms.len()))
    })?;
    let body_length = u16::try_from(body).map_err(|_| {
        S7Error::protocol(format!("Alarm listing body of {} bytes exceeds u16", body))
    })?;

    let mut buf = BytesMut::with_capacity(LISTING_HEADER_SIZE + body);
    buf.put_u8(0x00);
    buf.put_u8(0x00);
    buf.put_u16(count);
    buf.put_u16(body_length);
    for alarm in alarms {
        alarm.encode_into(&mut buf)?;
    }
    Ok(buf.freeze())
}

fn expect_param(param: &[u8], kind: MessageKind) -> Result<UserDataParam> {
    let param = UserDataParam::decode(param)?;
    if param.kind() != kind {
        return Err(S7Error::malformed(format!(
            "Expected {:?} parameter, got {:?}",
            kind,
            param.kind()
        )));
    }
    Ok(param)
}

fn decode_optional_item(data: &[u8]) -> Result<Option<DataItem>> {
    if data.is_empty() {
        return Ok(None);
    }
    let (item, consumed) = DataItem::decode(data, false)?;
    if consumed != data.len() {
        return Err(S7Error::malformed("Trailing bytes after userdata item"));
    }
    Ok(Some(item))
}

fn encode_userdata(
    pdu_ref: u16,
    param: &UserDataParam,
    item: Option<&DataItem>,
    dst: &mut BytesMut,
) {
    let mut writer = PduWriter::begin(S7Header::new(rosctr::USER_DATA, pdu_ref, 0, 0), dst);
    param.encode_into(dst);
    writer.data(dst);
    if let Some(item) = item {
        item.encode_into(dst, false);
    }
    writer.finish(dst);
}

/// Pending-alarm query: either the start of a query or a follow-up asking
/// for the next data unit of a running one.
///
/// Decoding keeps the parameter and item as received, so re-encoding
/// reproduces the telegram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAlarmsRequest {
    param: UserDataParam,
    item: Option<DataItem>,
}

impl PendingAlarmsRequest {
    /// First request of a query.
    pub fn start() -> Self {
        Self {
            param: UserDataParam::cpu_request(subfunction::ALARM_QUERY, 0),
            item: Some(DataItem::octets(Bytes::from_static(&ALARM_QUERY))),
        }
    }

    /// Follow-up request echoing the sequence number of the last ack.
    pub fn follow_up(sequence_number: u8) -> Self {
        let mut param = UserDataParam::cpu_request(subfunction::ALARM_QUERY, sequence_number);
        param.method = METHOD_RESPONSE;
        param.tail = Some(UserDataTail::default());
        Self {
            param,
            item: Some(DataItem::failed(return_code::OBJECT_DOES_NOT_EXIST)),
        }
    }

    pub fn sequence_number(&self) -> u8 {
        self.param.sequence_number
    }

    /// Asks for the next data unit of a running query.
    pub fn is_follow_up(&self) -> bool {
        self.param.tail.is_some()
    }
}

impl Datagram for PendingAlarmsRequest {
    const KIND: MessageKind = MessageKind::PendingAlarmsRequest;
    const MIN_SIZE: usize = JOB_HEADER_SIZE + PARAM_SIZE;

    fn encode_pdu(&self, pdu_ref: u16, dst: &mut BytesMut) {
        encode_userdata(pdu_ref, &self.param, self.item.as_ref(), dst);
    }

    fn decode_pdu(_header: &S7Header, param: &[u8], data: &[u8]) -> Result<Self> {
        Ok(Self {
            param: expect_param(param, Self::KIND)?,
            item: decode_optional_item(data)?,
        })
    }
}

impl Request for PendingAlarmsRequest {
    type Response = PendingAlarmsAck;
}

/// One data unit of the pending-alarm listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAlarmsAck {
    param: UserDataParam,
    item: Option<DataItem>,
}

impl PendingAlarmsAck {
    /// Data unit carrying `fragment` of the listing.
    pub fn fragment(sequence_number: u8, has_more: bool, fragment: impl Into<Bytes>) -> Self {
        let tail = UserDataTail {
            data_unit_ref: 0,
            last_data_unit: if has_more { MORE_DATA_UNITS } else { 0x00 },
            error_code: 0,
        };
        Self {
            param: UserDataParam::cpu_response(subfunction::ALARM_QUERY, sequence_number, tail),
            item: Some(DataItem::octets(fragment)),
        }
    }

    /// Data unit reporting `error_code` instead of listing bytes.
    pub fn error(sequence_number: u8, error_code: u16) -> Self {
        let tail = UserDataTail {
            error_code,
            ..UserDataTail::default()
        };
        Self {
            param: UserDataParam::cpu_response(subfunction::ALARM_QUERY, sequence_number, tail),
            item: None,
        }
    }

    pub fn sequence_number(&self) -> u8 {
        self.param.sequence_number
    }

    pub fn data_unit_ref(&self) -> u8 {
        self.param.tail.map(|tail| tail.data_unit_ref).unwrap_or(0)
    }

    /// More data units follow this one.
    pub fn has_more(&self) -> bool {
        self.param.has_more()
    }

    pub fn error_code(&self) -> u16 {
        self.param.error_code()
    }

    /// Listing bytes of this data unit.
    pub fn payload(&self) -> &[u8] {
        self.item.as_ref().map(|item| &item.data[..]).unwrap_or(&[])
    }

    /// Fail on a userdata error code or a failed item.
    pub fn check(&self) -> Result<()> {
        check_userdata(self.error_code(), self.item.as_ref())
    }
}

impl Datagram for PendingAlarmsAck {
    const KIND: MessageKind = MessageKind::PendingAlarmsAck;
    const MIN_SIZE: usize = JOB_HEADER_SIZE + PARAM_SIZE_WITH_TAIL;

    fn encode_pdu(&self, pdu_ref: u16, dst: &mut BytesMut) {
        encode_userdata(pdu_ref, &self.param, self.item.as_ref(), dst);
    }

    fn decode_pdu(_header: &S7Header, param: &[u8], data: &[u8]) -> Result<Self> {
        let param = expect_param(param, Self::KIND)?;
        if param.tail.is_none() {
            return Err(S7Error::malformed("Pending alarms ack without response tail"));
        }
        Ok(Self {
            param,
            item: decode_optional_item(data)?,
        })
    }
}

/// Enable or disable alarm update indications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmUpdateRequest {
    param: UserDataParam,
    item: DataItem,
}

impl AlarmUpdateRequest {
    /// Request switching alarm updates on or off.
    pub fn new(enable: bool) -> Self {
        let mut data = BytesMut::with_capacity(12);
        data.put_u8(if enable { EVENTS_ENABLE } else { EVENTS_DISABLE });
        data.put_u8(0x00);
        data.put_slice(USERNAME);
        data.put_u8(ALARM_TYPE_ALARM_S);
        data.put_u8(0x00);
        Self {
            param: UserDataParam::cpu_request(subfunction::MESSAGE_SERVICE, 0),
            item: DataItem::octets(data.freeze()),
        }
    }

    /// True when the request switches updates on.
    pub fn enables_updates(&self) -> bool {
        self.item
            .data
            .first()
            .is_some_and(|events| *events != EVENTS_DISABLE)
    }
}

impl Datagram for AlarmUpdateRequest {
    const KIND: MessageKind = MessageKind::AlarmUpdateRequest;
    const MIN_SIZE: usize = JOB_HEADER_SIZE + PARAM_SIZE;

    fn encode_pdu(&self, pdu_ref: u16, dst: &mut BytesMut) {
        encode_userdata(pdu_ref, &self.param, Some(&self.item), dst);
    }

    fn decode_pdu(_header: &S7Header, param: &[u8], data: &[u8]) -> Result<Self> {
        let param = expect_param(param, Self::KIND)?;
        let item = decode_optional_item(data)?
            .ok_or_else(|| S7Error::malformed("Alarm update request without data"))?;
        ensure_len(&item.data, 1, "Alarm update events")?;
        Ok(Self { param, item })
    }
}

impl Request for AlarmUpdateRequest {
    type Response = AlarmUpdateAck;
}

/// Ack of an alarm update request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmUpdateAck {
    param: UserDataParam,
    item: Option<DataItem>,
}

impl AlarmUpdateAck {
    /// Successful ack with the given result byte.
    pub fn accepted(result: u8) -> Self {
        Self {
            param: UserDataParam::cpu_response(
                subfunction::MESSAGE_SERVICE,
                0,
                UserDataTail::default(),
            ),
            item: Some(DataItem::octets(vec![result, 0x00])),
        }
    }

    pub fn sequence_number(&self) -> u8 {
        self.param.sequence_number
    }

    pub fn error_code(&self) -> u16 {
        self.param.error_code()
    }

    /// Result byte reported by the PLC.
    pub fn result(&self) -> Option<u8> {
        self.item.as_ref().and_then(|item| item.data.first().copied())
    }

    /// Fail on a userdata error code or a failed item.
    pub fn check(&self) -> Result<()> {
        check_userdata(self.error_code(), self.item.as_ref())
    }
}

impl Datagram for AlarmUpdateAck {
    const KIND: MessageKind = MessageKind::AlarmUpdateAck;
    const MIN_SIZE: usize = JOB_HEADER_SIZE + PARAM_SIZE_WITH_TAIL;

    fn encode_pdu(&self, pdu_ref: u16, dst: &mut BytesMut) {
        encode_userdata(pdu_ref, &self.param, self.item.as_ref(), dst);
    }

    fn decode_pdu(_header: &S7Header, param: &[u8], data: &[u8]) -> Result<Self> {
        Ok(Self {
            param: expect_param(param, Self::KIND)?,
            item: decode_optional_item(data)?,
        })
    }
}

/// Unsolicited alarm indication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmIndication {
    param: UserDataParam,
    item: DataItem,
    alarms: Vec<PlcAlarm>,
}

impl AlarmIndication {
    /// ALARM_S indication carrying `alarms`.
    ///
    /// Fails with `Protocol` when the alarms do not fit the entry count
    /// or an entry's length byte.
    pub fn new(alarms: Vec<PlcAlarm>) -> Result<Self> {
        let count = u8::try_from(alarms.len()).map_err(|_| {
            S7Error::protocol(format!(
                "{} alarms exceed the indication maximum of {}",
                alarms.len(),
                u8::MAX
            ))
        })?;
        let mut data = BytesMut::new();
        data.put_u8(count);
        for alarm in &alarms {
            alarm.encode_into(&mut data)?;
        }
        let param = UserDataParam {
            method: METHOD_REQUEST,
            type_code: TYPE_PUSH,
            group: GROUP_CPU,
            subfunction: subfunction::ALARM_S_INDICATION,
            sequence_number: 0,
            tail: None,
        };
        Ok(Self {
            param,
            item: DataItem::octets(data.freeze()),
            alarms,
        })
    }

    pub fn alarms(&self) -> &[PlcAlarm] {
        &self.alarms
    }

    pub fn into_alarms(self) -> Vec<PlcAlarm> {
        self.alarms
    }

    /// ALARM_S or ALARM_SQ.
    pub fn subfunction(&self) -> u8 {
        self.param.subfunction
    }

    pub fn sequence_number(&self) -> u8 {
        self.param.sequence_number
    }
}

impl Datagram for AlarmIndication {
    const KIND: MessageKind = MessageKind::AlarmIndication;
    const MIN_SIZE: usize = JOB_HEADER_SIZE + PARAM_SIZE;

    fn encode_pdu(&self, pdu_ref: u16, dst: &mut BytesMut) {
        encode_userdata(pdu_ref, &self.param, Some(&self.item), dst);
    }

    fn decode_pdu(_header: &S7Header, param: &[u8], data: &[u8]) -> Result<Self> {
        let param = expect_param(param, Self::KIND)?;
        let item = decode_optional_item(data)?
            .ok_or_else(|| S7Error::malformed("Alarm indication without data"))?;
        ensure_len(&item.data, 1, "Alarm indication count")?;
        let alarms = decode_entries(&item.data[1..], item.data[0] as usize)?;
        Ok(Self {
            param,
            item,
            alarms,
        })
    }
}

fn check_userdata(error_code: u16, item: Option<&DataItem>) -> Result<()> {
    if error_code != 0 {
        let [class, code] = error_code.to_be_bytes();
        return Err(S7Error::Plc { class, code });
    }
    match item {
        Some(item) if !item.is_ok() => Err(S7Error::ItemFailed {
            return_code: item.return_code,
        }),
        _ => Ok(()),
    }
}
