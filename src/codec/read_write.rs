//! Read and write variable jobs.
//!
//! Items are addressed with the S7 any-pointer:
//! ```text
//! ┌──────┬──────┬────────┬──────┬───────────┬───────────┬──────┬─────────────────┐
//! │ 0x12 │ 0x0A │ syntax │ type │ count u16 │ DB no u16 │ area │ bit address u24 │
//! │      │      │ 0x10   │      │           │           │      │                 │
//! └──────┴──────┴────────┴──────┴───────────┴───────────┴──────┴─────────────────┘
//! ```

use bytes::{BufMut, BytesMut};

use super::data_item::{decode_items, encode_items, DATA_ITEM_HEADER_SIZE};
use super::{ensure_len, function, DataItem, Datagram, MessageKind, PduWriter, Request};
use crate::error::{Result, S7Error};
use crate::protocol::{rosctr, S7Header, ACK_HEADER_SIZE, JOB_HEADER_SIZE};

/// Encoded size of one any-pointer.
pub const ITEM_ADDRESS_SIZE: usize = 12;

/// Maximum items per read or write job.
pub const MAX_ITEMS: usize = 20;

const VAR_SPEC: u8 = 0x12;
const ADDRESS_LENGTH: u8 = 0x0A;
const SYNTAX_ANY: u8 = 0x10;

/// Memory area of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Area {
    Inputs,
    Outputs,
    Flags,
    DataBlock,
    Counters,
    Timers,
}

impl Area {
    /// Wire code.
    pub fn code(self) -> u8 {
        match self {
            Self::Inputs => 0x81,
            Self::Outputs => 0x82,
            Self::Flags => 0x83,
            Self::DataBlock => 0x84,
            Self::Counters => 0x1C,
            Self::Timers => 0x1D,
        }
    }
}

impl TryFrom<u8> for Area {
    type Error = S7Error;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            0x81 => Self::Inputs,
            0x82 => Self::Outputs,
            0x83 => Self::Flags,
            0x84 => Self::DataBlock,
            0x1C => Self::Counters,
            0x1D => Self::Timers,
            other => return Err(S7Error::malformed(format!("Unknown area 0x{:02X}", other))),
        })
    }
}

/// Element type of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemType {
    Bit,
    Byte,
    Char,
    Word,
    Int,
    DWord,
    DInt,
    Real,
    Counter,
    Timer,
}

impl ItemType {
    /// Wire code.
    pub fn code(self) -> u8 {
        match self {
            Self::Bit => 0x01,
            Self::Byte => 0x02,
            Self::Char => 0x03,
            Self::Word => 0x04,
            Self::Int => 0x05,
            Self::DWord => 0x06,
            Self::DInt => 0x07,
            Self::Real => 0x08,
            Self::Counter => 0x1C,
            Self::Timer => 0x1D,
        }
    }

    /// Size of one element in bytes.
    pub fn element_size(self) -> usize {
        match self {
            Self::Bit | Self::Byte | Self::Char => 1,
            Self::Word | Self::Int | Self::Counter | Self::Timer => 2,
            Self::DWord | Self::DInt | Self::Real => 4,
        }
    }

    /// Transport size used for this type in the data section.
    pub fn transport_size(self) -> u8 {
        use super::transport_size;
        match self {
            Self::Bit => transport_size::BIT,
            Self::Int | Self::DInt => transport_size::INTEGER,
            Self::Real => transport_size::REAL,
            Self::Counter | Self::Timer => transport_size::OCTET_STRING,
            _ => transport_size::BYTE_WORD_DWORD,
        }
    }
}

impl TryFrom<u8> for ItemType {
    type Error = S7Error;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            0x01 => Self::Bit,
            0x02 => Self::Byte,
            0x03 => Self::Char,
            0x04 => Self::Word,
            0x05 => Self::Int,
            0x06 => Self::DWord,
            0x07 => Self::DInt,
            0x08 => Self::Real,
            0x1C => Self::Counter,
            0x1D => Self::Timer,
            other => {
                return Err(S7Error::malformed(format!(
                    "Unknown item type 0x{:02X}",
                    other
                )))
            }
        })
    }
}

/// Any-pointer address of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemAddress {
    pub area: Area,
    /// Data block number, zero outside `DataBlock`.
    pub db_number: u16,
    pub item_type: ItemType,
    /// Number of elements.
    pub count: u16,
    /// Start address in bits (byte offset * 8 + bit).
    pub bit_address: u32,
}

impl ItemAddress {
    /// `length` bytes starting at byte `offset`.
    pub fn bytes(area: Area, db_number: u16, offset: u32, length: u16) -> Self {
        Self {
            area,
            db_number,
            item_type: ItemType::Byte,
            count: length,
            bit_address: offset << 3,
        }
    }

    /// A single bit.
    pub fn bit(area: Area, db_number: u16, offset: u32, bit: u8) -> Self {
        Self {
            area,
            db_number,
            item_type: ItemType::Bit,
            count: 1,
            bit_address: (offset << 3) | u32::from(bit & 0x07),
        }
    }

    /// Byte length of the addressed data.
    pub fn byte_length(&self) -> usize {
        self.item_type.element_size() * self.count as usize
    }

    fn encode_into(&self, dst: &mut BytesMut) {
        dst.put_u8(VAR_SPEC);
        dst.put_u8(ADDRESS_LENGTH);
        dst.put_u8(SYNTAX_ANY);
        dst.put_u8(self.item_type.code());
        dst.put_u16(self.count);
        dst.put_u16(self.db_number);
        dst.put_u8(self.area.code());
        let [_, hi, mid, lo] = self.bit_address.to_be_bytes();
        dst.put_slice(&[hi, mid, lo]);
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        ensure_len(buf, ITEM_ADDRESS_SIZE, "Item address")?;
        if buf[0] != VAR_SPEC || buf[1] != ADDRESS_LENGTH || buf[2] != SYNTAX_ANY {
            return Err(S7Error::malformed("Unsupported item address syntax"));
        }
        Ok(Self {
            item_type: ItemType::try_from(buf[3])?,
            count: u16::from_be_bytes([buf[4], buf[5]]),
            db_number: u16::from_be_bytes([buf[6], buf[7]]),
            area: Area::try_from(buf[8])?,
            bit_address: u32::from_be_bytes([0, buf[9], buf[10], buf[11]]),
        })
    }
}

fn encode_addresses<'a>(
    function: u8,
    addresses: impl ExactSizeIterator<Item = &'a ItemAddress>,
    dst: &mut BytesMut,
) {
    dst.put_u8(function);
    dst.put_u8(addresses.len() as u8);
    for address in addresses {
        address.encode_into(dst);
    }
}

fn decode_addresses(param: &[u8]) -> Result<Vec<ItemAddress>> {
    ensure_len(param, 2, "Item list")?;
    let count = param[1] as usize;
    let body = &param[2..];
    if body.len() != count * ITEM_ADDRESS_SIZE {
        return Err(S7Error::malformed(format!(
            "{} items need {} parameter bytes, got {}",
            count,
            count * ITEM_ADDRESS_SIZE,
            body.len()
        )));
    }
    body.chunks_exact(ITEM_ADDRESS_SIZE)
        .map(ItemAddress::decode)
        .collect()
}

fn item_count(param: &[u8]) -> Result<usize> {
    ensure_len(param, 2, "Ack parameter")?;
    Ok(param[1] as usize)
}

/// Read variable job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub items: Vec<ItemAddress>,
}

impl ReadRequest {
    pub fn new(items: Vec<ItemAddress>) -> Self {
        Self { items }
    }

    /// Bytes the ack will need, used to check against the PDU size.
    pub fn response_size(&self) -> usize {
        let data: usize = self
            .items
            .iter()
            .map(|item| DATA_ITEM_HEADER_SIZE + item.byte_length() + 1)
            .sum();
        ACK_HEADER_SIZE + 2 + data
    }
}

impl Datagram for ReadRequest {
    const KIND: MessageKind = MessageKind::ReadRequest;
    const MIN_SIZE: usize = JOB_HEADER_SIZE + 2;

    fn encode_pdu(&self, pdu_ref: u16, dst: &mut BytesMut) {
        let writer = PduWriter::begin(S7Header::new(rosctr::JOB, pdu_ref, 0, 0), dst);
        encode_addresses(function::READ_VAR, self.items.iter(), dst);
        writer.finish(dst);
    }

    fn decode_pdu(_header: &S7Header, param: &[u8], _data: &[u8]) -> Result<Self> {
        Ok(Self::new(decode_addresses(param)?))
    }
}

impl Request for ReadRequest {
    type Response = ReadAck;
}

/// Read variable ack, one data item per requested address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAck {
    pub items: Vec<DataItem>,
}

impl Datagram for ReadAck {
    const KIND: MessageKind = MessageKind::ReadAck;
    const MIN_SIZE: usize = ACK_HEADER_SIZE + 2;

    fn encode_pdu(&self, pdu_ref: u16, dst: &mut BytesMut) {
        let mut writer = PduWriter::begin(S7Header::new(rosctr::ACK_DATA, pdu_ref, 0, 0), dst);
        dst.put_u8(function::READ_VAR);
        dst.put_u8(self.items.len() as u8);
        writer.data(dst);
        encode_items(self.items.iter(), dst);
        writer.finish(dst);
    }

    fn decode_pdu(_header: &S7Header, param: &[u8], data: &[u8]) -> Result<Self> {
        Ok(Self {
            items: decode_items(data, item_count(param)?)?,
        })
    }
}

/// One item of a write job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteItem {
    pub address: ItemAddress,
    pub value: DataItem,
}

impl WriteItem {
    /// Write `data` as bytes starting at `offset`.
    pub fn bytes(area: Area, db_number: u16, offset: u32, data: impl Into<bytes::Bytes>) -> Self {
        let data = data.into();
        let address = ItemAddress::bytes(area, db_number, offset, data.len() as u16);
        Self {
            value: DataItem::new(
                super::return_code::RESERVED,
                super::transport_size::BYTE_WORD_DWORD,
                data,
            ),
            address,
        }
    }

    /// Write a single bit.
    pub fn bit(area: Area, db_number: u16, offset: u32, bit: u8, value: bool) -> Self {
        Self {
            address: ItemAddress::bit(area, db_number, offset, bit),
            value: DataItem::new(
                super::return_code::RESERVED,
                super::transport_size::BIT,
                vec![u8::from(value)],
            ),
        }
    }
}

/// Write variable job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub items: Vec<WriteItem>,
}

impl WriteRequest {
    pub fn new(items: Vec<WriteItem>) -> Self {
        Self { items }
    }
}

impl Datagram for WriteRequest {
    const KIND: MessageKind = MessageKind::WriteRequest;
    const MIN_SIZE: usize = JOB_HEADER_SIZE + 2;

    fn encode_pdu(&self, pdu_ref: u16, dst: &mut BytesMut) {
        let mut writer = PduWriter::begin(S7Header::new(rosctr::JOB, pdu_ref, 0, 0), dst);
        encode_addresses(
            function::WRITE_VAR,
            self.items.iter().map(|item| &item.address),
            dst,
        );
        writer.data(dst);
        encode_items(self.items.iter().map(|item| &item.value), dst);
        writer.finish(dst);
    }

    fn decode_pdu(_header: &S7Header, param: &[u8], data: &[u8]) -> Result<Self> {
        let addresses = decode_addresses(param)?;
        let values = decode_items(data, addresses.len())?;
        Ok(Self::new(
            addresses
                .into_iter()
                .zip(values)
                .map(|(address, value)| WriteItem { address, value })
                .collect(),
        ))
    }
}

impl Request for WriteRequest {
    type Response = WriteAck;
}

/// Result of one written item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteItemResult {
    pub return_code: u8,
}

impl WriteItemResult {
    /// `Ok` on success, `ItemFailed` otherwise.
    pub fn into_result(self) -> Result<()> {
        if self.return_code == super::return_code::SUCCESS {
            Ok(())
        } else {
            Err(S7Error::ItemFailed {
                return_code: self.return_code,
            })
        }
    }
}

/// Write variable ack, one return code per item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    pub items: Vec<WriteItemResult>,
}

impl Datagram for WriteAck {
    const KIND: MessageKind = MessageKind::WriteAck;
    const MIN_SIZE: usize = ACK_HEADER_SIZE + 2;

    fn encode_pdu(&self, pdu_ref: u16, dst: &mut BytesMut) {
        let mut writer = PduWriter::begin(S7Header::new(rosctr::ACK_DATA, pdu_ref, 0, 0), dst);
        dst.put_u8(function::WRITE_VAR);
        dst.put_u8(self.items.len() as u8);
        writer.data(dst);
        for item in &self.items {
            dst.put_u8(item.return_code);
        }
        writer.finish(dst);
    }

    fn decode_pdu(_header: &S7Header, param: &[u8], data: &[u8]) -> Result<Self> {
        let count = item_count(param)?;
        if data.len() != count {
            return Err(S7Error::malformed(format!(
                "Write ack for {} items carries {} return codes",
                count,
                data.len()
            )));
        }
        Ok(Self {
            items: data
                .iter()
                .map(|&return_code| WriteItemResult { return_code })
                .collect(),
        })
    }
}
