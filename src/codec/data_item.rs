//! Data items of the S7 data section.
//!
//! ```text
//! ┌─────────────┬────────────────┬───────────────┬──────────────────────┐
//! │ return code │ transport size │ length u16 BE │ data (+ pad to even) │
//! └─────────────┴────────────────┴───────────────┴──────────────────────┘
//! ```
//!
//! The length field counts bits for the bit-oriented transport sizes and
//! bytes for everything else.

use bytes::{BufMut, Bytes, BytesMut};

use super::ensure_len;
use crate::error::{Result, S7Error};

/// Item return codes.
pub mod return_code {
    /// Reserved, used in requests.
    pub const RESERVED: u8 = 0x00;
    /// Hardware fault.
    pub const HARDWARE_FAULT: u8 = 0x01;
    /// Access to the object not allowed.
    pub const ACCESS_DENIED: u8 = 0x03;
    /// Address out of range.
    pub const INVALID_ADDRESS: u8 = 0x05;
    /// Data type not supported.
    pub const DATA_TYPE_NOT_SUPPORTED: u8 = 0x06;
    /// Data type inconsistent.
    pub const DATA_TYPE_INCONSISTENT: u8 = 0x07;
    /// Object does not exist.
    pub const OBJECT_DOES_NOT_EXIST: u8 = 0x0A;
    /// Success.
    pub const SUCCESS: u8 = 0xFF;
}

/// Transport sizes of the data section.
pub mod transport_size {
    /// No data (error items).
    pub const NULL: u8 = 0x00;
    /// Single bit, length in bits.
    pub const BIT: u8 = 0x03;
    /// Byte/word/dword, length in bits.
    pub const BYTE_WORD_DWORD: u8 = 0x04;
    /// Integer, length in bits.
    pub const INTEGER: u8 = 0x05;
    /// Real, length in bytes.
    pub const REAL: u8 = 0x07;
    /// Octet string, length in bytes.
    pub const OCTET_STRING: u8 = 0x09;

    /// Whether the length field of this transport size counts bits.
    #[inline]
    pub fn counts_bits(size: u8) -> bool {
        size == BYTE_WORD_DWORD || size == INTEGER
    }
}

/// Size of the item header (return code, transport size, length).
pub const DATA_ITEM_HEADER_SIZE: usize = 4;

/// One data item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataItem {
    /// Return code (`0xFF` on success, `0x00` in requests).
    pub return_code: u8,
    /// Transport size (see `transport_size` module).
    pub transport_size: u8,
    /// Item payload.
    pub data: Bytes,
}

impl DataItem {
    /// Create an item.
    pub fn new(return_code: u8, transport_size: u8, data: impl Into<Bytes>) -> Self {
        Self {
            return_code,
            transport_size,
            data: data.into(),
        }
    }

    /// A successful octet-string item.
    pub fn octets(data: impl Into<Bytes>) -> Self {
        Self::new(return_code::SUCCESS, transport_size::OCTET_STRING, data)
    }

    /// A failed item without payload.
    pub fn failed(code: u8) -> Self {
        Self::new(code, transport_size::NULL, Bytes::new())
    }

    /// Check for the success return code.
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.return_code == return_code::SUCCESS
    }

    /// Payload on success, `ItemFailed` otherwise.
    pub fn into_result(self) -> Result<Bytes> {
        if self.is_ok() {
            Ok(self.data)
        } else {
            Err(S7Error::ItemFailed {
                return_code: self.return_code,
            })
        }
    }

    /// Encoded size without padding.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        DATA_ITEM_HEADER_SIZE + self.data.len()
    }

    /// Append the item; `pad` adds a fill byte after odd-length payloads.
    pub fn encode_into(&self, dst: &mut BytesMut, pad: bool) {
        let length = if transport_size::counts_bits(self.transport_size) {
            self.data.len() * 8
        } else {
            self.data.len()
        };
        dst.put_u8(self.return_code);
        dst.put_u8(self.transport_size);
        dst.put_u16(length as u16);
        dst.put_slice(&self.data);
        if pad && self.data.len() % 2 == 1 {
            dst.put_u8(0x00);
        }
    }

    /// Decode one item from the start of `buf`.
    ///
    /// Returns the item and the bytes consumed, padding included when
    /// `pad` is set and the buffer holds the fill byte.
    pub fn decode(buf: &[u8], pad: bool) -> Result<(Self, usize)> {
        ensure_len(buf, DATA_ITEM_HEADER_SIZE, "Data item header")?;
        let return_code = buf[0];
        let size = buf[1];
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let bytes = if transport_size::counts_bits(size) {
            length.div_ceil(8)
        } else {
            length
        };

        let end = DATA_ITEM_HEADER_SIZE + bytes;
        ensure_len(buf, end, "Data item payload")?;
        let item = Self::new(return_code, size, Bytes::copy_from_slice(&buf[DATA_ITEM_HEADER_SIZE..end]));

        let consumed = if pad && bytes % 2 == 1 && buf.len() > end {
            end + 1
        } else {
            end
        };
        Ok((item, consumed))
    }
}

/// Encode a list of items, padding all but the last to even length.
pub(crate) fn encode_items<'a>(
    items: impl ExactSizeIterator<Item = &'a DataItem>,
    dst: &mut BytesMut,
) {
    let last = items.len().saturating_sub(1);
    for (index, item) in items.enumerate() {
        item.encode_into(dst, index != last);
    }
}

/// Decode exactly `count` items.
pub(crate) fn decode_items(mut buf: &[u8], count: usize) -> Result<Vec<DataItem>> {
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let (item, consumed) = DataItem::decode(buf, true)?;
        items.push(item);
        buf = &buf[consumed..];
    }
    if !buf.is_empty() {
        return Err(S7Error::malformed(format!(
            "{} trailing bytes after {} data items",
            buf.len(),
            count
        )));
    }
    Ok(items)
}
