//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the ISO-on-TCP envelope of the data plane:
//! - TPKT and S7 header encoding/decoding
//! - Frame buffer for accumulating partial reads and COTP segments
//! - Frame struct with typed accessors
//! - Frame reader over an async byte stream
//! - Pooled buffers for multi-fragment transfers

mod buffer_pool;
mod frame;
mod frame_buffer;
mod reader;
mod wire_format;

pub use buffer_pool::{BufferPool, PooledBuffer, BUFFER_POOL_SIZE, MAX_RETAINED_CAPACITY};
pub use frame::{build_data_frame, encode_data_frame_into, Frame};
pub use frame_buffer::{FrameBuffer, DEFAULT_MAX_PDU_SIZE};
pub use reader::{FrameReader, DEFAULT_READ_BUFFER_SIZE};
pub use wire_format::{
    decode_tpkt_length, encode_tpkt_header, header_size, peek_pdu_ref, rosctr, tpdu, S7Header,
    ACK_HEADER_SIZE, COTP_DATA_HEADER_SIZE, DEFAULT_PDU_SIZE, ISO_HEADER_SIZE, JOB_HEADER_SIZE,
    MAX_TPKT_LENGTH, MIN_TPKT_LENGTH, PDU_REF_OFFSET, S7_PROTOCOL_ID, TPKT_HEADER_SIZE,
    TPKT_VERSION,
};
