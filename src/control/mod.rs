//! Control plane - connection setup before any job is issued.
//!
//! # Workflow
//!
//! 1. Client sends a COTP connection request carrying the TSAPs
//! 2. PLC answers with a connection confirm (or a disconnect request)
//! 3. Client sends the S7 communication setup job
//! 4. PLC acks with its PDU size and parallel job count
//! 5. Jobs and userdata flow on the data TPDUs

mod cotp;
mod handshake;

pub use cotp::{param, ConnectionConfirm, ConnectionRequest, LOCAL_TSAP, TPDU_SIZE_1024};
pub use handshake::{negotiate, Negotiated};
