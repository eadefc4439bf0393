//! # s7wire-client
//!
//! Async protocol engine for Siemens S7 PLCs over ISO-on-TCP.
//!
//! The crate speaks the S7 request/response protocol on one persistent TCP
//! connection: it frames TPKT/COTP telegrams, encodes jobs and userdata
//! requests, correlates responses by PDU reference, bounds the requests in
//! flight to what the PLC negotiated, reassembles multi-part alarm listings
//! and reconnects after a dropped connection.
//!
//! ## Architecture
//!
//! - **Control Plane**: COTP connect and S7 communication setup
//! - **Data Plane**: jobs, acks and userdata on COTP data TPDUs, one writer
//!   task and one receive task per connection
//!
//! ## Example
//!
//! ```ignore
//! use s7wire_client::codec::read_write::{Area, ItemAddress, WriteItem};
//! use s7wire_client::ClientBuilder;
//!
//! #[tokio::main]
//! async fn main() -> s7wire_client::Result<()> {
//!     let client = ClientBuilder::new().slot(1).open("192.168.0.10:102").await?;
//!
//!     client
//!         .write(vec![WriteItem::bit(Area::Flags, 0, 10, 3, true)])
//!         .await?;
//!     let values = client
//!         .read(vec![ItemAddress::bytes(Area::DataBlock, 5, 0, 8)])
//!         .await?;
//!
//!     let mut alarms = client.subscribe_alarms().await?;
//!     while let Ok(indication) = alarms.recv().await {
//!         println!("{:?} {:?}", values, indication.alarms());
//!     }
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod control;
pub mod correlation;
pub mod error;
pub mod gate;
pub mod protocol;
pub mod reassembly;
pub mod reference;
pub mod transport;
pub mod writer;

mod client;
mod subscription;

pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, ConnectionType};
pub use connection::ConnectionState;
pub use error::{Result, S7Error};
pub use subscription::AlarmSubscription;
