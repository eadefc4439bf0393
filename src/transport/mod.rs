//! Transport module - the TCP byte stream under ISO-on-TCP.

mod tcp;

pub use tcp::{Endpoint, TcpTransport, TransportOptions};
