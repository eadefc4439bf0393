//! Client configuration.
//!
//! [`ClientConfig`] holds every tunable of a connection. It can be built in
//! code through [`ClientBuilder`](crate::ClientBuilder), or loaded from JSON:
//!
//! ```
//! use s7wire_client::config::{ClientConfig, ConnectionType};
//!
//! let config = ClientConfig::from_json(r#"{
//!     "host": "192.168.0.10",
//!     "connection_type": "op",
//!     "slot": 1,
//!     "request_timeout_ms": 2000
//! }"#).unwrap();
//!
//! assert_eq!(config.port, 102);
//! assert_eq!(config.connection_type, ConnectionType::Op);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, S7Error};
use crate::protocol::DEFAULT_PDU_SIZE;
use crate::writer::DEFAULT_CHANNEL_CAPACITY;

/// ISO-on-TCP port.
pub const DEFAULT_PORT: u16 = 102;

/// Smallest PDU size a PLC negotiates.
pub const MIN_PDU_SIZE: u16 = 240;

/// Kind of connection resource requested on the PLC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// Programming device.
    #[default]
    Pg,
    /// Operator panel.
    Op,
    /// Basic S7 communication.
    Basic,
}

impl ConnectionType {
    /// High byte of the remote TSAP.
    pub fn code(self) -> u16 {
        match self {
            Self::Pg => 0x01,
            Self::Op => 0x02,
            Self::Basic => 0x03,
        }
    }
}

/// Connection and runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub connection_type: ConnectionType,
    pub rack: u16,
    pub slot: u16,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub auto_reconnect: bool,
    pub reconnect_interval_ms: u64,
    /// TCP keep-alive on the PLC socket.
    pub keep_alive: bool,
    /// Parallel jobs requested during communication setup.
    pub max_jobs: u16,
    /// PDU size requested during communication setup.
    pub pdu_size: u16,
    /// Read buffer of the receive task.
    pub receive_buffer_size: usize,
    /// Queue depth of each alarm subscription.
    pub indication_queue_depth: usize,
    pub writer_channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connection_type: ConnectionType::Pg,
            rack: 0,
            slot: 2,
            connect_timeout_ms: 5000,
            request_timeout_ms: 5000,
            auto_reconnect: true,
            reconnect_interval_ms: 500,
            keep_alive: true,
            max_jobs: 10,
            pdu_size: DEFAULT_PDU_SIZE,
            receive_buffer_size: 64 * 1024,
            indication_queue_depth: 16,
            writer_channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the settings can be used for a connection.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(S7Error::Config("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(S7Error::Config("port must not be 0".into()));
        }
        if self.rack > 7 {
            return Err(S7Error::Config(format!("rack {} out of range 0..=7", self.rack)));
        }
        if self.slot > 31 {
            return Err(S7Error::Config(format!("slot {} out of range 0..=31", self.slot)));
        }
        if self.max_jobs == 0 {
            return Err(S7Error::Config("max_jobs must be at least 1".into()));
        }
        if self.pdu_size < MIN_PDU_SIZE {
            return Err(S7Error::Config(format!(
                "pdu_size {} below minimum {}",
                self.pdu_size, MIN_PDU_SIZE
            )));
        }
        if self.connect_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(S7Error::Config("timeouts must be non-zero".into()));
        }
        if self.receive_buffer_size == 0
            || self.indication_queue_depth == 0
            || self.writer_channel_capacity == 0
        {
            return Err(S7Error::Config("buffer sizes must be non-zero".into()));
        }
        Ok(())
    }

    /// Remote TSAP for this connection type, rack and slot.
    pub fn remote_tsap(&self) -> u16 {
        (self.connection_type.code() << 8) + self.rack * 0x20 + self.slot
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[inline]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[inline]
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}
