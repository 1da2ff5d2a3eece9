//! Connection, reader and writer configuration
//!
//! All three structs deserialize from JSON with every field optional, build
//! fluently with `with_*` methods, and are checked by `validate()`;
//! `from_json()` parses and validates in one step. `ConnectionManager::new`
//! refuses an invalid connection config. Durations are stored as integer
//! milliseconds.
//!
//! ```rust
//! use std::time::Duration;
//! use voltage_modbus_flow::ConnectionConfig;
//!
//! let config = ConnectionConfig::new("192.168.1.20", 502)
//!     .with_unit_id(3)
//!     .with_reconnect_timeout(Duration::from_secs(2));
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.socket_address(), "192.168.1.20:502");
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_RECONNECT_TIMEOUT_MS, DEFAULT_RESPONSE_TIMEOUT_MS, DEFAULT_TCP_PORT, DEFAULT_UNIT_ID,
    MAX_POLL_INTERVAL_MS, MAX_READ_COILS, MAX_READ_REGISTERS,
};
use crate::error::{ModbusError, ModbusResult};
use crate::request::{DataTypeTag, ReadDataType, WriteDataType};

/// Target device and reconnect policy. Immutable once a manager owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    /// Per-transaction response timeout (also bounds connect)
    pub timeout_ms: u64,
    /// Reconnect automatically after a disconnect
    pub reconnect: bool,
    /// Delay before each automatic reconnect attempt
    pub reconnect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_TCP_PORT,
            unit_id: DEFAULT_UNIT_ID,
            timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            reconnect: true,
            reconnect_timeout_ms: DEFAULT_RECONNECT_TIMEOUT_MS,
        }
    }
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable auto-reconnect with the given delay.
    pub fn with_reconnect_timeout(mut self, delay: Duration) -> Self {
        self.reconnect = true;
        self.reconnect_timeout_ms = delay.as_millis() as u64;
        self
    }

    /// Disable auto-reconnect; reconnects then happen only on request.
    pub fn without_reconnect(mut self) -> Self {
        self.reconnect = false;
        self
    }

    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.host.trim().is_empty() {
            return Err(ModbusError::configuration("host must not be empty"));
        }
        if self.port == 0 {
            return Err(ModbusError::configuration("port must not be 0"));
        }
        if self.timeout_ms == 0 {
            return Err(ModbusError::configuration("timeout_ms must be positive"));
        }
        if self.reconnect && self.reconnect_timeout_ms == 0 {
            return Err(ModbusError::configuration(
                "reconnect_timeout_ms must be positive when reconnect is enabled",
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

/// Unit of the default polling rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateUnit {
    #[default]
    Ms,
    S,
    M,
    H,
}

impl RateUnit {
    pub fn to_duration(self, rate: u64) -> Duration {
        match self {
            Self::Ms => Duration::from_millis(rate),
            Self::S => Duration::from_secs(rate),
            Self::M => Duration::from_secs(rate.saturating_mul(60)),
            Self::H => Duration::from_secs(rate.saturating_mul(3600)),
        }
    }
}

impl std::fmt::Display for RateUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ms => "ms",
            Self::S => "s",
            Self::M => "m",
            Self::H => "h",
        };
        f.write_str(s)
    }
}

/// Static configuration of a polling node; also the fallback for every
/// field a submitted loop spec leaves out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub name: String,
    /// Empty means "use the name"
    pub topic: String,
    pub data_type: DataTypeTag,
    pub address: i64,
    pub quantity: i64,
    /// Default loop rate; 0 disables the default loop
    pub rate: u64,
    pub rate_unit: RateUnit,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            topic: String::new(),
            data_type: ReadDataType::HoldingRegister.into(),
            address: 0,
            quantity: 1,
            rate: 0,
            rate_unit: RateUnit::Ms,
        }
    }
}

impl ReaderConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_data_type(mut self, data_type: impl Into<DataTypeTag>) -> Self {
        self.data_type = data_type.into();
        self
    }

    pub fn with_address(mut self, address: i64) -> Self {
        self.address = address;
        self
    }

    pub fn with_quantity(mut self, quantity: i64) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn with_rate(mut self, rate: u64, unit: RateUnit) -> Self {
        self.rate = rate;
        self.rate_unit = unit;
        self
    }

    /// Default loop interval, `None` when the default loop is disabled.
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.rate > 0).then(|| self.rate_unit.to_duration(self.rate))
    }

    /// Topic used when nothing more specific is given.
    pub fn default_topic(&self) -> &str {
        if self.topic.is_empty() {
            &self.name
        } else {
            &self.topic
        }
    }

    /// Check the fallback read and the default loop rate.
    pub fn validate(&self) -> ModbusResult<()> {
        if self.name.trim().is_empty() {
            return Err(ModbusError::configuration("reader name must not be empty"));
        }
        let data_type = self
            .data_type
            .resolve()
            .map_err(|e| ModbusError::configuration(e.to_string()))?;
        if !(0..=u16::MAX as i64).contains(&self.address) {
            return Err(ModbusError::configuration(format!(
                "address {} out of range 0-65535",
                self.address
            )));
        }
        let max = match data_type {
            ReadDataType::Coil | ReadDataType::Input => MAX_READ_COILS,
            ReadDataType::HoldingRegister | ReadDataType::InputRegister => MAX_READ_REGISTERS,
        };
        if !(1..=max as i64).contains(&self.quantity) {
            return Err(ModbusError::configuration(format!(
                "quantity {} out of range 1-{} for {}",
                self.quantity,
                max,
                data_type.name()
            )));
        }
        if let Some(interval) = self.poll_interval() {
            if interval > Duration::from_millis(MAX_POLL_INTERVAL_MS) {
                return Err(ModbusError::configuration(format!(
                    "rate {} {} exceeds {} ms",
                    self.rate, self.rate_unit, MAX_POLL_INTERVAL_MS
                )));
            }
        }
        Ok(())
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

/// Static configuration of a write node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub name: String,
    pub data_type: WriteDataType,
    /// Address used when a message carries none
    pub address: u16,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            data_type: WriteDataType::HoldingRegister,
            address: 0,
        }
    }
}

impl WriterConfig {
    pub fn new(name: impl Into<String>, data_type: WriteDataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            address: 0,
        }
    }

    pub fn with_address(mut self, address: u16) -> Self {
        self.address = address;
        self
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.name.trim().is_empty() {
            return Err(ModbusError::configuration("writer name must not be empty"));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}
