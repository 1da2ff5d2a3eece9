//! # Voltage Modbus Flow - Managed Modbus TCP Polling and Writes
//!
//! Keeps one Modbus TCP connection alive and shares it between any number of
//! periodic read loops and write commands, the way a flow-based automation
//! host wires a device into its graph.
//!
//! ## Components
//!
//! - **ConnectionManager**: owns the client, runs the connect/reconnect state
//!   machine, serializes transactions and publishes lifecycle events
//! - **PollingScheduler**: named, replaceable read loops that fire on
//!   creation and then every interval, plus one default loop that follows
//!   the connection
//! - **WriteDispatcher**: validates a loose payload and issues exactly one
//!   write transaction
//! - **StatusSink**: observational status events for every node
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Used by |
//! |------|----------|---------|
//! | 0x01 | Read Coils | Scheduler (`Coil`, `FC1`) |
//! | 0x02 | Read Discrete Inputs | Scheduler (`Input`, `FC2`) |
//! | 0x03 | Read Holding Registers | Scheduler (`HoldingRegister`, `FC3`) |
//! | 0x04 | Read Input Registers | Scheduler (`InputRegister`, `FC4`) |
//! | 0x05 | Write Single Coil | Dispatcher (`Coil`) |
//! | 0x06 | Write Single Register | Dispatcher (`HoldingRegister`) |
//! | 0x0F | Write Multiple Coils | Dispatcher (`Coils`) |
//! | 0x10 | Write Multiple Registers | Dispatcher (`HoldingRegisters`) |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use voltage_modbus_flow::{
//!     ConnectionConfig, ConnectionManager, ModbusResult, PollingScheduler, ReaderConfig,
//!     TracingSink, WriteCommand, WriteDataType, WriteDispatcher, WriterConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let manager = ConnectionManager::tcp(ConnectionConfig::new("127.0.0.1", 502))?;
//!     let sink = Arc::new(TracingSink);
//!
//!     let (_scheduler, mut results) = PollingScheduler::attach(
//!         manager.clone(),
//!         ReaderConfig::new("plc").with_quantity(10).with_rate(1000, Default::default()),
//!         sink.clone(),
//!     );
//!     let writer = WriteDispatcher::attach(
//!         manager.clone(),
//!         WriterConfig::new("valves", WriteDataType::Coils),
//!         sink,
//!     );
//!     manager.start()?;
//!
//!     writer.write(WriteCommand::new(json!([1, 0, 1])).with_address(5)).await.ok();
//!     if let Some(result) = results.recv().await {
//!         println!("{}: {:?}", result.topic, result.payload);
//!     }
//!
//!     manager.stop().await;
//!     Ok(())
//! }
//! ```

// ============================================================================
// Transport codec
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus protocol constants based on official specification
pub mod constants;

/// High-performance PDU with stack-allocated fixed array
pub mod pdu;

/// Modbus protocol definitions and message handling
pub mod protocol;

/// Network transport layer for Modbus TCP
pub mod transport;

/// Typed Modbus client over any transport
pub mod client;

// ============================================================================
// Connection management and scheduling
// ============================================================================

/// Connection, reader and writer configuration
pub mod config;

/// Data-type tags and transaction values
pub mod request;

/// Connection lifecycle and reconnect policy
pub mod connection;

/// Host messages and read results
pub mod message;

/// Observational status events
pub mod status;

/// Named periodic read loops
pub mod poller;

/// Payload validation and write transactions
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use voltage_modbus_flow::tokio) ===
pub use tokio;

// === Components ===
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, Connector, TcpConnector,
};
pub use poller::PollingScheduler;
pub use writer::{WriteCommand, WriteDispatcher, WriteOutcome};

// === Configuration ===
pub use config::{ConnectionConfig, RateUnit, ReaderConfig, WriterConfig};

// === Messages ===
pub use message::{ControlCommand, InboundMessage, LoopSettings, LoopSpec, ReadResult};
pub use request::{
    Alias, DataTypeTag, ReadDataType, ReadRequest, ReadValues, WriteDataType, WriteRequest,
    READ_ALIASES,
};

// === Status ===
pub use status::{NodeStatus, StatusEvent, StatusSink, TracingSink};

// === Error handling ===
pub use error::{ModbusError, ModbusResult};

// === Client API ===
pub use client::{GenericModbusClient, ModbusClient, ModbusTcpClient};
pub use protocol::{ModbusFunction, ModbusRequest, ModbusResponse, SlaveId};
pub use transport::{ModbusTransport, TcpTransport, TransportStats};

// === PDU (advanced usage) ===
pub use pdu::{ModbusPdu, PduBuilder};

// === Protocol limits and defaults ===
pub use constants::{
    DEFAULT_RECONNECT_TIMEOUT_MS, DEFAULT_RESPONSE_TIMEOUT_MS, DEFAULT_TCP_PORT,
    MAX_POLL_INTERVAL_MS, MAX_PDU_SIZE, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS,
    MAX_WRITE_REGISTERS,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Voltage Modbus Flow v{} - managed Modbus TCP polling", VERSION)
}
