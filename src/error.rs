//! Error types for the connection, scheduling and write layers
//!
//! Every fallible operation in the crate returns [`ModbusResult`]. Errors fall
//! into three groups:
//!
//! | Group | Variants | Handling |
//! |-------|----------|----------|
//! | Transport | `Io`, `Connection`, `Timeout`, `Frame`, `Protocol` | Link is dropped, reconnect policy applies |
//! | Device | `Exception` | Reported to the caller, link stays up |
//! | Caller | `InvalidPayload`, `PayloadTypeMismatch`, `InvalidData`, `UnsupportedDataType`, `Configuration` | Rejected before any bytes are sent |
//! | Lifecycle | `NotConnected`, `Closed`, `Cancelled` | Nothing was sent |

use thiserror::Error;

/// Result alias used across the crate.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Errors produced by the Modbus flow layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// Socket level I/O failure.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection could not be established or was lost.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// No response within the configured timeout.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Response violated the protocol (bad length, wrong transaction id, ...).
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Malformed MBAP frame.
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// The device answered with a Modbus exception.
    #[error("Modbus exception: function={function:#04x}, code={code:#04x} ({message})")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// Function code outside the supported set.
    #[error("Invalid function code: {code}")]
    InvalidFunction { code: u8 },

    /// Request parameters out of range.
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Configuration rejected at construction time.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Write payload missing or not coercible to a number.
    #[error("Invalid payload: {message}")]
    InvalidPayload { message: String },

    /// Write payload has the wrong shape for the configured data type.
    #[error("Payload type mismatch: expected {expected}, got {actual}")]
    PayloadTypeMismatch {
        expected: &'static str,
        actual: String,
    },

    /// Data-type tag not found in the alias table.
    #[error("Unsupported data type: {tag}")]
    UnsupportedDataType { tag: String },

    /// A transaction was attempted while no link is up.
    #[error("Not connected")]
    NotConnected,

    /// The connection manager has been stopped.
    #[error("Connection manager closed")]
    Closed,

    /// The caller gave up on a transaction before it reached the link.
    #[error("Transaction cancelled")]
    Cancelled,

    /// A validated write reached the device but the transaction failed.
    #[error("Write failed: {0}")]
    WriteFailed(#[source] Box<ModbusError>),
}

impl ModbusError {
    /// Create a connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid payload error
    pub fn invalid_payload<S: Into<String>>(message: S) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }

    /// Create a device exception error from the raw exception code
    pub fn exception(function: u8, code: u8) -> Self {
        Self::Exception {
            function,
            code,
            message: exception_text(code).to_string(),
        }
    }

    /// Whether the error means the link itself is broken.
    ///
    /// Exception responses and caller errors leave the link healthy.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::Protocol { .. }
                | Self::Frame { .. }
        )
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            message: error.to_string(),
        }
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(error: serde_json::Error) -> Self {
        Self::configuration(error.to_string())
    }
}

/// Human-readable text for a Modbus exception code.
pub fn exception_text(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Server Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Server Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed To Respond",
        _ => "Unknown Exception",
    }
}
