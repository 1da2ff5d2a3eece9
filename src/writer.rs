//! Write dispatcher
//!
//! Turns a loose payload into exactly one write transaction. Validation
//! happens before anything is sent: a rejected payload never reaches the
//! wire, and a failed transaction is returned to the caller rather than
//! retried here.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::WriterConfig;
use crate::connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, Connector, TcpConnector,
};
use crate::error::{ModbusError, ModbusResult};
use crate::message::{coerce_integer, InboundMessage};
use crate::protocol::ModbusFunction;
use crate::request::{WriteDataType, WriteRequest};
use crate::status::{NodeStatus, StatusReporter, StatusSink};

/// Payload and optional address override of one write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteCommand {
    pub payload: Value,
    pub address: Option<Value>,
}

impl WriteCommand {
    pub fn new(payload: impl Into<Value>) -> Self {
        Self {
            payload: payload.into(),
            address: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<Value>) -> Self {
        self.address = Some(address.into());
        self
    }
}

impl From<&InboundMessage> for WriteCommand {
    fn from(message: &InboundMessage) -> Self {
        Self {
            payload: message.payload.clone(),
            address: message.address.clone(),
        }
    }
}

/// A completed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub function: ModbusFunction,
    pub address: u16,
    /// Number of coils or registers written
    pub count: usize,
}

/// Scalar coercion: numbers, numeric strings and booleans
fn scalar(value: &Value) -> Option<i64> {
    match value {
        Value::Bool(b) => Some(i64::from(*b)),
        other => coerce_integer(other),
    }
}

fn register_value(value: &Value) -> ModbusResult<u16> {
    let number = scalar(value)
        .ok_or_else(|| ModbusError::invalid_payload(format!("{} is not a number", value)))?;
    match number {
        0..=65535 => Ok(number as u16),
        -32768..=-1 => Ok(number as i16 as u16),
        _ => Err(ModbusError::invalid_payload(format!(
            "{} does not fit in a register",
            number
        ))),
    }
}

fn coil_value(value: &Value) -> ModbusResult<bool> {
    scalar(value)
        .map(|number| number != 0)
        .ok_or_else(|| ModbusError::invalid_payload(format!("{} is not a number", value)))
}

fn sequence<'a>(payload: &'a Value, data_type: WriteDataType) -> ModbusResult<&'a [Value]> {
    let Value::Array(items) = payload else {
        return Err(ModbusError::PayloadTypeMismatch {
            expected: "array",
            actual: json_type(payload).to_string(),
        });
    };
    if items.is_empty() {
        return Err(ModbusError::invalid_payload(format!(
            "{:?} write needs at least one value",
            data_type
        )));
    }
    Ok(items)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Issues writes for one configured data type and address.
pub struct WriteDispatcher<C: Connector = TcpConnector> {
    manager: ConnectionManager<C>,
    config: WriterConfig,
    status: StatusReporter,
    shutdown: CancellationToken,
}

impl<C: Connector> WriteDispatcher<C> {
    /// Bind to a shared connection and start mirroring its state to `sink`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn attach(
        manager: ConnectionManager<C>,
        config: WriterConfig,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        let status = StatusReporter::new(config.name.clone(), sink);
        status.report(NodeStatus::Initiating);

        let shutdown = manager.shutdown_token();
        tokio::spawn(follow_connection(
            manager.subscribe(),
            manager.watch_state(),
            status.clone(),
            shutdown.clone(),
        ));

        Self {
            manager,
            config,
            status,
            shutdown,
        }
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Validate the command and build the transaction it maps to.
    pub fn prepare(&self, command: &WriteCommand) -> ModbusResult<WriteRequest> {
        if command.payload.is_null() {
            return Err(ModbusError::invalid_payload("Invalid msg.payload!"));
        }

        let address = match command.address.as_ref().and_then(coerce_integer) {
            Some(address) => u16::try_from(address).map_err(|_| {
                ModbusError::invalid_data(format!("Address {} out of range", address))
            })?,
            None => self.config.address,
        };

        let data_type = self.config.data_type;
        let request = match data_type {
            WriteDataType::Coil => WriteRequest::SingleCoil {
                address,
                value: coil_value(&command.payload)?,
            },
            WriteDataType::HoldingRegister => WriteRequest::SingleRegister {
                address,
                value: register_value(&command.payload)?,
            },
            WriteDataType::Coils => WriteRequest::MultipleCoils {
                address,
                values: sequence(&command.payload, data_type)?
                    .iter()
                    .map(coil_value)
                    .collect::<ModbusResult<_>>()?,
            },
            WriteDataType::HoldingRegisters => WriteRequest::MultipleRegisters {
                address,
                values: sequence(&command.payload, data_type)?
                    .iter()
                    .map(register_value)
                    .collect::<ModbusResult<_>>()?,
            },
        };
        Ok(request)
    }

    /// Perform one write.
    ///
    /// When the link is down and auto-reconnect is off, a reconnect is
    /// requested first; the write itself still fails if the link is not up
    /// by the time it is issued.
    pub async fn write(&self, command: WriteCommand) -> ModbusResult<WriteOutcome> {
        if self.manager.state() == ConnectionState::Disconnected && !self.manager.auto_reconnect()
        {
            self.manager.request_reconnect();
        }

        let request = match self.prepare(&command) {
            Ok(request) => request,
            Err(e) => {
                error!("{}: {}", self.config.name, e);
                self.status.report(NodeStatus::Error(e.to_string()));
                return Err(e);
            }
        };

        let outcome = WriteOutcome {
            function: request.function(),
            address: request.address(),
            count: match &request {
                WriteRequest::MultipleCoils { values, .. } => values.len(),
                WriteRequest::MultipleRegisters { values, .. } => values.len(),
                _ => 1,
            },
        };
        debug!(
            "{}: {} address={} count={}",
            self.config.name, outcome.function, outcome.address, outcome.count
        );

        match self.manager.write(request).await {
            Ok(()) => {
                self.status.report(NodeStatus::Written);
                Ok(outcome)
            }
            Err(e) => {
                error!("{}: {}", self.config.name, e);
                self.status.report(NodeStatus::Error(e.to_string()));
                Err(ModbusError::WriteFailed(Box::new(e)))
            }
        }
    }

    /// Write the payload and address carried by a host message.
    pub async fn handle(&self, message: &InboundMessage) -> ModbusResult<WriteOutcome> {
        self.write(WriteCommand::from(message)).await
    }

    /// Stop mirroring connection state. Also happens on drop.
    pub fn detach(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("{}: Closing", self.config.name);
            self.shutdown.cancel();
            self.status.report(NodeStatus::Disconnected);
        }
    }
}

impl<C: Connector> Drop for WriteDispatcher<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn follow_connection(
    mut events: broadcast::Receiver<ConnectionEvent>,
    mut states: watch::Receiver<ConnectionState>,
    status: StatusReporter,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                if *states.borrow_and_update() == ConnectionState::Connecting {
                    status.report(NodeStatus::Connecting);
                }
            }
            event = events.recv() => match event {
                Ok(event) => status.report(NodeStatus::from(&event)),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Missed {} connection events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}
