//! Messages exchanged with the host framework
//!
//! Inbound messages are loose JSON: numbers may arrive as strings and any
//! field may be missing. This module turns them into typed commands and
//! renders read results back out.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::config::ReaderConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::request::{DataTypeTag, ReadRequest, ReadValues};

/// A message as delivered by the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundMessage {
    /// Cancel the loop named in `payload.name`
    pub kill: bool,
    pub topic: Option<String>,
    pub payload: Value,
    /// Write address override
    pub address: Option<Value>,
}

impl InboundMessage {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }

    pub fn kill(name: impl Into<String>) -> Self {
        Self {
            kill: true,
            payload: serde_json::json!({ "name": name.into() }),
            ..Self::default()
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<Value>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn from_json(json: &str) -> ModbusResult<Self> {
        serde_json::from_str(json).map_err(|e| ModbusError::invalid_payload(e.to_string()))
    }
}

/// Coerce a loose JSON value to an integer.
///
/// Accepts integers, floats (truncated) and numeric strings; anything else
/// is `None`.
pub(crate) fn coerce_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
        }
        _ => None,
    }
}

/// Overrides for one polling loop. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopSpec {
    pub name: Option<String>,
    pub topic: Option<String>,
    pub address: Option<Value>,
    pub quantity: Option<Value>,
    pub data_type: Option<DataTypeTag>,
    /// Milliseconds
    pub interval: Option<u64>,
}

/// Empty strings and nulls count as absent
fn present(map: &Map<String, Value>, key: &str) -> Option<Value> {
    match map.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(value) => Some(value.clone()),
    }
}

fn text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl LoopSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Extract overrides from a payload element. Non-objects yield no overrides.
    pub fn from_value(value: &Value) -> Self {
        let Some(map) = value.as_object() else {
            return Self::default();
        };
        Self {
            name: present(map, "name").map(text),
            topic: present(map, "topic").map(text),
            address: present(map, "address"),
            quantity: present(map, "quantity"),
            data_type: present(map, "dataType").map(DataTypeTag::new),
            interval: present(map, "interval")
                .as_ref()
                .and_then(coerce_integer)
                .and_then(|ms| u64::try_from(ms).ok()),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<Value>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_quantity(mut self, quantity: impl Into<Value>) -> Self {
        self.quantity = Some(quantity.into());
        self
    }

    pub fn with_data_type(mut self, data_type: impl Into<DataTypeTag>) -> Self {
        self.data_type = Some(data_type.into());
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval.as_millis() as u64);
        self
    }

    /// Settings after falling back to `reader`, plus the tick interval.
    ///
    /// Topic precedence: spec, message, configured topic, node name. An
    /// interval of zero (or none) falls back to the configured rate; `None`
    /// means the loop fires once and does not repeat.
    pub fn resolve(
        &self,
        reader: &ReaderConfig,
        message_topic: Option<&str>,
    ) -> (LoopSettings, Option<Duration>) {
        let topic = self
            .topic
            .as_deref()
            .or(message_topic.filter(|t| !t.is_empty()))
            .unwrap_or_else(|| reader.default_topic());

        let settings = LoopSettings {
            name: self.name.clone().unwrap_or_else(|| reader.name.clone()),
            topic: topic.to_string(),
            address: self
                .address
                .clone()
                .unwrap_or_else(|| Value::from(reader.address)),
            quantity: self
                .quantity
                .clone()
                .unwrap_or_else(|| Value::from(reader.quantity)),
            data_type: self
                .data_type
                .clone()
                .unwrap_or_else(|| reader.data_type.clone()),
            timer_id: None,
        };

        let interval = match self.interval {
            Some(ms) if ms > 0 => Some(Duration::from_millis(ms)),
            _ => reader.poll_interval(),
        };
        (settings, interval)
    }
}

/// A control message decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Cancel(String),
    Submit {
        specs: Vec<LoopSpec>,
        topic: Option<String>,
    },
}

impl ControlCommand {
    /// Decode an inbound message; `None` when there is nothing to do.
    pub fn from_message(message: &InboundMessage) -> Option<Self> {
        if message.kill {
            let name = message
                .payload
                .as_object()
                .and_then(|map| present(map, "name"))
                .map(text);
            return match name {
                Some(name) => Some(Self::Cancel(name)),
                None => {
                    warn!("Kill message without a loop name ignored");
                    None
                }
            };
        }

        let specs = match &message.payload {
            Value::Array(items) => items.iter().map(LoopSpec::from_value).collect(),
            other => vec![LoopSpec::from_value(other)],
        };
        Some(Self::Submit {
            specs,
            topic: message.topic.clone(),
        })
    }
}

/// Snapshot of a loop's effective settings, echoed with every result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopSettings {
    pub name: String,
    pub topic: String,
    /// Passed through as given; checked when the request is built
    pub address: Value,
    pub quantity: Value,
    pub data_type: DataTypeTag,
    /// Set on interval ticks, absent on the immediate fire
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timer_id: Option<u64>,
}

impl LoopSettings {
    /// Settings of the statically configured loop
    pub fn from_reader(reader: &ReaderConfig) -> Self {
        LoopSpec::default().resolve(reader, None).0
    }

    /// Build the read transaction for this loop.
    pub fn read_request(&self) -> ModbusResult<ReadRequest> {
        let data_type = self.data_type.resolve()?;
        let address = coerce_integer(&self.address)
            .ok_or_else(|| ModbusError::invalid_data(format!("Invalid address {}", self.address)))?;
        let quantity = coerce_integer(&self.quantity).ok_or_else(|| {
            ModbusError::invalid_data(format!("Invalid quantity {}", self.quantity))
        })?;
        ReadRequest::new(data_type, address, quantity)
    }
}

/// A successful read, ready for the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadResult {
    pub topic: String,
    pub settings: LoopSettings,
    pub payload: ReadValues,
}

impl ReadResult {
    pub fn to_json(&self) -> ModbusResult<String> {
        serde_json::to_string(self).map_err(ModbusError::from)
    }
}
