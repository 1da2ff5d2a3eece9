//! Data-type tags and the transient request values built from them
//!
//! Hosts name what to read with a loose tag: a function code number, an
//! `"FC<n>"`/`"FC <n>"` string, or a symbolic name. [`READ_ALIASES`] is the
//! only place those spellings are mapped; every lookup goes through it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::ModbusFunction;

/// What a polling loop reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadDataType {
    /// FC1
    Coil,
    /// FC2, discrete inputs
    Input,
    /// FC3
    HoldingRegister,
    /// FC4
    InputRegister,
}

/// One host spelling of a read data type: a bare function code number or a
/// string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alias {
    Code(u64),
    Name(&'static str),
}

/// Every accepted spelling of a read data type.
pub const READ_ALIASES: &[(Alias, ReadDataType)] = &[
    (Alias::Code(1), ReadDataType::Coil),
    (Alias::Name("FC1"), ReadDataType::Coil),
    (Alias::Name("FC 1"), ReadDataType::Coil),
    (Alias::Name("Coil"), ReadDataType::Coil),
    (Alias::Code(2), ReadDataType::Input),
    (Alias::Name("FC2"), ReadDataType::Input),
    (Alias::Name("FC 2"), ReadDataType::Input),
    (Alias::Name("Input"), ReadDataType::Input),
    (Alias::Code(3), ReadDataType::HoldingRegister),
    (Alias::Name("FC3"), ReadDataType::HoldingRegister),
    (Alias::Name("FC 3"), ReadDataType::HoldingRegister),
    (Alias::Name("HoldingRegister"), ReadDataType::HoldingRegister),
    (Alias::Code(4), ReadDataType::InputRegister),
    (Alias::Name("FC4"), ReadDataType::InputRegister),
    (Alias::Name("FC 4"), ReadDataType::InputRegister),
    (Alias::Name("InputRegister"), ReadDataType::InputRegister),
];

impl ReadDataType {
    pub fn function(self) -> ModbusFunction {
        match self {
            Self::Coil => ModbusFunction::ReadCoils,
            Self::Input => ModbusFunction::ReadDiscreteInputs,
            Self::HoldingRegister => ModbusFunction::ReadHoldingRegisters,
            Self::InputRegister => ModbusFunction::ReadInputRegisters,
        }
    }

    /// Canonical symbolic name
    pub fn name(self) -> &'static str {
        match self {
            Self::Coil => "Coil",
            Self::Input => "Input",
            Self::HoldingRegister => "HoldingRegister",
            Self::InputRegister => "InputRegister",
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        Self::lookup(Alias::Code(code))
    }

    /// Exact, case-sensitive alias lookup.
    pub fn from_alias(alias: &str) -> Option<Self> {
        READ_ALIASES
            .iter()
            .find(|(key, _)| matches!(key, Alias::Name(name) if *name == alias))
            .map(|&(_, data_type)| data_type)
    }

    fn lookup(alias: Alias) -> Option<Self> {
        READ_ALIASES
            .iter()
            .find(|(key, _)| *key == alias)
            .map(|&(_, data_type)| data_type)
    }
}

/// A data-type tag as the host supplied it.
///
/// Kept verbatim so result snapshots echo what was configured; resolved to a
/// [`ReadDataType`] only when a transaction is about to be issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataTypeTag(Value);

impl DataTypeTag {
    pub fn new(raw: Value) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> &Value {
        &self.0
    }

    /// Resolve through the alias table.
    pub fn resolve(&self) -> ModbusResult<ReadDataType> {
        let resolved = match &self.0 {
            Value::Number(n) => integral(n).and_then(ReadDataType::from_code),
            Value::String(s) => ReadDataType::from_alias(s),
            _ => None,
        };
        resolved.ok_or_else(|| ModbusError::UnsupportedDataType {
            tag: self.0.to_string(),
        })
    }
}

/// `1` and `1.0` are the same code; `1.5` is no code at all.
fn integral(n: &serde_json::Number) -> Option<u64> {
    n.as_u64().or_else(|| {
        n.as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= 0.0)
            .map(|f| f as u64)
    })
}

impl From<ReadDataType> for DataTypeTag {
    fn from(data_type: ReadDataType) -> Self {
        Self(Value::String(data_type.name().to_string()))
    }
}

impl From<&str> for DataTypeTag {
    fn from(tag: &str) -> Self {
        Self(Value::String(tag.to_string()))
    }
}

impl From<u64> for DataTypeTag {
    fn from(code: u64) -> Self {
        Self(Value::from(code))
    }
}

/// What a write dispatcher writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteDataType {
    /// FC5
    Coil,
    /// FC6
    HoldingRegister,
    /// FC15
    Coils,
    /// FC16
    HoldingRegisters,
}

impl WriteDataType {
    pub fn function(self) -> ModbusFunction {
        match self {
            Self::Coil => ModbusFunction::WriteSingleCoil,
            Self::HoldingRegister => ModbusFunction::WriteSingleRegister,
            Self::Coils => ModbusFunction::WriteMultipleCoils,
            Self::HoldingRegisters => ModbusFunction::WriteMultipleRegisters,
        }
    }

    /// Whether the payload must be a sequence
    pub fn is_multiple(self) -> bool {
        matches!(self, Self::Coils | Self::HoldingRegisters)
    }
}

impl std::str::FromStr for WriteDataType {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Coil" => Ok(Self::Coil),
            "HoldingRegister" => Ok(Self::HoldingRegister),
            "Coils" => Ok(Self::Coils),
            "HoldingRegisters" => Ok(Self::HoldingRegisters),
            other => Err(ModbusError::UnsupportedDataType {
                tag: other.to_string(),
            }),
        }
    }
}

/// One read transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub data_type: ReadDataType,
    pub address: u16,
    pub quantity: u16,
}

impl ReadRequest {
    /// Build from unchecked numbers; values outside `u16` are rejected here,
    /// protocol quantity limits are enforced by the client.
    pub fn new(data_type: ReadDataType, address: i64, quantity: i64) -> ModbusResult<Self> {
        let address = u16::try_from(address)
            .map_err(|_| ModbusError::invalid_data(format!("Address {} out of range", address)))?;
        let quantity = u16::try_from(quantity).map_err(|_| {
            ModbusError::invalid_data(format!("Quantity {} out of range", quantity))
        })?;
        Ok(Self {
            data_type,
            address,
            quantity,
        })
    }
}

/// One write transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteRequest {
    SingleCoil { address: u16, value: bool },
    SingleRegister { address: u16, value: u16 },
    MultipleCoils { address: u16, values: Vec<bool> },
    MultipleRegisters { address: u16, values: Vec<u16> },
}

impl WriteRequest {
    pub fn function(&self) -> ModbusFunction {
        match self {
            Self::SingleCoil { .. } => ModbusFunction::WriteSingleCoil,
            Self::SingleRegister { .. } => ModbusFunction::WriteSingleRegister,
            Self::MultipleCoils { .. } => ModbusFunction::WriteMultipleCoils,
            Self::MultipleRegisters { .. } => ModbusFunction::WriteMultipleRegisters,
        }
    }

    pub fn address(&self) -> u16 {
        match self {
            Self::SingleCoil { address, .. }
            | Self::SingleRegister { address, .. }
            | Self::MultipleCoils { address, .. }
            | Self::MultipleRegisters { address, .. } => *address,
        }
    }
}

/// Values returned by a read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ReadValues {
    /// Coils or discrete inputs
    Bits(Vec<bool>),
    /// Holding or input registers
    Registers(Vec<u16>),
}

impl ReadValues {
    pub fn len(&self) -> usize {
        match self {
            Self::Bits(bits) => bits.len(),
            Self::Registers(registers) => registers.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
