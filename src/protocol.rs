//! Modbus application-layer messages
//!
//! Requests and responses here are transport independent: the TCP transport
//! wraps them in an MBAP header, nothing else in the crate needs to know how.

use serde::Serialize;

use crate::constants::{MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS};
use crate::error::{ModbusError, ModbusResult};

/// Modbus unit identifier.
pub type SlaveId = u8;

/// Function codes supported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ModbusFunction {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleCoil,
    WriteSingleRegister,
    WriteMultipleCoils,
    WriteMultipleRegisters,
}

impl ModbusFunction {
    /// Decode a raw function code.
    pub fn from_u8(code: u8) -> ModbusResult<Self> {
        match code {
            0x01 => Ok(Self::ReadCoils),
            0x02 => Ok(Self::ReadDiscreteInputs),
            0x03 => Ok(Self::ReadHoldingRegisters),
            0x04 => Ok(Self::ReadInputRegisters),
            0x05 => Ok(Self::WriteSingleCoil),
            0x06 => Ok(Self::WriteSingleRegister),
            0x0F => Ok(Self::WriteMultipleCoils),
            0x10 => Ok(Self::WriteMultipleRegisters),
            _ => Err(ModbusError::invalid_function(code)),
        }
    }

    /// Raw function code.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::ReadCoils => 0x01,
            Self::ReadDiscreteInputs => 0x02,
            Self::ReadHoldingRegisters => 0x03,
            Self::ReadInputRegisters => 0x04,
            Self::WriteSingleCoil => 0x05,
            Self::WriteSingleRegister => 0x06,
            Self::WriteMultipleCoils => 0x0F,
            Self::WriteMultipleRegisters => 0x10,
        }
    }

    #[inline]
    pub fn is_read(self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::ReadHoldingRegisters
                | Self::ReadInputRegisters
        )
    }
}

impl std::fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ReadCoils => "Read Coils",
            Self::ReadDiscreteInputs => "Read Discrete Inputs",
            Self::ReadHoldingRegisters => "Read Holding Registers",
            Self::ReadInputRegisters => "Read Input Registers",
            Self::WriteSingleCoil => "Write Single Coil",
            Self::WriteSingleRegister => "Write Single Register",
            Self::WriteMultipleCoils => "Write Multiple Coils",
            Self::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "FC{:02} {}", self.to_u8(), name)
    }
}

/// A single request PDU plus its unit identifier.
///
/// For writes, `data` carries the payload only: the coil/register value for
/// FC05/FC06, the packed bytes for FC15/FC16. The byte count is added when
/// the PDU is encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusRequest {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    pub address: u16,
    pub quantity: u16,
    pub data: Vec<u8>,
}

impl ModbusRequest {
    /// Create a read request (FC01-FC04).
    pub fn new_read(
        slave_id: SlaveId,
        function: ModbusFunction,
        address: u16,
        quantity: u16,
    ) -> Self {
        Self {
            slave_id,
            function,
            address,
            quantity,
            data: Vec::new(),
        }
    }

    /// Check quantity limits and data length before encoding.
    pub fn validate(&self) -> ModbusResult<()> {
        let quantity = self.quantity as usize;
        match self.function {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
                if quantity == 0 || quantity > MAX_READ_COILS {
                    return Err(ModbusError::invalid_data(format!(
                        "Invalid quantity {} (1-{})",
                        quantity, MAX_READ_COILS
                    )));
                }
            }
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                if quantity == 0 || quantity > MAX_READ_REGISTERS {
                    return Err(ModbusError::invalid_data(format!(
                        "Invalid quantity {} (1-{})",
                        quantity, MAX_READ_REGISTERS
                    )));
                }
            }
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => {
                if self.data.len() != 2 {
                    return Err(ModbusError::invalid_data("Single write needs 2 data bytes"));
                }
            }
            ModbusFunction::WriteMultipleCoils => {
                if quantity == 0 || quantity > MAX_WRITE_COILS {
                    return Err(ModbusError::invalid_data(format!(
                        "Invalid quantity {} (1-{})",
                        quantity, MAX_WRITE_COILS
                    )));
                }
                if self.data.len() != quantity.div_ceil(8) {
                    return Err(ModbusError::invalid_data("Coil data length mismatch"));
                }
            }
            ModbusFunction::WriteMultipleRegisters => {
                if quantity == 0 || quantity > MAX_WRITE_REGISTERS {
                    return Err(ModbusError::invalid_data(format!(
                        "Invalid quantity {} (1-{})",
                        quantity, MAX_WRITE_REGISTERS
                    )));
                }
                if self.data.len() != quantity * 2 {
                    return Err(ModbusError::invalid_data("Register data length mismatch"));
                }
            }
        }
        Ok(())
    }
}

/// A decoded response PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusResponse {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    data: Vec<u8>,
    exception: Option<u8>,
}

impl ModbusResponse {
    /// Normal response; `data` is everything after the function code.
    pub fn new_success(slave_id: SlaveId, function: ModbusFunction, data: Vec<u8>) -> Self {
        Self {
            slave_id,
            function,
            data,
            exception: None,
        }
    }

    /// Exception response.
    pub fn new_exception(slave_id: SlaveId, function: ModbusFunction, code: u8) -> Self {
        Self {
            slave_id,
            function,
            data: Vec::new(),
            exception: Some(code),
        }
    }

    /// Payload bytes after the function code.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// The exception as an error, if this is an exception response.
    pub fn get_exception(&self) -> Option<ModbusError> {
        self.exception
            .map(|code| ModbusError::exception(self.function.to_u8(), code))
    }

    /// Unpack coil/discrete-input bits, skipping the byte count prefix.
    ///
    /// Returns every bit in the payload; callers trim to the requested quantity.
    pub fn parse_bits(&self) -> ModbusResult<Vec<bool>> {
        let payload = self.counted_payload()?;
        let mut bits = Vec::with_capacity(payload.len() * 8);
        for &byte in payload {
            for bit in 0..8 {
                bits.push(byte & (1 << bit) != 0);
            }
        }
        Ok(bits)
    }

    /// Decode big-endian registers, skipping the byte count prefix.
    pub fn parse_registers(&self) -> ModbusResult<Vec<u16>> {
        let payload = self.counted_payload()?;
        if payload.len() % 2 != 0 {
            return Err(ModbusError::protocol(format!(
                "Odd register byte count: {}",
                payload.len()
            )));
        }
        Ok(payload
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    fn counted_payload(&self) -> ModbusResult<&[u8]> {
        let (&byte_count, rest) = self
            .data
            .split_first()
            .ok_or_else(|| ModbusError::protocol("Empty response payload"))?;
        let byte_count = byte_count as usize;
        if rest.len() < byte_count {
            return Err(ModbusError::protocol(format!(
                "Byte count {} exceeds payload length {}",
                byte_count,
                rest.len()
            )));
        }
        Ok(&rest[..byte_count])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_code_mapping() {
        for code in [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x0F, 0x10] {
            assert_eq!(ModbusFunction::from_u8(code).unwrap().to_u8(), code);
        }
        assert_eq!(
            ModbusFunction::from_u8(0x17),
            Err(ModbusError::InvalidFunction { code: 0x17 })
        );
        assert!(ModbusFunction::ReadInputRegisters.is_read());
        assert!(!ModbusFunction::WriteMultipleCoils.is_read());
    }

    #[test]
    fn test_validate_read_quantity() {
        let ok = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 0, 125);
        assert!(ok.validate().is_ok());

        let too_many = ModbusRequest::new_read(1, ModbusFunction::ReadHoldingRegisters, 0, 126);
        assert!(matches!(
            too_many.validate(),
            Err(ModbusError::InvalidData { .. })
        ));

        let zero = ModbusRequest::new_read(1, ModbusFunction::ReadCoils, 0, 0);
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_validate_multiple_coils_length() {
        let request = ModbusRequest {
            slave_id: 1,
            function: ModbusFunction::WriteMultipleCoils,
            address: 5,
            quantity: 9,
            data: vec![0xFF],
        };
        assert!(request.validate().is_err());

        let request = ModbusRequest {
            data: vec![0xFF, 0x01],
            ..request
        };
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_parse_bits_lsb_first() {
        let response =
            ModbusResponse::new_success(1, ModbusFunction::ReadCoils, vec![0x02, 0b0000_0101, 0x01]);
        let bits = response.parse_bits().unwrap();
        assert_eq!(bits.len(), 16);
        assert_eq!(&bits[..4], &[true, false, true, false]);
        assert!(bits[8]);
    }

    #[test]
    fn test_parse_registers() {
        let response = ModbusResponse::new_success(
            1,
            ModbusFunction::ReadHoldingRegisters,
            vec![0x04, 0x12, 0x34, 0x00, 0x0A],
        );
        assert_eq!(response.parse_registers().unwrap(), vec![0x1234, 0x000A]);
    }

    #[test]
    fn test_parse_truncated_payload() {
        let response =
            ModbusResponse::new_success(1, ModbusFunction::ReadHoldingRegisters, vec![0x04, 0x12]);
        assert!(matches!(
            response.parse_registers(),
            Err(ModbusError::Protocol { .. })
        ));

        let empty = ModbusResponse::new_success(1, ModbusFunction::ReadCoils, vec![]);
        assert!(empty.parse_bits().is_err());
    }

    #[test]
    fn test_exception_response() {
        let response = ModbusResponse::new_exception(1, ModbusFunction::ReadCoils, 0x02);
        assert!(response.is_exception());
        assert_eq!(response.get_exception(), Some(ModbusError::exception(0x01, 0x02)));
    }
}
