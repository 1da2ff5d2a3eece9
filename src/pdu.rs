//! Stack-allocated Modbus PDU and the request/response codec
//!
//! A PDU is the function code followed by its data; it never exceeds
//! [`MAX_PDU_SIZE`] bytes, so it lives in a fixed array instead of a `Vec`.

use tracing::debug;

use crate::constants::MAX_PDU_SIZE;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusFunction, ModbusRequest, ModbusResponse, SlaveId};

/// PDU backed by a fixed-size array
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    /// Create an empty PDU
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Copy a received PDU
    pub fn from_slice(data: &[u8]) -> ModbusResult<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(ModbusError::frame(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }

        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        Ok(pdu)
    }

    /// Encode a request into its wire PDU.
    ///
    /// The request is validated first, so quantity limits are enforced here
    /// for every transport.
    pub fn from_request(request: &ModbusRequest) -> ModbusResult<Self> {
        request.validate()?;

        let builder = PduBuilder::new()
            .function_code(request.function.to_u8())?
            .address(request.address)?;

        let pdu = match request.function {
            ModbusFunction::ReadCoils
            | ModbusFunction::ReadDiscreteInputs
            | ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters => builder.quantity(request.quantity)?.build(),
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteSingleRegister => {
                builder.data(&request.data)?.build()
            }
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => builder
                .quantity(request.quantity)?
                .byte(request.data.len() as u8)?
                .data(&request.data)?
                .build(),
        };

        debug!(
            "PDU encoded: {} address={} quantity={} len={}",
            request.function,
            request.address,
            request.quantity,
            pdu.len()
        );
        Ok(pdu)
    }

    /// Decode this PDU as a response from `slave_id`.
    pub fn to_response(&self, slave_id: SlaveId) -> ModbusResult<ModbusResponse> {
        let fc = self
            .function_code()
            .ok_or_else(|| ModbusError::frame("Empty response PDU"))?;

        if self.is_exception() {
            let code = self
                .exception_code()
                .ok_or_else(|| ModbusError::frame("Exception response without code"))?;
            let function = ModbusFunction::from_u8(fc & 0x7F)?;
            debug!("PDU decoded: {} exception={:02X}", function, code);
            return Ok(ModbusResponse::new_exception(slave_id, function, code));
        }

        let function = ModbusFunction::from_u8(fc)?;
        debug!("PDU decoded: {} data_len={}", function, self.len - 1);
        Ok(ModbusResponse::new_success(
            slave_id,
            function,
            self.data[1..self.len].to_vec(),
        ))
    }

    /// Push a single byte
    #[inline]
    pub fn push(&mut self, byte: u8) -> ModbusResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(ModbusError::frame("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> ModbusResult<()> {
        self.extend(&value.to_be_bytes())
    }

    /// Extend with a byte slice
    #[inline]
    pub fn extend(&mut self, data: &[u8]) -> ModbusResult<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(ModbusError::frame(format!(
                "PDU would exceed max size: {} + {} > {}",
                self.len,
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Function code (first byte)
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        (self.len > 0).then(|| self.data[0])
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code().is_some_and(|fc| fc & 0x80 != 0)
    }

    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        (self.is_exception() && self.len > 1).then(|| self.data[1])
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// PDU builder - fluent API
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::new(),
        }
    }

    #[inline]
    pub fn function_code(mut self, fc: u8) -> ModbusResult<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    #[inline]
    pub fn address(mut self, addr: u16) -> ModbusResult<Self> {
        self.pdu.push_u16(addr)?;
        Ok(self)
    }

    #[inline]
    pub fn quantity(mut self, qty: u16) -> ModbusResult<Self> {
        self.pdu.push_u16(qty)?;
        Ok(self)
    }

    #[inline]
    pub fn byte(mut self, b: u8) -> ModbusResult<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    #[inline]
    pub fn data(mut self, data: &[u8]) -> ModbusResult<Self> {
        self.pdu.extend(data)?;
        Ok(self)
    }

    #[inline]
    pub fn build(self) -> ModbusPdu {
        self.pdu
    }
}
