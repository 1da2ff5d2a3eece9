//! Typed Modbus client operations
//!
//! [`ModbusClient`] is the primitive the connection manager drives: one method
//! per supported function code, each a single request/response transaction.
//! [`GenericModbusClient`] implements it over any [`ModbusTransport`], and
//! [`ModbusTcpClient`] is the TCP flavour.
//!
//! | Function Code | Method |
//! |---------------|--------|
//! | 0x01 | `read_01()` |
//! | 0x02 | `read_02()` |
//! | 0x03 | `read_03()` |
//! | 0x04 | `read_04()` |
//! | 0x05 | `write_05()` |
//! | 0x06 | `write_06()` |
//! | 0x0F | `write_0f()` |
//! | 0x10 | `write_10()` |

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::debug;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusFunction, ModbusRequest, ModbusResponse, SlaveId};
use crate::transport::{ModbusTransport, TcpTransport, TransportStats};

/// Async Modbus client operations.
///
/// Quantities are checked against protocol limits before anything is sent:
/// 1-2000 bits and 1-125 registers for reads, 1-1968 coils and 1-123
/// registers for multiple writes.
pub trait ModbusClient: Send + Sync {
    /// Read coils (function code 0x01).
    fn read_01(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send;

    /// Read discrete inputs (function code 0x02).
    fn read_02(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send;

    /// Read holding registers (function code 0x03).
    fn read_03(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send;

    /// Read input registers (function code 0x04).
    fn read_04(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send;

    /// Write single coil (function code 0x05).
    fn write_05(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        value: bool,
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Write single register (function code 0x06).
    fn write_06(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        value: u16,
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Write multiple coils (function code 0x0F).
    fn write_0f(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[bool],
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Write multiple registers (function code 0x10).
    fn write_10(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[u16],
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    fn is_connected(&self) -> bool;

    fn close(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;

    fn get_stats(&self) -> TransportStats;
}

/// Client over any transport.
///
/// PDU construction and parsing live here once; transports only move frames.
pub struct GenericModbusClient<T: ModbusTransport> {
    transport: T,
}

impl<T: ModbusTransport> GenericModbusClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Validate and execute a raw request
    pub async fn execute_request(
        &mut self,
        request: ModbusRequest,
    ) -> ModbusResult<ModbusResponse> {
        request.validate()?;
        debug!(
            "Request slave={} {} address={} quantity={}",
            request.slave_id, request.function, request.address, request.quantity
        );
        let response = self.transport.request(&request).await?;
        debug!(
            "Response slave={} {} data_len={}",
            response.slave_id,
            response.function,
            response.data().len()
        );
        Ok(response)
    }

    async fn read_bits(
        &mut self,
        slave_id: SlaveId,
        function: ModbusFunction,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        let request = ModbusRequest::new_read(slave_id, function, address, quantity);
        let response = self.execute_request(request).await?;
        let bits = response.parse_bits()?;
        if bits.len() < quantity as usize {
            return Err(ModbusError::protocol(format!(
                "Expected {} bits, received {}",
                quantity,
                bits.len()
            )));
        }
        Ok(bits.into_iter().take(quantity as usize).collect())
    }

    async fn read_registers(
        &mut self,
        slave_id: SlaveId,
        function: ModbusFunction,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        let request = ModbusRequest::new_read(slave_id, function, address, quantity);
        let response = self.execute_request(request).await?;
        let registers = response.parse_registers()?;
        if registers.len() != quantity as usize {
            return Err(ModbusError::protocol(format!(
                "Expected {} registers, received {}",
                quantity,
                registers.len()
            )));
        }
        Ok(registers)
    }
}

/// Pack coils LSB first, eight per byte
fn pack_coils(values: &[bool]) -> Vec<u8> {
    values
        .chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |byte, (i, &on)| if on { byte | (1 << i) } else { byte })
        })
        .collect()
}

impl<T: ModbusTransport + Send + Sync> ModbusClient for GenericModbusClient<T> {
    async fn read_01(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        self.read_bits(slave_id, ModbusFunction::ReadCoils, address, quantity)
            .await
    }

    async fn read_02(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        self.read_bits(slave_id, ModbusFunction::ReadDiscreteInputs, address, quantity)
            .await
    }

    async fn read_03(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.read_registers(slave_id, ModbusFunction::ReadHoldingRegisters, address, quantity)
            .await
    }

    async fn read_04(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.read_registers(slave_id, ModbusFunction::ReadInputRegisters, address, quantity)
            .await
    }

    async fn write_05(&mut self, slave_id: SlaveId, address: u16, value: bool) -> ModbusResult<()> {
        let request = ModbusRequest {
            slave_id,
            function: ModbusFunction::WriteSingleCoil,
            address,
            quantity: 1,
            data: if value { vec![0xFF, 0x00] } else { vec![0x00, 0x00] },
        };
        self.execute_request(request).await?;
        Ok(())
    }

    async fn write_06(&mut self, slave_id: SlaveId, address: u16, value: u16) -> ModbusResult<()> {
        let request = ModbusRequest {
            slave_id,
            function: ModbusFunction::WriteSingleRegister,
            address,
            quantity: 1,
            data: value.to_be_bytes().to_vec(),
        };
        self.execute_request(request).await?;
        Ok(())
    }

    async fn write_0f(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()> {
        if values.len() > u16::MAX as usize {
            return Err(ModbusError::invalid_data("Too many coils"));
        }
        let request = ModbusRequest {
            slave_id,
            function: ModbusFunction::WriteMultipleCoils,
            address,
            quantity: values.len() as u16,
            data: pack_coils(values),
        };
        self.execute_request(request).await?;
        Ok(())
    }

    async fn write_10(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        if values.len() > u16::MAX as usize {
            return Err(ModbusError::invalid_data("Too many registers"));
        }
        let request = ModbusRequest {
            slave_id,
            function: ModbusFunction::WriteMultipleRegisters,
            address,
            quantity: values.len() as u16,
            data: values.iter().flat_map(|v| v.to_be_bytes()).collect(),
        };
        self.execute_request(request).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.transport.close().await
    }

    fn get_stats(&self) -> TransportStats {
        self.transport.get_stats()
    }
}

/// Modbus TCP client implementation using the generic client
pub struct ModbusTcpClient {
    inner: GenericModbusClient<TcpTransport>,
}

impl ModbusTcpClient {
    /// Connect to a resolved socket address
    pub async fn new(addr: SocketAddr, timeout: Duration) -> ModbusResult<Self> {
        let transport = TcpTransport::new(addr, timeout).await?;
        Ok(Self {
            inner: GenericModbusClient::new(transport),
        })
    }

    /// Resolve `host:port` and connect to the first address
    pub async fn from_address(addr: &str, timeout: Duration) -> ModbusResult<Self> {
        let resolved = tokio::net::lookup_host(addr)
            .await
            .map_err(|e| ModbusError::connection(format!("Cannot resolve {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| ModbusError::connection(format!("No address for {}", addr)))?;
        Self::new(resolved, timeout).await
    }

    pub fn server_address(&self) -> SocketAddr {
        self.inner.transport().address()
    }

    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.inner.transport_mut().set_packet_logging(enabled);
    }
}

impl ModbusClient for ModbusTcpClient {
    async fn read_01(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        self.inner.read_01(slave_id, address, quantity).await
    }

    async fn read_02(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        self.inner.read_02(slave_id, address, quantity).await
    }

    async fn read_03(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.inner.read_03(slave_id, address, quantity).await
    }

    async fn read_04(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.inner.read_04(slave_id, address, quantity).await
    }

    async fn write_05(&mut self, slave_id: SlaveId, address: u16, value: bool) -> ModbusResult<()> {
        self.inner.write_05(slave_id, address, value).await
    }

    async fn write_06(&mut self, slave_id: SlaveId, address: u16, value: u16) -> ModbusResult<()> {
        self.inner.write_06(slave_id, address, value).await
    }

    async fn write_0f(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()> {
        self.inner.write_0f(slave_id, address, values).await
    }

    async fn write_10(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        self.inner.write_10(slave_id, address, values).await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.inner.close().await
    }

    fn get_stats(&self) -> TransportStats {
        self.inner.get_stats()
    }
}
