//! Modbus TCP transport
//!
//! Wraps request PDUs in an MBAP header, sends them over a single socket and
//! matches each response to its request by transaction id. A transport never
//! reconnects on its own: any socket failure drops the stream, after which
//! [`ModbusTransport::is_connected`] reports `false` and the owner decides
//! what happens next.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN, MODBUS_PROTOCOL_ID};
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::ModbusPdu;
use crate::protocol::{ModbusRequest, ModbusResponse, SlaveId};

/// Format raw bytes as hex string for packet logging
fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Transport layer abstraction.
///
/// One call to [`request`](ModbusTransport::request) is one complete
/// request/response exchange. Implementations take `&mut self`, so a
/// transport is never used by two transactions at once.
pub trait ModbusTransport: Send + Sync {
    /// Send a request and wait for the matching response.
    ///
    /// Exception responses are returned as `Err(ModbusError::Exception)`.
    fn request(
        &mut self,
        request: &ModbusRequest,
    ) -> impl Future<Output = ModbusResult<ModbusResponse>> + Send;

    /// Whether the underlying socket is still open.
    fn is_connected(&self) -> bool;

    /// Close the socket. Further requests fail with a connection error.
    fn close(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;

    fn get_stats(&self) -> TransportStats;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Modbus TCP transport over a single `TcpStream`.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    address: SocketAddr,
    timeout: Duration,
    transaction_id: u16,
    stats: TransportStats,
    packet_logging: bool,
}

impl TcpTransport {
    /// Connect to `address`; the same timeout bounds the connect and every I/O step.
    pub async fn new(address: SocketAddr, timeout_duration: Duration) -> ModbusResult<Self> {
        let stream = match timeout(timeout_duration, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ModbusError::connection(format!(
                    "Failed to connect to {}: {}",
                    address, e
                )))
            }
            Err(_) => {
                return Err(ModbusError::timeout(
                    format!("connect to {}", address),
                    timeout_duration.as_millis() as u64,
                ))
            }
        };
        stream.set_nodelay(true)?;

        Ok(Self {
            stream: Some(stream),
            address,
            timeout: timeout_duration,
            transaction_id: 0,
            stats: TransportStats::default(),
            packet_logging: false,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Enable or disable hex packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    /// Next transaction id; wraps around and skips 0
    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        if self.transaction_id == 0 {
            self.transaction_id = 1;
        }
        self.transaction_id
    }
}

/// MBAP header + unit id + PDU
fn encode_frame(transaction_id: u16, slave_id: SlaveId, pdu: &ModbusPdu) -> BytesMut {
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
    frame.put_u16(transaction_id);
    frame.put_u16(MODBUS_PROTOCOL_ID);
    frame.put_u16((pdu.len() + 1) as u16);
    frame.put_u8(slave_id);
    frame.put_slice(pdu.as_slice());
    frame
}

async fn io_step<T, F>(limit: Duration, operation: &str, fut: F) -> ModbusResult<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ModbusError::from(e)),
        Err(_) => Err(ModbusError::timeout(operation, limit.as_millis() as u64)),
    }
}

/// Write one frame and read back one response, returning (unit id, PDU bytes).
async fn exchange(
    stream: &mut TcpStream,
    frame: &[u8],
    transaction_id: u16,
    limit: Duration,
) -> ModbusResult<(SlaveId, Vec<u8>)> {
    io_step(limit, "send request", stream.write_all(frame)).await?;

    let mut header = [0u8; MBAP_HEADER_LEN + 1];
    io_step(limit, "read response header", stream.read_exact(&mut header)).await?;

    let response_id = u16::from_be_bytes([header[0], header[1]]);
    let protocol_id = u16::from_be_bytes([header[2], header[3]]);
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    let unit_id = header[6];

    if protocol_id != MODBUS_PROTOCOL_ID {
        return Err(ModbusError::frame(format!(
            "Unexpected protocol id {}",
            protocol_id
        )));
    }
    if !(2..=MAX_MBAP_LENGTH).contains(&length) {
        return Err(ModbusError::frame(format!("Invalid MBAP length {}", length)));
    }

    let mut pdu = vec![0u8; length - 1];
    io_step(limit, "read response data", stream.read_exact(&mut pdu)).await?;

    if response_id != transaction_id {
        return Err(ModbusError::protocol(format!(
            "Transaction id mismatch: sent {}, received {}",
            transaction_id, response_id
        )));
    }

    Ok((unit_id, pdu))
}

impl ModbusTransport for TcpTransport {
    async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        let pdu = ModbusPdu::from_request(request)?;

        if self.stream.is_none() {
            return Err(ModbusError::connection(format!(
                "Transport to {} is closed",
                self.address
            )));
        }

        let transaction_id = self.next_transaction_id();
        let frame = encode_frame(transaction_id, request.slave_id, &pdu);
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        if self.packet_logging {
            info!(
                "[MODBUS-TCP] send slave:{} {}",
                request.slave_id,
                format_hex_packet(&frame)
            );
        }

        let outcome = match self.stream.as_mut() {
            Some(stream) => exchange(stream, &frame, transaction_id, self.timeout).await,
            None => Err(ModbusError::connection("Transport is closed")),
        };

        let (unit_id, raw_pdu) = match outcome {
            Ok(received) => received,
            Err(e) => {
                self.stats.errors += 1;
                if matches!(e, ModbusError::Timeout { .. }) {
                    self.stats.timeouts += 1;
                }
                // A partial exchange leaves the stream unusable
                self.stream = None;
                debug!("TCP exchange with {} failed: {}", self.address, e);
                return Err(e);
            }
        };

        self.stats.responses_received += 1;
        self.stats.bytes_received += (MBAP_HEADER_LEN + 1 + raw_pdu.len()) as u64;

        if self.packet_logging {
            info!(
                "[MODBUS-TCP] receive slave:{} {}",
                unit_id,
                format_hex_packet(&raw_pdu)
            );
        }

        let response = ModbusPdu::from_slice(&raw_pdu)?.to_response(unit_id)?;
        if let Some(error) = response.get_exception() {
            self.stats.errors += 1;
            return Err(error);
        }
        if response.function != request.function {
            self.stats.errors += 1;
            return Err(ModbusError::protocol(format!(
                "Function mismatch: sent {}, received {}",
                request.function, response.function
            )));
        }

        Ok(response)
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ModbusFunction;

    #[test]
    fn test_encode_frame_layout() {
        let request = ModbusRequest::new_read(0x11, ModbusFunction::ReadHoldingRegisters, 0x006B, 3);
        let pdu = ModbusPdu::from_request(&request).unwrap();
        let frame = encode_frame(0x0001, 0x11, &pdu);
        assert_eq!(
            &frame[..],
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]
        );
    }

    #[test]
    fn test_hex_format() {
        assert_eq!(format_hex_packet(&[0x00, 0xAB, 0x10]), "00 AB 10");
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpTransport::new(addr, Duration::from_secs(1)).await;
        assert!(result.unwrap_err().is_transport_error());
    }
}
