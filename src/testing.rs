//! In-memory slave used by unit tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};

use crate::client::ModbusClient;
use crate::config::ConnectionConfig;
use crate::connection::{ConnectionEvent, Connector};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::SlaveId;
use crate::transport::TransportStats;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Read01 { address: u16, quantity: u16 },
    Read02 { address: u16, quantity: u16 },
    Read03 { address: u16, quantity: u16 },
    Read04 { address: u16, quantity: u16 },
    Write05 { address: u16, value: bool },
    Write06 { address: u16, value: u16 },
    Write0f { address: u16, values: Vec<bool> },
    Write10 { address: u16, values: Vec<u16> },
}

#[derive(Default)]
struct DeviceState {
    calls: Vec<(Instant, Call)>,
    connects: usize,
    closes: usize,
    refuse_connects: usize,
    connect_delay: Duration,
    response_delay: Duration,
    failures: VecDeque<ModbusError>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Shared state behind every client the mock connector hands out.
#[derive(Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn timed_calls(&self) -> Vec<(Instant, Call)> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn max_concurrency(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    pub fn refuse_next_connects(&self, count: usize) {
        self.state.lock().unwrap().refuse_connects = count;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().unwrap().connect_delay = delay;
    }

    pub fn set_response_delay(&self, delay: Duration) {
        self.state.lock().unwrap().response_delay = delay;
    }

    /// Fail the next transaction with `error`
    pub fn fail_next(&self, error: ModbusError) {
        self.state.lock().unwrap().failures.push_back(error);
    }

    async fn transact<T>(&self, call: Call, response: T) -> ModbusResult<T> {
        let (delay, failure) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push((Instant::now(), call));
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            (state.response_delay, state.failures.pop_front())
        };
        if !delay.is_zero() {
            sleep(delay).await;
        }
        self.state.lock().unwrap().in_flight -= 1;
        match failure {
            Some(error) => Err(error),
            None => Ok(response),
        }
    }
}

pub struct MockConnector {
    device: MockDevice,
}

impl MockConnector {
    pub fn new(device: MockDevice) -> Self {
        Self { device }
    }
}

impl Connector for MockConnector {
    type Client = MockClient;

    async fn connect(&self, _config: &ConnectionConfig) -> ModbusResult<MockClient> {
        let delay = self.device.state.lock().unwrap().connect_delay;
        if !delay.is_zero() {
            sleep(delay).await;
        }
        let mut state = self.device.state.lock().unwrap();
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(ModbusError::connection("Connection refused"));
        }
        state.connects += 1;
        Ok(MockClient {
            device: self.device.clone(),
            open: true,
        })
    }
}

pub struct MockClient {
    device: MockDevice,
    open: bool,
}

fn bits(address: u16, quantity: u16) -> Vec<bool> {
    (0..quantity)
        .map(|i| address.wrapping_add(i) % 2 == 0)
        .collect()
}

fn registers(address: u16, quantity: u16) -> Vec<u16> {
    (0..quantity).map(|i| address.wrapping_add(i)).collect()
}

impl ModbusClient for MockClient {
    async fn read_01(&mut self, _: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        let call = Call::Read01 { address, quantity };
        self.device.transact(call, bits(address, quantity)).await
    }

    async fn read_02(&mut self, _: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        let call = Call::Read02 { address, quantity };
        self.device.transact(call, bits(address, quantity)).await
    }

    async fn read_03(&mut self, _: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        let call = Call::Read03 { address, quantity };
        self.device.transact(call, registers(address, quantity)).await
    }

    async fn read_04(&mut self, _: SlaveId, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        let call = Call::Read04 { address, quantity };
        self.device.transact(call, registers(address, quantity)).await
    }

    async fn write_05(&mut self, _: SlaveId, address: u16, value: bool) -> ModbusResult<()> {
        self.device.transact(Call::Write05 { address, value }, ()).await
    }

    async fn write_06(&mut self, _: SlaveId, address: u16, value: u16) -> ModbusResult<()> {
        self.device.transact(Call::Write06 { address, value }, ()).await
    }

    async fn write_0f(&mut self, _: SlaveId, address: u16, values: &[bool]) -> ModbusResult<()> {
        let call = Call::Write0f {
            address,
            values: values.to_vec(),
        };
        self.device.transact(call, ()).await
    }

    async fn write_10(&mut self, _: SlaveId, address: u16, values: &[u16]) -> ModbusResult<()> {
        let call = Call::Write10 {
            address,
            values: values.to_vec(),
        };
        self.device.transact(call, ()).await
    }

    fn is_connected(&self) -> bool {
        self.open
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if self.open {
            self.open = false;
            self.device.state.lock().unwrap().closes += 1;
        }
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Next lifecycle event, failing the test if none arrives.
pub async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(600), events.recv())
        .await
        .expect("no connection event")
        .expect("event channel closed")
}
