//! Connection lifecycle and reconnect policy
//!
//! A [`ConnectionManager`] owns the only client for one Modbus TCP slave. A
//! supervisor task drives the state machine:
//!
//! ```text
//! Disconnected ──start()──▶ Connecting ──ok──▶ Connected
//!      ▲                        │                  │
//!      │◀──────── failed ───────┘                  │ transport error
//!      │◀──────────────────────────────────────────┘
//!      │   reconnect on: timer (auto) or request_reconnect() (manual)
//!
//! any ──stop()──▶ Closing ──▶ Disconnected (terminal)
//! ```
//!
//! Readers and writers share the manager by cloning it and never touch the
//! client lifecycle. Transactions queue on a fair async mutex, so they reach
//! the socket one at a time in arrival order.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ModbusClient, ModbusTcpClient};
use crate::config::ConnectionConfig;
use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::ModbusFunction;
use crate::request::{ReadDataType, ReadRequest, ReadValues, WriteRequest};

/// Grace period for closing a client that is being discarded
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Capacity of the supervisor signal queue
const SIGNAL_CAPACITY: usize = 32;

/// Produces a fresh client for every (re)connection.
pub trait Connector: Send + Sync + 'static {
    type Client: ModbusClient + 'static;

    fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> impl Future<Output = ModbusResult<Self::Client>> + Send;
}

/// Connects over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector {
    packet_logging: bool,
}

impl TcpConnector {
    /// Log every frame in hex
    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }
}

impl Connector for TcpConnector {
    type Client = ModbusTcpClient;

    async fn connect(&self, config: &ConnectionConfig) -> ModbusResult<ModbusTcpClient> {
        let mut client =
            ModbusTcpClient::from_address(&config.socket_address(), config.response_timeout())
                .await?;
        client.set_packet_logging(self.packet_logging);
        Ok(client)
    }
}

/// Lifecycle state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Closing => "Closing",
        };
        f.write_str(s)
    }
}

/// Lifecycle notification fanned out to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    /// Link went down or a connect attempt failed; carries the reason
    Disconnected(String),
    /// A transport failure was observed
    TransportError(String),
}

#[derive(Debug)]
enum Signal {
    Reconnect,
    LinkLost(String),
}

struct Inner<C: Connector> {
    config: ConnectionConfig,
    connector: C,
    client: Mutex<Option<C::Client>>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    signal_tx: mpsc::Sender<Signal>,
    signal_rx: StdMutex<Option<mpsc::Receiver<Signal>>>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

/// Shared handle to one managed Modbus TCP connection.
///
/// Cloning is cheap; every clone drives the same link.
pub struct ConnectionManager<C: Connector = TcpConnector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ConnectionManager<TcpConnector> {
    /// Manager for a real TCP slave
    pub fn tcp(config: ConnectionConfig) -> ModbusResult<Self> {
        Self::new(config, TcpConnector::default())
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Validate the configuration and build an idle manager.
    pub fn new(config: ConnectionConfig, connector: C) -> ModbusResult<Self> {
        config.validate()?;

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connector,
                client: Mutex::new(None),
                state_tx,
                events,
                signal_tx,
                signal_rx: StdMutex::new(Some(signal_rx)),
                supervisor: StdMutex::new(None),
                cancel: CancellationToken::new(),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn auto_reconnect(&self) -> bool {
        self.inner.config.reconnect
    }

    /// Follow state changes; the receiver always holds the latest state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to lifecycle events. Dropping the receiver unsubscribes.
    ///
    /// The state is updated before each event is sent, so `state()` read in
    /// reaction to an event is never older than that event.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Token cancelled when the manager stops; dependents derive child tokens.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.cancel.child_token()
    }

    /// Begin connecting. Calling it again while running is a no-op.
    pub fn start(&self) -> ModbusResult<()> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(ModbusError::Closed);
        }
        let Some(signals) = self.inner.signal_rx.lock().ok().and_then(|mut rx| rx.take()) else {
            debug!("Connection manager already started");
            return Ok(());
        };

        let handle = tokio::spawn(supervise(Arc::clone(&self.inner), signals));
        if let Ok(mut slot) = self.inner.supervisor.lock() {
            *slot = Some(handle);
        }
        Ok(())
    }

    /// Ask for a connect attempt while disconnected.
    ///
    /// Only meaningful when auto-reconnect is off; otherwise the timer already
    /// schedules attempts and the request is ignored.
    pub fn request_reconnect(&self) {
        if self.inner.stopped.load(Ordering::Acquire)
            || self.inner.config.reconnect
            || self.state() != ConnectionState::Disconnected
        {
            return;
        }
        debug!(
            "Reconnect requested for {}",
            self.inner.config.socket_address()
        );
        let _ = self.inner.signal_tx.try_send(Signal::Reconnect);
    }

    /// Close the link for good.
    ///
    /// Cancels an in-flight connect attempt, waits for a running transaction
    /// to finish, fails queued ones with [`ModbusError::Closed`] and closes
    /// the client. Idempotent.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            "Disconnecting from modbustcp slave at {}",
            self.inner.config.socket_address()
        );
        self.inner.set_state(ConnectionState::Closing);
        self.inner.cancel.cancel();

        let supervisor = self.inner.supervisor.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }

        if let Some(mut client) = self.inner.client.lock().await.take() {
            let _ = timeout(CLOSE_GRACE, client.close()).await;
        }

        self.inner.set_state(ConnectionState::Disconnected);
        self.inner
            .emit(ConnectionEvent::Disconnected("closed".to_string()));
    }

    /// Issue one read transaction.
    pub async fn read(&self, request: ReadRequest) -> ModbusResult<ReadValues> {
        self.queue_read(request, None).await
    }

    /// Issue one read transaction unless `abort` fires while it is still
    /// queued behind other transactions.
    ///
    /// Fails with [`ModbusError::Cancelled`] when aborted. A request that
    /// already holds the link runs to completion.
    pub async fn read_until(
        &self,
        request: ReadRequest,
        abort: &CancellationToken,
    ) -> ModbusResult<ReadValues> {
        self.queue_read(request, Some(abort)).await
    }

    async fn queue_read(
        &self,
        request: ReadRequest,
        abort: Option<&CancellationToken>,
    ) -> ModbusResult<ReadValues> {
        let unit_id = self.inner.config.unit_id;
        let limit = self.inner.config.response_timeout();
        let function = request.data_type.function();
        let ReadRequest {
            address, quantity, ..
        } = request;

        let mut slot = self.inner.acquire(abort).await?;
        let client = slot.as_mut().ok_or(ModbusError::NotConnected)?;
        let result = match request.data_type {
            ReadDataType::Coil => bounded(limit, function, client.read_01(unit_id, address, quantity))
                .await
                .map(ReadValues::Bits),
            ReadDataType::Input => bounded(limit, function, client.read_02(unit_id, address, quantity))
                .await
                .map(ReadValues::Bits),
            ReadDataType::HoldingRegister => {
                bounded(limit, function, client.read_03(unit_id, address, quantity))
                    .await
                    .map(ReadValues::Registers)
            }
            ReadDataType::InputRegister => {
                bounded(limit, function, client.read_04(unit_id, address, quantity))
                    .await
                    .map(ReadValues::Registers)
            }
        };
        self.inner.settle(&mut slot, result).await
    }

    /// Issue one write transaction.
    pub async fn write(&self, request: WriteRequest) -> ModbusResult<()> {
        let unit_id = self.inner.config.unit_id;
        let limit = self.inner.config.response_timeout();
        let function = request.function();

        let mut slot = self.inner.acquire(None).await?;
        let client = slot.as_mut().ok_or(ModbusError::NotConnected)?;
        let result = match &request {
            WriteRequest::SingleCoil { address, value } => {
                bounded(limit, function, client.write_05(unit_id, *address, *value)).await
            }
            WriteRequest::SingleRegister { address, value } => {
                bounded(limit, function, client.write_06(unit_id, *address, *value)).await
            }
            WriteRequest::MultipleCoils { address, values } => {
                bounded(limit, function, client.write_0f(unit_id, *address, values)).await
            }
            WriteRequest::MultipleRegisters { address, values } => {
                bounded(limit, function, client.write_10(unit_id, *address, values)).await
            }
        };
        self.inner.settle(&mut slot, result).await
    }
}

/// Apply the response timeout to one client call
async fn bounded<T>(
    limit: Duration,
    function: ModbusFunction,
    call: impl Future<Output = ModbusResult<T>>,
) -> ModbusResult<T> {
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ModbusError::timeout(
            function.to_string(),
            limit.as_millis() as u64,
        )),
    }
}

impl<C: Connector> Inner<C> {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(
                "Connection {} state {} -> {}",
                self.config.socket_address(),
                previous,
                state
            );
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Wait for the client slot in FIFO order, bailing out on stop or when
    /// the caller aborts.
    async fn acquire(
        &self,
        abort: Option<&CancellationToken>,
    ) -> ModbusResult<MutexGuard<'_, Option<C::Client>>> {
        if self.cancel.is_cancelled() {
            return Err(ModbusError::Closed);
        }
        if abort.is_some_and(CancellationToken::is_cancelled) {
            return Err(ModbusError::Cancelled);
        }
        let aborted = async {
            match abort {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ModbusError::Closed),
            _ = aborted => Err(ModbusError::Cancelled),
            slot = self.client.lock() => Ok(slot),
        }
    }

    /// Drop the client if the transaction broke the link.
    async fn settle<T>(
        &self,
        slot: &mut Option<C::Client>,
        result: ModbusResult<T>,
    ) -> ModbusResult<T> {
        if let Err(e) = &result {
            if e.is_transport_error() {
                warn!(
                    "ModbusTCPConnection {}: {}",
                    self.config.socket_address(),
                    e
                );
                if let Some(mut client) = slot.take() {
                    let _ = timeout(CLOSE_GRACE, client.close()).await;
                }
                self.emit(ConnectionEvent::TransportError(e.to_string()));
                let _ = self.signal_tx.try_send(Signal::LinkLost(e.to_string()));
            }
        }
        result
    }
}

/// Supervisor loop: connect, hold the link until it breaks, apply the
/// reconnect policy, repeat until cancelled.
async fn supervise<C: Connector>(inner: Arc<Inner<C>>, mut signals: mpsc::Receiver<Signal>) {
    let address = inner.config.socket_address();

    loop {
        inner.set_state(ConnectionState::Connecting);
        info!(
            "Connecting to modbustcp slave at {} unit_id: {}",
            address, inner.config.unit_id
        );

        let attempt = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            result = inner.connector.connect(&inner.config) => result,
        };

        let reason = match attempt {
            Ok(client) => {
                *inner.client.lock().await = Some(client);
                while signals.try_recv().is_ok() {}
                inner.set_state(ConnectionState::Connected);
                inner.emit(ConnectionEvent::Connected);
                info!("Connected to modbustcp slave at {}", address);

                loop {
                    tokio::select! {
                        _ = inner.cancel.cancelled() => return,
                        signal = signals.recv() => match signal {
                            Some(Signal::LinkLost(reason)) => break reason,
                            Some(Signal::Reconnect) => continue,
                            None => return,
                        },
                    }
                }
            }
            Err(e) => {
                warn!("Unable to connect to modbustcp slave at {}: {}", address, e);
                inner.emit(ConnectionEvent::TransportError(e.to_string()));
                e.to_string()
            }
        };

        inner.set_state(ConnectionState::Disconnected);
        inner.emit(ConnectionEvent::Disconnected(reason));

        if inner.config.reconnect {
            let delay = inner.config.reconnect_timeout();
            debug!("Reconnecting to {} in {:?}", address, delay);
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                _ = sleep(delay) => {}
            }
        } else {
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => return,
                    signal = signals.recv() => match signal {
                        Some(Signal::Reconnect) => break,
                        Some(Signal::LinkLost(_)) => continue,
                        None => return,
                    },
                }
            }
        }
    }
}
