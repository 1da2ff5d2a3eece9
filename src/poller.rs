//! Polling scheduler
//!
//! Runs any number of named read loops over one shared connection. Each loop
//! fires once when created and then every interval until it is cancelled,
//! replaced by a loop of the same name, or the scheduler goes away.
//!
//! The statically configured (default) loop follows the connection: it is
//! started from tick zero on every `Connected` event and stopped on every
//! `Disconnected` event. Named loops keep ticking regardless; ticks issued
//! while the link is down fail and are reported, and the loop carries on.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use voltage_modbus_flow::{
//!     ConnectionConfig, ConnectionManager, InboundMessage, PollingScheduler, ReaderConfig,
//!     TracingSink,
//! };
//!
//! # async fn example() -> voltage_modbus_flow::ModbusResult<()> {
//! let manager = ConnectionManager::tcp(ConnectionConfig::new("192.168.1.20", 502))?;
//! let (scheduler, mut results) =
//!     PollingScheduler::attach(manager.clone(), ReaderConfig::new("plc"), Arc::new(TracingSink));
//! manager.start()?;
//!
//! scheduler.handle(&InboundMessage::new(json!({
//!     "name": "poll1", "address": 0, "quantity": 4, "dataType": "Coil", "interval": 500
//! })));
//! while let Some(result) = results.recv().await {
//!     println!("{} {:?}", result.topic, result.payload);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ReaderConfig;
use crate::connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, Connector, TcpConnector,
};
use crate::constants::MAX_POLL_INTERVAL_MS;
use crate::error::ModbusError;
use crate::message::{ControlCommand, InboundMessage, LoopSettings, LoopSpec, ReadResult};
use crate::status::{NodeStatus, StatusReporter, StatusSink};

struct LoopHandle {
    timer_id: u64,
    cancel: CancellationToken,
}

impl LoopHandle {
    fn stop(&self) {
        self.cancel.cancel();
    }
}

struct Registry {
    reader: ReaderConfig,
    default: Option<LoopHandle>,
    named: HashMap<String, LoopHandle>,
    /// Repeating loops without any name; only reachable through shutdown
    unnamed: Vec<LoopHandle>,
}

struct Shared<C: Connector> {
    manager: ConnectionManager<C>,
    registry: Mutex<Registry>,
    results: mpsc::UnboundedSender<ReadResult>,
    status: StatusReporter,
    shutdown: CancellationToken,
    next_timer_id: AtomicU64,
    /// Set while the default loop belongs to a live link
    linked: AtomicBool,
}

/// Owns every polling loop of one reader node.
pub struct PollingScheduler<C: Connector = TcpConnector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> PollingScheduler<C> {
    /// Bind to a shared connection.
    ///
    /// Returns the scheduler and the stream of read results. Must be called
    /// inside a tokio runtime.
    pub fn attach(
        manager: ConnectionManager<C>,
        reader: ReaderConfig,
        sink: Arc<dyn StatusSink>,
    ) -> (Self, mpsc::UnboundedReceiver<ReadResult>) {
        let (results, receiver) = mpsc::unbounded_channel();
        let status = StatusReporter::new(reader.name.clone(), sink);
        status.report(NodeStatus::Initiating);

        let events = manager.subscribe();
        let states = manager.watch_state();
        let shared = Arc::new(Shared {
            shutdown: manager.shutdown_token(),
            manager,
            registry: Mutex::new(Registry {
                reader,
                default: None,
                named: HashMap::new(),
                unnamed: Vec::new(),
            }),
            results,
            status,
            next_timer_id: AtomicU64::new(1),
            linked: AtomicBool::new(false),
        });

        // The subscription above may also deliver this link's Connected
        shared.on_link_up_if(shared.manager.is_connected());
        tokio::spawn(follow_connection(Arc::clone(&shared), events, states));

        (Self { shared }, receiver)
    }

    /// Replace the static configuration, restarting the default loop if the
    /// link is up.
    pub fn configure_default_loop(&self, reader: ReaderConfig) {
        self.shared.registry().reader = reader;
        if self.shared.manager.is_connected() {
            self.shared.linked.store(true, Ordering::Release);
            self.shared.on_connected();
        } else {
            self.shared.stop_default();
        }
    }

    /// Create or replace loops. Fields a spec leaves out come from the
    /// static configuration; `topic` is the topic of the carrying message.
    pub fn submit(&self, specs: Vec<LoopSpec>, topic: Option<&str>) {
        for spec in specs {
            self.shared.submit(&spec, topic);
        }
    }

    /// Stop and forget the named loop. Unknown names are ignored.
    pub fn cancel(&self, name: &str) -> bool {
        let removed = self.shared.registry().named.remove(name);
        match removed {
            Some(handle) => {
                handle.stop();
                info!("Stopped loop {}", name);
                true
            }
            None => {
                debug!("No active loop named {}", name);
                false
            }
        }
    }

    /// Apply a control message from the host.
    pub fn handle(&self, message: &InboundMessage) {
        match ControlCommand::from_message(message) {
            Some(ControlCommand::Cancel(name)) => {
                self.cancel(&name);
            }
            Some(ControlCommand::Submit { specs, topic }) => {
                self.submit(specs, topic.as_deref());
            }
            None => {}
        }
    }

    /// Names of the running named loops, sorted.
    pub fn active_loops(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.registry().named.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn default_loop_running(&self) -> bool {
        self.shared.registry().default.is_some()
    }

    /// Cancel every loop and stop following the connection.
    pub fn shutdown(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        debug!("{}: Closing", self.shared.status_name());
        self.shared.shutdown.cancel();
        self.shared.clear_loops();
        self.shared.status.report(NodeStatus::Disconnected);
    }
}

impl<C: Connector> Drop for PollingScheduler<C> {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl<C: Connector> Shared<C> {
    /// The registry lock is never held across an await.
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn status_name(&self) -> String {
        self.registry().reader.name.clone()
    }

    /// First `Connected` of a link; repeats are ignored.
    fn on_link_up_if(self: &Arc<Self>, connected: bool) {
        if connected && !self.linked.swap(true, Ordering::AcqRel) {
            self.on_connected();
        }
    }

    fn on_connected(self: &Arc<Self>) {
        let mut registry = self.registry();
        let reader = &registry.reader;
        self.status.report(NodeStatus::Connected {
            rate: Some(format!("{} {}", reader.rate, reader.rate_unit)),
        });

        if let Some(old) = registry.default.take() {
            old.stop();
        }
        // Rate 0: wait for submitted loops only
        let Some(interval) = registry.reader.poll_interval() else {
            return;
        };
        let settings = LoopSettings::from_reader(&registry.reader);
        registry.default = self.spawn_loop(settings, Some(interval));
    }

    fn on_disconnected(&self) {
        info!(
            "{} was disconnected or was unable to connect",
            self.registry().reader.name
        );
        self.linked.store(false, Ordering::Release);
        self.status.report(NodeStatus::Disconnected);
        self.stop_default();
    }

    fn stop_default(&self) {
        if let Some(handle) = self.registry().default.take() {
            handle.stop();
        }
    }

    fn clear_loops(&self) {
        let mut guard = self.registry();
        let registry = &mut *guard;
        let handles: Vec<LoopHandle> = registry
            .default
            .take()
            .into_iter()
            .chain(registry.named.drain().map(|(_, handle)| handle))
            .chain(registry.unnamed.drain(..))
            .collect();
        drop(guard);
        for handle in handles {
            handle.stop();
        }
    }

    fn submit(self: &Arc<Self>, spec: &LoopSpec, topic: Option<&str>) {
        if self.shutdown.is_cancelled() {
            debug!("Scheduler closed, ignoring loop {:?}", spec.name);
            return;
        }
        let mut registry = self.registry();
        let (settings, interval) = spec.resolve(&registry.reader, topic);
        let name = settings.name.clone();
        info!("Starting loop {}", name);

        if !name.is_empty() {
            if let Some(old) = registry.named.remove(&name) {
                debug!("Replacing loop {} (timer {})", name, old.timer_id);
                old.stop();
            }
        }

        let Some(handle) = self.spawn_loop(settings, interval) else {
            return;
        };
        if interval.is_none() {
            // Fired once, nothing to keep
            return;
        }
        if name.is_empty() {
            registry.unnamed.retain(|h| !h.cancel.is_cancelled());
            registry.unnamed.push(handle);
        } else {
            registry.named.insert(name, handle);
        }
    }

    /// Start a loop task; `None` when its data type is not supported.
    fn spawn_loop(
        self: &Arc<Self>,
        settings: LoopSettings,
        interval: Option<Duration>,
    ) -> Option<LoopHandle> {
        if let Err(e) = settings.data_type.resolve() {
            warn!("Loop {} ignored: {}", settings.name, e);
            return None;
        }

        let handle = LoopHandle {
            timer_id: self.next_timer_id.fetch_add(1, Ordering::Relaxed),
            cancel: self.shutdown.child_token(),
        };
        tokio::spawn(run_loop(
            Arc::clone(self),
            settings,
            interval,
            handle.timer_id,
            handle.cancel.clone(),
        ));
        Some(handle)
    }

    /// One read transaction for a loop tick. Nothing is sent once the loop
    /// is cancelled, even while the read waits its turn.
    async fn poll(&self, settings: LoopSettings, cancel: CancellationToken) {
        if cancel.is_cancelled() {
            return;
        }
        let request = match settings.read_request() {
            Ok(request) => request,
            Err(e) => {
                error!("{}: {}", settings.name, e);
                self.status.report(NodeStatus::Error(e.to_string()));
                return;
            }
        };

        self.status.report(NodeStatus::Polling);
        match self.manager.read_until(request, &cancel).await {
            Ok(payload) => {
                if cancel.is_cancelled() {
                    debug!("Dropping result of stopped loop {}", settings.name);
                    return;
                }
                self.status.report(NodeStatus::Waiting);
                let _ = self.results.send(ReadResult {
                    topic: settings.topic.clone(),
                    settings,
                    payload,
                });
            }
            Err(ModbusError::Cancelled) => {
                debug!("Loop {} stopped before its read was sent", settings.name);
            }
            Err(e) => {
                error!("{}: {}", settings.name, e);
                self.status.report(NodeStatus::Error(e.to_string()));
            }
        }
    }
}

/// Fire immediately, then on every interval tick until cancelled.
///
/// Each tick's transaction runs in its own task so the interval is measured
/// from issue time. A tick is skipped while the loop's previous read is
/// still queued or in flight.
async fn run_loop<C: Connector>(
    shared: Arc<Shared<C>>,
    mut settings: LoopSettings,
    interval: Option<Duration>,
    timer_id: u64,
    cancel: CancellationToken,
) {
    let pending = Arc::new(AtomicBool::new(false));
    fire(&shared, settings.clone(), &cancel, &pending);

    let Some(period) = interval else {
        return;
    };
    let period = capped(period);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    settings.timer_id = Some(timer_id);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => fire(&shared, settings.clone(), &cancel, &pending),
        }
    }
}

fn fire<C: Connector>(
    shared: &Arc<Shared<C>>,
    settings: LoopSettings,
    cancel: &CancellationToken,
    pending: &Arc<AtomicBool>,
) {
    if pending.swap(true, Ordering::AcqRel) {
        debug!("Loop {} skips a tick, last read still pending", settings.name);
        return;
    }
    let (shared, cancel, pending) = (Arc::clone(shared), cancel.clone(), Arc::clone(pending));
    tokio::spawn(async move {
        shared.poll(settings, cancel).await;
        pending.store(false, Ordering::Release);
    });
}

fn capped(period: Duration) -> Duration {
    let limit = Duration::from_millis(MAX_POLL_INTERVAL_MS);
    if period > limit {
        warn!("Interval {:?} capped at {:?}", period, limit);
        limit
    } else {
        period
    }
}

async fn follow_connection<C: Connector>(
    shared: Arc<Shared<C>>,
    mut events: broadcast::Receiver<ConnectionEvent>,
    mut states: watch::Receiver<ConnectionState>,
) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                shared.clear_loops();
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                if *states.borrow_and_update() == ConnectionState::Connecting {
                    shared.status.report(NodeStatus::Connecting);
                }
            }
            event = events.recv() => match event {
                Ok(ConnectionEvent::Connected) => shared.on_link_up_if(true),
                Ok(ConnectionEvent::Disconnected(_)) => shared.on_disconnected(),
                Ok(ConnectionEvent::TransportError(message)) => {
                    shared.status.report(NodeStatus::Error(message));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Missed {} connection events, resyncing", skipped);
                    if shared.manager.is_connected() {
                        shared.linked.store(true, Ordering::Release);
                        shared.on_connected();
                    } else {
                        shared.on_disconnected();
                    }
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::sleep;

    use crate::config::{ConnectionConfig, RateUnit};
    use crate::error::ModbusError;
    use crate::request::{ReadDataType, ReadValues};
    use crate::status::StatusEvent;
    use crate::testing::{next_event, Call, MockConnector, MockDevice};

    struct Fixture {
        device: MockDevice,
        manager: ConnectionManager<MockConnector>,
        scheduler: PollingScheduler<MockConnector>,
        results: mpsc::UnboundedReceiver<ReadResult>,
        statuses: mpsc::UnboundedReceiver<StatusEvent>,
    }

    impl Fixture {
        /// Attach to a started manager and wait for the link
        async fn connected(reader: ReaderConfig) -> Self {
            let device = MockDevice::new();
            let manager = ConnectionManager::new(
                ConnectionConfig::new("mock", 502).with_reconnect_timeout(Duration::from_secs(1)),
                MockConnector::new(device.clone()),
            )
            .unwrap();
            let (tx, statuses) = mpsc::unbounded_channel();
            let (scheduler, results) =
                PollingScheduler::attach(manager.clone(), reader, Arc::new(tx));

            let mut events = manager.subscribe();
            manager.start().unwrap();
            assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
            sleep(Duration::from_millis(1)).await;

            Self {
                device,
                manager,
                scheduler,
                results,
                statuses,
            }
        }

        fn results(&mut self) -> Vec<ReadResult> {
            let mut results = Vec::new();
            while let Ok(result) = self.results.try_recv() {
                results.push(result);
            }
            results
        }

        fn statuses(&mut self) -> Vec<NodeStatus> {
            let mut statuses = Vec::new();
            while let Ok(event) = self.statuses.try_recv() {
                statuses.push(event.status);
            }
            statuses
        }

        fn calls_at(&self, address: u16) -> Vec<Instant> {
            self.device
                .timed_calls()
                .into_iter()
                .filter(|(_, call)| match call {
                    Call::Read01 { address: a, .. }
                    | Call::Read02 { address: a, .. }
                    | Call::Read03 { address: a, .. }
                    | Call::Read04 { address: a, .. } => *a == address,
                    _ => false,
                })
                .map(|(at, _)| at)
                .collect()
        }
    }

    fn idle_reader() -> ReaderConfig {
        ReaderConfig::new("reader")
    }

    fn spacing(times: &[Instant]) -> Vec<Duration> {
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_submitted_loop_fires_immediately_then_every_interval() {
        let mut fixture = Fixture::connected(idle_reader()).await;
        let start = Instant::now();
        fixture.scheduler.handle(&InboundMessage::new(json!({
            "name": "poll1", "address": 0, "quantity": 4, "dataType": "Coil", "interval": 500
        })));

        sleep(Duration::from_millis(1250)).await;
        let calls = fixture.device.timed_calls();
        assert_eq!(calls.len(), 3);
        for (_, call) in &calls {
            assert_eq!(
                *call,
                Call::Read01 {
                    address: 0,
                    quantity: 4
                }
            );
        }
        assert_eq!(calls[0].0, start);
        let times: Vec<Instant> = calls.iter().map(|(at, _)| *at).collect();
        assert_eq!(spacing(&times), vec![Duration::from_millis(500); 2]);

        let results = fixture.results();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].topic, "reader");
        assert_eq!(results[0].settings.name, "poll1");
        assert_eq!(results[0].settings.timer_id, None);
        assert!(results[1].settings.timer_id.is_some());
        assert_eq!(results[1].settings.timer_id, results[2].settings.timer_id);
        assert_eq!(
            results[0].payload,
            ReadValues::Bits(vec![true, false, true, false])
        );
        assert_eq!(fixture.scheduler.active_loops(), vec!["poll1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_then_kill_reads_at_most_once() {
        let mut fixture = Fixture::connected(idle_reader()).await;
        fixture.scheduler.handle(&InboundMessage::new(json!({
            "name": "A", "address": 10, "quantity": 2, "dataType": "HoldingRegister", "interval": 1000
        })));
        fixture.scheduler.handle(&InboundMessage::kill("A"));

        sleep(Duration::from_secs(5)).await;
        assert!(fixture.calls_at(10).len() <= 1);
        assert!(fixture.scheduler.active_loops().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_name_replaces_loop() {
        let mut fixture = Fixture::connected(idle_reader()).await;
        let spec = LoopSpec::named("A")
            .with_quantity(1)
            .with_interval(Duration::from_secs(1));
        fixture
            .scheduler
            .submit(vec![spec.clone().with_address(10)], None);
        sleep(Duration::from_millis(10)).await;
        fixture
            .scheduler
            .submit(vec![spec.with_address(20)], None);

        sleep(Duration::from_millis(3500)).await;
        assert_eq!(fixture.calls_at(10).len(), 1);
        assert_eq!(fixture.calls_at(20).len(), 4);
        assert_eq!(fixture.scheduler.active_loops(), vec!["A".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_unknown_name_is_noop() {
        let fixture = Fixture::connected(idle_reader()).await;
        assert!(!fixture.scheduler.cancel("nope"));
        fixture.scheduler.handle(&InboundMessage::kill("nope"));
        assert!(fixture.device.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_zero_never_starts_default_loop() {
        let fixture = Fixture::connected(idle_reader()).await;
        sleep(Duration::from_secs(30)).await;
        assert!(!fixture.scheduler.default_loop_running());
        assert!(fixture.device.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_loop_follows_connection() {
        let reader = ReaderConfig::new("reader")
            .with_address(3)
            .with_quantity(2)
            .with_rate(1, RateUnit::S);
        let mut fixture = Fixture::connected(reader).await;
        assert!(fixture.scheduler.default_loop_running());
        assert!(fixture.statuses().contains(&NodeStatus::Connected {
            rate: Some("1 s".to_string())
        }));

        sleep(Duration::from_millis(2500)).await;
        assert_eq!(fixture.calls_at(3).len(), 3);
        assert!(fixture
            .results()
            .iter()
            .all(|r| r.payload == ReadValues::Registers(vec![3, 4])));

        // Tick at 3 s breaks the link
        fixture.device.clear_calls();
        fixture
            .device
            .fail_next(ModbusError::connection("reset by peer"));
        let mut events = fixture.manager.subscribe();
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::TransportError(_)
        ));
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Disconnected(_)
        ));
        sleep(Duration::from_millis(1)).await;
        assert!(!fixture.scheduler.default_loop_running());

        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
        sleep(Duration::from_millis(1)).await;
        assert!(fixture.scheduler.default_loop_running());

        sleep(Duration::from_millis(100)).await;
        let times = fixture.calls_at(3);
        assert_eq!(times.len(), 2);
        assert_eq!(spacing(&times), vec![Duration::from_secs(1)]);
        let restarted = fixture.results();
        assert_eq!(restarted.len(), 1);
        assert_eq!(restarted[0].settings.timer_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tick_does_not_cancel_loop() {
        let mut fixture = Fixture::connected(idle_reader()).await;
        fixture.device.fail_next(ModbusError::exception(0x04, 0x02));
        fixture.scheduler.submit(
            vec![LoopSpec::named("ir")
                .with_data_type(ReadDataType::InputRegister)
                .with_interval(Duration::from_millis(200))],
            None,
        );

        sleep(Duration::from_millis(450)).await;
        assert_eq!(fixture.device.calls().len(), 3);
        let results = fixture.results();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.settings.timer_id.is_some()));

        let statuses = fixture.statuses();
        assert!(statuses.iter().any(|s| matches!(s, NodeStatus::Error(_))));
        assert_eq!(statuses.last(), Some(&NodeStatus::Waiting));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_data_type_issues_nothing() {
        let mut fixture = Fixture::connected(idle_reader()).await;
        fixture.scheduler.submit(
            vec![LoopSpec::named("x").with_interval(Duration::from_secs(1))],
            None,
        );
        sleep(Duration::from_millis(10)).await;
        fixture.device.clear_calls();

        fixture.scheduler.handle(&InboundMessage::new(json!({
            "name": "x", "dataType": "FC9", "interval": 100
        })));
        sleep(Duration::from_secs(3)).await;
        assert!(fixture.device.calls().is_empty());
        assert!(fixture.scheduler.active_loops().is_empty());
        assert!(!fixture
            .statuses()
            .iter()
            .any(|s| matches!(s, NodeStatus::Error(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_loop_discards_in_flight_result() {
        let mut fixture = Fixture::connected(idle_reader()).await;
        fixture.device.set_response_delay(Duration::from_millis(500));
        fixture.scheduler.submit(
            vec![LoopSpec::named("slow").with_interval(Duration::from_secs(10))],
            None,
        );
        sleep(Duration::from_millis(100)).await;
        assert!(fixture.scheduler.cancel("slow"));

        sleep(Duration::from_secs(1)).await;
        assert_eq!(fixture.device.calls().len(), 1);
        assert!(fixture.results().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_array_payload_starts_independent_loops() {
        let mut fixture = Fixture::connected(idle_reader()).await;
        fixture.scheduler.handle(
            &InboundMessage::new(json!([
                {"name": "a", "address": 1, "interval": 1000},
                {"name": "b", "address": 2, "interval": "1000", "topic": "bt"}
            ]))
            .with_topic("mt"),
        );
        sleep(Duration::from_millis(10)).await;
        assert_eq!(
            fixture.scheduler.active_loops(),
            vec!["a".to_string(), "b".to_string()]
        );

        let mut topics: Vec<String> = fixture.results().into_iter().map(|r| r.topic).collect();
        topics.sort();
        assert_eq!(topics, vec!["bt".to_string(), "mt".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_without_rate_fires_once() {
        let fixture = Fixture::connected(idle_reader()).await;
        fixture.scheduler.handle(&InboundMessage::new(json!({
            "name": "once", "address": 5, "interval": 0
        })));
        sleep(Duration::from_secs(10)).await;
        assert_eq!(fixture.calls_at(5).len(), 1);
        assert!(fixture.scheduler.active_loops().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_and_stop_cancel_all_loops() {
        let fixture = Fixture::connected(idle_reader().with_rate(1, RateUnit::S)).await;
        fixture.scheduler.submit(
            vec![
                LoopSpec::named("a").with_interval(Duration::from_millis(300)),
                LoopSpec::named("b").with_interval(Duration::from_millis(300)),
            ],
            None,
        );
        sleep(Duration::from_millis(10)).await;
        fixture.scheduler.shutdown();
        assert!(fixture.scheduler.active_loops().is_empty());
        assert!(!fixture.scheduler.default_loop_running());

        fixture.device.clear_calls();
        fixture.scheduler.submit(
            vec![LoopSpec::named("late").with_interval(Duration::from_millis(300))],
            None,
        );
        sleep(Duration::from_secs(5)).await;
        assert!(fixture.device.calls().is_empty());
        assert!(fixture.scheduler.active_loops().is_empty());

        let second = Fixture::connected(idle_reader()).await;
        second.scheduler.submit(
            vec![LoopSpec::named("c").with_interval(Duration::from_millis(300))],
            None,
        );
        sleep(Duration::from_millis(10)).await;
        second.manager.stop().await;
        second.device.clear_calls();
        sleep(Duration::from_secs(5)).await;
        assert!(second.device.calls().is_empty());
        assert!(second.scheduler.active_loops().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_under_slow_device_sends_nothing_after() {
        let mut fixture = Fixture::connected(idle_reader()).await;
        fixture.device.set_response_delay(Duration::from_secs(1));
        fixture.scheduler.submit(
            vec![LoopSpec::named("slow")
                .with_address(9)
                .with_interval(Duration::from_millis(100))],
            None,
        );

        sleep(Duration::from_secs(2)).await;
        assert!(fixture.scheduler.cancel("slow"));
        let cancelled_at = Instant::now();
        let _ = fixture.results();

        sleep(Duration::from_secs(20)).await;
        let calls = fixture.calls_at(9);
        assert!(calls.len() <= 3, "ticks piled up: {}", calls.len());
        assert!(calls.iter().all(|at| *at <= cancelled_at));
        assert!(fixture.results().is_empty());
        assert_eq!(fixture.device.max_concurrency(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_under_slow_device_retires_old_loop() {
        let fixture = Fixture::connected(idle_reader()).await;
        fixture.device.set_response_delay(Duration::from_secs(1));
        let spec = LoopSpec::named("A").with_interval(Duration::from_millis(100));
        fixture
            .scheduler
            .submit(vec![spec.clone().with_address(10)], None);

        sleep(Duration::from_secs(2)).await;
        fixture.scheduler.submit(vec![spec.with_address(20)], None);
        let replaced_at = Instant::now();

        sleep(Duration::from_secs(5)).await;
        assert!(fixture.calls_at(10).iter().all(|at| *at <= replaced_at));
        assert!(fixture.calls_at(20).len() >= 3);
        assert_eq!(fixture.scheduler.active_loops(), vec!["A".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_interval_is_capped() {
        assert_eq!(
            capped(Duration::MAX),
            Duration::from_millis(MAX_POLL_INTERVAL_MS)
        );
        assert_eq!(capped(Duration::from_secs(1)), Duration::from_secs(1));

        let fixture = Fixture::connected(idle_reader()).await;
        fixture.scheduler.submit(
            vec![LoopSpec::named("forever")
                .with_address(6)
                .with_interval(Duration::from_millis(u64::MAX))],
            None,
        );
        let forever = idle_reader()
            .with_address(8)
            .with_rate(u64::MAX, RateUnit::H);
        fixture.scheduler.configure_default_loop(forever);
        sleep(Duration::from_secs(60)).await;

        assert_eq!(fixture.calls_at(6).len(), 1);
        assert_eq!(fixture.calls_at(8).len(), 1);
        assert_eq!(fixture.scheduler.active_loops(), vec!["forever".to_string()]);
        assert!(fixture.scheduler.default_loop_running());

        // Loop task is alive and still answers to cancel
        assert!(fixture.scheduler.cancel("forever"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_to_live_link_starts_default_loop_once() {
        let device = MockDevice::new();
        let manager = ConnectionManager::new(
            ConnectionConfig::new("mock", 502),
            MockConnector::new(device.clone()),
        )
        .unwrap();
        let mut events = manager.subscribe();
        manager.start().unwrap();
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);

        let (tx, _statuses) = mpsc::unbounded_channel();
        let (scheduler, _results) = PollingScheduler::attach(
            manager.clone(),
            idle_reader().with_address(4).with_rate(1, RateUnit::S),
            Arc::new(tx),
        );
        // A late Connected for the same link
        scheduler.shared.on_link_up_if(true);
        sleep(Duration::from_millis(500)).await;

        assert!(scheduler.default_loop_running());
        assert_eq!(device.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configure_default_loop_restarts() {
        let fixture = Fixture::connected(idle_reader()).await;
        assert!(!fixture.scheduler.default_loop_running());

        fixture
            .scheduler
            .configure_default_loop(idle_reader().with_address(42).with_rate(500, RateUnit::Ms));
        assert!(fixture.scheduler.default_loop_running());
        sleep(Duration::from_millis(1100)).await;
        assert_eq!(fixture.calls_at(42).len(), 3);
    }
}
