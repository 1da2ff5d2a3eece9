//! Voltage Modbus Flow Demo
//!
//! Connects to a Modbus TCP slave and drives it from newline-delimited JSON
//! on stdin:
//! - `{"payload": {"name": "poll1", "address": 0, "quantity": 4, "dataType": "Coil", "interval": 500}}`
//!   starts (or replaces) a polling loop
//! - `{"kill": true, "payload": {"name": "poll1"}}` stops it
//! - `{"write": {"payload": [1, 2, 3], "address": 10}}` writes holding registers
//!
//! A default loop reads holding registers 0..10 every 5 s. Every read
//! result is printed to stdout as one JSON line. Logging goes to stderr and
//! is controlled by `RUST_LOG`.
//!
//! Usage: cargo run --bin demo [server_address]
//! Example: cargo run --bin demo 127.0.0.1:502

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use voltage_modbus_flow::{
    ConnectionConfig, ConnectionManager, InboundMessage, ModbusResult, PollingScheduler,
    RateUnit, ReaderConfig, TracingSink, WriteDataType, WriteDispatcher, WriterConfig,
    DEFAULT_TCP_PORT,
};

fn parse_address(arg: Option<String>) -> (String, u16) {
    let address = arg.unwrap_or_else(|| "127.0.0.1:502".to_string());
    match address.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(DEFAULT_TCP_PORT)),
        None => (address, DEFAULT_TCP_PORT),
    }
}

#[tokio::main]
async fn main() -> ModbusResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let (host, port) = parse_address(std::env::args().nth(1));
    let config = ConnectionConfig::new(host, port)
        .with_timeout(Duration::from_secs(5))
        .with_reconnect_timeout(Duration::from_secs(2));
    info!("{} connecting to {}", voltage_modbus_flow::info(), config.socket_address());

    let manager = ConnectionManager::tcp(config)?;
    let sink = Arc::new(TracingSink);

    // Default loop: first ten holding registers every 5 s
    let reader = ReaderConfig::new("demo-reader")
        .with_quantity(10)
        .with_rate(5, RateUnit::S);
    let (scheduler, mut results) = PollingScheduler::attach(manager.clone(), reader, sink.clone());
    let writer = WriteDispatcher::attach(
        manager.clone(),
        WriterConfig::new("demo-writer", WriteDataType::HoldingRegisters),
        sink,
    );
    manager.start()?;

    let printer = tokio::spawn(async move {
        while let Some(result) = results.recv().await {
            match result.to_json() {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Unprintable result: {}", e),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(e) => {
                warn!("Ignoring malformed line: {}", e);
                continue;
            }
        };

        if let Some(write) = value.get("write") {
            let message: InboundMessage = match serde_json::from_value(write.clone()) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Ignoring malformed write: {}", e);
                    continue;
                }
            };
            match writer.handle(&message).await {
                Ok(outcome) => info!(
                    "Wrote {} value(s) at {} ({})",
                    outcome.count, outcome.address, outcome.function
                ),
                Err(e) => warn!("Write rejected: {}", e),
            }
        } else {
            match serde_json::from_value::<InboundMessage>(value) {
                Ok(message) => scheduler.handle(&message),
                Err(e) => warn!("Ignoring malformed control message: {}", e),
            }
        }
    }

    scheduler.shutdown();
    writer.detach();
    manager.stop().await;
    printer.abort();
    Ok(())
}
