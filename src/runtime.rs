//! Port runtime
//!
//! One tokio task per port runs the cycle loop: execute the next action,
//! park until the next deadline or a write wakeup when idle, and reopen the
//! channel with exponential backoff after an I/O failure. The `Gateway`
//! assembles the tasks from a validated configuration and owns their
//! shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::GatewayConfig;
use crate::core::client::{ClientHandle, CycleStatus, RegisterSink, SerialClient};
use crate::core::protocols::CodecRegistry;
use crate::core::register::RegisterBank;
use crate::error::Result;

const INITIAL_REOPEN_DELAY: Duration = Duration::from_secs(1);
const MAX_REOPEN_DELAY: Duration = Duration::from_secs(30);

/// Drive one port until the token is cancelled.
pub async fn run_port(mut client: SerialClient, shutdown: CancellationToken) {
    let port = client.port_name().to_string();
    let wakeup = client.wakeup();
    let mut reopen_delay = INITIAL_REOPEN_DELAY;

    info!(%port, "port task started");
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        if !client.is_open() {
            match client.open().await {
                Ok(()) => {
                    reopen_delay = INITIAL_REOPEN_DELAY;
                }
                Err(e) => {
                    warn!(%port, error = %e, delay = ?reopen_delay, "port open failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(reopen_delay) => {}
                    }
                    reopen_delay = (reopen_delay * 2).min(MAX_REOPEN_DELAY);
                    continue;
                }
            }
        }

        match client.cycle().await {
            Ok(CycleStatus::Busy) => {}
            Ok(CycleStatus::Idle { until }) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = wakeup.notified() => {}
                    _ = async {
                        match until {
                            Some(deadline) => sleep_until(deadline).await,
                            None => std::future::pending().await,
                        }
                    } => {}
                }
            }
            Err(e) => {
                error!(%port, error = %e, "port cycle failed, reopening");
                client.close().await;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(reopen_delay) => {}
                }
                reopen_delay = (reopen_delay * 2).min(MAX_REOPEN_DELAY);
            }
        }
    }
    client.close().await;
    info!(%port, "port task stopped");
}

/// Running gateway: the port tasks plus the shared register bank and the
/// per-port write handles.
pub struct Gateway {
    handles: HashMap<String, ClientHandle>,
    bank: Arc<RegisterBank>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Gateway {
    /// Build clients from a validated configuration and spawn one task per
    /// port.
    pub fn start(config: &GatewayConfig, sink: Arc<dyn RegisterSink>) -> Result<Self> {
        let registry = CodecRegistry::with_builtin();
        let bank = Arc::new(RegisterBank::new());
        let shutdown = CancellationToken::new();

        let mut handles = HashMap::new();
        let mut tasks = Vec::new();
        for port in &config.ports {
            let transport = port.build_transport()?;
            let devices = port.build_devices(&registry, &bank)?;
            let (client, handle) =
                SerialClient::new(&port.name, transport, &registry, devices, sink.clone())?;
            handles.insert(port.name.clone(), handle);
            tasks.push(tokio::spawn(run_port(client, shutdown.child_token())));
        }
        info!(ports = tasks.len(), registers = bank.len(), "gateway started");
        Ok(Self {
            handles,
            bank,
            shutdown,
            tasks,
        })
    }

    /// Write-side handle for a port.
    pub fn handle(&self, port: &str) -> Option<&ClientHandle> {
        self.handles.get(port)
    }

    pub fn registers(&self) -> &Arc<RegisterBank> {
        &self.bank
    }

    /// Cancel the port tasks and wait for them to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "port task panicked");
            }
        }
        info!("gateway stopped");
    }
}
