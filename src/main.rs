use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};

use serialsrv::bootstrap::{init_tracing, Args};
use serialsrv::config::GatewayConfig;
use serialsrv::core::client::RegisterSink;
use serialsrv::core::device::{ConnectionState, Device};
use serialsrv::core::register::{Register, RegisterErrorKind};
use serialsrv::runtime::Gateway;

/// Default downstream: settled values and errors go to the log. A real
/// deployment replaces this with a publishing layer.
#[derive(Debug)]
struct LoggingSink;

impl RegisterSink for LoggingSink {
    fn on_register_read(&self, register: &Arc<Register>, changed: bool) {
        if changed {
            info!(
                register = %register.key(),
                value = ?register.as_f64(),
                "value changed"
            );
        } else {
            debug!(register = %register.key(), "value confirmed");
        }
    }

    fn on_register_error(&self, register: &Arc<Register>, kind: RegisterErrorKind) {
        debug!(register = %register.key(), ?kind, "register error");
    }

    fn on_device_state(&self, device: &Arc<Device>, state: ConnectionState) {
        info!(device = %device.id(), ?state, "device state changed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(&args)?;

    let config = GatewayConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if args.validate {
        info!(config = %args.config.display(), "configuration is valid");
        return Ok(());
    }

    let gateway = Gateway::start(&config, Arc::new(LoggingSink))?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    gateway.shutdown().await;
    Ok(())
}
