//! Process bootstrap: command line and log setup.

use std::path::PathBuf;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::Result;

/// Serial/TCP device polling gateway.
#[derive(Debug, Parser)]
#[command(name = "serialsrv", version, about)]
pub struct Args {
    /// Configuration file (yaml, toml or json).
    #[arg(short, long, env = "SERIALSRV_CONFIG", default_value = "serialsrv.yaml")]
    pub config: PathBuf,

    /// Log filter, e.g. "info" or "serialsrv=debug".
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Also write daily-rotated log files into this directory.
    #[arg(long, env = "SERIALSRV_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    pub validate: bool,
}

/// Install the tracing subscriber. The returned guard must stay alive for
/// the process lifetime so buffered file output is flushed.
pub fn init_tracing(args: &Args) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(&args.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    match &args.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "serialsrv.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .with(file_layer)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .init();
            Ok(None)
        }
    }
}
