//! TCP transport
//!
//! The same transaction surface over a TCP socket, for Modbus TCP gateways
//! and serial-over-TCP converters. Line-settings overrides are no-ops here.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::traits::{FrameCompleteFn, FrameRead, Transport};
use crate::error::TransactionError;

/// TCP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpPortConfig {
    pub host: String,
    pub port: u16,
    /// Timeout for establishing the connection.
    #[serde(default = "default_connect_timeout", with = "humantime_millis")]
    pub connect_timeout: Duration,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Millisecond (de)serialization for durations in config files.
pub(crate) mod humantime_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl TcpPortConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("tcp host cannot be empty".to_string());
        }
        if self.port == 0 {
            return Err("tcp port cannot be zero".to_string());
        }
        Ok(())
    }
}

/// TCP implementation of the port transaction primitive.
#[derive(Debug)]
pub struct TcpTransport {
    config: TcpPortConfig,
    stream: Option<TcpStream>,
    last_interaction: Option<Instant>,
}

impl TcpTransport {
    pub fn new(config: TcpPortConfig) -> Result<Self, TransactionError> {
        config
            .validate()
            .map_err(|e| TransactionError::io(format!("tcp config: {e}")))?;
        Ok(Self {
            config,
            stream: None,
            last_interaction: None,
        })
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream, TransactionError> {
        self.stream
            .as_mut()
            .ok_or_else(|| TransactionError::io("tcp socket not connected"))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn transport_type(&self) -> &str {
        "tcp"
    }

    fn describe(&self) -> String {
        format!("tcp:{}:{}", self.config.host, self.config.port)
    }

    async fn open(&mut self) -> Result<(), TransactionError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let addr = format!("{}:{}", self.config.host, self.config.port);
        debug!(%addr, "connecting tcp port");
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransactionError::io(format!("connect to {addr} timed out")))?
            .map_err(|e| TransactionError::io(format!("connect to {addr} failed: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransactionError::io(format!("set_nodelay failed: {e}")))?;
        self.stream = Some(stream);
        info!(%addr, "tcp port connected");
        self.skip_noise().await
    }

    async fn close(&mut self) {
        if self.stream.take().is_some() {
            info!(host = %self.config.host, port = self.config.port, "tcp port closed");
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn write_bytes(&mut self, buf: &[u8]) -> Result<(), TransactionError> {
        let stream = self.stream_mut()?;
        stream
            .write_all(buf)
            .await
            .map_err(|e| TransactionError::io(format!("tcp write failed: {e}")))?;
        self.last_interaction = Some(Instant::now());
        Ok(())
    }

    async fn read_frame(
        &mut self,
        max_len: usize,
        response_timeout: Duration,
        frame_timeout: Duration,
        frame_complete: Option<FrameCompleteFn<'_>>,
    ) -> Result<FrameRead, TransactionError> {
        let stream = self.stream_mut()?;
        let frame = super::read_framed(
            stream,
            max_len,
            response_timeout,
            frame_timeout,
            frame_complete,
        )
        .await?;
        self.last_interaction = Some(Instant::now());
        Ok(frame)
    }

    async fn sleep_since_last_interaction(&mut self, min_gap: Duration) {
        if min_gap.is_zero() {
            return;
        }
        if let Some(last) = self.last_interaction {
            let elapsed = last.elapsed();
            if elapsed < min_gap {
                tokio::time::sleep(min_gap - elapsed).await;
            }
        }
    }

    async fn skip_noise(&mut self) -> Result<(), TransactionError> {
        let stream = self.stream_mut()?;
        let discarded = super::drain_noise(stream).await?;
        if discarded > 0 {
            warn!(
                host = %self.config.host,
                bytes = discarded,
                "discarded noise from tcp stream"
            );
            self.last_interaction = Some(Instant::now());
        }
        Ok(())
    }
}
