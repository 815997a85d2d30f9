//! Serial transport
//!
//! tokio-serial implementation of the port transaction primitive. Tracks the
//! instant of the last byte moved in either direction so the cycle driver
//! can enforce protocol turn-around silence, and supports a per-device
//! override of the line byte format that is restored when cleared.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use super::traits::{FrameCompleteFn, FrameRead, LineSettings, Parity, Transport};
use crate::error::TransactionError;

/// Serial port configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialPortConfig {
    /// Device node path, e.g. "/dev/ttyRS485-1".
    pub path: String,
    /// Base line settings; devices may override them transiently.
    #[serde(flatten)]
    pub line: LineSettings,
}

impl SerialPortConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.path.is_empty() {
            return Err("serial port path cannot be empty".to_string());
        }
        self.line.validate()
    }
}

/// Serial implementation of the port transaction primitive.
#[derive(Debug)]
pub struct SerialTransport {
    config: SerialPortConfig,
    stream: Option<SerialStream>,
    last_interaction: Option<Instant>,
    override_active: bool,
}

impl SerialTransport {
    pub fn new(config: SerialPortConfig) -> Result<Self, TransactionError> {
        config
            .validate()
            .map_err(|e| TransactionError::io(format!("serial config: {e}")))?;
        Ok(Self {
            config,
            stream: None,
            last_interaction: None,
            override_active: false,
        })
    }

    fn stream_mut(&mut self) -> Result<&mut SerialStream, TransactionError> {
        self.stream
            .as_mut()
            .ok_or_else(|| TransactionError::io("serial port not open"))
    }

    fn apply_settings(
        stream: &mut SerialStream,
        settings: &LineSettings,
    ) -> Result<(), TransactionError> {
        stream
            .set_baud_rate(settings.baud_rate)
            .and_then(|()| stream.set_data_bits(to_data_bits(settings.data_bits)))
            .and_then(|()| stream.set_stop_bits(to_stop_bits(settings.stop_bits)))
            .and_then(|()| stream.set_parity(to_parity(settings.parity)))
            .map_err(|e| TransactionError::io(format!("line settings: {e}")))
    }
}

fn to_data_bits(bits: u8) -> tokio_serial::DataBits {
    match bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

fn to_stop_bits(bits: u8) -> tokio_serial::StopBits {
    match bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    }
}

fn to_parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn transport_type(&self) -> &str {
        "serial"
    }

    fn describe(&self) -> String {
        format!("serial:{}", self.config.path)
    }

    async fn open(&mut self) -> Result<(), TransactionError> {
        if self.stream.is_some() {
            return Ok(());
        }
        debug!(path = %self.config.path, "opening serial port");
        let mut stream = tokio_serial::new(&self.config.path, self.config.line.baud_rate)
            .data_bits(to_data_bits(self.config.line.data_bits))
            .stop_bits(to_stop_bits(self.config.line.stop_bits))
            .parity(to_parity(self.config.line.parity))
            .open_native_async()
            .map_err(|e| {
                TransactionError::io(format!("failed to open {}: {e}", self.config.path))
            })?;
        #[cfg(unix)]
        stream
            .set_exclusive(false)
            .map_err(|e| TransactionError::io(format!("failed to set exclusive mode: {e}")))?;
        self.stream = Some(stream);
        self.override_active = false;
        info!(path = %self.config.path, "serial port opened");

        // A just-opened line may carry stale bytes from a previous half
        // transaction.
        self.skip_noise().await
    }

    async fn close(&mut self) {
        if self.stream.take().is_some() {
            info!(path = %self.config.path, "serial port closed");
        }
        self.override_active = false;
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn write_bytes(&mut self, buf: &[u8]) -> Result<(), TransactionError> {
        let stream = self.stream_mut()?;
        stream
            .write_all(buf)
            .await
            .map_err(|e| TransactionError::io(format!("serial write failed: {e}")))?;
        stream
            .flush()
            .await
            .map_err(|e| TransactionError::io(format!("serial flush failed: {e}")))?;
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
                path = %self.config.path,
                bytes = discarded,
                "discarded noise from serial line"
            );
            self.last_interaction = Some(Instant::now());
        }
        Ok(())
    }

    fn apply_line_override(&mut self, settings: &LineSettings) -> Result<(), TransactionError> {
        if *settings == self.config.line {
            return Ok(());
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TransactionError::io("serial port not open"))?;
        Self::apply_settings(stream, settings)?;
        self.override_active = true;
        debug!(path = %self.config.path, ?settings, "line override applied");
        Ok(())
    }

    fn clear_line_override(&mut self) -> Result<(), TransactionError> {
        if !self.override_active {
            return Ok(());
        }
        let base = self.config.line;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TransactionError::io("serial port not open"))?;
        Self::apply_settings(stream, &base)?;
        self.override_active = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation() {
        let config = SerialPortConfig {
            path: "/dev/ttyUSB0".to_string(),
            line: LineSettings::default(),
        };
        assert!(config.validate().is_ok());

        let config = SerialPortConfig {
            path: String::new(),
            line: LineSettings::default(),
        };
        assert!(config.validate().is_err());

        let config = SerialPortConfig {
            path: "/dev/ttyUSB0".to_string(),
            line: LineSettings {
                data_bits: 9,
                ..Default::default()
            },
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn operations_on_closed_port_fail_with_io() {
        let mut transport = SerialTransport::new(SerialPortConfig {
            path: "/dev/ttyNONEXISTENT".to_string(),
            line: LineSettings::default(),
        })
        .unwrap();
        assert!(!transport.is_open());
        let err = transport.write_bytes(&[0x01]).await.unwrap_err();
        assert!(err.is_io());
        // Close is idempotent even when never opened.
        transport.close().await;
        transport.close().await;
    }
}
