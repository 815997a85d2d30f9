//! Transport layer traits
//!
//! The transport is the minimal, timing-correct I/O surface the protocol
//! codecs run against: open/close, whole-buffer writes, framed reads with
//! response and inter-byte timeouts, enforced bus silence, and noise
//! draining. Exactly one request/response transaction is in flight on a
//! transport at any instant; the owning port task guarantees this.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransactionError;

/// Serial line parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Serial byte-format settings. Some protocols require a per-device
/// override of the port's base settings for the duration of one device's
/// transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

impl LineSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.baud_rate == 0 {
            return Err("baud rate must be greater than zero".to_string());
        }
        if ![5, 6, 7, 8].contains(&self.data_bits) {
            return Err(format!("data bits must be 5..=8, got {}", self.data_bits));
        }
        if ![1, 2].contains(&self.stop_bits) {
            return Err(format!("stop bits must be 1 or 2, got {}", self.stop_bits));
        }
        Ok(())
    }
}

/// Result of a framed read.
#[derive(Debug, Clone)]
pub struct FrameRead {
    /// The received frame.
    pub bytes: Vec<u8>,
    /// Time between issuing the read and the first received byte.
    pub first_byte_latency: Duration,
}

/// Predicate recognizing a complete frame for a given protocol.
pub type FrameCompleteFn<'a> = &'a (dyn Fn(&[u8]) -> bool + Send + Sync);

/// A physical half-duplex channel (serial line or TCP socket).
#[async_trait]
pub trait Transport: Send + fmt::Debug {
    /// Short identifier ("serial", "tcp", "mock").
    fn transport_type(&self) -> &str;

    /// Human-readable endpoint description for logging.
    fn describe(&self) -> String;

    /// Open the channel. Fails with `Io` when the device node or socket is
    /// unavailable.
    async fn open(&mut self) -> Result<(), TransactionError>;

    /// Close the channel. Idempotent.
    async fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Blocking write of the whole buffer.
    async fn write_bytes(&mut self, buf: &[u8]) -> Result<(), TransactionError>;

    /// Read one response frame.
    ///
    /// Blocks until the `frame_complete` predicate accepts the bytes read so
    /// far, or `frame_timeout` elapses since the last received byte
    /// (inter-byte silence marks end of frame), or no byte at all arrives
    /// within `response_timeout`. Zero received bytes is a transient
    /// `Timeout`; hard channel faults are `Io`.
    async fn read_frame(
        &mut self,
        max_len: usize,
        response_timeout: Duration,
        frame_timeout: Duration,
        frame_complete: Option<FrameCompleteFn<'_>>,
    ) -> Result<FrameRead, TransactionError>;

    /// Sleep until at least `min_gap` has passed since the last byte moved
    /// on this channel in either direction.
    async fn sleep_since_last_interaction(&mut self, min_gap: Duration);

    /// Drain and discard unsolicited bytes.
    async fn skip_noise(&mut self) -> Result<(), TransactionError>;

    /// Temporarily switch the serial byte format for one device's
    /// transactions. No-op for transports without line settings.
    fn apply_line_override(&mut self, _settings: &LineSettings) -> Result<(), TransactionError> {
        Ok(())
    }

    /// Restore the port's base byte format.
    fn clear_line_override(&mut self) -> Result<(), TransactionError> {
        Ok(())
    }
}
