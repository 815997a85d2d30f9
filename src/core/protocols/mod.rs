//! Protocol codecs
//!
//! A codec turns scheduler actions into request frames and response frames
//! back into raw register values. Codecs are pure and stateless apart from
//! counters, so one instance serves every port speaking that protocol.

pub mod modbus;

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use super::device::Device;
use super::register::Register;
use super::scheduler::ReadRange;
use super::transport::LineSettings;
use crate::error::TransactionError;

pub use modbus::{ModbusCodec, ModbusMode};

/// One device event decoded from an event-poll response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub reg_type: u8,
    pub address: u32,
    pub raw: u64,
}

/// Frame-completeness predicate produced per request.
pub type FrameChecker = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Wire codec for one protocol.
pub trait ProtocolCodec: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Upper bound on a response frame, used to size read buffers.
    fn max_frame_len(&self) -> usize;

    /// Map a register type name from the configuration to the protocol's
    /// register type byte.
    fn reg_type_from_str(&self, name: &str) -> Option<u8>;

    /// Check a register's addressing against the protocol's wire limits, so
    /// configuration that cannot be encoded is rejected at load time.
    fn validate_register(
        &self,
        _reg_type: u8,
        _address: u32,
        _width_words: u8,
    ) -> Result<(), String> {
        Ok(())
    }

    /// Largest register count one read request may carry for `reg_type`.
    fn max_read_count(&self, _reg_type: u8) -> usize {
        usize::MAX
    }

    /// Serial line settings the protocol itself mandates; used when the
    /// device configuration carries no override of its own.
    fn preferred_line_settings(&self) -> Option<LineSettings> {
        None
    }

    fn encode_read_request(
        &self,
        device: &Device,
        range: &ReadRange,
    ) -> Result<Vec<u8>, TransactionError>;

    /// Decode a read response into raw values, one per range member in
    /// address order.
    fn decode_read_response(
        &self,
        device: &Device,
        range: &ReadRange,
        frame: &[u8],
    ) -> Result<Vec<u64>, TransactionError>;

    fn encode_write_request(
        &self,
        device: &Device,
        register: &Register,
        raw: u64,
    ) -> Result<Vec<u8>, TransactionError>;

    fn decode_write_response(
        &self,
        device: &Device,
        register: &Register,
        frame: &[u8],
    ) -> Result<(), TransactionError>;

    /// Whether the protocol has a device-side event queue.
    fn supports_events(&self) -> bool {
        false
    }

    fn encode_enable_events(&self, _device: &Device) -> Result<Vec<u8>, TransactionError> {
        Err(TransactionError::protocol("events not supported"))
    }

    fn decode_enable_events_response(
        &self,
        _device: &Device,
        _frame: &[u8],
    ) -> Result<(), TransactionError> {
        Err(TransactionError::protocol("events not supported"))
    }

    fn encode_events_poll(&self, _device: &Device) -> Result<Vec<u8>, TransactionError> {
        Err(TransactionError::protocol("events not supported"))
    }

    fn decode_events_response(
        &self,
        _device: &Device,
        _frame: &[u8],
    ) -> Result<Vec<EventRecord>, TransactionError> {
        Err(TransactionError::protocol("events not supported"))
    }

    /// Predicate recognizing a complete response to `request`, letting the
    /// transport return as soon as the frame is whole instead of waiting
    /// out the inter-byte timeout.
    fn response_complete(&self, _request: &[u8]) -> Option<FrameChecker> {
        None
    }
}

/// Name-indexed codec registry, populated with the built-in protocols at
/// startup.
#[derive(Debug, Default)]
pub struct CodecRegistry {
    codecs: DashMap<String, Arc<dyn ProtocolCodec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self {
            codecs: DashMap::new(),
        }
    }

    /// Registry with the built-in protocols registered.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(ModbusCodec::new(ModbusMode::Rtu)));
        registry.register(Arc::new(ModbusCodec::new(ModbusMode::Tcp)));
        registry
    }

    pub fn register(&self, codec: Arc<dyn ProtocolCodec>) {
        self.codecs.insert(codec.name().to_string(), codec);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProtocolCodec>> {
        self.codecs.get(name).map(|c| c.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.codecs.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_has_both_modbus_variants() {
        let registry = CodecRegistry::with_builtin();
        assert!(registry.get("modbus_rtu").is_some());
        assert!(registry.get("modbus_tcp").is_some());
        assert!(registry.get("dlt645").is_none());
    }
}
