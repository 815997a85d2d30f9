//! Register model
//!
//! A register is an addressable quantity on a device: identity (device id,
//! register type, address, bit range), a declared numeric format with 16-bit
//! word order, and polling metadata (read period, sporadic mode, poll flag).
//!
//! Registers are interned: identical identity tuples resolve to the same
//! `Arc<Register>` so that read callbacks and write requests always target a
//! single shared object, even when several logical channels reference the
//! same physical register.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{GatewayError, Result};

/// Numeric format of a register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterFormat {
    U8,
    U16,
    U24,
    U32,
    U64,
    S8,
    S16,
    S24,
    S32,
    S64,
    Bcd8,
    Bcd16,
    Bcd24,
    Bcd32,
    Float,
    Double,
    Char8,
}

impl RegisterFormat {
    /// Width of the value on the wire, in bytes.
    pub fn width_bytes(self) -> u8 {
        match self {
            RegisterFormat::U8 | RegisterFormat::S8 | RegisterFormat::Bcd8 | RegisterFormat::Char8 => 1,
            RegisterFormat::U16 | RegisterFormat::S16 | RegisterFormat::Bcd16 => 2,
            RegisterFormat::U24 | RegisterFormat::S24 | RegisterFormat::Bcd24 => 3,
            RegisterFormat::U32 | RegisterFormat::S32 | RegisterFormat::Bcd32 | RegisterFormat::Float => 4,
            RegisterFormat::U64 | RegisterFormat::S64 | RegisterFormat::Double => 8,
        }
    }

    /// Number of 16-bit words needed to carry the value.
    pub fn width_words(self) -> u8 {
        self.width_bytes().div_ceil(2)
    }
}

/// Order of 16-bit words within a multi-word value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

/// How a register participates in the device's event mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SporadicMode {
    /// Value changes are obtained by polling only.
    #[default]
    Disabled,
    /// Value changes arrive via device events only; the register is never
    /// actively polled.
    OnlyEvents,
    /// Events are enabled and the register is also polled.
    EventsAndPolling,
}

/// Lazily discovered register availability on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Availability {
    #[default]
    Unknown,
    Available,
    Unavailable,
}

/// Last settled error on a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterErrorKind {
    /// Retryable read fault (timeout, bad checksum).
    TransientRead,
    /// Retryable write fault.
    TransientWrite,
    /// Device reported the register as unsupported.
    Permanent,
}

/// Register identity. Immutable once created; used for equality and lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegisterKey {
    /// Owning device id.
    pub device: String,
    /// Protocol-specific register type (e.g. Modbus holding vs input).
    pub reg_type: u8,
    /// Address within the register type.
    pub address: u32,
    /// First bit of the value within the addressed word(s).
    pub bit_offset: u8,
    /// Number of value bits, 1..=64.
    pub bit_width: u8,
}

impl std::fmt::Display for RegisterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.device, self.reg_type, self.address)?;
        if self.bit_offset != 0 || self.bit_width != 64 {
            write!(f, "[{}+{}]", self.bit_offset, self.bit_width)?;
        }
        Ok(())
    }
}

/// Mutable poll state, owned by the port task; external observers only take
/// snapshots through `Register` accessors.
#[derive(Debug, Default)]
struct RegState {
    raw: Option<u64>,
    last_ok_read: Option<Instant>,
    last_read_wall: Option<DateTime<Utc>>,
    error: Option<RegisterErrorKind>,
    availability: Availability,
}

/// An addressable value on a device together with its polling metadata.
#[derive(Debug)]
pub struct Register {
    key: RegisterKey,
    format: RegisterFormat,
    word_order: WordOrder,
    scale: f64,
    offset: f64,
    read_period: Option<Duration>,
    sporadic: SporadicMode,
    poll: bool,
    state: RwLock<RegState>,
}

impl Register {
    /// Create a register, validating the format/bit-range combination.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: RegisterKey,
        format: RegisterFormat,
        word_order: WordOrder,
        scale: f64,
        offset: f64,
        read_period: Option<Duration>,
        sporadic: SporadicMode,
        poll: bool,
    ) -> Result<Self> {
        if key.bit_width == 0 || key.bit_width > 64 {
            return Err(GatewayError::config(format!(
                "register {key}: bit width must be 1..=64, got {}",
                key.bit_width
            )));
        }
        let format_bits = u16::from(format.width_bytes()) * 8;
        if u16::from(key.bit_offset) + u16::from(key.bit_width) > format_bits {
            return Err(GatewayError::config(format!(
                "register {key}: bit range {}+{} exceeds {format_bits}-bit format",
                key.bit_offset, key.bit_width
            )));
        }
        if scale == 0.0 {
            return Err(GatewayError::config(format!(
                "register {key}: scale must be non-zero"
            )));
        }
        Ok(Self {
            key,
            format,
            word_order,
            scale,
            offset,
            read_period,
            sporadic,
            poll,
            state: RwLock::new(RegState::default()),
        })
    }

    pub fn key(&self) -> &RegisterKey {
        &self.key
    }

    pub fn format(&self) -> RegisterFormat {
        self.format
    }

    pub fn word_order(&self) -> WordOrder {
        self.word_order
    }

    pub fn read_period(&self) -> Option<Duration> {
        self.read_period
    }

    pub fn sporadic(&self) -> SporadicMode {
        self.sporadic
    }

    /// Whether this register is ever actively read (vs write-only or
    /// events-only).
    pub fn is_polled(&self) -> bool {
        self.poll && self.sporadic != SporadicMode::OnlyEvents
    }

    pub fn is_poll_enabled(&self) -> bool {
        self.poll
    }

    /// Accept a raw value from the device. Returns true when the value
    /// differs from the previous one. Clears any read error.
    pub fn set_value(&self, raw: u64, now: Instant) -> bool {
        let raw = extract_bits(raw, self.key.bit_offset, self.key.bit_width);
        let mut state = self.state.write().expect("register state poisoned");
        let changed = state.raw != Some(raw);
        state.raw = Some(raw);
        state.last_ok_read = Some(now);
        state.last_read_wall = Some(Utc::now());
        state.error = None;
        state.availability = Availability::Available;
        changed
    }

    /// Current raw value, if any read has settled.
    pub fn value(&self) -> Option<u64> {
        self.state.read().expect("register state poisoned").raw
    }

    /// Current value decoded through format, scale and offset.
    pub fn as_f64(&self) -> Option<f64> {
        self.value()
            .map(|raw| decode_raw(raw, self.format) * self.scale + self.offset)
    }

    pub fn set_error(&self, kind: RegisterErrorKind) {
        let mut state = self.state.write().expect("register state poisoned");
        state.error = Some(kind);
        if kind == RegisterErrorKind::Permanent {
            state.availability = Availability::Unavailable;
        }
    }

    pub fn error(&self) -> Option<RegisterErrorKind> {
        self.state.read().expect("register state poisoned").error
    }

    pub fn availability(&self) -> Availability {
        self.state
            .read()
            .expect("register state poisoned")
            .availability
    }

    /// Forget the lazily discovered availability, used on device reconnect.
    pub fn reset_availability(&self) {
        let mut state = self.state.write().expect("register state poisoned");
        state.availability = Availability::Unknown;
        if state.error == Some(RegisterErrorKind::Permanent) {
            state.error = None;
        }
    }

    pub fn last_ok_read(&self) -> Option<Instant> {
        self.state
            .read()
            .expect("register state poisoned")
            .last_ok_read
    }

    /// Wall-clock timestamp of the last settled read, for publishing layers.
    pub fn last_read_timestamp(&self) -> Option<DateTime<Utc>> {
        self.state
            .read()
            .expect("register state poisoned")
            .last_read_wall
    }
}

/// Extract `width` bits starting at `offset` from a raw word value.
fn extract_bits(raw: u64, offset: u8, width: u8) -> u64 {
    let shifted = raw >> offset;
    if width >= 64 {
        shifted
    } else {
        shifted & ((1u64 << width) - 1)
    }
}

/// Decode a raw register value into a float according to its format.
pub fn decode_raw(raw: u64, format: RegisterFormat) -> f64 {
    match format {
        RegisterFormat::U8 => (raw as u8) as f64,
        RegisterFormat::U16 => (raw as u16) as f64,
        RegisterFormat::U24 => (raw & 0xFF_FFFF) as f64,
        RegisterFormat::U32 => (raw as u32) as f64,
        RegisterFormat::U64 => raw as f64,
        RegisterFormat::S8 => (raw as u8 as i8) as f64,
        RegisterFormat::S16 => (raw as u16 as i16) as f64,
        RegisterFormat::S24 => {
            let v = (raw & 0xFF_FFFF) as i64;
            let v = if v & 0x80_0000 != 0 { v - 0x100_0000 } else { v };
            v as f64
        }
        RegisterFormat::S32 => (raw as u32 as i32) as f64,
        RegisterFormat::S64 => (raw as i64) as f64,
        RegisterFormat::Bcd8 => bcd_to_u64(raw & 0xFF) as f64,
        RegisterFormat::Bcd16 => bcd_to_u64(raw & 0xFFFF) as f64,
        RegisterFormat::Bcd24 => bcd_to_u64(raw & 0xFF_FFFF) as f64,
        RegisterFormat::Bcd32 => bcd_to_u64(raw & 0xFFFF_FFFF) as f64,
        RegisterFormat::Float => f64::from(f32::from_bits(raw as u32)),
        RegisterFormat::Double => f64::from_bits(raw),
        RegisterFormat::Char8 => (raw as u8) as f64,
    }
}

/// Packed-BCD to binary. Invalid nibbles saturate to 9 rather than failing,
/// matching the tolerant behavior of the meters this format comes from.
pub fn bcd_to_u64(mut bcd: u64) -> u64 {
    let mut result = 0u64;
    let mut multiplier = 1u64;
    while bcd != 0 {
        let nibble = (bcd & 0xF).min(9);
        result += nibble * multiplier;
        multiplier *= 10;
        bcd >>= 4;
    }
    result
}

/// Binary to packed-BCD.
pub fn u64_to_bcd(mut value: u64) -> u64 {
    let mut result = 0u64;
    let mut shift = 0u32;
    while value != 0 {
        result |= (value % 10) << shift;
        value /= 10;
        shift += 4;
    }
    result
}

/// Assemble a raw value from response words honoring the word order.
pub fn raw_from_words(words: &[u16], order: WordOrder) -> u64 {
    let mut raw = 0u64;
    match order {
        WordOrder::BigEndian => {
            for &w in words {
                raw = (raw << 16) | u64::from(w);
            }
        }
        WordOrder::LittleEndian => {
            for &w in words.iter().rev() {
                raw = (raw << 16) | u64::from(w);
            }
        }
    }
    raw
}

/// Split a raw value into `count` wire words honoring the word order.
pub fn words_from_raw(raw: u64, count: u8, order: WordOrder) -> Vec<u16> {
    let mut words: Vec<u16> = (0..count)
        .rev()
        .map(|i| ((raw >> (16 * u32::from(i))) & 0xFFFF) as u16)
        .collect();
    if order == WordOrder::LittleEndian {
        words.reverse();
    }
    words
}

/// Interning storage: identical register keys resolve to one instance.
#[derive(Debug, Default)]
pub struct RegisterBank {
    registers: DashMap<RegisterKey, Arc<Register>>,
}

impl RegisterBank {
    pub fn new() -> Self {
        Self {
            registers: DashMap::new(),
        }
    }

    /// Return the interned register for `key`, creating it with `make` on
    /// first use.
    pub fn intern<F>(&self, key: RegisterKey, make: F) -> Result<Arc<Register>>
    where
        F: FnOnce() -> Result<Register>,
    {
        if let Some(existing) = self.registers.get(&key) {
            return Ok(existing.clone());
        }
        let reg = Arc::new(make()?);
        self.registers.insert(key, reg.clone());
        Ok(reg)
    }

    pub fn get(&self, key: &RegisterKey) -> Option<Arc<Register>> {
        self.registers.get(key).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(address: u32) -> RegisterKey {
        RegisterKey {
            device: "meter1".to_string(),
            reg_type: 0,
            address,
            bit_offset: 0,
            bit_width: 16,
        }
    }

    fn make_register(address: u32) -> Register {
        Register::new(
            key(address),
            RegisterFormat::U16,
            WordOrder::BigEndian,
            1.0,
            0.0,
            None,
            SporadicMode::Disabled,
            true,
        )
        .unwrap()
    }

    #[test]
    fn rejects_invalid_bit_range() {
        let mut k = key(1);
        k.bit_width = 0;
        assert!(Register::new(
            k,
            RegisterFormat::U16,
            WordOrder::BigEndian,
            1.0,
            0.0,
            None,
            SporadicMode::Disabled,
            true
        )
        .is_err());

        let mut k = key(1);
        k.bit_offset = 8;
        k.bit_width = 16; // 8+16 > 16-bit format
        assert!(Register::new(
            k,
            RegisterFormat::U16,
            WordOrder::BigEndian,
            1.0,
            0.0,
            None,
            SporadicMode::Disabled,
            true
        )
        .is_err());
    }

    #[tokio::test]
    async fn value_change_detection() {
        let reg = make_register(1);
        let now = Instant::now();
        assert!(reg.set_value(42, now));
        assert!(!reg.set_value(42, now));
        assert!(reg.set_value(43, now));
        assert_eq!(reg.value(), Some(43));
        assert_eq!(reg.availability(), Availability::Available);
    }

    #[test]
    fn bit_extraction() {
        // Low byte of a 16-bit word.
        let k = RegisterKey {
            device: "io1".to_string(),
            reg_type: 0,
            address: 7,
            bit_offset: 0,
            bit_width: 8,
        };
        let reg = Register::new(
            k,
            RegisterFormat::U16,
            WordOrder::BigEndian,
            1.0,
            0.0,
            None,
            SporadicMode::Disabled,
            true,
        )
        .unwrap();
        reg.set_value(0xAB12, Instant::now());
        assert_eq!(reg.value(), Some(0x12));
    }

    #[test]
    fn bcd_codec() {
        assert_eq!(bcd_to_u64(0x1234), 1234);
        assert_eq!(u64_to_bcd(1234), 0x1234);
        assert_eq!(bcd_to_u64(0), 0);
        // Invalid nibble saturates instead of failing.
        assert_eq!(bcd_to_u64(0x1F), 19);
    }

    #[test]
    fn word_order_assembly() {
        assert_eq!(
            raw_from_words(&[0x1122, 0x3344], WordOrder::BigEndian),
            0x1122_3344
        );
        assert_eq!(
            raw_from_words(&[0x1122, 0x3344], WordOrder::LittleEndian),
            0x3344_1122
        );
        assert_eq!(
            words_from_raw(0x1122_3344, 2, WordOrder::BigEndian),
            vec![0x1122, 0x3344]
        );
        assert_eq!(
            words_from_raw(0x1122_3344, 2, WordOrder::LittleEndian),
            vec![0x3344, 0x1122]
        );
    }

    #[test]
    fn float_decode() {
        let raw = u64::from(1.5f32.to_bits());
        assert!((decode_raw(raw, RegisterFormat::Float) - 1.5).abs() < f64::EPSILON);
        let raw = 2.25f64.to_bits();
        assert!((decode_raw(raw, RegisterFormat::Double) - 2.25).abs() < f64::EPSILON);
    }

    #[test]
    fn signed_decode() {
        assert_eq!(decode_raw(0xFFFF, RegisterFormat::S16), -1.0);
        assert_eq!(decode_raw(0xFF_FFFF, RegisterFormat::S24), -1.0);
        assert_eq!(decode_raw(0x80_0000, RegisterFormat::S24), -8_388_608.0);
    }

    #[test]
    fn interning_returns_same_instance() {
        let bank = RegisterBank::new();
        let a = bank.intern(key(5), || Ok(make_register(5))).unwrap();
        let b = bank.intern(key(5), || Ok(make_register(5))).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(bank.len(), 1);
        let c = bank.intern(key(6), || Ok(make_register(6))).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(bank.len(), 2);
    }
}
