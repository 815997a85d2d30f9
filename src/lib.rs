//! serialsrv: a polling gateway for field devices on serial lines and TCP
//! sockets.
//!
//! The crate models devices as sets of addressable registers, schedules
//! periodic and best-effort reads per port, drives request/response
//! transactions through pluggable protocol codecs (Modbus RTU/TCP built in),
//! tracks per-device connection state with setup replay on reconnect, and
//! exposes settled values and errors through a `RegisterSink`.

pub mod bootstrap;
pub mod config;
pub mod core;
pub mod error;
pub mod runtime;

pub use crate::config::{DeviceConfig, GatewayConfig, PortConfig, RegisterConfig, TransportConfig};
pub use crate::core::{
    Availability, ClientHandle, CodecRegistry, ConnectionState, CycleStatus, Device,
    DeviceTimings, PollAction, PollScheduler, ReadRange, Register, RegisterBank,
    RegisterErrorKind, RegisterFormat, RegisterKey, RegisterSink, SerialClient, SporadicMode,
    Transport, WordOrder,
};
pub use crate::error::{GatewayError, Result, TransactionError};
pub use crate::runtime::Gateway;
