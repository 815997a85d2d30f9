//! Polling core: registers, devices, schedule, protocol codecs and the
//! per-port cycle driver.

pub mod client;
pub mod device;
pub mod protocols;
pub mod register;
pub mod scheduler;
pub mod transport;

pub use client::{ClientHandle, CycleStatus, RegisterSink, SerialClient, WriteRequest};
pub use device::{ConnectionState, Device, DeviceTimings, DeviceTransition, SetupItem};
pub use protocols::{CodecRegistry, EventRecord, ProtocolCodec};
pub use register::{
    Availability, Register, RegisterBank, RegisterErrorKind, RegisterFormat, RegisterKey,
    SporadicMode, WordOrder,
};
pub use scheduler::{PollAction, PollScheduler, ReadRange};
pub use transport::{LineSettings, Parity, SerialPortConfig, TcpPortConfig, Transport};
