//! Device model and connection state machine
//!
//! A device is one physical addressable unit on a port. Besides its
//! registers and timing parameters, it carries the connection state machine:
//! a consecutive-failure counter combined with a fixed device timeout decides
//! when the device counts as disconnected, and the first success after a
//! disconnect triggers re-application of the device's setup writes.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::register::Register;
use super::transport::LineSettings;

/// Per-device timing parameters, all enforced by the cycle driver.
#[derive(Debug, Clone)]
pub struct DeviceTimings {
    /// Maximum inter-byte silence used to detect end of a response frame.
    pub frame_timeout: Duration,
    /// Maximum wait for the first response byte after a request.
    pub response_timeout: Duration,
    /// Minimum silence between back-to-back requests to this device.
    pub request_delay: Duration,
    /// Minimum bus silence before switching to this device from another one.
    pub inter_device_delay: Duration,
    /// The device counts as disconnected once this much time passed since
    /// the last success (together with the failure counter).
    pub device_timeout: Duration,
    /// Number of consecutive failed transactions required for a disconnect.
    pub max_fail_cycles: u32,
}

impl Default for DeviceTimings {
    fn default() -> Self {
        Self {
            frame_timeout: Duration::from_millis(20),
            response_timeout: Duration::from_millis(500),
            request_delay: Duration::ZERO,
            inter_device_delay: Duration::ZERO,
            device_timeout: Duration::from_secs(3),
            max_fail_cycles: 2,
        }
    }
}

/// Connection state as seen by the polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transaction has settled yet.
    #[default]
    Unknown,
    Connected,
    Disconnected,
}

/// State transition produced by feeding a transaction outcome in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTransition {
    None,
    /// First success after Unknown/Disconnected.
    Reconnected,
    /// The failure budget and device timeout are both exhausted.
    Disconnected,
}

/// A register write applied once at device (re)connect.
#[derive(Debug, Clone)]
pub struct SetupItem {
    pub name: String,
    pub register: Arc<Register>,
    pub value: u64,
}

#[derive(Debug, Default)]
struct LinkState {
    connection: ConnectionState,
    consecutive_failures: u32,
    last_success: Option<Instant>,
    /// Reference point for the device timeout before any success happened.
    first_failure: Option<Instant>,
    setup_done: bool,
    events_enabled: bool,
}

/// One physical addressable unit on a port.
#[derive(Debug)]
pub struct Device {
    id: String,
    protocol: String,
    slave_id: u8,
    timings: DeviceTimings,
    line_override: Option<LineSettings>,
    max_register_hole: u32,
    max_read_registers: usize,
    events_poll_interval: Duration,
    registers: Vec<Arc<Register>>,
    setup_items: Vec<SetupItem>,
    link: RwLock<LinkState>,
}

impl Device {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        protocol: String,
        slave_id: u8,
        timings: DeviceTimings,
        line_override: Option<LineSettings>,
        max_register_hole: u32,
        max_read_registers: usize,
        events_poll_interval: Duration,
        registers: Vec<Arc<Register>>,
        setup_items: Vec<SetupItem>,
    ) -> Self {
        Self {
            id,
            protocol,
            slave_id,
            timings,
            line_override,
            max_register_hole,
            max_read_registers,
            events_poll_interval,
            registers,
            setup_items,
            link: RwLock::new(LinkState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    pub fn timings(&self) -> &DeviceTimings {
        &self.timings
    }

    pub fn line_override(&self) -> Option<&LineSettings> {
        self.line_override.as_ref()
    }

    pub fn max_register_hole(&self) -> u32 {
        self.max_register_hole
    }

    pub fn max_read_registers(&self) -> usize {
        self.max_read_registers
    }

    pub fn events_poll_interval(&self) -> Duration {
        self.events_poll_interval
    }

    pub fn registers(&self) -> &[Arc<Register>] {
        &self.registers
    }

    pub fn setup_items(&self) -> &[SetupItem] {
        &self.setup_items
    }

    /// Whether any register on this device uses the event mechanism.
    pub fn has_sporadic_registers(&self) -> bool {
        use super::register::SporadicMode;
        self.registers
            .iter()
            .any(|r| r.sporadic() != SporadicMode::Disabled)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.link.read().expect("device link poisoned").connection
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.link
            .read()
            .expect("device link poisoned")
            .consecutive_failures
    }

    /// Setup writes are pending initially (when any are configured) and
    /// again after every disconnect.
    pub fn needs_setup(&self) -> bool {
        !self.setup_items.is_empty() && !self.link.read().expect("device link poisoned").setup_done
    }

    pub fn mark_setup_done(&self) {
        self.link.write().expect("device link poisoned").setup_done = true;
    }

    pub fn events_enabled(&self) -> bool {
        self.link.read().expect("device link poisoned").events_enabled
    }

    pub fn set_events_enabled(&self, enabled: bool) {
        self.link.write().expect("device link poisoned").events_enabled = enabled;
    }

    /// Feed a successful transaction into the state machine.
    pub fn on_transaction_ok(&self, now: Instant) -> DeviceTransition {
        let mut link = self.link.write().expect("device link poisoned");
        link.consecutive_failures = 0;
        link.last_success = Some(now);
        match link.connection {
            ConnectionState::Connected => DeviceTransition::None,
            ConnectionState::Unknown | ConnectionState::Disconnected => {
                link.connection = ConnectionState::Connected;
                debug!(device = %self.id, "device connected");
                DeviceTransition::Reconnected
            }
        }
    }

    /// Feed a failed transaction into the state machine.
    ///
    /// Disconnect requires both conditions: the failure streak reached
    /// `max_fail_cycles` and the device timeout elapsed since the last
    /// success (or since the first failure when there never was one).
    pub fn on_transaction_fail(&self, now: Instant) -> DeviceTransition {
        let mut link = self.link.write().expect("device link poisoned");
        link.consecutive_failures = link.consecutive_failures.saturating_add(1);
        let reference = match link.last_success {
            Some(t) => t,
            None => *link.first_failure.get_or_insert(now),
        };
        let timed_out = now.saturating_duration_since(reference) > self.timings.device_timeout;
        let over_budget = link.consecutive_failures >= self.timings.max_fail_cycles;
        if timed_out && over_budget && link.connection != ConnectionState::Disconnected {
            link.connection = ConnectionState::Disconnected;
            link.setup_done = false;
            link.events_enabled = false;
            debug!(
                device = %self.id,
                failures = link.consecutive_failures,
                "device disconnected"
            );
            DeviceTransition::Disconnected
        } else {
            DeviceTransition::None
        }
    }

    /// Forget lazily discovered register availability, called on reconnect.
    pub fn reset_unavailable_registers(&self) {
        for reg in &self.registers {
            reg.reset_availability();
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({}:{})", self.id, self.protocol, self.slave_id)
    }
}
