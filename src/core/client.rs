//! Port cycle driver
//!
//! One `SerialClient` owns one physical channel and drives everything that
//! happens on it: flushing queued writes, executing scheduler actions
//! through the protocol codec, replaying device setup after reconnects, and
//! feeding transaction outcomes back into the register, device and schedule
//! state. The client runs strictly sequentially, which is what makes the
//! one-transaction-in-flight guarantee hold for the whole port.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::device::{ConnectionState, Device, DeviceTransition};
use super::protocols::{CodecRegistry, ProtocolCodec};
use super::register::{Availability, Register, RegisterErrorKind, SporadicMode};
use super::scheduler::{PollAction, PollScheduler, ReadRange};
use super::transport::Transport;
use crate::error::{GatewayError, Result, TransactionError};

/// Writes flushed per cycle while a poll deadline has already passed. The
/// cap keeps a busy write queue from starving the schedule.
pub const MAX_FLUSHES_WHEN_POLL_IS_DUE: usize = 10;

/// A queued register write.
#[derive(Debug)]
pub struct WriteRequest {
    pub register: Arc<Register>,
    pub raw: u64,
}

/// Downstream consumer of poll results (a publishing layer, a test probe).
pub trait RegisterSink: Send + Sync {
    /// A read settled. `changed` is true when the value differs from the
    /// previous one.
    fn on_register_read(&self, register: &Arc<Register>, changed: bool);

    fn on_register_error(&self, register: &Arc<Register>, kind: RegisterErrorKind);

    fn on_device_state(&self, _device: &Arc<Device>, _state: ConnectionState) {}
}

/// What one `cycle` call accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    /// Work was done; call again right away.
    Busy,
    /// Nothing to do before `until` (or until an external wakeup when
    /// `None`).
    Idle { until: Option<Instant> },
}

/// Write-side handle held by API layers; cheap to clone.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    writes: mpsc::UnboundedSender<WriteRequest>,
    wakeup: Arc<Notify>,
}

impl ClientHandle {
    /// Queue a raw register write and wake the port task.
    pub fn write_register(&self, register: Arc<Register>, raw: u64) -> Result<()> {
        self.writes
            .send(WriteRequest { register, raw })
            .map_err(|_| GatewayError::internal("port task is gone"))?;
        self.wakeup.notify_one();
        Ok(())
    }

    /// Notification handle the port task parks on while idle.
    pub fn wakeup(&self) -> Arc<Notify> {
        self.wakeup.clone()
    }
}

/// Cycle driver for one port.
pub struct SerialClient {
    port_name: String,
    transport: Box<dyn Transport>,
    codecs: HashMap<String, Arc<dyn ProtocolCodec>>,
    devices: Vec<Arc<Device>>,
    scheduler: PollScheduler,
    sink: Arc<dyn RegisterSink>,
    writes: mpsc::UnboundedReceiver<WriteRequest>,
    wakeup: Arc<Notify>,
    last_device: Option<String>,
}

impl SerialClient {
    pub fn new(
        port_name: impl Into<String>,
        transport: Box<dyn Transport>,
        registry: &CodecRegistry,
        devices: Vec<Arc<Device>>,
        sink: Arc<dyn RegisterSink>,
    ) -> Result<(Self, ClientHandle)> {
        let port_name = port_name.into();
        let mut codecs = HashMap::new();
        for device in &devices {
            let codec = registry.get(device.protocol()).ok_or_else(|| {
                GatewayError::config(format!(
                    "device {}: unknown protocol {:?}",
                    device.id(),
                    device.protocol()
                ))
            })?;
            if device.has_sporadic_registers() && !codec.supports_events() {
                return Err(GatewayError::config(format!(
                    "device {}: protocol {:?} has no event mechanism",
                    device.id(),
                    device.protocol()
                )));
            }
            codecs.insert(device.id().to_string(), codec);
        }

        let now = Instant::now();
        let mut scheduler = PollScheduler::new();
        for device in &devices {
            scheduler.add_device(device, now);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let wakeup = Arc::new(Notify::new());
        let handle = ClientHandle {
            writes: tx,
            wakeup: wakeup.clone(),
        };
        Ok((
            Self {
                port_name,
                transport,
                codecs,
                devices,
                scheduler,
                sink,
                writes: rx,
                wakeup,
                last_device: None,
            },
            handle,
        ))
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Notification the port task parks on while idle; writes ping it.
    pub fn wakeup(&self) -> Arc<Notify> {
        self.wakeup.clone()
    }

    pub async fn open(&mut self) -> std::result::Result<(), TransactionError> {
        self.transport.open().await
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
        self.last_device = None;
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Run one step of the port loop: flush queued writes, then execute the
    /// next scheduled action. Returns `Idle` with the next deadline when
    /// there was nothing to do. An `Err` means the channel itself failed and
    /// the port must be reopened.
    pub async fn cycle(&mut self) -> Result<CycleStatus> {
        let now = Instant::now();
        let poll_pending = !matches!(self.scheduler.next_due(now), PollAction::Idle { .. });

        let mut flushed = 0usize;
        while let Ok(request) = self.writes.try_recv() {
            self.execute_write(request).await?;
            flushed += 1;
            if poll_pending && flushed >= MAX_FLUSHES_WHEN_POLL_IS_DUE {
                debug!(port = %self.port_name, "write flush capped, poll is due");
                break;
            }
        }

        let now = Instant::now();
        match self.scheduler.next_due(now) {
            PollAction::Idle { until } => {
                if flushed > 0 {
                    Ok(CycleStatus::Busy)
                } else {
                    // Leave the line at its base settings while parked.
                    if self.last_device.take().is_some() {
                        self.transport
                            .clear_line_override()
                            .map_err(|e| GatewayError::io(e.to_string()))?;
                    }
                    Ok(CycleStatus::Idle { until })
                }
            }
            PollAction::ReadRange(range) => {
                self.execute_read(range).await?;
                Ok(CycleStatus::Busy)
            }
            PollAction::EnableEvents { device } => {
                self.execute_enable_events(device).await?;
                Ok(CycleStatus::Busy)
            }
            PollAction::PollEvents { device } => {
                self.execute_poll_events(device).await?;
                Ok(CycleStatus::Busy)
            }
        }
    }

    fn codec_for(&self, device: &Arc<Device>) -> Arc<dyn ProtocolCodec> {
        self.codecs
            .get(device.id())
            .expect("codec resolved at construction")
            .clone()
    }

    /// Clear a previous device's line override, honor the inter-device
    /// silence and apply the new device's override, once per device switch.
    /// A device-level override wins over the protocol's own preference.
    async fn prepare_access(
        &mut self,
        device: &Arc<Device>,
        codec: &Arc<dyn ProtocolCodec>,
    ) -> std::result::Result<(), TransactionError> {
        if self.last_device.as_deref() == Some(device.id()) {
            return Ok(());
        }
        self.transport.clear_line_override()?;
        self.transport
            .sleep_since_last_interaction(device.timings().inter_device_delay)
            .await;
        let settings = device
            .line_override()
            .copied()
            .or_else(|| codec.preferred_line_settings());
        if let Some(settings) = settings {
            self.transport.apply_line_override(&settings)?;
        }
        self.last_device = Some(device.id().to_string());
        Ok(())
    }

    /// One request/response exchange with the device's timeouts.
    async fn transact(
        &mut self,
        device: &Arc<Device>,
        codec: &Arc<dyn ProtocolCodec>,
        request: &[u8],
    ) -> std::result::Result<Vec<u8>, TransactionError> {
        let timings = device.timings().clone();
        self.transport
            .sleep_since_last_interaction(timings.request_delay)
            .await;
        self.transport.write_bytes(request).await?;
        let checker = codec.response_complete(request);
        let frame = self
            .transport
            .read_frame(
                codec.max_frame_len(),
                timings.response_timeout,
                timings.frame_timeout,
                checker.as_deref(),
            )
            .await?;
        trace!(
            port = %self.port_name,
            device = %device.id(),
            latency_us = frame.first_byte_latency.as_micros() as u64,
            "transaction settled"
        );
        Ok(frame.bytes)
    }

    fn device_ok(&self, device: &Arc<Device>, now: Instant) {
        if device.on_transaction_ok(now) == DeviceTransition::Reconnected {
            info!(port = %self.port_name, device = %device.id(), "device is connected");
            device.reset_unavailable_registers();
            self.sink.on_device_state(device, ConnectionState::Connected);
        }
    }

    /// Feed a failed transaction in; on the disconnect transition every
    /// register of the device is marked in error exactly once.
    fn device_fail(&self, device: &Arc<Device>, now: Instant) {
        if device.on_transaction_fail(now) == DeviceTransition::Disconnected {
            warn!(
                port = %self.port_name,
                device = %device.id(),
                failures = device.consecutive_failures(),
                "device is disconnected"
            );
            for register in device.registers() {
                register.set_error(RegisterErrorKind::TransientRead);
                self.sink
                    .on_register_error(register, RegisterErrorKind::TransientRead);
            }
            self.sink
                .on_device_state(device, ConnectionState::Disconnected);
        }
    }

    fn fail_range(&self, range: &ReadRange, kind: RegisterErrorKind) {
        for register in &range.registers {
            register.set_error(kind);
            self.sink.on_register_error(register, kind);
        }
    }

    async fn execute_read(&mut self, range: ReadRange) -> Result<()> {
        let device = range.device.clone();
        let codec = self.codec_for(&device);
        self.prepare_access(&device, &codec)
            .await
            .map_err(|e| GatewayError::io(e.to_string()))?;

        if device.needs_setup() && !self.write_setup(&device, &codec).await? {
            // Setup failed; settle the range as a transient miss so the
            // schedule keeps moving and retries on the next natural turn.
            self.fail_range(&range, RegisterErrorKind::TransientRead);
            self.scheduler.on_range_done(&range, Instant::now());
            return Ok(());
        }

        let outcome = match codec.encode_read_request(&device, &range) {
            Ok(request) => match self.transact(&device, &codec, &request).await {
                Ok(frame) => codec.decode_read_response(&device, &range, &frame),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let now = Instant::now();
        match outcome {
            Ok(values) => {
                self.device_ok(&device, now);
                for (register, raw) in range.registers.iter().zip(values) {
                    let changed = register.set_value(raw, now);
                    self.sink.on_register_read(register, changed);
                }
            }
            Err(e) if e.is_io() => return Err(GatewayError::io(e.to_string())),
            Err(TransactionError::PermanentRegister(msg)) => {
                // An exception response still means the device is talking.
                self.device_ok(&device, now);
                if range.registers.len() == 1 {
                    debug!(
                        port = %self.port_name,
                        register = %range.registers[0].key(),
                        %msg,
                        "register settled as unsupported"
                    );
                    self.fail_range(&range, RegisterErrorKind::Permanent);
                } else {
                    // Some member of the coalesced range is unsupported;
                    // probe them one by one to find out which.
                    self.read_members_individually(&device, &codec, &range)
                        .await?;
                }
            }
            Err(e) => {
                debug!(
                    port = %self.port_name,
                    device = %device.id(),
                    error = %e,
                    "read range failed"
                );
                self.fail_range(&range, RegisterErrorKind::TransientRead);
                self.device_fail(&device, now);
            }
        }
        self.scheduler.on_range_done(&range, Instant::now());
        Ok(())
    }

    /// Per-register probe after a coalesced range came back with an illegal
    /// data address exception.
    async fn read_members_individually(
        &mut self,
        device: &Arc<Device>,
        codec: &Arc<dyn ProtocolCodec>,
        range: &ReadRange,
    ) -> Result<()> {
        for register in &range.registers {
            let single = ReadRange {
                device: device.clone(),
                reg_type: register.key().reg_type,
                start: register.key().address,
                count: u32::from(register.format().width_words()),
                registers: vec![register.clone()],
            };
            let outcome = match codec.encode_read_request(device, &single) {
                Ok(request) => match self.transact(device, codec, &request).await {
                    Ok(frame) => codec.decode_read_response(device, &single, &frame),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            let now = Instant::now();
            match outcome {
                Ok(values) => {
                    self.device_ok(device, now);
                    let changed = register.set_value(values[0], now);
                    self.sink.on_register_read(register, changed);
                }
                Err(e) if e.is_io() => return Err(GatewayError::io(e.to_string())),
                Err(TransactionError::PermanentRegister(_)) => {
                    self.device_ok(device, now);
                    debug!(
                        port = %self.port_name,
                        register = %register.key(),
                        "register settled as unsupported"
                    );
                    register.set_error(RegisterErrorKind::Permanent);
                    self.sink
                        .on_register_error(register, RegisterErrorKind::Permanent);
                }
                Err(_) => {
                    register.set_error(RegisterErrorKind::TransientRead);
                    self.sink
                        .on_register_error(register, RegisterErrorKind::TransientRead);
                    self.device_fail(device, now);
                }
            }
        }
        Ok(())
    }

    /// Replay the device's setup writes. Returns false when a transient
    /// failure aborted the replay; unsupported setup addresses are skipped.
    async fn write_setup(
        &mut self,
        device: &Arc<Device>,
        codec: &Arc<dyn ProtocolCodec>,
    ) -> Result<bool> {
        for item in device.setup_items() {
            if item.register.availability() == Availability::Unavailable {
                continue;
            }
            let outcome = match codec.encode_write_request(device, &item.register, item.value) {
                Ok(request) => match self.transact(device, codec, &request).await {
                    Ok(frame) => codec.decode_write_response(device, &item.register, &frame),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            let now = Instant::now();
            match outcome {
                Ok(()) => {
                    self.device_ok(device, now);
                    debug!(
                        port = %self.port_name,
                        device = %device.id(),
                        item = %item.name,
                        value = item.value,
                        "setup register written"
                    );
                }
                Err(e) if e.is_io() => return Err(GatewayError::io(e.to_string())),
                Err(TransactionError::PermanentRegister(_)) => {
                    self.device_ok(device, now);
                    warn!(
                        port = %self.port_name,
                        device = %device.id(),
                        item = %item.name,
                        "setup register unsupported, skipped"
                    );
                    item.register.set_error(RegisterErrorKind::Permanent);
                }
                Err(e) => {
                    debug!(
                        port = %self.port_name,
                        device = %device.id(),
                        item = %item.name,
                        error = %e,
                        "setup write failed"
                    );
                    self.device_fail(device, now);
                    return Ok(false);
                }
            }
        }
        device.mark_setup_done();
        info!(port = %self.port_name, device = %device.id(), "device setup complete");
        Ok(true)
    }

    async fn execute_write(&mut self, request: WriteRequest) -> Result<()> {
        let Some(device) = self
            .devices
            .iter()
            .find(|d| d.id() == request.register.key().device)
            .cloned()
        else {
            warn!(
                port = %self.port_name,
                register = %request.register.key(),
                "dropping write for unknown device"
            );
            return Ok(());
        };
        let codec = self.codec_for(&device);
        self.prepare_access(&device, &codec)
            .await
            .map_err(|e| GatewayError::io(e.to_string()))?;

        let outcome = match codec.encode_write_request(&device, &request.register, request.raw) {
            Ok(frame) => match self.transact(&device, &codec, &frame).await {
                Ok(response) => codec.decode_write_response(&device, &request.register, &response),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let now = Instant::now();
        match outcome {
            Ok(()) => {
                self.device_ok(&device, now);
                let changed = request.register.set_value(request.raw, now);
                self.sink.on_register_read(&request.register, changed);
            }
            Err(e) if e.is_io() => return Err(GatewayError::io(e.to_string())),
            Err(TransactionError::PermanentRegister(_)) => {
                self.device_ok(&device, now);
                request.register.set_error(RegisterErrorKind::Permanent);
                self.sink
                    .on_register_error(&request.register, RegisterErrorKind::Permanent);
            }
            Err(e) => {
                debug!(
                    port = %self.port_name,
                    register = %request.register.key(),
                    error = %e,
                    "write failed"
                );
                request.register.set_error(RegisterErrorKind::TransientWrite);
                self.sink
                    .on_register_error(&request.register, RegisterErrorKind::TransientWrite);
                self.device_fail(&device, now);
            }
        }
        Ok(())
    }

    async fn execute_enable_events(&mut self, device: Arc<Device>) -> Result<()> {
        let codec = self.codec_for(&device);
        self.prepare_access(&device, &codec)
            .await
            .map_err(|e| GatewayError::io(e.to_string()))?;

        let outcome = match codec.encode_enable_events(&device) {
            Ok(request) => match self.transact(&device, &codec, &request).await {
                Ok(frame) => codec.decode_enable_events_response(&device, &frame),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let now = Instant::now();
        match outcome {
            Ok(()) => {
                self.device_ok(&device, now);
                device.set_events_enabled(true);
                info!(port = %self.port_name, device = %device.id(), "events enabled");
            }
            Err(e) if e.is_io() => return Err(GatewayError::io(e.to_string())),
            Err(e) => {
                debug!(
                    port = %self.port_name,
                    device = %device.id(),
                    error = %e,
                    "enabling events failed"
                );
                self.device_fail(&device, now);
            }
        }
        self.scheduler.on_events_enabled(&device, Instant::now());
        Ok(())
    }

    async fn execute_poll_events(&mut self, device: Arc<Device>) -> Result<()> {
        let codec = self.codec_for(&device);
        self.prepare_access(&device, &codec)
            .await
            .map_err(|e| GatewayError::io(e.to_string()))?;

        let outcome = match codec.encode_events_poll(&device) {
            Ok(request) => match self.transact(&device, &codec, &request).await {
                Ok(frame) => codec.decode_events_response(&device, &frame),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let now = Instant::now();
        match outcome {
            Ok(events) => {
                self.device_ok(&device, now);
                for event in events {
                    let Some(register) = device.registers().iter().find(|r| {
                        r.sporadic() != SporadicMode::Disabled
                            && r.key().reg_type == event.reg_type
                            && r.key().address == event.address
                    }) else {
                        debug!(
                            port = %self.port_name,
                            device = %device.id(),
                            reg_type = event.reg_type,
                            address = event.address,
                            "event for unknown register"
                        );
                        continue;
                    };
                    let changed = register.set_value(event.raw, now);
                    self.sink.on_register_read(register, changed);
                }
            }
            Err(e) if e.is_io() => return Err(GatewayError::io(e.to_string())),
            Err(e) => {
                debug!(
                    port = %self.port_name,
                    device = %device.id(),
                    error = %e,
                    "event poll failed"
                );
                self.device_fail(&device, now);
            }
        }
        self.scheduler.on_events_polled(&device, Instant::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::device::DeviceTimings;
    use crate::core::protocols::modbus::{crc16, REG_HOLDING};
    use crate::core::register::{RegisterFormat, RegisterKey, WordOrder};
    use crate::core::transport::{MockReply, MockTransport};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct RecordingSink {
        reads: Mutex<Vec<(RegisterKey, u64, bool)>>,
        errors: Mutex<Vec<(RegisterKey, RegisterErrorKind)>>,
        states: Mutex<Vec<(String, ConnectionState)>>,
    }

    impl RegisterSink for RecordingSink {
        fn on_register_read(&self, register: &Arc<Register>, changed: bool) {
            self.reads.lock().unwrap().push((
                register.key().clone(),
                register.value().unwrap_or(0),
                changed,
            ));
        }

        fn on_register_error(&self, register: &Arc<Register>, kind: RegisterErrorKind) {
            self.errors
                .lock()
                .unwrap()
                .push((register.key().clone(), kind));
        }

        fn on_device_state(&self, device: &Arc<Device>, state: ConnectionState) {
            self.states
                .lock()
                .unwrap()
                .push((device.id().to_string(), state));
        }
    }

    fn register(address: u32, period: Option<Duration>) -> Arc<Register> {
        Arc::new(
            Register::new(
                RegisterKey {
                    device: "dev".to_string(),
                    reg_type: REG_HOLDING,
                    address,
                    bit_offset: 0,
                    bit_width: 16,
                },
                RegisterFormat::U16,
                WordOrder::BigEndian,
                1.0,
                0.0,
                period,
                SporadicMode::Disabled,
                true,
            )
            .unwrap(),
        )
    }

    fn device(registers: Vec<Arc<Register>>) -> Arc<Device> {
        Arc::new(Device::new(
            "dev".to_string(),
            "modbus_rtu".to_string(),
            1,
            DeviceTimings {
                response_timeout: Duration::from_millis(100),
                ..Default::default()
            },
            None,
            1,
            125,
            Duration::from_millis(50),
            registers,
            Vec::new(),
        ))
    }

    fn rtu_frame(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc16(body).to_le_bytes());
        frame
    }

    fn client_with(
        mock: MockTransport,
        devices: Vec<Arc<Device>>,
        sink: Arc<RecordingSink>,
    ) -> (SerialClient, ClientHandle) {
        SerialClient::new(
            "test-port",
            Box::new(mock),
            &CodecRegistry::with_builtin(),
            devices,
            sink,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn read_cycle_settles_values_and_connects_device() {
        let mock = MockTransport::new();
        // Response for a 2-word read of addresses 7..9.
        mock.expect(
            None,
            MockReply::Frame(rtu_frame(&[0x01, 0x03, 0x04, 0x00, 0x2A, 0x00, 0x2B])),
            Duration::from_millis(2),
        );

        let regs = vec![
            register(7, Some(Duration::from_millis(100))),
            register(8, Some(Duration::from_millis(100))),
        ];
        let dev = device(regs.clone());
        let sink = Arc::new(RecordingSink::default());
        let (mut client, _handle) = client_with(mock, vec![dev.clone()], sink.clone());

        client.open().await.unwrap();
        assert_eq!(client.cycle().await.unwrap(), CycleStatus::Busy);

        assert_eq!(regs[0].value(), Some(0x2A));
        assert_eq!(regs[1].value(), Some(0x2B));
        assert_eq!(dev.connection_state(), ConnectionState::Connected);
        assert_eq!(sink.reads.lock().unwrap().len(), 2);
        assert_eq!(
            sink.states.lock().unwrap().as_slice(),
            &[("dev".to_string(), ConnectionState::Connected)]
        );

        // Both registers rescheduled: nothing due until the period elapses.
        match client.cycle().await.unwrap() {
            CycleStatus::Idle { until } => assert!(until.is_some()),
            other => panic!("expected Idle, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queued_write_is_flushed_before_polling() {
        let mock = MockTransport::new();
        let write_req = rtu_frame(&[0x01, 0x06, 0x00, 0x07, 0x00, 0x63]);
        mock.expect(
            Some(write_req.clone()),
            MockReply::Frame(write_req),
            Duration::from_millis(1),
        );
        mock.expect(
            None,
            MockReply::Frame(rtu_frame(&[0x01, 0x03, 0x02, 0x00, 0x2A])),
            Duration::from_millis(1),
        );

        let reg = register(7, Some(Duration::from_millis(100)));
        let dev = device(vec![reg.clone()]);
        let sink = Arc::new(RecordingSink::default());
        let (mut client, handle) = client_with(mock, vec![dev], sink.clone());

        handle.write_register(reg.clone(), 0x63).unwrap();
        client.open().await.unwrap();
        assert_eq!(client.cycle().await.unwrap(), CycleStatus::Busy);

        // The write settled first (value 0x63), then the poll (0x2A).
        let reads = sink.reads.lock().unwrap();
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[0].1, 0x63);
        assert_eq!(reads[1].1, 0x2A);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_disconnect_and_reconnect_replays_setup() {
        let mock = MockTransport::new();
        let setup_frame = rtu_frame(&[0x01, 0x06, 0x00, 0x00, 0x00, 0x01]);
        // First contact: setup write then a poll.
        mock.expect(
            Some(setup_frame.clone()),
            MockReply::Frame(setup_frame.clone()),
            Duration::from_millis(1),
        );
        mock.expect(
            None,
            MockReply::Frame(rtu_frame(&[0x01, 0x03, 0x02, 0x00, 0x01])),
            Duration::from_millis(1),
        );
        // Then silence until the device disconnects.
        mock.expect_timeouts(8, Duration::ZERO);
        // Recovery: the setup replay comes before any poll.
        mock.expect(
            Some(setup_frame.clone()),
            MockReply::Frame(setup_frame),
            Duration::from_millis(1),
        );
        mock.expect(
            None,
            MockReply::Frame(rtu_frame(&[0x01, 0x03, 0x02, 0x00, 0x02])),
            Duration::from_millis(1),
        );

        let poll_reg = register(7, Some(Duration::from_millis(100)));
        let setup_reg = register(0, None);
        let dev = Arc::new(Device::new(
            "dev".to_string(),
            "modbus_rtu".to_string(),
            1,
            DeviceTimings {
                response_timeout: Duration::from_millis(100),
                device_timeout: Duration::from_millis(200),
                max_fail_cycles: 2,
                ..Default::default()
            },
            None,
            1,
            125,
            Duration::from_millis(50),
            vec![poll_reg.clone()],
            vec![crate::core::device::SetupItem {
                name: "mode".to_string(),
                register: setup_reg,
                value: 1,
            }],
        ));
        let sink = Arc::new(RecordingSink::default());
        let (mut client, _handle) = client_with(mock, vec![dev.clone()], sink.clone());
        client.open().await.unwrap();

        // Setup plus first poll.
        client.cycle().await.unwrap();
        assert_eq!(poll_reg.value(), Some(1));
        assert!(!dev.needs_setup());

        // Keep cycling through the silent phase; each failed poll costs a
        // response timeout of virtual time, so the device timeout elapses.
        for _ in 0..8 {
            match client.cycle().await.unwrap() {
                CycleStatus::Busy => {}
                CycleStatus::Idle { until: Some(t) } => tokio::time::sleep_until(t).await,
                CycleStatus::Idle { until: None } => panic!("scheduler went empty"),
            }
        }
        assert_eq!(dev.connection_state(), ConnectionState::Disconnected);
        assert!(dev.needs_setup());
        // The disconnect was reported exactly once.
        let disconnects = sink
            .states
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| *s == ConnectionState::Disconnected)
            .count();
        assert_eq!(disconnects, 1);

        // Next due poll replays setup first, then reads.
        loop {
            match client.cycle().await.unwrap() {
                CycleStatus::Busy => {
                    if poll_reg.value() == Some(2) {
                        break;
                    }
                }
                CycleStatus::Idle { until: Some(t) } => tokio::time::sleep_until(t).await,
                CycleStatus::Idle { until: None } => panic!("scheduler went empty"),
            }
        }
        assert_eq!(dev.connection_state(), ConnectionState::Connected);
        assert!(!dev.needs_setup());
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_register_in_range_is_probed_out() {
        let mock = MockTransport::new();
        // Coalesced read fails with illegal data address.
        mock.expect(
            None,
            MockReply::Frame(rtu_frame(&[0x01, 0x83, 0x02])),
            Duration::from_millis(1),
        );
        // Individual probes: address 7 ok, address 8 unsupported.
        mock.expect(
            None,
            MockReply::Frame(rtu_frame(&[0x01, 0x03, 0x02, 0x00, 0x2A])),
            Duration::from_millis(1),
        );
        mock.expect(
            None,
            MockReply::Frame(rtu_frame(&[0x01, 0x83, 0x02])),
            Duration::from_millis(1),
        );
        // The next turn reads only the supported register.
        mock.expect(
            None,
            MockReply::Frame(rtu_frame(&[0x01, 0x03, 0x02, 0x00, 0x2B])),
            Duration::from_millis(1),
        );

        let good = register(7, Some(Duration::from_millis(100)));
        let bad = register(8, Some(Duration::from_millis(100)));
        let dev = device(vec![good.clone(), bad.clone()]);
        let sink = Arc::new(RecordingSink::default());
        let (mut client, _handle) = client_with(mock, vec![dev.clone()], sink.clone());
        client.open().await.unwrap();

        client.cycle().await.unwrap();
        assert_eq!(good.value(), Some(0x2A));
        assert_eq!(bad.error(), Some(RegisterErrorKind::Permanent));
        assert_eq!(bad.availability(), Availability::Unavailable);
        // The exception proved the device is alive.
        assert_eq!(dev.connection_state(), ConnectionState::Connected);

        tokio::time::sleep(Duration::from_millis(100)).await;
        client.cycle().await.unwrap();
        assert_eq!(good.value(), Some(0x2B));
    }
}
