//! End-to-end polling scenarios against a scripted transport under a paused
//! tokio clock: period preservation, half-duplex serialization, best-effort
//! fairness and the event flow.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serialsrv::core::client::{CycleStatus, RegisterSink, SerialClient};
use serialsrv::core::device::{Device, DeviceTimings};
use serialsrv::core::protocols::modbus::{crc16, REG_HOLDING, REG_INPUT};
use serialsrv::core::protocols::CodecRegistry;
use serialsrv::core::register::{
    Register, RegisterErrorKind, RegisterFormat, RegisterKey, SporadicMode, WordOrder,
};
use serialsrv::core::transport::mock::TransactionLog;
use serialsrv::core::transport::{LineEvent, LineSettings, MockReply, MockTransport, Parity};

#[derive(Debug)]
struct NullSink;

impl RegisterSink for NullSink {
    fn on_register_read(&self, _register: &Arc<Register>, _changed: bool) {}
    fn on_register_error(&self, _register: &Arc<Register>, _kind: RegisterErrorKind) {}
}

fn register_on(
    device: &str,
    reg_type: u8,
    address: u32,
    period: Option<Duration>,
    sporadic: SporadicMode,
) -> Arc<Register> {
    Arc::new(
        Register::new(
            RegisterKey {
                device: device.to_string(),
                reg_type,
                address,
                bit_offset: 0,
                bit_width: 16,
            },
            RegisterFormat::U16,
            WordOrder::BigEndian,
            1.0,
            0.0,
            period,
            sporadic,
            true,
        )
        .unwrap(),
    )
}

fn register(
    reg_type: u8,
    address: u32,
    period: Option<Duration>,
    sporadic: SporadicMode,
) -> Arc<Register> {
    register_on("dev", reg_type, address, period, sporadic)
}

fn device_on(
    id: &str,
    slave_id: u8,
    line: Option<LineSettings>,
    registers: Vec<Arc<Register>>,
) -> Arc<Device> {
    Arc::new(Device::new(
        id.to_string(),
        "modbus_rtu".to_string(),
        slave_id,
        DeviceTimings {
            response_timeout: Duration::from_millis(500),
            ..Default::default()
        },
        line,
        1,
        125,
        Duration::from_millis(50),
        registers,
        Vec::new(),
    ))
}

fn device(registers: Vec<Arc<Register>>) -> Arc<Device> {
    device_on("dev", 1, None, registers)
}

fn rtu_frame(body: &[u8]) -> Vec<u8> {
    let mut frame = body.to_vec();
    frame.extend_from_slice(&crc16(body).to_le_bytes());
    frame
}

fn word_response(slave: u8, value: u16) -> Vec<u8> {
    rtu_frame(&[slave, 0x03, 0x02, (value >> 8) as u8, value as u8])
}

fn single_word_response(value: u16) -> Vec<u8> {
    word_response(1, value)
}

/// Drive the cycle loop until `log` holds `transactions` entries.
async fn run_until(client: &mut SerialClient, log: &TransactionLog, transactions: usize) {
    loop {
        if log.lock().unwrap().len() >= transactions {
            return;
        }
        match client.cycle().await.unwrap() {
            CycleStatus::Busy => {}
            CycleStatus::Idle { until: Some(t) } => tokio::time::sleep_until(t).await,
            CycleStatus::Idle { until: None } => panic!("nothing left to schedule"),
        }
    }
}

/// Address encoded in a single-register read request.
fn request_address(request: &[u8]) -> u32 {
    u32::from(u16::from_be_bytes([request[2], request[3]]))
}

#[tokio::test(start_paused = true)]
async fn periodic_register_keeps_its_grid_and_transactions_never_overlap() {
    let mock = MockTransport::new();
    for _ in 0..10 {
        mock.expect(
            None,
            MockReply::Frame(single_word_response(0x2A)),
            Duration::from_millis(5),
        );
    }
    let log = mock.log();
    let script = mock.script();
    let overlap = mock.overlap_flag();

    let reg = register(
        REG_HOLDING,
        0,
        Some(Duration::from_millis(100)),
        SporadicMode::Disabled,
    );
    let dev = device(vec![reg]);
    let (mut client, _handle) = SerialClient::new(
        "p1",
        Box::new(mock),
        &CodecRegistry::with_builtin(),
        vec![dev],
        Arc::new(NullSink),
    )
    .unwrap();
    client.open().await.unwrap();

    run_until(&mut client, &log, 10).await;

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 10);
    assert!(!overlap.load(Ordering::SeqCst));
    for pair in log.windows(2) {
        // Strictly sequential on the bus.
        assert!(pair[1].started >= pair[0].finished);
        // The 5ms of bus time per poll does not stretch the 100ms period.
        assert_eq!(
            pair[1].started.duration_since(pair[0].started),
            Duration::from_millis(100)
        );
    }
    assert!(script.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn two_devices_interleave_with_scoped_line_overrides() {
    let mock = MockTransport::new();
    let read_req = |slave: u8| rtu_frame(&[slave, 0x03, 0x00, 0x00, 0x00, 0x01]);
    for _ in 0..3 {
        mock.expect(
            Some(read_req(1)),
            MockReply::Frame(word_response(1, 0x11)),
            Duration::from_millis(1),
        );
        mock.expect(
            Some(read_req(2)),
            MockReply::Frame(word_response(2, 0x22)),
            Duration::from_millis(1),
        );
    }
    let log = mock.log();
    let script = mock.script();
    let overlap = mock.overlap_flag();
    let line_events = mock.line_events();

    let fast_line = LineSettings {
        baud_rate: 19200,
        data_bits: 8,
        stop_bits: 1,
        parity: Parity::Even,
    };
    let reg1 = register_on(
        "dev1",
        REG_HOLDING,
        0,
        Some(Duration::from_millis(100)),
        SporadicMode::Disabled,
    );
    let reg2 = register_on(
        "dev2",
        REG_HOLDING,
        0,
        Some(Duration::from_millis(100)),
        SporadicMode::Disabled,
    );
    let dev1 = device_on("dev1", 1, None, vec![reg1.clone()]);
    let dev2 = device_on("dev2", 2, Some(fast_line), vec![reg2.clone()]);
    let (mut client, _handle) = SerialClient::new(
        "p1",
        Box::new(mock),
        &CodecRegistry::with_builtin(),
        vec![dev1, dev2],
        Arc::new(NullSink),
    )
    .unwrap();
    client.open().await.unwrap();

    run_until(&mut client, &log, 6).await;

    let log = log.lock().unwrap();
    assert!(!overlap.load(Ordering::SeqCst));
    // Devices alternate on the bus, strictly sequentially.
    let slaves: Vec<u8> = log.iter().map(|t| t.request[0]).collect();
    assert_eq!(slaves, vec![1, 2, 1, 2, 1, 2]);
    for pair in log.windows(2) {
        assert!(pair[1].started >= pair[0].finished);
    }

    // dev2's byte format was applied for each of its visits and cleared
    // again before anything else touched the line.
    let events = line_events.lock().unwrap();
    let applied: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, LineEvent::Applied(_)))
        .collect();
    assert_eq!(applied.len(), 3);
    assert!(applied.iter().all(|e| **e == LineEvent::Applied(fast_line)));
    for (i, event) in events.iter().enumerate() {
        if matches!(event, LineEvent::Applied(_)) {
            assert_eq!(events[i - 1], LineEvent::Cleared);
        }
    }

    assert_eq!(reg1.value(), Some(0x11));
    assert_eq!(reg2.value(), Some(0x22));
    assert!(script.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn best_effort_registers_share_idle_time_fairly() {
    let mock = MockTransport::new();
    for _ in 0..12 {
        mock.expect(
            None,
            MockReply::Frame(single_word_response(0x2A)),
            Duration::from_millis(30),
        );
    }
    let log = mock.log();

    // One deadline-driven register plus two best-effort ones, far enough
    // apart that no read range merges them.
    let periodic = register(
        REG_HOLDING,
        0,
        Some(Duration::from_millis(100)),
        SporadicMode::Disabled,
    );
    let free_a = register(REG_HOLDING, 50, None, SporadicMode::Disabled);
    let free_b = register(REG_HOLDING, 100, None, SporadicMode::Disabled);
    let dev = device(vec![periodic, free_a, free_b]);
    let (mut client, _handle) = SerialClient::new(
        "p1",
        Box::new(mock),
        &CodecRegistry::with_builtin(),
        vec![dev],
        Arc::new(NullSink),
    )
    .unwrap();
    client.open().await.unwrap();

    run_until(&mut client, &log, 12).await;

    let log = log.lock().unwrap();
    let count = |addr: u32| {
        log.iter()
            .filter(|t| request_address(&t.request) == addr)
            .count()
    };
    let (p, a, b) = (count(0), count(50), count(100));
    assert_eq!(p + a + b, 12);
    // The periodic register got its turns despite the busy bus.
    assert!(p >= 3, "periodic polled {p} times");
    // The rotation kept the best-effort pair balanced.
    assert!(a >= 3 && b >= 3, "best-effort polled {a}/{b} times");
    assert!(a.abs_diff(b) <= 1, "unbalanced rotation: {a} vs {b}");
}

#[tokio::test(start_paused = true)]
async fn events_are_enabled_before_the_first_event_poll() {
    let mock = MockTransport::new();
    // Enable-events ack.
    mock.expect(
        None,
        MockReply::Frame(rtu_frame(&[0x01, 0x46, 0x01, 0x18])),
        Duration::from_millis(1),
    );
    // Periodic read.
    mock.expect(
        None,
        MockReply::Frame(single_word_response(0x2A)),
        Duration::from_millis(1),
    );
    // Event poll: input register 2 changed to 7.
    mock.expect(
        None,
        MockReply::Frame(rtu_frame(&[0x01, 0x46, 5, REG_INPUT, 0x00, 0x02, 0x00, 0x07])),
        Duration::from_millis(1),
    );
    let log = mock.log();
    let script = mock.script();

    let periodic = register(
        REG_HOLDING,
        0,
        Some(Duration::from_millis(100)),
        SporadicMode::Disabled,
    );
    let sporadic = register(REG_INPUT, 2, None, SporadicMode::OnlyEvents);
    let dev = device(vec![periodic.clone(), sporadic.clone()]);
    let (mut client, _handle) = SerialClient::new(
        "p1",
        Box::new(mock),
        &CodecRegistry::with_builtin(),
        vec![dev.clone()],
        Arc::new(NullSink),
    )
    .unwrap();
    client.open().await.unwrap();

    run_until(&mut client, &log, 3).await;

    let log = log.lock().unwrap();
    // Order on the wire: enable events, periodic read, event poll.
    assert_eq!(&log[0].request[1..3], &[0x46, 0x18]);
    assert_eq!(log[1].request[1], 0x03);
    assert_eq!(&log[2].request[1..3], &[0x46, 0x10]);

    assert!(dev.events_enabled());
    assert_eq!(periodic.value(), Some(0x2A));
    // The event carried the sporadic register's new value; it was never
    // read actively.
    assert_eq!(sporadic.value(), Some(7));
    assert!(script.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn io_failure_escalates_to_the_port_level() {
    let mock = MockTransport::new();
    mock.expect(
        None,
        MockReply::Io("bus adapter unplugged".to_string()),
        Duration::ZERO,
    );

    let reg = register(
        REG_HOLDING,
        0,
        Some(Duration::from_millis(100)),
        SporadicMode::Disabled,
    );
    let dev = device(vec![reg]);
    let (mut client, _handle) = SerialClient::new(
        "p1",
        Box::new(mock),
        &CodecRegistry::with_builtin(),
        vec![dev],
        Arc::new(NullSink),
    )
    .unwrap();
    client.open().await.unwrap();

    let err = client.cycle().await.unwrap_err();
    assert!(matches!(err, serialsrv::GatewayError::Io(_)));
}
