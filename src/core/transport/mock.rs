//! Scripted mock transport for tests
//!
//! Replays canned request/response exchanges with configurable latency and
//! keeps a timestamped transaction log, so tests can assert serialization
//! (at most one transaction in flight) and timing behavior under a paused
//! tokio clock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::traits::{FrameCompleteFn, FrameRead, LineSettings, Transport};
use crate::error::TransactionError;

/// Scripted reply to one request.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// A complete response frame.
    Frame(Vec<u8>),
    /// The device stays silent past the response timeout.
    Timeout,
    /// The channel itself fails.
    Io(String),
}

/// One scripted exchange.
#[derive(Debug, Clone)]
pub struct MockExchange {
    /// When set, the incoming request must match byte for byte.
    pub expect: Option<Vec<u8>>,
    pub reply: MockReply,
    /// Simulated bus time between request and response.
    pub latency: Duration,
}

/// Record of one completed exchange.
#[derive(Debug, Clone)]
pub struct LoggedTransaction {
    pub request: Vec<u8>,
    pub started: Instant,
    pub finished: Instant,
    pub ok: bool,
}

pub type TransactionLog = Arc<Mutex<Vec<LoggedTransaction>>>;

/// Shared view of the unconsumed script, for end-of-test assertions.
pub type Script = Arc<Mutex<VecDeque<MockExchange>>>;

/// Line-settings call observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    Applied(LineSettings),
    Cleared,
}

/// Scripted transport.
#[derive(Debug)]
pub struct MockTransport {
    script: Script,
    log: TransactionLog,
    overlap: Arc<AtomicBool>,
    line_events: Arc<Mutex<Vec<LineEvent>>>,
    open: bool,
    fail_next_open: bool,
    pending: Option<(Vec<u8>, Instant)>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            log: Arc::new(Mutex::new(Vec::new())),
            overlap: Arc::new(AtomicBool::new(false)),
            line_events: Arc::new(Mutex::new(Vec::new())),
            open: false,
            fail_next_open: false,
            pending: None,
        }
    }

    /// Queue an exchange answered after `latency` of simulated bus time.
    pub fn expect(&self, request: Option<Vec<u8>>, reply: MockReply, latency: Duration) {
        self.script
            .lock()
            .expect("mock script poisoned")
            .push_back(MockExchange {
                expect: request,
                reply,
                latency,
            });
    }

    /// Queue `n` identical silent (timeout) replies.
    pub fn expect_timeouts(&self, n: usize, latency: Duration) {
        for _ in 0..n {
            self.expect(None, MockReply::Timeout, latency);
        }
    }

    /// Shared handle to the transaction log.
    pub fn log(&self) -> TransactionLog {
        self.log.clone()
    }

    /// Shared flag set when a request was written while another was in
    /// flight, i.e. the half-duplex discipline was violated.
    pub fn overlap_flag(&self) -> Arc<AtomicBool> {
        self.overlap.clone()
    }

    /// Shared handle to the script; tests assert it is drained at the end.
    pub fn script(&self) -> Script {
        self.script.clone()
    }

    /// Shared record of `apply_line_override`/`clear_line_override` calls.
    pub fn line_events(&self) -> Arc<Mutex<Vec<LineEvent>>> {
        self.line_events.clone()
    }

    pub fn fail_next_open(&mut self) {
        self.fail_next_open = true;
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn transport_type(&self) -> &str {
        "mock"
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }

    async fn open(&mut self) -> Result<(), TransactionError> {
        if self.fail_next_open {
            self.fail_next_open = false;
            return Err(TransactionError::io("mock open failure"));
        }
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) {
        self.open = false;
        self.pending = None;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn write_bytes(&mut self, buf: &[u8]) -> Result<(), TransactionError> {
        if !self.open {
            return Err(TransactionError::io("mock transport not open"));
        }
        if self.pending.is_some() {
            self.overlap.store(true, Ordering::SeqCst);
        }
        self.pending = Some((buf.to_vec(), Instant::now()));
        Ok(())
    }

    async fn read_frame(
        &mut self,
        _max_len: usize,
        response_timeout: Duration,
        _frame_timeout: Duration,
        _frame_complete: Option<FrameCompleteFn<'_>>,
    ) -> Result<FrameRead, TransactionError> {
        let (request, started) = self
            .pending
            .take()
            .ok_or_else(|| TransactionError::io("mock read without pending request"))?;

        let exchange = self
            .script
            .lock()
            .expect("mock script poisoned")
            .pop_front();
        let Some(exchange) = exchange else {
            tokio::time::sleep(response_timeout).await;
            self.log.lock().expect("mock log poisoned").push(LoggedTransaction {
                request,
                started,
                finished: Instant::now(),
                ok: false,
            });
            return Err(TransactionError::timeout("mock script exhausted"));
        };

        if let Some(expected) = &exchange.expect {
            assert_eq!(
                expected, &request,
                "mock transport received an unexpected request"
            );
        }

        tokio::time::sleep(exchange.latency).await;
        let (result, ok) = match exchange.reply {
            MockReply::Frame(bytes) => {
                let latency = exchange.latency;
                (
                    Ok(FrameRead {
                        bytes,
                        first_byte_latency: latency,
                    }),
                    true,
                )
            }
            MockReply::Timeout => {
                tokio::time::sleep(response_timeout).await;
                (
                    Err(TransactionError::timeout("mock device silent")),
                    false,
                )
            }
            MockReply::Io(msg) => (Err(TransactionError::io(msg)), false),
        };

        self.log.lock().expect("mock log poisoned").push(LoggedTransaction {
            request,
            started,
            finished: Instant::now(),
            ok,
        });
        result
    }

    async fn sleep_since_last_interaction(&mut self, _min_gap: Duration) {
        // The mock has no physical bus; turn-around gaps are irrelevant to
        // the scripted exchanges.
    }

    async fn skip_noise(&mut self) -> Result<(), TransactionError> {
        Ok(())
    }

    fn apply_line_override(&mut self, settings: &LineSettings) -> Result<(), TransactionError> {
        self.line_events
            .lock()
            .expect("mock line events poisoned")
            .push(LineEvent::Applied(*settings));
        Ok(())
    }

    fn clear_line_override(&mut self) -> Result<(), TransactionError> {
        self.line_events
            .lock()
            .expect("mock line events poisoned")
            .push(LineEvent::Cleared);
        Ok(())
    }
}
