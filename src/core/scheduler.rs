//! Poll scheduler
//!
//! Decides what the port should do next: enable events on a device, poll a
//! device's event queue, read a coalesced register range, or sleep. The
//! scheduler never touches the bus; the cycle driver executes the action and
//! reports completion back, which is the only point where schedule state
//! advances.
//!
//! Two polling classes exist. Periodic registers carry a read period and a
//! due timestamp rescheduled from the previous due point, so a slow bus does
//! not silently stretch the period. Best-effort registers have no period and
//! are served round-robin from a rotation queue whenever nothing with a
//! deadline is due, which bounds the gap between two polls of the same
//! register by the queue length.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use super::device::Device;
use super::register::{Availability, Register};

/// A coalesced read of adjacent registers on one device.
#[derive(Debug, Clone)]
pub struct ReadRange {
    pub device: Arc<Device>,
    pub reg_type: u8,
    /// First register address of the range.
    pub start: u32,
    /// Address span covered by the range, including member widths.
    pub count: u32,
    /// Members, sorted by address.
    pub registers: Vec<Arc<Register>>,
}

/// What the port should do next.
#[derive(Debug, Clone)]
pub enum PollAction {
    /// Ask the device to start queueing events. Must precede event polls.
    EnableEvents { device: Arc<Device> },
    /// Drain the device's pending event queue.
    PollEvents { device: Arc<Device> },
    /// Execute a coalesced register read.
    ReadRange(ReadRange),
    /// Nothing to do before `until` (or at all, when `None`).
    Idle { until: Option<Instant> },
}

#[derive(Debug)]
struct PeriodicEntry {
    device: Arc<Device>,
    register: Arc<Register>,
    period: Duration,
    due: Instant,
}

#[derive(Debug)]
struct BestEffortEntry {
    device: Arc<Device>,
    register: Arc<Register>,
}

#[derive(Debug)]
struct EventsEntry {
    device: Arc<Device>,
    next_poll: Instant,
}

/// Schedule state for one port.
#[derive(Debug, Default)]
pub struct PollScheduler {
    periodic: Vec<PeriodicEntry>,
    best_effort: VecDeque<BestEffortEntry>,
    events: Vec<EventsEntry>,
}

impl PollScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device's pollable registers. Periodic registers become due
    /// immediately; event-capable devices get an event slot due immediately
    /// so that enabling events happens before the first event poll.
    pub fn add_device(&mut self, device: &Arc<Device>, now: Instant) {
        for reg in device.registers() {
            if !reg.is_polled() {
                continue;
            }
            match reg.read_period() {
                Some(period) => self.periodic.push(PeriodicEntry {
                    device: device.clone(),
                    register: reg.clone(),
                    period,
                    due: now,
                }),
                None => self.best_effort.push_back(BestEffortEntry {
                    device: device.clone(),
                    register: reg.clone(),
                }),
            }
        }
        if device.has_sporadic_registers() {
            self.events.push(EventsEntry {
                device: device.clone(),
                next_poll: now,
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.periodic.is_empty() && self.best_effort.is_empty() && self.events.is_empty()
    }

    /// Compute the next action without advancing any state. Stable: repeated
    /// calls with the same `now` return the same action, and the action only
    /// changes once a deadline passes or a completion is reported.
    pub fn next_due(&self, now: Instant) -> PollAction {
        let periodic_due = self
            .periodic
            .iter()
            .filter(|e| eligible(&e.register))
            .map(|e| e.due)
            .min();
        let events_due = self.events.iter().map(|e| e.next_poll).min();

        let periodic_ready = periodic_due.is_some_and(|d| d <= now);
        let events_ready = events_due.is_some_and(|d| d <= now);

        if events_ready || periodic_ready {
            // Both deadline classes compete on their due timestamps; an
            // event slot wins an exact tie.
            let events_first = match (events_due, periodic_due) {
                (Some(e), Some(p)) => !periodic_ready || (events_ready && e <= p),
                (Some(_), None) => true,
                _ => false,
            };
            if events_first {
                let entry = self
                    .events
                    .iter()
                    .min_by_key(|e| e.next_poll)
                    .expect("events entry vanished");
                return if entry.device.events_enabled() {
                    PollAction::PollEvents {
                        device: entry.device.clone(),
                    }
                } else {
                    PollAction::EnableEvents {
                        device: entry.device.clone(),
                    }
                };
            }
            let seed = self
                .periodic
                .iter()
                .filter(|e| eligible(&e.register))
                .min_by_key(|e| e.due)
                .expect("periodic entry vanished");
            return PollAction::ReadRange(self.build_range(seed.device.clone(), &seed.register, now));
        }

        // No deadline pending: serve the best-effort rotation.
        if let Some(seed) = self.best_effort.iter().find(|e| eligible(&e.register)) {
            return PollAction::ReadRange(self.build_range(
                seed.device.clone(),
                &seed.register,
                now,
            ));
        }

        let until = match (periodic_due, events_due) {
            (Some(p), Some(e)) => Some(p.min(e)),
            (Some(p), None) => Some(p),
            (None, Some(e)) => Some(e),
            (None, None) => None,
        };
        PollAction::Idle { until }
    }

    /// Coalesce registers around `seed` into one read range: same device and
    /// register type, sorted by address, with holes no wider than the
    /// device's limit and the total span capped.
    fn build_range(&self, device: Arc<Device>, seed: &Arc<Register>, now: Instant) -> ReadRange {
        let reg_type = seed.key().reg_type;
        let max_hole = device.max_register_hole();
        let max_span = device.max_read_registers() as u32;

        // Candidates worth reading together with the seed: due periodic
        // registers and any best-effort register of the same device/type.
        let mut candidates: Vec<Arc<Register>> = Vec::new();
        for e in &self.periodic {
            if Arc::ptr_eq(&e.device, &device)
                && e.register.key().reg_type == reg_type
                && e.due <= now
                && eligible(&e.register)
            {
                candidates.push(e.register.clone());
            }
        }
        for e in &self.best_effort {
            if Arc::ptr_eq(&e.device, &device)
                && e.register.key().reg_type == reg_type
                && eligible(&e.register)
            {
                candidates.push(e.register.clone());
            }
        }
        if !candidates.iter().any(|r| Arc::ptr_eq(r, seed)) {
            candidates.push(seed.clone());
        }
        candidates.sort_by_key(|r| r.key().address);
        candidates.dedup_by(|a, b| Arc::ptr_eq(a, b));

        let seed_addr = seed.key().address;
        let seed_pos = candidates
            .iter()
            .position(|r| Arc::ptr_eq(r, seed))
            .expect("seed not among candidates");

        // Grow outward from the seed while the address holes stay small and
        // the span fits one request.
        let mut lo = seed_pos;
        let mut hi = seed_pos;
        let mut start = seed_addr;
        let mut end = reg_end(seed);
        loop {
            let grow_hi = if hi + 1 < candidates.len() {
                let next = &candidates[hi + 1];
                let gap = next.key().address.saturating_sub(end);
                let new_end = end.max(reg_end(next));
                (gap <= max_hole && new_end - start <= max_span).then_some(new_end)
            } else {
                None
            };
            if let Some(new_end) = grow_hi {
                hi += 1;
                end = new_end;
                continue;
            }
            let grow_lo = if lo > 0 {
                let prev = &candidates[lo - 1];
                let gap = start.saturating_sub(reg_end(prev));
                let new_start = prev.key().address;
                (gap <= max_hole && end - new_start <= max_span).then_some(new_start)
            } else {
                None
            };
            if let Some(new_start) = grow_lo {
                lo -= 1;
                start = new_start;
                continue;
            }
            break;
        }

        let registers: Vec<Arc<Register>> = candidates[lo..=hi].to_vec();
        trace!(
            device = %device.id(),
            reg_type,
            start,
            count = end - start,
            members = registers.len(),
            "built read range"
        );
        ReadRange {
            device,
            reg_type,
            start,
            count: end - start,
            registers,
        }
    }

    /// Report a completed read range. Rescheduling is the same for success
    /// and transient failure: periodic members advance from the previous due
    /// point, best-effort members rotate to the back of the queue.
    /// Permanently failed registers become ineligible through their
    /// availability flag and need no entry removal.
    pub fn on_range_done(&mut self, range: &ReadRange, now: Instant) {
        for reg in &range.registers {
            if let Some(entry) = self
                .periodic
                .iter_mut()
                .find(|e| Arc::ptr_eq(&e.register, reg))
            {
                entry.due += entry.period;
                if entry.due <= now {
                    entry.due = now + entry.period;
                }
            } else if let Some(pos) = self
                .best_effort
                .iter()
                .position(|e| Arc::ptr_eq(&e.register, reg))
            {
                let entry = self
                    .best_effort
                    .remove(pos)
                    .expect("best-effort entry vanished");
                self.best_effort.push_back(entry);
            }
        }
    }

    /// Report the outcome of an events-enable request. Failed attempts retry
    /// at the device's events poll interval.
    pub fn on_events_enabled(&mut self, device: &Arc<Device>, now: Instant) {
        self.reschedule_events(device, now);
    }

    /// Report a completed event poll.
    pub fn on_events_polled(&mut self, device: &Arc<Device>, now: Instant) {
        self.reschedule_events(device, now);
    }

    fn reschedule_events(&mut self, device: &Arc<Device>, now: Instant) {
        if let Some(entry) = self
            .events
            .iter_mut()
            .find(|e| Arc::ptr_eq(&e.device, device))
        {
            entry.next_poll = now + device.events_poll_interval();
        }
    }
}

fn eligible(reg: &Register) -> bool {
    reg.availability() != Availability::Unavailable
}

fn reg_end(reg: &Arc<Register>) -> u32 {
    reg.key().address + u32::from(reg.format().width_words())
}
