//! Heartbeat scheduling and inactivity tracking for one connection.
//!
//! The mode decides who produces periodic traffic. Upstream sends plain
//! heartbeats, roundtrip sends heartbeat requests and counts anything the
//! peer sends back as proof of life, downstream sends nothing and relies
//! on the peer's traffic. Every mode except disabled arms an inactivity
//! deadline at `interval * multiplier` past the last inbound packet.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use tether_wire::{heartbeat, heartbeat_request, HeartbeatMode, Packet};

/// Factor applied to the heartbeat interval to get the inactivity window.
///
/// The dynamic form is consulted every time the window is computed, so a
/// deployment can widen it under load without touching the connection.
#[derive(Clone)]
pub enum TimeoutMultiplier {
    /// Fixed factor
    Fixed(f64),
    /// Factor computed on demand
    Dynamic(Arc<dyn Fn() -> f64 + Send + Sync>),
}

impl TimeoutMultiplier {
    fn value(&self) -> f64 {
        match self {
            TimeoutMultiplier::Fixed(factor) => *factor,
            TimeoutMultiplier::Dynamic(compute) => compute(),
        }
    }
}

impl Default for TimeoutMultiplier {
    fn default() -> Self {
        TimeoutMultiplier::Fixed(2.5)
    }
}

impl fmt::Debug for TimeoutMultiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutMultiplier::Fixed(factor) => f.debug_tuple("Fixed").field(factor).finish(),
            TimeoutMultiplier::Dynamic(_) => f.write_str("Dynamic"),
        }
    }
}

/// Heartbeat state machine for one connection.
#[derive(Debug)]
pub struct HeartbeatState {
    mode: HeartbeatMode,
    interval: Duration,
    multiplier: TimeoutMultiplier,
    running: bool,
    last_active: Instant,
    next_send: Option<Instant>,
}

impl HeartbeatState {
    /// New, stopped state. Call [`start`](Self::start) once the connection
    /// is open.
    pub fn new(mode: HeartbeatMode, interval: Duration, multiplier: TimeoutMultiplier) -> Self {
        Self {
            mode,
            interval,
            multiplier,
            running: false,
            last_active: Instant::now(),
            next_send: None,
        }
    }

    /// Current heartbeat mode.
    pub fn mode(&self) -> HeartbeatMode {
        self.mode
    }

    /// Current heartbeat interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Arm the schedule. The inactivity window starts counting from `now`.
    pub fn start(&mut self, now: Instant) {
        self.running = true;
        self.last_active = now;
        self.rearm(now);
    }

    /// Disarm everything; the connection is gone.
    pub fn stop(&mut self) {
        self.running = false;
        self.next_send = None;
    }

    /// Record inbound traffic. Any packet counts, not just heartbeats.
    pub fn mark_active(&mut self, now: Instant) {
        self.last_active = now;
    }

    /// Apply a negotiated settings change and restart the window from `now`.
    pub fn apply(&mut self, mode: Option<HeartbeatMode>, interval: Option<Duration>, now: Instant) {
        if let Some(mode) = mode {
            self.mode = mode;
        }
        if let Some(interval) = interval {
            self.interval = interval;
        }
        self.last_active = now;
        if self.running {
            self.rearm(now);
        }
    }

    /// Heartbeat packet due at `now`, if the mode produces one. Advances
    /// the schedule by one interval.
    pub fn poll_send(&mut self, now: Instant) -> Option<Packet> {
        if !self.running {
            return None;
        }
        match self.next_send {
            Some(at) if at <= now => {
                self.next_send = Some(now + self.interval);
                match self.mode {
                    HeartbeatMode::Upstream => Some(heartbeat()),
                    HeartbeatMode::Roundtrip => Some(heartbeat_request()),
                    HeartbeatMode::Downstream | HeartbeatMode::Disabled => None,
                }
            }
            _ => None,
        }
    }

    /// When the next periodic packet is due, if the mode sends any.
    pub fn next_send_at(&self) -> Option<Instant> {
        self.next_send
    }

    /// Deadline after which the peer is considered unreachable. `None`
    /// when liveness is not being tracked.
    pub fn idle_deadline(&self) -> Option<Instant> {
        if !self.running || self.mode == HeartbeatMode::Disabled {
            return None;
        }
        Some(self.last_active + self.window())
    }

    /// Whether an inbound heartbeat request gets a reply.
    pub fn permits_reply(&self) -> bool {
        self.mode != HeartbeatMode::Disabled
    }

    fn window(&self) -> Duration {
        self.interval.mul_f64(self.multiplier.value().max(0.0))
    }

    fn rearm(&mut self, now: Instant) {
        self.next_send = match self.mode {
            HeartbeatMode::Upstream | HeartbeatMode::Roundtrip => Some(now + self.interval),
            HeartbeatMode::Downstream | HeartbeatMode::Disabled => None,
        };
    }
}
