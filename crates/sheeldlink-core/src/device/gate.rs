//! Callback-aware outbound frame queue
//!
//! The board periodically runs its application callback and should not
//! receive new frames while inside it. Frames submitted during a callback,
//! or while older frames are still waiting, join a FIFO that is released one
//! frame at a time once the board has been quiet for the configured interval.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::protocol::ShieldFrame;

/// What the drain routine should do next
#[derive(Debug, Clone, PartialEq)]
pub enum GateRelease {
    /// Send this frame now
    Send(ShieldFrame),
    /// The next frame may go out at this instant
    WaitUntil(Instant),
    /// Frames are waiting for the callback to end
    Blocked,
    /// Nothing queued
    Idle,
}

/// Gating state for one device session
#[derive(Debug)]
pub struct OutboundGate {
    quiet_interval: Duration,
    in_callback: bool,
    last_exit: Option<Instant>,
    last_release: Option<Instant>,
    queue: VecDeque<ShieldFrame>,
}

impl OutboundGate {
    /// Create an open gate with an empty queue
    pub fn new(quiet_interval: Duration) -> Self {
        Self {
            quiet_interval,
            in_callback: false,
            last_exit: None,
            last_release: None,
            queue: VecDeque::new(),
        }
    }

    /// Offer a frame. Returns it back when it may be sent right away,
    /// otherwise it is queued.
    pub fn submit(&mut self, frame: ShieldFrame) -> Option<ShieldFrame> {
        if !self.in_callback && self.queue.is_empty() {
            return Some(frame);
        }
        self.queue.push_back(frame);
        None
    }

    /// The board entered its callback
    pub fn enter_callback(&mut self) {
        self.in_callback = true;
    }

    /// The board left its callback (or the watchdog gave up waiting)
    pub fn exit_callback(&mut self, now: Instant) {
        self.in_callback = false;
        self.last_exit = Some(now);
    }

    /// Frames waiting in the queue
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Earliest instant the next queued frame may leave
    fn ready_at(&self) -> Option<Instant> {
        let after_exit = self.last_exit.map(|t| t + self.quiet_interval);
        let after_release = self.last_release.map(|t| t + self.quiet_interval);
        after_exit.max(after_release)
    }

    /// Release at most one queued frame
    pub fn poll_release(&mut self, now: Instant) -> GateRelease {
        if self.queue.is_empty() {
            return GateRelease::Idle;
        }
        if self.in_callback {
            return GateRelease::Blocked;
        }
        match self.ready_at() {
            Some(at) if at > now => GateRelease::WaitUntil(at),
            _ => match self.queue.pop_front() {
                Some(frame) => {
                    self.last_release = Some(now);
                    GateRelease::Send(frame)
                }
                None => GateRelease::Idle,
            },
        }
    }
}
