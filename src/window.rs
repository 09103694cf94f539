use std::time::Duration;
use tokio::time::Instant;

use crate::error::RegistrarError;

/// Longest accepted window, a century.
pub const MAX_WINDOW: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Call budget: at most `capacity` admissions per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    window: Duration,
    capacity: u32,
}

impl RateLimit {
    pub fn new(window: Duration, capacity: u32) -> Result<Self, RegistrarError> {
        if window.is_zero() {
            return Err(RegistrarError::Config("window duration must be positive".into()));
        }
        if window > MAX_WINDOW {
            return Err(RegistrarError::Config(format!(
                "window duration must not exceed {:?}",
                MAX_WINDOW
            )));
        }
        if capacity == 0 {
            return Err(RegistrarError::Config("capacity must be positive".into()));
        }
        Ok(Self { window, capacity })
    }

    pub fn per_minute(capacity: u32) -> Result<Self, RegistrarError> {
        Self::new(Duration::from_secs(60), capacity)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// Fixed-window counter. Callers must hold the controller's lock.
#[derive(Debug)]
pub struct WindowTracker {
    limit: RateLimit,
    window_start: Instant,
    consumed: u32,
    // Number of roll-overs since construction
    generation: u64,
}

impl WindowTracker {
    pub fn new(limit: RateLimit, now: Instant) -> Self {
        Self {
            limit,
            window_start: now,
            consumed: 0,
            generation: 0,
        }
    }

    pub fn should_roll_over(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= self.limit.window
    }

    pub fn roll_over(&mut self, now: Instant) {
        // window_start never moves backwards
        if now > self.window_start {
            self.window_start = now;
        }
        self.consumed = 0;
        self.generation += 1;
    }

    /// Rolls over if the current window has elapsed. Returns whether it did.
    pub fn refresh(&mut self, now: Instant) -> bool {
        if self.should_roll_over(now) {
            self.roll_over(now);
            true
        } else {
            false
        }
    }

    pub fn remaining(&self) -> bool {
        self.consumed < self.limit.capacity
    }

    pub fn remaining_slots(&self) -> u32 {
        self.limit.capacity - self.consumed
    }

    /// Takes one slot, returning its zero-based index in the window.
    pub fn consume(&mut self) -> Option<u32> {
        if !self.remaining() {
            return None;
        }
        let slot = self.consumed;
        self.consumed += 1;
        Some(slot)
    }

    pub fn window_end(&self) -> Instant {
        self.window_start + self.limit.window
    }

    pub fn window_start(&self) -> Instant {
        self.window_start
    }

    pub fn consumed(&self) -> u32 {
        self.consumed
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }
}
