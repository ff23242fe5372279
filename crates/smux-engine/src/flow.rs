//! Flow control primitives
//!
//! Watermark hysteresis and exponential backoff, kept free of engine state
//! so the transitions can be tested in isolation.

use std::time::Duration;

/// Backoff position of one retried operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    delay: Duration,
    attempts: u32,
}

impl RetryState {
    /// Start a new backoff at `min`
    pub fn new(min: Duration) -> Self {
        Self {
            delay: min,
            attempts: 0,
        }
    }

    /// Delay before the next attempt
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Number of failed attempts so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Double the delay after a failed attempt
    ///
    /// Returns `None` once the doubled delay would exceed `max`, meaning the
    /// operation should be abandoned.
    pub fn next(self, max: Duration) -> Option<Self> {
        let delay = self.delay.checked_mul(2)?;
        (delay <= max).then_some(Self {
            delay,
            attempts: self.attempts + 1,
        })
    }

    /// Double the delay after a failed attempt, holding at `max`
    pub fn next_saturating(self, max: Duration) -> Self {
        Self {
            delay: self.delay.saturating_mul(2).min(max),
            attempts: self.attempts.saturating_add(1),
        }
    }
}

/// Watermark crossing reported by [`Watermarks`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crossing {
    High,
    Low,
}

/// High/low watermark pair with hysteresis
///
/// `High` is reported when the level climbs to the high mark and arms the
/// pair; `Low` is reported once when an armed pair drains to the low mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub low: usize,
    pub high: usize,
}

impl Watermarks {
    pub fn new(low: usize, high: usize) -> Self {
        Self { low, high }
    }

    /// Level increased to `level`
    pub fn on_rise(&self, level: usize, armed: &mut bool) -> Option<Crossing> {
        if !*armed && level >= self.high {
            *armed = true;
            Some(Crossing::High)
        } else {
            None
        }
    }

    /// Level decreased to `level`
    pub fn on_fall(&self, level: usize, armed: &mut bool) -> Option<Crossing> {
        if *armed && level <= self.low {
            *armed = false;
            Some(Crossing::Low)
        } else {
            None
        }
    }
}
