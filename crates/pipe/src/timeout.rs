//! Wait policy for blocking reads

use std::time::{Duration, Instant};

/// Millisecond value that denotes an infinite wait
pub const INFINITE: u16 = 65535;

/// How long a consumer is willing to wait for data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Poll once and return immediately
    Immediate,
    /// Wait up to the given duration
    After(Duration),
    /// Wait until data arrives
    Infinite,
}

impl Timeout {
    /// Bounded wait in milliseconds
    pub fn millis(ms: u64) -> Self {
        if ms == 0 {
            Timeout::Immediate
        } else {
            Timeout::After(Duration::from_millis(ms))
        }
    }

    /// Absolute deadline for a bounded wait started now
    ///
    /// `None` for a wait too long to be represented as an instant, which
    /// callers treat like `Infinite`.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        match self {
            Timeout::After(d) => Instant::now().checked_add(*d),
            Timeout::Immediate | Timeout::Infinite => None,
        }
    }
}

impl From<u16> for Timeout {
    fn from(ms: u16) -> Self {
        match ms {
            0 => Timeout::Immediate,
            INFINITE => Timeout::Infinite,
            ms => Timeout::After(Duration::from_millis(ms as u64)),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            Timeout::Immediate
        } else {
            Timeout::After(d)
        }
    }
}
