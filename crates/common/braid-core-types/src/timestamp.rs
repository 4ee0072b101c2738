//! Hybrid logical timestamps.
//!
//! Nodes are ordered causally by their parent links; within that, replicas
//! need a total order that survives wall-clock skew between authors. A
//! hybrid timestamp pairs the author's physical clock with a logical counter
//! that ticks whenever the physical component would stand still or run
//! backwards, so a single author's timestamps are strictly monotonic.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

/// A hybrid logical timestamp. Ordering is lexicographic on
/// `(physical_ms, logical)`, which the derive gives us from field order.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct HybridTimestamp {
    /// Milliseconds since the Unix epoch on the author's clock.
    pub physical_ms: u64,
    /// Tie-breaking counter for events within the same millisecond.
    pub logical: u32,
}

impl HybridTimestamp {
    pub fn new(physical_ms: u64, logical: u32) -> Self {
        Self {
            physical_ms,
            logical,
        }
    }

    /// The smallest timestamp strictly greater than `self`.
    pub fn successor(&self) -> Self {
        Self {
            physical_ms: self.physical_ms,
            logical: self.logical + 1,
        }
    }
}

impl fmt::Display for HybridTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.physical_ms, self.logical)
    }
}

/// Per-author clock issuing strictly increasing hybrid timestamps.
#[derive(Debug, Default)]
pub struct HybridClock {
    last: Mutex<HybridTimestamp>,
}

impl HybridClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next timestamp. Wall-clock regression or repetition is
    /// absorbed by the logical counter.
    pub fn now(&self) -> HybridTimestamp {
        let wall = Utc::now().timestamp_millis().max(0) as u64;
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        *last = if wall > last.physical_ms {
            HybridTimestamp::new(wall, 0)
        } else {
            last.successor()
        };
        *last
    }

    /// Fold a remote timestamp in, so the next local issue sorts after
    /// everything this clock has seen.
    pub fn observe(&self, remote: &HybridTimestamp) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if *remote > *last {
            *last = *remote;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issues_strictly_increasing() {
        let clock = HybridClock::new();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn observe_pushes_clock_forward() {
        let clock = HybridClock::new();
        let far_future = HybridTimestamp::new(u64::MAX - 1, 3);
        clock.observe(&far_future);
        assert!(clock.now() > far_future);
    }

    #[test]
    fn ordering_is_physical_then_logical() {
        let a = HybridTimestamp::new(10, 5);
        let b = HybridTimestamp::new(10, 6);
        let c = HybridTimestamp::new(11, 0);
        assert!(a < b && b < c);
        assert!(a.successor() == b);
    }
}
