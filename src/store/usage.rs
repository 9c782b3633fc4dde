//! Per-capability usage tracking: aggregate counters plus a bounded ring of
//! recent access events (spec §3 `CapabilityUsage`).

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Default size of the access-event ring kept per capability.
pub const DEFAULT_RING_CAPACITY: usize = 100;

/// One recorded attempt to use a capability.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AccessEvent {
    pub timestamp: i64,
    pub action: String,
    pub resource: String,
    pub success: bool,
}

/// Aggregate usage counters plus a bounded ring of recent access events.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CapabilityUsage {
    pub total_uses: u64,
    pub successful_uses: u64,
    pub failed_uses: u64,
    pub last_access: Option<i64>,
    pub ring_capacity: usize,
    pub recent: VecDeque<AccessEvent>,
}

impl CapabilityUsage {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY)
    }

    pub fn with_capacity(ring_capacity: usize) -> Self {
        Self {
            total_uses: 0,
            successful_uses: 0,
            failed_uses: 0,
            last_access: None,
            ring_capacity,
            recent: VecDeque::new(),
        }
    }

    /// Records `event`, trimming the oldest entry past the ring capacity.
    pub fn record(&mut self, event: AccessEvent) {
        self.total_uses += 1;
        if event.success {
            self.successful_uses += 1;
        } else {
            self.failed_uses += 1;
        }
        self.last_access = Some(event.timestamp);
        self.recent.push_back(event);
        while self.recent.len() > self.ring_capacity.max(1) {
            self.recent.pop_front();
        }
    }

    /// Count of successful accesses within `[now - window_seconds, now]`,
    /// used by the rate-limit constraint (spec §4.4 step 6).
    pub fn uses_within(&self, now_unix: i64, window_seconds: i64) -> u32 {
        let floor = now_unix - window_seconds;
        self.recent
            .iter()
            .filter(|e| e.success && e.timestamp > floor && e.timestamp <= now_unix)
            .count() as u32
    }
}

impl Default for CapabilityUsage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_trims_oldest() {
        let mut usage = CapabilityUsage::with_capacity(3);
        for i in 0..5 {
            usage.record(AccessEvent {
                timestamp: i,
                action: "read".into(),
                resource: "r".into(),
                success: true,
            });
        }
        assert_eq!(usage.recent.len(), 3);
        assert_eq!(usage.recent.front().unwrap().timestamp, 2);
        assert_eq!(usage.total_uses, 5);
    }

    #[test]
    fn uses_within_window() {
        let mut usage = CapabilityUsage::new();
        for t in [10, 20, 30, 100] {
            usage.record(AccessEvent {
                timestamp: t,
                action: "read".into(),
                resource: "r".into(),
                success: true,
            });
        }
        assert_eq!(usage.uses_within(30, 25), 2);
    }
}
