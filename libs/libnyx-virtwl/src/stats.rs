//! Diagnostic counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters bumped by the dispatcher, readers and the ring transport
#[derive(Debug, Default)]
pub struct Stats {
    pub vfds_accepted: AtomicU64,
    pub vfd_new_rejected: AtomicU64,
    pub recv_queued: AtomicU64,
    pub recv_unknown_vfd: AtomicU64,
    pub unknown_descriptor_ids: AtomicU64,
    pub malformed_messages: AtomicU64,
    pub unknown_commands: AtomicU64,
    pub hangups: AtomicU64,
    pub buffers_recycled: AtomicU64,
    pub buffers_dropped: AtomicU64,
}

/// Point-in-time copy of [`Stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub vfds_accepted: u64,
    pub vfd_new_rejected: u64,
    pub recv_queued: u64,
    pub recv_unknown_vfd: u64,
    pub unknown_descriptor_ids: u64,
    pub malformed_messages: u64,
    pub unknown_commands: u64,
    pub hangups: u64,
    pub buffers_recycled: u64,
    pub buffers_dropped: u64,
}

impl Stats {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            vfds_accepted: get(&self.vfds_accepted),
            vfd_new_rejected: get(&self.vfd_new_rejected),
            recv_queued: get(&self.recv_queued),
            recv_unknown_vfd: get(&self.recv_unknown_vfd),
            unknown_descriptor_ids: get(&self.unknown_descriptor_ids),
            malformed_messages: get(&self.malformed_messages),
            unknown_commands: get(&self.unknown_commands),
            hangups: get(&self.hangups),
            buffers_recycled: get(&self.buffers_recycled),
            buffers_dropped: get(&self.buffers_dropped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_bumps() {
        let stats = Stats::default();
        Stats::bump(&stats.recv_queued);
        Stats::bump(&stats.recv_queued);
        Stats::bump(&stats.hangups);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.recv_queued, 2);
        assert_eq!(snapshot.hangups, 1);
        assert_eq!(snapshot.malformed_messages, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = Stats::default();
        Stats::bump(&stats.vfds_accepted);
        let text = toml::to_string(&stats.snapshot()).unwrap();
        assert!(text.contains("vfds_accepted = 1"));
    }
}
