//! Engine statistics

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the engine and its handles
#[derive(Debug, Default)]
pub struct EngineStats {
    pub requests_queued: AtomicU64,
    pub requests_completed: AtomicU64,
    pub requests_failed: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub bytes_discarded: AtomicU64,
    pub fragments: AtomicU64,
    pub tokens_dispatched: AtomicU64,
    pub retries: AtomicU64,
    pub timeouts: AtomicU64,
    pub rmw: AtomicU64,
    pub sec_suppressed: AtomicU64,
    pub deallocations: AtomicU64,
    pub orphans_recovered: AtomicU64,
    pub requeues: AtomicU64,
    pub collisions: AtomicU64,
    pub seq_advances: AtomicU64,
    pub control_commands: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub requests_queued: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub bytes_discarded: u64,
    pub fragments: u64,
    pub tokens_dispatched: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub rmw: u64,
    pub sec_suppressed: u64,
    pub deallocations: u64,
    pub orphans_recovered: u64,
    pub requeues: u64,
    pub collisions: u64,
    pub seq_advances: u64,
    pub control_commands: u64,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl EngineStats {
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            requests_queued: get(&self.requests_queued),
            requests_completed: get(&self.requests_completed),
            requests_failed: get(&self.requests_failed),
            bytes_read: get(&self.bytes_read),
            bytes_written: get(&self.bytes_written),
            bytes_discarded: get(&self.bytes_discarded),
            fragments: get(&self.fragments),
            tokens_dispatched: get(&self.tokens_dispatched),
            retries: get(&self.retries),
            timeouts: get(&self.timeouts),
            rmw: get(&self.rmw),
            sec_suppressed: get(&self.sec_suppressed),
            deallocations: get(&self.deallocations),
            orphans_recovered: get(&self.orphans_recovered),
            requeues: get(&self.requeues),
            collisions: get(&self.collisions),
            seq_advances: get(&self.seq_advances),
            control_commands: get(&self.control_commands),
        }
    }
}

impl StatsSnapshot {
    /// Requests still waiting for a completion
    #[must_use]
    pub const fn outstanding(&self) -> u64 {
        self.requests_queued
            .saturating_sub(self.requests_completed + self.requests_failed)
    }

    /// Sum of two snapshots, for aggregating RAID members
    #[must_use]
    pub const fn merged(&self, other: &Self) -> Self {
        Self {
            requests_queued: self.requests_queued + other.requests_queued,
            requests_completed: self.requests_completed + other.requests_completed,
            requests_failed: self.requests_failed + other.requests_failed,
            bytes_read: self.bytes_read + other.bytes_read,
            bytes_written: self.bytes_written + other.bytes_written,
            bytes_discarded: self.bytes_discarded + other.bytes_discarded,
            fragments: self.fragments + other.fragments,
            tokens_dispatched: self.tokens_dispatched + other.tokens_dispatched,
            retries: self.retries + other.retries,
            timeouts: self.timeouts + other.timeouts,
            rmw: self.rmw + other.rmw,
            sec_suppressed: self.sec_suppressed + other.sec_suppressed,
            deallocations: self.deallocations + other.deallocations,
            orphans_recovered: self.orphans_recovered + other.orphans_recovered,
            requeues: self.requeues + other.requeues,
            collisions: self.collisions + other.collisions,
            seq_advances: self.seq_advances + other.seq_advances,
            control_commands: self.control_commands + other.control_commands,
        }
    }
}
