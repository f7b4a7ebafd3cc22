//! Splitting an instance group's update into batches.

use std::time::Duration;

pub use fleet_director::UpdateConfig;

/// Kind of update batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    /// Updated first; the rest only proceeds if every canary is healthy.
    Canary,
    Rolling,
}

/// A contiguous slice `[start, start + count)` of the instances to update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    pub kind: BatchKind,
    pub start: u32,
    pub count: u32,
}

impl Batch {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start as usize..(self.start + self.count) as usize
    }
}

/// Canaries first, then the remainder in batches of `max_in_flight`.
pub fn plan_batches(total: u32, config: &UpdateConfig) -> Vec<Batch> {
    let mut batches = Vec::new();
    let canaries = config.canaries.min(total);
    if canaries > 0 {
        batches.push(Batch {
            kind: BatchKind::Canary,
            start: 0,
            count: canaries,
        });
    }
    let size = config.max_in_flight.max(1);
    let mut start = canaries;
    while start < total {
        let count = size.min(total - start);
        batches.push(Batch {
            kind: BatchKind::Rolling,
            start,
            count,
        });
        start += count;
    }
    batches
}

/// How long an instance of this batch kind may take to report `running`.
pub fn watch_time(config: &UpdateConfig, kind: BatchKind) -> Duration {
    match kind {
        BatchKind::Canary => Duration::from_millis(config.canary_watch_time_ms),
        BatchKind::Rolling => Duration::from_millis(config.update_watch_time_ms),
    }
}

/// Concurrency of a batch: canaries share the rolling limit.
pub fn batch_parallelism(config: &UpdateConfig, batch: &Batch) -> usize {
    config.max_in_flight.max(1).min(batch.count.max(1)) as usize
}
