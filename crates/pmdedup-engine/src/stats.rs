//! Engine statistics

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine counters, updated lock-free
#[derive(Debug, Default)]
pub struct DedupStats {
    /// Blocks passed to `submit_block`
    pub submitted: AtomicU64,
    /// Submissions redirected to an existing block
    pub duplicates: AtomicU64,
    /// Submissions that wrote a fresh block
    pub new_blocks: AtomicU64,
    /// Weak fingerprint matches whose strong fingerprints differed
    pub weak_collisions: AtomicU64,
    /// Entries upgraded to strong on a weak hit
    pub lazy_strengthened: AtomicU64,
    /// Concurrent identical submissions folded into the winner
    pub lost_races_folded: AtomicU64,
    /// Entries the finalizer moved to weak-valid
    pub finalized_weak: AtomicU64,
    /// Entries the finalizer moved to strong-valid and indexed
    pub finalized_strong: AtomicU64,
    /// Entries the finalizer found to duplicate already indexed content
    pub unmerged_duplicates: AtomicU64,
    /// Entries returned to the free list
    pub reclaimed: AtomicU64,
    /// Entries skipped because their block was rebound
    pub stale_skips: AtomicU64,
    /// Completed finalizer passes
    pub finalizer_passes: AtomicU64,
    /// Completed mode windows
    pub mode_windows: AtomicU64,
    /// Windows that switched modes
    pub mode_changes: AtomicU64,
}

impl DedupStats {
    /// Bump a counter by one
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy every counter
    pub fn snapshot(&self) -> DedupStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        DedupStatsSnapshot {
            submitted: load(&self.submitted),
            duplicates: load(&self.duplicates),
            new_blocks: load(&self.new_blocks),
            weak_collisions: load(&self.weak_collisions),
            lazy_strengthened: load(&self.lazy_strengthened),
            lost_races_folded: load(&self.lost_races_folded),
            finalized_weak: load(&self.finalized_weak),
            finalized_strong: load(&self.finalized_strong),
            unmerged_duplicates: load(&self.unmerged_duplicates),
            reclaimed: load(&self.reclaimed),
            stale_skips: load(&self.stale_skips),
            finalizer_passes: load(&self.finalizer_passes),
            mode_windows: load(&self.mode_windows),
            mode_changes: load(&self.mode_changes),
        }
    }
}

/// Point-in-time copy of [`DedupStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DedupStatsSnapshot {
    pub submitted: u64,
    pub duplicates: u64,
    pub new_blocks: u64,
    pub weak_collisions: u64,
    pub lazy_strengthened: u64,
    pub lost_races_folded: u64,
    pub finalized_weak: u64,
    pub finalized_strong: u64,
    pub unmerged_duplicates: u64,
    pub reclaimed: u64,
    pub stale_skips: u64,
    pub finalizer_passes: u64,
    pub mode_windows: u64,
    pub mode_changes: u64,
}

impl DedupStatsSnapshot {
    /// Fraction of submissions that were duplicates (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn dedup_ratio(&self) -> f64 {
        if self.submitted == 0 {
            return 0.0;
        }
        self.duplicates as f64 / self.submitted as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_ratio() {
        let stats = DedupStats::default();
        assert!(stats.snapshot().dedup_ratio().abs() < f64::EPSILON);

        for _ in 0..4 {
            DedupStats::incr(&stats.submitted);
        }
        DedupStats::incr(&stats.duplicates);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.submitted, 4);
        assert_eq!(snapshot.duplicates, 1);
        assert!((snapshot.dedup_ratio() - 0.25).abs() < f64::EPSILON);
    }
}
