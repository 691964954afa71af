//! Adaptive mode controller
//!
//! Samples submissions in windows of `window_size` blocks. At the end of
//! each window the number of duplicates seen picks the strategy for the
//! next one:
//!
//! ```text
//! dups > high_threshold          -> StrongFirst
//! dups > low_threshold           -> WeakThenStrong
//! otherwise, with probability p  -> NoFingerprint
//! otherwise                      -> WeakThenStrong
//! ```
//!
//! Counters are plain atomics. A window is consumed by a compare-exchange
//! on the block counter, so exactly one caller recomputes each window.
//! Readers may observe the previous mode while a recomputation is in
//! flight.

use pmdedup_common::{DedupMode, ModeConfig};
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tracing::{debug, info};

/// Point-in-time view of the controller
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ModeState {
    /// Blocks counted in the current window
    pub cur_block_count: u64,
    /// Duplicates counted in the current window
    pub dup_block_count: u64,
    /// Strategy applied to new submissions
    pub active_mode: DedupMode,
}

/// Outcome of one window recomputation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModeTransition {
    /// Mode in effect during the finished window
    pub from: DedupMode,
    /// Mode chosen for the next window
    pub to: DedupMode,
    /// Duplicates observed in the finished window
    pub duplicates: u64,
}

impl ModeTransition {
    /// Whether the recomputation switched modes
    #[must_use]
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Sliding-window sampler choosing the active [`DedupMode`]
#[derive(Debug)]
pub struct ModeController {
    config: ModeConfig,
    cur_block_count: AtomicU64,
    dup_block_count: AtomicU64,
    active_mode: AtomicU8,
    windows: AtomicU64,
}

impl ModeController {
    /// Controller starting in `config.initial_mode`
    #[must_use]
    pub fn new(config: ModeConfig) -> Self {
        let initial = config.initial_mode;
        Self {
            config,
            cur_block_count: AtomicU64::new(0),
            dup_block_count: AtomicU64::new(0),
            active_mode: AtomicU8::new(initial.as_u8()),
            windows: AtomicU64::new(0),
        }
    }

    /// Strategy for the next submission
    pub fn mode(&self) -> DedupMode {
        DedupMode::from_u8(self.active_mode.load(Ordering::Acquire))
            .unwrap_or(self.config.initial_mode)
    }

    /// Snapshot of the counters and the active mode
    pub fn state(&self) -> ModeState {
        ModeState {
            cur_block_count: self.cur_block_count.load(Ordering::Relaxed),
            dup_block_count: self.dup_block_count.load(Ordering::Relaxed),
            active_mode: self.mode(),
        }
    }

    /// Number of windows completed so far
    pub fn windows(&self) -> u64 {
        self.windows.load(Ordering::Relaxed)
    }

    /// Count one submitted block
    ///
    /// Returns the transition computed when this call completed a window.
    pub fn record(&self, duplicate: bool) -> Option<ModeTransition> {
        // Duplicates first, so a window never sees more blocks than its
        // duplicates account for
        if duplicate {
            self.dup_block_count.fetch_add(1, Ordering::AcqRel);
        }
        self.cur_block_count.fetch_add(1, Ordering::AcqRel);

        let window = self.config.window_size;
        let mut last = None;
        let mut current = self.cur_block_count.load(Ordering::Acquire);
        while current >= window {
            match self.cur_block_count.compare_exchange_weak(
                current,
                current - window,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    last = Some(self.recompute());
                    current = self.cur_block_count.load(Ordering::Acquire);
                }
                Err(actual) => current = actual,
            }
        }
        last
    }

    fn recompute(&self) -> ModeTransition {
        let duplicates = self.dup_block_count.swap(0, Ordering::AcqRel);
        self.windows.fetch_add(1, Ordering::Relaxed);

        let from = self.mode();
        let to = if self.config.adaptive {
            self.select(duplicates)
        } else {
            from
        };
        self.active_mode.store(to.as_u8(), Ordering::Release);

        let transition = ModeTransition {
            from,
            to,
            duplicates,
        };
        if transition.changed() {
            info!("Dedup mode {from} -> {to} ({duplicates} duplicates in window)");
        } else {
            debug!("Dedup mode stays {to} ({duplicates} duplicates in window)");
        }
        transition
    }

    fn select(&self, duplicates: u64) -> DedupMode {
        if duplicates > self.config.high_threshold {
            DedupMode::StrongFirst
        } else if duplicates > self.config.low_threshold {
            DedupMode::WeakThenStrong
        } else if rand::thread_rng().gen_bool(self.config.explore_probability) {
            DedupMode::NoFingerprint
        } else {
            DedupMode::WeakThenStrong
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn config(window_size: u64, explore_probability: f64) -> ModeConfig {
        ModeConfig {
            adaptive: true,
            initial_mode: DedupMode::WeakThenStrong,
            window_size,
            high_threshold: 50,
            low_threshold: 10,
            explore_probability,
        }
    }

    #[test]
    fn test_high_duplicates_select_strong_first() {
        let controller = ModeController::new(config(100, 0.5));

        for _ in 0..20 {
            assert!(controller.record(false).is_none());
        }
        for _ in 0..79 {
            assert!(controller.record(true).is_none());
        }
        let transition = controller.record(true).unwrap();

        assert_eq!(transition.duplicates, 80);
        assert_eq!(transition.from, DedupMode::WeakThenStrong);
        assert_eq!(transition.to, DedupMode::StrongFirst);
        assert_eq!(controller.mode(), DedupMode::StrongFirst);

        let state = controller.state();
        assert_eq!(state.cur_block_count, 0);
        assert_eq!(state.dup_block_count, 0);
    }

    #[test]
    fn test_moderate_duplicates_select_weak_then_strong() {
        let controller = ModeController::new(ModeConfig {
            initial_mode: DedupMode::StrongFirst,
            ..config(100, 1.0)
        });
        // 30 duplicates: above low, not above high
        for i in 0..100 {
            controller.record(i < 30);
        }
        assert_eq!(controller.mode(), DedupMode::WeakThenStrong);
    }

    #[test]
    fn test_low_duplicates_explore() {
        let always = ModeController::new(config(10, 1.0));
        for _ in 0..10 {
            always.record(false);
        }
        assert_eq!(always.mode(), DedupMode::NoFingerprint);

        let never = ModeController::new(ModeConfig {
            initial_mode: DedupMode::StrongFirst,
            ..config(10, 0.0)
        });
        for _ in 0..10 {
            never.record(false);
        }
        assert_eq!(never.mode(), DedupMode::WeakThenStrong);
    }

    #[test]
    fn test_pinned_mode_never_changes() {
        let controller = ModeController::new(ModeConfig {
            window_size: 10,
            ..ModeConfig::pinned(DedupMode::NoFingerprint)
        });
        for _ in 0..100 {
            if let Some(transition) = controller.record(true) {
                assert!(!transition.changed());
            }
        }
        assert_eq!(controller.mode(), DedupMode::NoFingerprint);
        assert_eq!(controller.windows(), 10);
    }

    #[test]
    fn test_one_recomputation_per_window_under_contention() {
        let controller = Arc::new(ModeController::new(config(100, 0.5)));

        let transitions: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|t| {
                    let controller = Arc::clone(&controller);
                    s.spawn(move || {
                        (0..1000)
                            .filter_map(|i| controller.record((i + t) % 2 == 0))
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(transitions, 80);
        assert_eq!(controller.windows(), 80);
        assert_eq!(controller.state().cur_block_count, 0);
    }
}
