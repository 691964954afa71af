//! Background finalizer
//!
//! Blocks written without fingerprints are upgraded here, off the write
//! path. Each pass scans the whole entry table once:
//!
//! - free entries are skipped
//! - entries whose refcount reached zero are reclaimed, whatever their state
//! - unfinalized entries whose block was rebound elsewhere are stale and skipped
//! - other unfinalized entries get a weak fingerprint, and a strong one
//!   when the weak fingerprint is already indexed
//!
//! The worker parks on a [`FinalizerSignal`] between passes and is woken
//! explicitly or by its interval. Shutdown is checked once per wake cycle,
//! so a pass in progress always runs to completion.

use crate::engine::Shared;
use crate::entry::{Entry, EntryGuard, EntryState};
use crate::stats::DedupStats;
use parking_lot::{Condvar, Mutex};
use pmdedup_common::{EntryId, Error, Result};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct SignalState {
    pending: bool,
    shutdown: bool,
}

/// Wake-up signal for the finalizer thread
#[derive(Debug, Default)]
pub struct FinalizerSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl FinalizerSignal {
    /// Request a pass as soon as possible
    pub fn notify(&self) {
        self.state.lock().pending = true;
        self.cond.notify_one();
    }

    /// Ask the worker to exit at its next wake cycle
    pub fn request_shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cond.notify_all();
    }

    /// Clear a previous shutdown request
    pub fn reset(&self) {
        self.state.lock().shutdown = false;
    }

    /// Park until notified, shut down, or `interval` elapses
    ///
    /// Returns `false` once shutdown was requested.
    pub fn wait(&self, interval: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.pending && !state.shutdown {
            self.cond.wait_for(&mut state, interval);
        }
        state.pending = false;
        !state.shutdown
    }
}

/// Per-outcome counts of one finalizer pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Entries examined
    pub scanned: u64,
    /// Unfinalized entries moved to weak-valid
    pub weak: u64,
    /// Unfinalized entries moved to strong-valid and strong-indexed
    pub strong: u64,
    /// Entries whose content was already strong-indexed elsewhere
    pub unmerged: u64,
    /// Entries returned to the free list
    pub reclaimed: u64,
    /// Entries skipped because their block was rebound
    pub stale: u64,
    /// Entries left untouched because reading their block, locking them
    /// or persisting them failed; they are retried next pass
    pub errors: u64,
}

impl PassReport {
    /// Whether the pass changed or skipped anything
    #[must_use]
    pub const fn is_eventful(&self) -> bool {
        self.weak + self.strong + self.unmerged + self.reclaimed + self.stale + self.errors > 0
    }
}

enum Outcome {
    Idle,
    Weak,
    Strong,
    Unmerged,
    Reclaimed,
    Stale,
}

/// Run one full scan of the entry table on the calling thread
pub(crate) fn run_pass(shared: &Shared) -> PassReport {
    let mut report = PassReport::default();

    for raw in 0..shared.entries.capacity() {
        let id = EntryId::new(raw);
        report.scanned += 1;

        match finalize_entry(shared, id) {
            Ok(Outcome::Idle) => {}
            Ok(Outcome::Weak) => report.weak += 1,
            Ok(Outcome::Strong) => report.strong += 1,
            Ok(Outcome::Unmerged) => report.unmerged += 1,
            Ok(Outcome::Reclaimed) => report.reclaimed += 1,
            Ok(Outcome::Stale) => report.stale += 1,
            Err(e) => {
                warn!("Finalizer skipped entry {id}: {e}");
                report.errors += 1;
            }
        }

        thread::yield_now();
    }

    DedupStats::incr(&shared.stats.finalizer_passes);
    report
}

fn finalize_entry(shared: &Shared, id: EntryId) -> Result<Outcome> {
    let mut entry = shared.entries.lock(id)?;

    if entry.state == EntryState::Free {
        return Ok(Outcome::Idle);
    }
    if entry.refcount == 0 {
        reclaim(shared, entry)?;
        DedupStats::incr(&shared.stats.reclaimed);
        return Ok(Outcome::Reclaimed);
    }
    if entry.state != EntryState::Unfinalized {
        return Ok(Outcome::Idle);
    }
    if shared.entries.owner_of(entry.blocknr) != Some(id) {
        debug!("Entry {id} is stale (block {} rebound)", entry.blocknr);
        DedupStats::incr(&shared.stats.stale_skips);
        return Ok(Outcome::Stale);
    }

    let content = shared.device.read_block(entry.blocknr)?;
    let weak = shared.digester.weak(&content);

    if shared.index.weak.lookup(&weak).is_none() {
        entry.update(|e| {
            e.fp_weak = weak;
            e.state = EntryState::WeakValid;
        })?;
        shared.index.weak.insert(weak, id);
        DedupStats::incr(&shared.stats.finalized_weak);
        return Ok(Outcome::Weak);
    }

    let strong = shared.digester.strong(&content);
    entry.update(|e| {
        e.fp_weak = weak;
        e.fp_strong = strong;
        e.state = EntryState::StrongValid;
    })?;

    if shared.index.strong.insert_if_absent(strong, id).is_ok() {
        DedupStats::incr(&shared.stats.finalized_strong);
        Ok(Outcome::Strong)
    } else {
        // Left unindexed; the content stays stored twice
        DedupStats::incr(&shared.stats.unmerged_duplicates);
        Ok(Outcome::Unmerged)
    }
}

/// Return a locked entry, its index nodes and its block to the free pools
///
/// The cleared record is persisted first; if that fails nothing is
/// released. The id goes back on the free list only after the entry lock
/// is released.
pub(crate) fn reclaim(shared: &Shared, mut entry: EntryGuard<'_>) -> Result<()> {
    let id = entry.id();
    let old = Entry::clone(&entry);
    entry.update(Entry::clear)?;

    if old.state.has_weak() {
        shared.index.weak.remove(&old.fp_weak, id);
    }
    if old.state.has_strong() {
        shared.index.strong.remove(&old.fp_strong, id);
    }
    shared.entries.unbind_block(old.blocknr, id);

    if let Err(e) = shared.device.release_block(old.blocknr) {
        warn!("Failed to release block {} of entry {id}: {e}", old.blocknr);
    }
    drop(entry);

    shared.entries.free(id);
    debug!("Reclaimed entry {id} (block {})", old.blocknr);
    Ok(())
}

/// Handle to the running finalizer thread
pub struct Finalizer {
    handle: thread::JoinHandle<()>,
    shared: Arc<Shared>,
}

impl Finalizer {
    /// Spawn the worker thread
    pub(crate) fn spawn(shared: Arc<Shared>, interval: Duration) -> Result<Self> {
        shared.signal.reset();
        let worker = Arc::clone(&shared);

        let handle = thread::Builder::new()
            .name("pmdedup-finalizer".into())
            .spawn(move || {
                info!("Finalizer started (interval {:?})", interval);

                while worker.signal.wait(interval) {
                    let report = run_pass(&worker);
                    if report.is_eventful() {
                        debug!("Finalizer pass: {:?}", report);
                    }
                }

                info!("Finalizer stopped");
            })
            .map_err(|e| Error::internal(format!("failed to spawn finalizer: {e}")))?;

        Ok(Self { handle, shared })
    }

    /// Signal shutdown and wait for the current pass to finish
    pub fn stop(self) {
        self.shared.signal.request_shutdown();
        if self.handle.join().is_err() {
            error!("Finalizer thread panicked");
        }
    }
}

impl std::fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Finalizer")
            .field("thread", &self.handle.thread().name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_signal_wait_times_out() {
        let signal = FinalizerSignal::default();
        let start = Instant::now();
        assert!(signal.wait(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_signal_pending_notify_returns_immediately() {
        let signal = FinalizerSignal::default();
        signal.notify();

        let start = Instant::now();
        assert!(signal.wait(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_signal_shutdown_wakes_waiter() {
        let signal = Arc::new(FinalizerSignal::default());

        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        signal.request_shutdown();

        assert!(!waiter.join().unwrap());

        signal.reset();
        signal.notify();
        assert!(signal.wait(Duration::from_secs(1)));
    }

    #[test]
    fn test_pass_report_eventful() {
        let mut report = PassReport {
            scanned: 10,
            ..PassReport::default()
        };
        assert!(!report.is_eventful());
        report.stale = 1;
        assert!(report.is_eventful());

        let failed = PassReport {
            errors: 1,
            ..PassReport::default()
        };
        assert!(failed.is_eventful());
    }
}
