use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::transfer::Phase;

/// Cooperative cancellation token. Cloned into every blocking loop in the
/// engine; `interrupt` is observed between buffer-sized reads, never by
/// forcibly aborting an in-flight operation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelFlags>,
}

#[derive(Debug, Default)]
struct CancelFlags {
    interrupted: AtomicBool,
    terminated: AtomicBool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caller requested pause/cancel.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// The run has exited, whether by success, cancellation, or error. Set
    /// exactly once, in the engine's final cleanup step.
    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn terminate(&self) {
        self.inner.terminated.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.is_interrupted() || self.is_terminated()
    }
}

/// Counters shared between the control thread and chunk workers.
/// `downloaded` and `merged` hold raw byte counts; `observable_progress`
/// maps them through the two-phase weighting.
#[derive(Debug, Default)]
pub struct RunState {
    downloaded: AtomicU64,
    merged: AtomicU64,
    phase: AtomicU8,
    actions_completed: AtomicU64,
    actions_target: AtomicU64,
    merge_completed: AtomicU64,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn sub_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_sub(bytes, Ordering::SeqCst);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::SeqCst)
    }

    pub fn add_merged(&self, bytes: u64) {
        self.merged.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn merged(&self) -> u64 {
        self.merged.load(Ordering::SeqCst)
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase.as_u8(), Ordering::SeqCst);
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Arm the completion counter for a pass of `target` workers.
    pub fn begin_actions(&self, target: u64) {
        self.actions_completed.store(0, Ordering::SeqCst);
        self.actions_target.store(target, Ordering::SeqCst);
    }

    /// Marks one worker done; the last one flips the phase back to idle,
    /// which is what the wait loop polls for.
    pub fn complete_action(&self) {
        let done = self.actions_completed.fetch_add(1, Ordering::SeqCst) + 1;
        if done == self.actions_target.load(Ordering::SeqCst) {
            self.set_phase(Phase::Idle);
        }
    }

    pub fn complete_merge(&self) {
        self.merge_completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn merges_completed(&self) -> u64 {
        self.merge_completed.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        matches!(self.phase(), Phase::Downloading | Phase::Merging)
    }

    /// Observable progress for a transfer of `total` bytes. The download
    /// pass covers the first 90% of the bar and the merge pass the last 10%,
    /// so merging shows as forward motion instead of a stall at 100%.
    pub fn observable_progress(&self, total: u64) -> i64 {
        match self.phase() {
            Phase::Downloading => {
                let percent = percent_of(self.downloaded(), total);
                ((percent / 100.0) * 0.9 * total as f64) as i64
            }
            Phase::Merging => {
                let ninety = 0.9 * total as f64;
                let percent = percent_of(self.merged(), total);
                (ninety + (percent / 100.0) * 0.1 * total as f64) as i64
            }
            Phase::Completed => total as i64,
            Phase::Idle => -1,
        }
    }
}

fn percent_of(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (part as f64 / total as f64) * 100.0
}
