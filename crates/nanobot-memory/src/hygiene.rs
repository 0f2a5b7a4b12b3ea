//! Kind-aware retention pruning, throttled per process.
//!
//! A sweep deletes rows past their retention expiry in one transaction.
//! Sweeps run at most once per hour and only when at least one capture or
//! recall has happened since the previous sweep.

use crate::error::MemoryResult;
use crate::store::Store;

/// Minimum spacing between sweeps in one process.
pub const HYGIENE_MIN_INTERVAL_MS: u64 = 60 * 60 * 1_000;

/// Throttle state carried on the engine handle.
#[derive(Debug, Default)]
pub struct HygieneState {
    pub last_run_unix_ms: Option<u64>,
    pub activity_since_last_run: bool,
}

impl HygieneState {
    pub fn record_activity(&mut self) {
        self.activity_since_last_run = true;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HygieneReport {
    pub pruned: usize,
    pub ran_at_unix_ms: u64,
}

/// Runs a sweep when the throttle and activity gates allow it. Returns
/// `None` when no sweep was due.
pub fn run_if_due(
    store: &dyn Store,
    state: &mut HygieneState,
    now_unix_ms: u64,
) -> MemoryResult<Option<HygieneReport>> {
    if !state.activity_since_last_run {
        return Ok(None);
    }
    if let Some(last_run) = state.last_run_unix_ms {
        if now_unix_ms.saturating_sub(last_run) < HYGIENE_MIN_INTERVAL_MS {
            return Ok(None);
        }
    }

    let pruned = store.prune_expired(now_unix_ms)?;
    state.last_run_unix_ms = Some(now_unix_ms);
    state.activity_since_last_run = false;
    if pruned > 0 {
        tracing::debug!(pruned, "hygiene sweep removed expired entries");
    }
    Ok(Some(HygieneReport {
        pruned,
        ran_at_unix_ms: now_unix_ms,
    }))
}
