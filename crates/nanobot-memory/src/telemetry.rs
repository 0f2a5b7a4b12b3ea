use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::safety::SafetyRejection;

/// Contract counters for the memory engine. Counter names are part of the
/// operator contract and must not drift.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    recall_hit: AtomicU64,
    recall_miss: AtomicU64,
    capture_saved: AtomicU64,
    capture_dropped_low_conf: AtomicU64,
    capture_dropped_safety: AtomicU64,
    capture_deduped: AtomicU64,
    prompt_chars: AtomicU64,
    last_prompt_chars: AtomicU64,
    safety_reasons: Mutex<BTreeMap<&'static str, u64>>,
}

/// Point-in-time counter values, serializable for `memory status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub memory_recall_hit: u64,
    pub memory_recall_miss: u64,
    pub memory_capture_saved: u64,
    pub memory_capture_dropped_low_conf: u64,
    pub memory_capture_dropped_safety: u64,
    pub memory_capture_deduped: u64,
    pub memory_prompt_chars: u64,
    pub last_prompt_chars: u64,
    pub capture_dropped_safety_by_reason: BTreeMap<String, u64>,
}

impl MemoryTelemetry {
    pub fn record_recall_hit(&self, rendered_chars: u64) {
        self.recall_hit.fetch_add(1, Ordering::Relaxed);
        self.prompt_chars.fetch_add(rendered_chars, Ordering::Relaxed);
        self.last_prompt_chars.store(rendered_chars, Ordering::Relaxed);
    }

    pub fn record_recall_miss(&self) {
        self.recall_miss.fetch_add(1, Ordering::Relaxed);
        self.last_prompt_chars.store(0, Ordering::Relaxed);
    }

    pub fn record_capture_saved(&self) {
        self.capture_saved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capture_deduped(&self) {
        self.capture_deduped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capture_dropped_low_conf(&self) {
        self.capture_dropped_low_conf.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capture_dropped_safety(&self, reason: SafetyRejection) {
        self.capture_dropped_safety.fetch_add(1, Ordering::Relaxed);
        let mut reasons = match self.safety_reasons.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *reasons.entry(reason.as_str()).or_default() += 1;
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let reasons = match self.safety_reasons.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        TelemetrySnapshot {
            memory_recall_hit: self.recall_hit.load(Ordering::Relaxed),
            memory_recall_miss: self.recall_miss.load(Ordering::Relaxed),
            memory_capture_saved: self.capture_saved.load(Ordering::Relaxed),
            memory_capture_dropped_low_conf: self
                .capture_dropped_low_conf
                .load(Ordering::Relaxed),
            memory_capture_dropped_safety: self.capture_dropped_safety.load(Ordering::Relaxed),
            memory_capture_deduped: self.capture_deduped.load(Ordering::Relaxed),
            memory_prompt_chars: self.prompt_chars.load(Ordering::Relaxed),
            last_prompt_chars: self.last_prompt_chars.load(Ordering::Relaxed),
            capture_dropped_safety_by_reason: reasons
                .iter()
                .map(|(reason, count)| (reason.to_string(), *count))
                .collect(),
        }
    }
}
