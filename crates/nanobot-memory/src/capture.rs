//! Capture pipeline: extract, screen, gate, cap, persist, mirror.
//!
//! Running the pipeline twice over the same turn produces dedupe merges,
//! never duplicate rows; the store's dedupe key makes re-entry safe.

use crate::config::{CaptureSection, RetentionSection};
use crate::engine::CancelToken;
use crate::entry::{MemorySource, NewMemoryEntry};
use crate::error::MemoryResult;
use crate::extract::extract_candidates;
use crate::mirror::MirrorWriter;
use crate::safety::{evaluate_candidate, screen_turn, SafetyRejection, SafetyVerdict};
use crate::scope::{default_scope_for_kind, ResolvedScopes};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct CaptureRequest<'a> {
    pub channel: &'a str,
    pub chat_id: &'a str,
    pub sender_id: Option<&'a str>,
    pub user_text: &'a str,
    pub assistant_text: Option<&'a str>,
    pub scopes: &'a ResolvedScopes,
}

/// Per-stage tally for one capture run; the engine folds this into the
/// contract counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureOutcome {
    pub skipped: bool,
    pub cancelled: bool,
    pub saved: usize,
    pub deduped: usize,
    pub dropped_low_conf: usize,
    pub dropped_safety: Vec<SafetyRejection>,
}

/// Runs the capture pipeline for one turn.
pub fn run_capture(
    store: &dyn Store,
    mirrors: &MirrorWriter,
    capture: &CaptureSection,
    retention: &RetentionSection,
    request: &CaptureRequest<'_>,
    now_unix_ms: u64,
    cancel: &CancelToken,
) -> MemoryResult<CaptureOutcome> {
    let mut outcome = CaptureOutcome::default();
    if !capture.enabled
        || !capture
            .channels
            .iter()
            .any(|channel| channel == request.channel)
    {
        outcome.skipped = true;
        return Ok(outcome);
    }

    // Hostile turns are dropped wholesale so their text never reaches the
    // extractor or the store.
    if let SafetyVerdict::Reject(reason) = screen_turn(request.user_text) {
        outcome.dropped_safety.push(reason);
        return Ok(outcome);
    }

    let assistant_text = if capture.capture_assistant {
        request.assistant_text
    } else {
        None
    };
    let mut candidates = Vec::new();
    for candidate in extract_candidates(request.user_text, assistant_text) {
        match evaluate_candidate(&candidate.text) {
            SafetyVerdict::Accept => candidates.push(candidate),
            SafetyVerdict::Reject(reason) => outcome.dropped_safety.push(reason),
        }
    }

    let mut gated = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if candidate.confidence < capture.min_confidence
            || candidate.importance < capture.min_importance
        {
            outcome.dropped_low_conf += 1;
            continue;
        }
        gated.push(candidate);
    }

    gated.sort_by(|left, right| {
        (right.confidence + right.importance).total_cmp(&(left.confidence + left.importance))
    });
    gated.truncate(capture.max_entries_per_turn);

    for candidate in gated {
        if cancel.is_cancelled() {
            // Entries already upserted stay; the rest of the list is
            // abandoned.
            outcome.cancelled = true;
            break;
        }
        let scope_level = default_scope_for_kind(candidate.kind);
        let new_entry = NewMemoryEntry {
            kind: candidate.kind,
            scope_key: request.scopes.key_for(scope_level).to_string(),
            text: candidate.text,
            channel: request.channel.to_string(),
            chat_id: Some(request.chat_id.to_string()),
            sender_id: request.sender_id.map(str::to_string),
            importance: candidate.importance,
            confidence: candidate.confidence,
            source: MemorySource::Auto,
            expires_at_unix_ms: retention.expires_at_unix_ms(candidate.kind, now_unix_ms),
        };
        // A store failure drops the candidate, never the turn: busy or
        // unavailable exhaustion skips to the next candidate, anything
        // else abandons the rest of the list. The tallies gathered so far
        // are returned either way.
        let upserted = match store.upsert(&new_entry, now_unix_ms) {
            Ok(upserted) => upserted,
            Err(error) if error.is_retryable() => {
                tracing::warn!(
                    kind = new_entry.kind.as_str(),
                    error = %error,
                    "store rejected capture candidate after retries; dropping it"
                );
                continue;
            }
            Err(error) => {
                tracing::warn!(
                    kind = new_entry.kind.as_str(),
                    error_kind = error.kind_label(),
                    error = %error,
                    "store failed capture candidate; abandoning remaining candidates"
                );
                break;
            }
        };
        if upserted.is_insert() {
            outcome.saved += 1;
            if let Err(error) = mirrors.append_insert(
                new_entry.kind,
                &new_entry.scope_key,
                &new_entry.text,
                now_unix_ms,
            ) {
                tracing::warn!(
                    kind = new_entry.kind.as_str(),
                    error = format!("{error:#}"),
                    "mirror append failed; canonical store remains authoritative"
                );
            }
        } else {
            outcome.deduped += 1;
        }
    }

    Ok(outcome)
}
