//! One-time import of the legacy markdown memory into the canonical store.
//!
//! The legacy `MEMORY.md` stays a read-only artifact owned by the outer
//! runtime; backfill copies its bullet lines (and any pre-existing semantic
//! mirror files) into the store exactly once, guarded by a meta marker.

use std::path::Path;

use crate::config::RetentionSection;
use crate::entry::{normalize_for_dedupe, MemoryKind, MemorySource, NewMemoryEntry};
use crate::error::MemoryResult;
use crate::store::Store;

pub const BACKFILL_MARKER_KEY: &str = "backfill_complete";

const BACKFILL_IMPORTANCE: f64 = 0.6;
const BACKFILL_CHANNEL: &str = "backfill";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub imported: usize,
    pub merged: usize,
    pub already_complete: bool,
}

/// Imports legacy markdown sources into `global_scope_key`. Returns early
/// when the completion marker is already set.
pub fn run_backfill(
    store: &dyn Store,
    workspace_dir: &Path,
    global_scope_key: &str,
    retention: &RetentionSection,
    now_unix_ms: u64,
) -> MemoryResult<BackfillReport> {
    if store.get_meta(BACKFILL_MARKER_KEY)?.is_some() {
        return Ok(BackfillReport {
            already_complete: true,
            ..BackfillReport::default()
        });
    }

    let mut report = BackfillReport::default();
    let sources = [
        (workspace_dir.join("MEMORY.md"), MemoryKind::Fact),
        (
            workspace_dir.join("memory/semantic/preferences.md"),
            MemoryKind::Preference,
        ),
        (
            workspace_dir.join("memory/semantic/facts.md"),
            MemoryKind::Fact,
        ),
        (
            workspace_dir.join("memory/semantic/decisions.md"),
            MemoryKind::Decision,
        ),
    ];

    for (path, kind) in sources {
        if !path.exists() {
            continue;
        }
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "skipping unreadable backfill source"
                );
                continue;
            }
        };
        for line in raw.lines() {
            let Some(text) = parse_legacy_line(line) else {
                continue;
            };
            if normalize_for_dedupe(&text).is_empty() {
                continue;
            }
            let entry = NewMemoryEntry {
                kind,
                scope_key: global_scope_key.to_string(),
                text,
                channel: BACKFILL_CHANNEL.to_string(),
                chat_id: None,
                sender_id: None,
                importance: BACKFILL_IMPORTANCE,
                confidence: 1.0,
                source: MemorySource::Backfill,
                expires_at_unix_ms: retention.expires_at_unix_ms(kind, now_unix_ms),
            };
            if store.upsert(&entry, now_unix_ms)?.is_insert() {
                report.imported += 1;
            } else {
                report.merged += 1;
            }
        }
    }

    store.set_meta(BACKFILL_MARKER_KEY, &now_unix_ms.to_string())?;
    Ok(report)
}

/// Extracts the content of a legacy bullet line, stripping the optional
/// `[timestamp]` and `(scope)` groups mirror lines carry.
fn parse_legacy_line(line: &str) -> Option<String> {
    let mut rest = line.trim().strip_prefix("- ")?.trim_start();
    if rest.starts_with('[') {
        rest = rest.split_once(']').map_or(rest, |(_, tail)| tail).trim_start();
    }
    if rest.starts_with('(') {
        rest = rest.split_once(')').map_or(rest, |(_, tail)| tail).trim_start();
    }
    if rest.is_empty() {
        None
    } else {
        Some(rest.to_string())
    }
}
