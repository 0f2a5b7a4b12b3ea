//! The injected memory engine handle.
//!
//! Constructed once from a validated config and handed to the responder
//! path; there are no process-wide singletons. All operations are blocking
//! and thread-safe, with write serialization living in the store layer.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use nanobot_core::current_unix_timestamp_ms;

use crate::backfill::{run_backfill, BackfillReport};
use crate::capture::{run_capture, CaptureOutcome, CaptureRequest};
use crate::config::MemoryConfig;
use crate::entry::MemoryKind;
use crate::error::MemoryResult;
use crate::hygiene::{run_if_due, HygieneReport, HygieneState};
use crate::mirror::MirrorWriter;
use crate::recall::{fuse_and_rank, run_recall, RecallHit, RecallOutcome, RecallRequest};
use crate::scope::{resolve_scopes, ResolvedScopes, ScopeLevel};
use crate::store::{SearchRequest, SqliteFtsStore, Store, StoreStats, UpsertOutcome};
use crate::telemetry::{MemoryTelemetry, TelemetrySnapshot};
use crate::wal::WalWriter;

const WAL_PRE_PREVIEW_CHARS: usize = 80;
const WAL_POST_PREVIEW_CHARS: usize = 120;
const MANUAL_IMPORTANCE: f64 = 0.7;
const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1_000;

/// Cooperative cancellation flag shared across pipeline stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// One inbound message and the identity needed to scope it.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub channel: String,
    pub chat_id: String,
    pub sender_id: Option<String>,
    pub user_text: String,
    pub reply_to_text: Option<String>,
}

impl TurnContext {
    /// Session key in the runtime's `channel:chat_id` composition.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

/// Scope selector for the operator search surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScopeSelector {
    Chat,
    User,
    All,
}

/// Counters, row counts, and location for `memory status`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub db_path: PathBuf,
    pub backend: &'static str,
    pub store: StoreStats,
    pub counters: TelemetrySnapshot,
}

pub struct MemoryEngine {
    config: MemoryConfig,
    store: Box<dyn Store>,
    telemetry: MemoryTelemetry,
    wal: WalWriter,
    mirrors: MirrorWriter,
    hygiene: Mutex<HygieneState>,
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine").finish_non_exhaustive()
    }
}

impl MemoryEngine {
    /// Validates `config` and opens the backing store. Refuses to start on
    /// invalid config, including the reserved hybrid backend.
    pub fn new(config: MemoryConfig) -> MemoryResult<Self> {
        config.validate()?;
        let store = SqliteFtsStore::open(&config.db_path())?;
        let wal = WalWriter::new(config.wal_dir(), config.wal.enabled);
        let mirrors = MirrorWriter::new(config.workspace_memory_dir());
        Ok(Self {
            config,
            store: Box::new(store),
            telemetry: MemoryTelemetry::default(),
            wal,
            mirrors,
            hygiene: Mutex::new(HygieneState::default()),
        })
    }

    pub fn enabled(&self) -> bool {
        self.config.memory.enabled
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn scopes_for(&self, turn: &TurnContext) -> ResolvedScopes {
        resolve_scopes(
            &turn.channel,
            &turn.chat_id,
            turn.sender_id.as_deref(),
            &self.config.memory.workspace_id,
        )
    }

    /// Writes the pre-generation marker for this turn.
    pub fn append_wal_pre(&self, turn: &TurnContext) {
        let payload = format!(
            "channel={} chat={} sender={} text=\"{}\"",
            turn.channel,
            turn.chat_id,
            turn.sender_id.as_deref().unwrap_or("-"),
            preview(&turn.user_text, WAL_PRE_PREVIEW_CHARS),
        );
        self.wal
            .append_pre(&turn.session_key(), &payload, current_unix_timestamp_ms());
    }

    /// Writes the post-generation marker for this turn.
    pub fn append_wal_post(&self, turn: &TurnContext, assistant_summary: &str) {
        let payload = format!(
            "reply=\"{}\"",
            preview(assistant_summary, WAL_POST_PREVIEW_CHARS)
        );
        self.wal
            .append_post(&turn.session_key(), &payload, current_unix_timestamp_ms());
    }

    /// Recalls a bounded, relevance-ranked context slice for this turn.
    /// Store busy/unavailable exhaustion degrades to an empty outcome and
    /// is counted as a miss.
    pub fn recall(&self, turn: &TurnContext, cancel: &CancelToken) -> MemoryResult<RecallOutcome> {
        if !self.enabled() {
            return Ok(RecallOutcome::default());
        }
        let scopes = self.scopes_for(turn);
        let outcome = run_recall(
            self.store.as_ref(),
            &self.config.recall,
            &RecallRequest {
                user_text: &turn.user_text,
                reply_to_text: turn.reply_to_text.as_deref(),
                scopes: &scopes,
            },
            current_unix_timestamp_ms(),
            cancel,
        )?;

        if outcome.hits.is_empty() {
            self.telemetry.record_recall_miss();
        } else {
            let rendered_chars = outcome
                .rendered
                .as_deref()
                .map(|block| block.chars().count() as u64)
                .unwrap_or(0);
            self.telemetry.record_recall_hit(rendered_chars);
            tracing::debug!(
                hits = outcome.hits.len(),
                prompt_chars = rendered_chars,
                "memory recall produced context"
            );
        }
        self.mark_hygiene_activity();
        Ok(outcome)
    }

    /// Captures salient entries from a completed turn.
    pub fn capture(
        &self,
        turn: &TurnContext,
        assistant_text: Option<&str>,
        cancel: &CancelToken,
    ) -> MemoryResult<CaptureOutcome> {
        if !self.enabled() {
            return Ok(CaptureOutcome {
                skipped: true,
                ..CaptureOutcome::default()
            });
        }
        let scopes = self.scopes_for(turn);
        let outcome = run_capture(
            self.store.as_ref(),
            &self.mirrors,
            &self.config.capture,
            &self.config.retention,
            &CaptureRequest {
                channel: &turn.channel,
                chat_id: &turn.chat_id,
                sender_id: turn.sender_id.as_deref(),
                user_text: &turn.user_text,
                assistant_text,
                scopes: &scopes,
            },
            current_unix_timestamp_ms(),
            cancel,
        )?;

        if !outcome.skipped {
            for _ in 0..outcome.saved {
                self.telemetry.record_capture_saved();
            }
            for _ in 0..outcome.deduped {
                self.telemetry.record_capture_deduped();
            }
            for _ in 0..outcome.dropped_low_conf {
                self.telemetry.record_capture_dropped_low_conf();
            }
            for reason in &outcome.dropped_safety {
                self.telemetry.record_capture_dropped_safety(*reason);
            }
            self.mark_hygiene_activity();
        }
        Ok(outcome)
    }

    /// Runs a retention sweep when the hourly throttle and activity gate
    /// allow one.
    pub fn run_hygiene_if_due(&self) -> MemoryResult<Option<HygieneReport>> {
        let mut state = match self.hygiene.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        run_if_due(self.store.as_ref(), &mut state, current_unix_timestamp_ms())
    }

    /// Operator surface: counters and row counts.
    pub fn status(&self) -> MemoryResult<EngineStatus> {
        Ok(EngineStatus {
            db_path: self.config.db_path(),
            backend: self.config.memory.backend.as_str(),
            store: self.store.stats()?,
            counters: self.telemetry.snapshot(),
        })
    }

    /// Operator surface: ranked lexical search over selected scopes.
    pub fn search_scoped(
        &self,
        query: &str,
        channel: &str,
        chat_id: &str,
        sender_id: Option<&str>,
        selector: SearchScopeSelector,
        limit: usize,
    ) -> MemoryResult<Vec<RecallHit>> {
        let scopes = resolve_scopes(channel, chat_id, sender_id, &self.config.memory.workspace_id);
        let scope_keys = match selector {
            SearchScopeSelector::Chat => vec![scopes.chat],
            SearchScopeSelector::User => vec![scopes.user],
            SearchScopeSelector::All => vec![scopes.chat, scopes.user, scopes.global],
        };
        let hits = self.store.search(&SearchRequest {
            scope_keys: &scope_keys,
            kinds: &[],
            query_text: query,
            limit,
        })?;
        Ok(fuse_and_rank(hits, current_unix_timestamp_ms(), limit))
    }

    /// Operator surface: explicit insert with a caller-chosen scope.
    pub fn add_manual(
        &self,
        text: &str,
        kind: MemoryKind,
        scope: ScopeLevel,
        channel: &str,
        chat_id: &str,
        sender_id: Option<&str>,
    ) -> MemoryResult<UpsertOutcome> {
        let now_unix_ms = current_unix_timestamp_ms();
        let scopes = resolve_scopes(channel, chat_id, sender_id, &self.config.memory.workspace_id);
        let entry = crate::entry::NewMemoryEntry {
            kind,
            scope_key: scopes.key_for(scope).to_string(),
            text: text.to_string(),
            channel: channel.to_string(),
            chat_id: Some(chat_id.to_string()),
            sender_id: sender_id.map(str::to_string),
            importance: MANUAL_IMPORTANCE,
            confidence: 1.0,
            source: crate::entry::MemorySource::Manual,
            expires_at_unix_ms: self
                .config
                .retention
                .expires_at_unix_ms(kind, now_unix_ms),
        };
        let outcome = self.store.upsert(&entry, now_unix_ms)?;
        if outcome.is_insert() {
            if let Err(error) =
                self.mirrors
                    .append_insert(kind, &entry.scope_key, &entry.text, now_unix_ms)
            {
                tracing::warn!(error = format!("{error:#}"), "manual insert mirror failed");
            }
        }
        Ok(outcome)
    }

    /// Operator surface: prune entries not seen for `days` days.
    pub fn prune_older_than(&self, days: u64, dry_run: bool) -> MemoryResult<usize> {
        let cutoff =
            current_unix_timestamp_ms().saturating_sub(days.saturating_mul(MILLIS_PER_DAY));
        self.store.prune_last_seen_before(cutoff, dry_run)
    }

    /// Operator surface: one-time legacy import.
    pub fn backfill(&self) -> MemoryResult<BackfillReport> {
        let global_scope = resolve_scopes("cli", "direct", None, &self.config.memory.workspace_id);
        run_backfill(
            self.store.as_ref(),
            &self.config.workspace_dir(),
            &global_scope.global,
            &self.config.retention,
            current_unix_timestamp_ms(),
        )
    }

    /// Operator surface: rebuild the lexical index from the canonical
    /// table, then verify consistency.
    pub fn reindex(&self) -> MemoryResult<()> {
        self.store.reindex()?;
        self.store.consistency_probe()
    }

    pub fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    fn mark_hygiene_activity(&self) {
        let mut state = match self.hygiene.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.record_activity();
    }
}

/// Bounded single-line preview used in WAL payloads.
fn preview(text: &str, max_chars: usize) -> String {
    let flattened = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flattened.chars().count() <= max_chars {
        return flattened;
    }
    let clipped = flattened.chars().take(max_chars).collect::<String>();
    format!("{clipped}...")
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{preview, CancelToken, MemoryEngine, SearchScopeSelector, TurnContext};
    use crate::config::{MemoryBackendKind, MemoryConfig};
    use crate::entry::MemoryKind;
    use crate::error::MemoryError;
    use crate::scope::ScopeLevel;
    use crate::store::{SqliteFtsStore, Store};

    fn engine_at(root: &std::path::Path) -> MemoryEngine {
        let mut config = MemoryConfig::default();
        config.root_dir = root.to_path_buf();
        MemoryEngine::new(config).expect("engine")
    }

    fn turn(channel: &str, chat_id: &str, sender: Option<&str>, text: &str) -> TurnContext {
        TurnContext {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            sender_id: sender.map(str::to_string),
            user_text: text.to_string(),
            reply_to_text: None,
        }
    }

    #[test]
    fn unit_preview_flattens_and_bounds() {
        assert_eq!(preview("hello   there\nworld", 80), "hello there world");
        let long = "word ".repeat(40);
        let clipped = preview(&long, 20);
        assert!(clipped.ends_with("..."));
        assert_eq!(clipped.chars().count(), 23);
    }

    #[test]
    fn unit_reserved_backend_is_refused_at_construction() {
        let temp = tempdir().expect("tempdir");
        let mut config = MemoryConfig::default();
        config.root_dir = temp.path().to_path_buf();
        config.memory.backend = MemoryBackendKind::ReservedHybrid;
        let error = MemoryEngine::new(config).expect_err("reserved backend");
        assert!(matches!(error, MemoryError::ConfigInvalid(_)));
        assert!(error.to_string().contains("reserved_hybrid"));
    }

    #[test]
    fn functional_full_turn_flow_writes_wal_counters_and_mirrors() {
        let temp = tempdir().expect("tempdir");
        let engine = engine_at(temp.path());
        let cancel = CancelToken::new();
        let turn = turn("cli", "direct", Some("sam"), "I always prefer dark mode");

        engine.append_wal_pre(&turn);
        let recall = engine.recall(&turn, &cancel).expect("recall");
        assert!(recall.hits.is_empty());
        let capture = engine.capture(&turn, None, &cancel).expect("capture");
        assert_eq!(capture.saved, 1);
        engine.append_wal_post(&turn, "Noted, dark mode it is.");

        let counters = engine.telemetry_snapshot();
        assert_eq!(counters.memory_recall_miss, 1);
        assert_eq!(counters.memory_capture_saved, 1);

        let wal_file = temp
            .path()
            .join("workspace/memory/session-state/cli_direct.md");
        let wal = std::fs::read_to_string(wal_file).expect("read wal");
        let lines = wal.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("] PRE channel=cli chat=direct sender=sam"));
        assert!(lines[1].contains("] POST reply=\"Noted, dark mode it is.\""));

        let mirror = std::fs::read_to_string(
            temp.path().join("workspace/memory/semantic/preferences.md"),
        )
        .expect("read mirror");
        assert!(mirror.contains("I always prefer dark mode"));
    }

    #[test]
    fn functional_recall_hit_accumulates_prompt_chars() {
        let temp = tempdir().expect("tempdir");
        let engine = engine_at(temp.path());
        let cancel = CancelToken::new();
        let write_turn = turn("cli", "direct", Some("sam"), "I always prefer dark mode");
        engine.capture(&write_turn, None, &cancel).expect("capture");

        let read_turn = turn("cli", "direct", Some("sam"), "what mode do I prefer?");
        let recall = engine.recall(&read_turn, &cancel).expect("recall");
        assert_eq!(recall.hits.len(), 1);
        let rendered = recall.rendered.expect("rendered");
        assert_eq!(rendered, "- [preference] I always prefer dark mode");

        let counters = engine.telemetry_snapshot();
        assert_eq!(counters.memory_recall_hit, 1);
        assert_eq!(
            counters.memory_prompt_chars,
            rendered.chars().count() as u64
        );
        assert_eq!(
            counters.last_prompt_chars,
            rendered.chars().count() as u64
        );
    }

    #[test]
    fn functional_cross_chat_isolation_counts_a_miss() {
        let temp = tempdir().expect("tempdir");
        let engine = engine_at(temp.path());
        let cancel = CancelToken::new();
        engine
            .capture(
                &turn("cli", "A", None, "We decided to use postgres for billing"),
                None,
                &cancel,
            )
            .expect("capture");

        let recall = engine
            .recall(&turn("cli", "B", None, "postgres billing decision"), &cancel)
            .expect("recall");
        assert!(recall.hits.is_empty());
        assert_eq!(engine.telemetry_snapshot().memory_recall_miss, 1);
    }

    #[test]
    fn functional_user_preferences_bleed_across_chats() {
        let temp = tempdir().expect("tempdir");
        let engine = engine_at(temp.path());
        let cancel = CancelToken::new();
        engine
            .capture(
                &turn("cli", "A", Some("sam"), "I always prefer dark mode"),
                None,
                &cancel,
            )
            .expect("capture");

        let recall = engine
            .recall(
                &turn("cli", "B", Some("sam"), "which mode do I prefer?"),
                &cancel,
            )
            .expect("recall");
        assert_eq!(recall.hits.len(), 1);
        assert_eq!(recall.hits[0].entry.kind, MemoryKind::Preference);
    }

    #[test]
    fn unit_disabled_engine_is_inert() {
        let temp = tempdir().expect("tempdir");
        let mut config = MemoryConfig::default();
        config.root_dir = temp.path().to_path_buf();
        config.memory.enabled = false;
        let engine = MemoryEngine::new(config).expect("engine");
        let cancel = CancelToken::new();
        let turn = turn("cli", "direct", Some("sam"), "I always prefer dark mode");

        let recall = engine.recall(&turn, &cancel).expect("recall");
        assert!(recall.hits.is_empty());
        let capture = engine.capture(&turn, None, &cancel).expect("capture");
        assert!(capture.skipped);

        let counters = engine.telemetry_snapshot();
        assert_eq!(counters.memory_recall_miss, 0);
        assert_eq!(counters.memory_capture_saved, 0);
    }

    #[test]
    fn functional_manual_add_reaches_scoped_search() {
        let temp = tempdir().expect("tempdir");
        let engine = engine_at(temp.path());
        let outcome = engine
            .add_manual(
                "deploy window is friday morning",
                MemoryKind::Fact,
                ScopeLevel::Global,
                "cli",
                "direct",
                None,
            )
            .expect("add");
        assert!(outcome.is_insert());

        let hits = engine
            .search_scoped(
                "deploy window",
                "cli",
                "direct",
                None,
                SearchScopeSelector::All,
                8,
            )
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert!((hits[0].entry.confidence - 1.0).abs() < f64::EPSILON);

        let chat_only = engine
            .search_scoped(
                "deploy window",
                "cli",
                "direct",
                None,
                SearchScopeSelector::Chat,
                8,
            )
            .expect("chat search");
        assert!(chat_only.is_empty());
    }

    #[test]
    fn functional_status_reports_rows_and_counters() {
        let temp = tempdir().expect("tempdir");
        let engine = engine_at(temp.path());
        let cancel = CancelToken::new();
        engine
            .capture(
                &turn("cli", "direct", Some("sam"), "I always prefer dark mode"),
                None,
                &cancel,
            )
            .expect("capture");

        let status = engine.status().expect("status");
        assert_eq!(status.backend, "sqlite_fts");
        assert_eq!(status.store.total_rows, 1);
        assert_eq!(status.store.rows_by_kind.get("preference"), Some(&1));
        assert_eq!(status.counters.memory_capture_saved, 1);
        assert!(status.db_path.ends_with("memory/longterm.db"));
    }

    #[test]
    fn functional_prune_older_than_uses_last_seen() {
        let temp = tempdir().expect("tempdir");
        let engine = engine_at(temp.path());

        // Seed an old row through a second connection so last_seen sits in
        // the past.
        let store = SqliteFtsStore::open(&engine.config().db_path()).expect("open");
        let old_ms = nanobot_core::current_unix_timestamp_ms() - 40 * 24 * 60 * 60 * 1_000;
        store
            .upsert(
                &crate::entry::NewMemoryEntry {
                    kind: MemoryKind::Fact,
                    scope_key: "workspace:default:global".to_string(),
                    text: "stale fact from last month".to_string(),
                    channel: "cli".to_string(),
                    chat_id: None,
                    sender_id: None,
                    importance: 0.6,
                    confidence: 1.0,
                    source: crate::entry::MemorySource::Manual,
                    expires_at_unix_ms: old_ms + 3_650 * 24 * 60 * 60 * 1_000,
                },
                old_ms,
            )
            .expect("seed");

        assert_eq!(engine.prune_older_than(30, true).expect("dry run"), 1);
        assert_eq!(engine.status().expect("status").store.total_rows, 1);
        assert_eq!(engine.prune_older_than(30, false).expect("prune"), 1);
        assert_eq!(engine.status().expect("status").store.total_rows, 0);
    }

    #[test]
    fn functional_backfill_runs_once_through_engine() {
        let temp = tempdir().expect("tempdir");
        let engine = engine_at(temp.path());
        let workspace = engine.config().workspace_dir();
        std::fs::create_dir_all(&workspace).expect("workspace");
        std::fs::write(
            workspace.join("MEMORY.md"),
            "- ships rust services in production\n",
        )
        .expect("legacy");

        let first = engine.backfill().expect("backfill");
        assert_eq!(first.imported, 1);
        let second = engine.backfill().expect("second backfill");
        assert!(second.already_complete);
    }

    #[test]
    fn functional_hygiene_runs_only_after_activity() {
        let temp = tempdir().expect("tempdir");
        let engine = engine_at(temp.path());
        let cancel = CancelToken::new();

        assert!(engine.run_hygiene_if_due().expect("idle").is_none());
        engine
            .capture(
                &turn("cli", "direct", Some("sam"), "I always prefer dark mode"),
                None,
                &cancel,
            )
            .expect("capture");
        assert!(engine.run_hygiene_if_due().expect("due").is_some());
        assert!(engine.run_hygiene_if_due().expect("throttled").is_none());
    }

    #[test]
    fn functional_reindex_round_trips() {
        let temp = tempdir().expect("tempdir");
        let engine = engine_at(temp.path());
        engine
            .add_manual(
                "uses tailwind for styling",
                MemoryKind::Fact,
                ScopeLevel::User,
                "cli",
                "direct",
                Some("sam"),
            )
            .expect("add");
        engine.reindex().expect("reindex");
        let hits = engine
            .search_scoped(
                "tailwind",
                "cli",
                "direct",
                Some("sam"),
                SearchScopeSelector::User,
                8,
            )
            .expect("search");
        assert_eq!(hits.len(), 1);
    }
}
