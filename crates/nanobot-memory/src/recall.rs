//! Retrieval pipeline: query construction, dual-scope search, score
//! fusion, and bounded rendering of the memory block.

use std::time::{Duration, Instant};

use crate::config::RecallSection;
use crate::engine::CancelToken;
use crate::entry::{MemoryEntry, MemoryKind};
use crate::error::MemoryResult;
use crate::scope::ResolvedScopes;
use crate::store::{SearchRequest, Store};

/// Fusion weights over lexical relevance, design-time importance, and
/// recency. The weights are contract; only the decay curve was left open
/// and is fixed to a 7-day half-life.
pub const FTS_WEIGHT: f64 = 0.65;
pub const IMPORTANCE_WEIGHT: f64 = 0.20;
pub const RECENCY_WEIGHT: f64 = 0.15;
pub const RECENCY_HALF_LIFE_DAYS: f64 = 7.0;

/// Soft wall-clock budget for the whole retrieval; checked between layers.
pub const SEARCH_SOFT_DEADLINE: Duration = Duration::from_secs(2);

const MILLIS_PER_DAY: f64 = 24.0 * 60.0 * 60.0 * 1_000.0;

/// Kinds eligible for the cross-chat user layer.
const USER_LAYER_KINDS: [MemoryKind; 2] = [MemoryKind::Preference, MemoryKind::Fact];

#[derive(Debug, Clone)]
pub struct RecallRequest<'a> {
    pub user_text: &'a str,
    pub reply_to_text: Option<&'a str>,
    pub scopes: &'a ResolvedScopes,
}

/// One fused hit with its score components, kept for telemetry and the
/// operator search surface.
#[derive(Debug, Clone, PartialEq)]
pub struct RecallHit {
    pub entry: MemoryEntry,
    pub fts_norm: f64,
    pub recency: f64,
    pub final_score: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecallOutcome {
    pub hits: Vec<RecallHit>,
    pub rendered: Option<String>,
    pub cancelled: bool,
}

impl RecallOutcome {
    fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Self::default()
        }
    }
}

/// Runs the full retrieval pipeline. Cancellation, deadline expiry, and
/// store busy/unavailable exhaustion all degrade instead of failing the
/// turn: the caller sees an empty outcome and counts it as a miss. Only
/// non-retryable store errors (corruption) surface as `Err`.
pub fn run_recall(
    store: &dyn Store,
    recall: &RecallSection,
    request: &RecallRequest<'_>,
    now_unix_ms: u64,
    cancel: &CancelToken,
) -> MemoryResult<RecallOutcome> {
    let started = Instant::now();
    let query_text = build_query_text(request.user_text, request.reply_to_text);
    if query_text.is_empty() {
        return Ok(RecallOutcome::default());
    }
    if cancel.is_cancelled() {
        return Ok(RecallOutcome::cancelled());
    }

    let chat_scope = [request.scopes.chat.clone()];
    let chat_hits = match store.search(&SearchRequest {
        scope_keys: &chat_scope,
        kinds: &[],
        query_text: &query_text,
        limit: recall.max_results,
    }) {
        Ok(hits) => hits,
        Err(error) if error.is_retryable() => {
            tracing::warn!(
                error = %error,
                "chat-layer search failed after retries; returning empty recall"
            );
            return Ok(RecallOutcome::default());
        }
        Err(error) => return Err(error),
    };

    let user_hits = if cancel.is_cancelled() || started.elapsed() >= SEARCH_SOFT_DEADLINE {
        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "skipping user recall layer (cancelled or past deadline)"
        );
        Vec::new()
    } else {
        let user_scope = [request.scopes.user.clone()];
        match store.search(&SearchRequest {
            scope_keys: &user_scope,
            kinds: &USER_LAYER_KINDS,
            query_text: &query_text,
            limit: recall.user_preference_layer_results,
        }) {
            Ok(hits) => hits,
            Err(error) if error.is_retryable() => {
                tracing::warn!(
                    error = %error,
                    "user-layer search failed after retries; returning empty recall"
                );
                return Ok(RecallOutcome::default());
            }
            Err(error) => return Err(error),
        }
    };

    let mut fused = fuse_layer(chat_hits, now_unix_ms);
    fused.extend(fuse_layer(user_hits, now_unix_ms));
    let mut merged = dedupe_by_id(fused);
    sort_hits(&mut merged);
    merged.truncate(recall.max_results);

    let rendered = assemble_block(
        merged
            .iter()
            .map(|hit| render_line(&hit.entry))
            .collect::<Vec<_>>(),
        recall.max_prompt_chars,
    );

    Ok(RecallOutcome {
        hits: merged,
        rendered,
        cancelled: false,
    })
}

/// Fuses one layer of raw search hits and returns the top `limit` ranked
/// results. Operator search reuses this without the dual-layer plumbing.
pub fn fuse_and_rank(
    hits: Vec<crate::store::SearchHit>,
    now_unix_ms: u64,
    limit: usize,
) -> Vec<RecallHit> {
    let mut fused = fuse_layer(hits, now_unix_ms);
    sort_hits(&mut fused);
    fused.truncate(limit);
    fused
}

/// Concatenates the turn text with the replied-to text, whitespace
/// normalized. Stopword handling stays with the backend tokenizer.
pub fn build_query_text(user_text: &str, reply_to_text: Option<&str>) -> String {
    let mut combined = user_text.split_whitespace().collect::<Vec<_>>().join(" ");
    if let Some(reply) = reply_to_text {
        let normalized_reply = reply.split_whitespace().collect::<Vec<_>>().join(" ");
        if !normalized_reply.is_empty() {
            if !combined.is_empty() {
                combined.push(' ');
            }
            combined.push_str(&normalized_reply);
        }
    }
    combined
}

/// Exponential decay from the last-seen instant: 1.0 now, 0.5 at one
/// half-life, clamped into [0, 1].
pub fn recency_score(now_unix_ms: u64, last_seen_at_unix_ms: u64) -> f64 {
    let age_days = now_unix_ms.saturating_sub(last_seen_at_unix_ms) as f64 / MILLIS_PER_DAY;
    0.5_f64
        .powf(age_days / RECENCY_HALF_LIFE_DAYS)
        .clamp(0.0, 1.0)
}

/// Normalizes raw lexical scores against the layer maximum and fuses the
/// three signals into a final score.
fn fuse_layer(hits: Vec<crate::store::SearchHit>, now_unix_ms: u64) -> Vec<RecallHit> {
    let max_score = hits
        .iter()
        .map(|hit| hit.fts_score)
        .fold(0.0_f64, f64::max);
    hits.into_iter()
        .map(|hit| {
            let fts_norm = if max_score > 0.0 {
                (hit.fts_score / max_score).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let recency = recency_score(now_unix_ms, hit.entry.last_seen_at_unix_ms);
            let final_score = FTS_WEIGHT * fts_norm
                + IMPORTANCE_WEIGHT * hit.entry.importance.clamp(0.0, 1.0)
                + RECENCY_WEIGHT * recency;
            RecallHit {
                entry: hit.entry,
                fts_norm,
                recency,
                final_score,
            }
        })
        .collect()
}

fn dedupe_by_id(hits: Vec<RecallHit>) -> Vec<RecallHit> {
    let mut seen = std::collections::HashSet::new();
    let mut deduped = Vec::with_capacity(hits.len());
    for hit in hits {
        if seen.insert(hit.entry.id) {
            deduped.push(hit);
        }
    }
    deduped
}

/// Orders by final score, then importance, then freshness, then id.
fn sort_hits(hits: &mut [RecallHit]) {
    hits.sort_by(|left, right| {
        right
            .final_score
            .total_cmp(&left.final_score)
            .then_with(|| right.entry.importance.total_cmp(&left.entry.importance))
            .then_with(|| {
                right
                    .entry
                    .last_seen_at_unix_ms
                    .cmp(&left.entry.last_seen_at_unix_ms)
            })
            .then_with(|| left.entry.id.cmp(&right.entry.id))
    });
}

pub fn render_line(entry: &MemoryEntry) -> String {
    format!("- [{}] {}", entry.kind.as_str(), entry.text)
}

/// Joins ranked lines into the context block, dropping whole lines from
/// the tail once the character budget is reached. A partial line is never
/// emitted.
pub fn assemble_block(lines: Vec<String>, max_prompt_chars: usize) -> Option<String> {
    let mut block = String::new();
    let mut used_chars = 0usize;
    for line in lines {
        let line_chars = line.chars().count();
        let separator_chars = usize::from(!block.is_empty());
        if used_chars + separator_chars + line_chars > max_prompt_chars {
            break;
        }
        if !block.is_empty() {
            block.push('\n');
        }
        block.push_str(&line);
        used_chars += separator_chars + line_chars;
    }
    if block.is_empty() {
        None
    } else {
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tempfile::tempdir;

    use super::{
        assemble_block, build_query_text, recency_score, run_recall, RecallRequest,
        SEARCH_SOFT_DEADLINE,
    };
    use crate::config::RecallSection;
    use crate::engine::CancelToken;
    use crate::entry::{MemoryKind, MemorySource, NewMemoryEntry};
    use crate::error::{MemoryError, MemoryResult};
    use crate::scope::resolve_scopes;
    use crate::store::{
        SearchHit, SearchRequest, SqliteFtsStore, Store, StoreStats, UpsertOutcome,
    };

    const NOW_MS: u64 = 1_700_000_000_000;
    const DAY_MS: u64 = 24 * 60 * 60 * 1_000;

    /// Store double whose every operation fails with a fixed error kind.
    struct FailingStore {
        error: fn() -> MemoryError,
    }

    impl FailingStore {
        fn busy() -> Self {
            Self {
                error: || MemoryError::StoreBusy("stub store is busy".to_string()),
            }
        }

        fn corrupt() -> Self {
            Self {
                error: || MemoryError::Corrupt("stub index is corrupt".to_string()),
            }
        }
    }

    impl Store for FailingStore {
        fn upsert(&self, _entry: &NewMemoryEntry, _now_unix_ms: u64) -> MemoryResult<UpsertOutcome> {
            Err((self.error)())
        }

        fn search(&self, _request: &SearchRequest<'_>) -> MemoryResult<Vec<SearchHit>> {
            Err((self.error)())
        }

        fn prune_expired(&self, _now_unix_ms: u64) -> MemoryResult<usize> {
            Err((self.error)())
        }

        fn prune_last_seen_before(
            &self,
            _cutoff_unix_ms: u64,
            _dry_run: bool,
        ) -> MemoryResult<usize> {
            Err((self.error)())
        }

        fn reindex(&self) -> MemoryResult<()> {
            Err((self.error)())
        }

        fn consistency_probe(&self) -> MemoryResult<()> {
            Err((self.error)())
        }

        fn stats(&self) -> MemoryResult<StoreStats> {
            Err((self.error)())
        }

        fn get_meta(&self, _key: &str) -> MemoryResult<Option<String>> {
            Err((self.error)())
        }

        fn set_meta(&self, _key: &str, _value: &str) -> MemoryResult<()> {
            Err((self.error)())
        }
    }

    fn open_store(dir: &std::path::Path) -> SqliteFtsStore {
        SqliteFtsStore::open(&dir.join("longterm.db")).expect("open store")
    }

    fn entry_in_scope(
        scope_key: &str,
        kind: MemoryKind,
        text: &str,
        importance: f64,
    ) -> NewMemoryEntry {
        NewMemoryEntry {
            kind,
            scope_key: scope_key.to_string(),
            text: text.to_string(),
            channel: "cli".to_string(),
            chat_id: Some("direct".to_string()),
            sender_id: Some("sam".to_string()),
            importance,
            confidence: 0.9,
            source: MemorySource::Auto,
            expires_at_unix_ms: NOW_MS + 3_650 * DAY_MS,
        }
    }

    #[test]
    fn unit_recency_score_halves_every_seven_days() {
        assert!((recency_score(NOW_MS, NOW_MS) - 1.0).abs() < 1e-9);
        let one_half_life = recency_score(NOW_MS, NOW_MS - 7 * DAY_MS);
        assert!((one_half_life - 0.5).abs() < 1e-6);
        let two_half_lives = recency_score(NOW_MS, NOW_MS - 14 * DAY_MS);
        assert!((two_half_lives - 0.25).abs() < 1e-6);
        assert!(recency_score(NOW_MS, NOW_MS - 365 * DAY_MS) >= 0.0);
    }

    #[test]
    fn unit_build_query_text_concatenates_and_normalizes() {
        assert_eq!(
            build_query_text("  what about   tailwind ", Some("we were\ndiscussing css")),
            "what about tailwind we were discussing css"
        );
        assert_eq!(build_query_text("solo", None), "solo");
        assert_eq!(build_query_text("", None), "");
    }

    #[test]
    fn functional_ranking_prefers_rare_exact_match_over_common_term() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());
        let scopes = resolve_scopes("cli", "direct", Some("sam"), "default");

        let older = entry_in_scope(
            &scopes.user,
            MemoryKind::Preference,
            "prefer concise responses",
            0.7,
        );
        store.upsert(&older, NOW_MS - DAY_MS).expect("e1");
        store
            .upsert(
                &entry_in_scope(&scopes.user, MemoryKind::Fact, "uses tailwind", 0.5),
                NOW_MS - 30 * DAY_MS,
            )
            .expect("e2");
        // A realistic user layer carries several preference rows sharing the
        // "prefer" stem, which is what makes the rare term decisive.
        for filler in [
            "prefer four space indentation always",
            "prefer detailed code review comments",
            "prefer snake case naming everywhere",
        ] {
            store
                .upsert(
                    &entry_in_scope(&scopes.user, MemoryKind::Preference, filler, 0.6),
                    NOW_MS - 20 * DAY_MS,
                )
                .expect("filler");
        }

        let outcome = run_recall(
            &store,
            &RecallSection::default(),
            &RecallRequest {
                user_text: "tailwind preference",
                reply_to_text: None,
                scopes: &scopes,
            },
            NOW_MS,
            &CancelToken::new(),
        )
        .expect("recall");

        assert!(outcome.hits.len() >= 2);
        assert_eq!(outcome.hits[0].entry.text, "uses tailwind");
        assert!((outcome.hits[0].fts_norm - 1.0).abs() < 1e-9);
        assert!(outcome
            .hits
            .iter()
            .any(|hit| hit.entry.text == "prefer concise responses"));
        let rendered = outcome.rendered.expect("rendered block");
        assert!(rendered.starts_with("- [fact] uses tailwind"));
    }

    #[test]
    fn functional_chat_scope_isolation_yields_miss() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());
        let scopes_a = resolve_scopes("cli", "A", None, "default");
        store
            .upsert(
                &entry_in_scope(
                    &scopes_a.chat,
                    MemoryKind::Decision,
                    "decided to use postgres",
                    0.75,
                ),
                NOW_MS,
            )
            .expect("upsert");

        let scopes_b = resolve_scopes("cli", "B", None, "default");
        let outcome = run_recall(
            &store,
            &RecallSection::default(),
            &RecallRequest {
                user_text: "postgres decision",
                reply_to_text: None,
                scopes: &scopes_b,
            },
            NOW_MS,
            &CancelToken::new(),
        )
        .expect("recall");
        assert!(outcome.hits.is_empty());
        assert!(outcome.rendered.is_none());
    }

    #[test]
    fn functional_user_layer_bleeds_across_chats_for_preferences() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());
        let scopes_a = resolve_scopes("cli", "A", Some("sam"), "default");
        store
            .upsert(
                &entry_in_scope(
                    &scopes_a.user,
                    MemoryKind::Preference,
                    "prefer concise responses",
                    0.7,
                ),
                NOW_MS,
            )
            .expect("upsert");

        let scopes_b = resolve_scopes("cli", "B", Some("sam"), "default");
        let outcome = run_recall(
            &store,
            &RecallSection::default(),
            &RecallRequest {
                user_text: "concise responses",
                reply_to_text: None,
                scopes: &scopes_b,
            },
            NOW_MS,
            &CancelToken::new(),
        )
        .expect("recall");
        assert_eq!(outcome.hits.len(), 1);
        assert_eq!(outcome.hits[0].entry.kind, MemoryKind::Preference);
    }

    #[test]
    fn functional_episodic_entries_do_not_cross_chats_via_user_layer() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());
        let scopes_a = resolve_scopes("cli", "A", Some("sam"), "default");
        store
            .upsert(
                &entry_in_scope(
                    &scopes_a.chat,
                    MemoryKind::Episodic,
                    "finished the migration work",
                    0.6,
                ),
                NOW_MS,
            )
            .expect("upsert");

        let scopes_b = resolve_scopes("cli", "B", Some("sam"), "default");
        let outcome = run_recall(
            &store,
            &RecallSection::default(),
            &RecallRequest {
                user_text: "migration work",
                reply_to_text: None,
                scopes: &scopes_b,
            },
            NOW_MS,
            &CancelToken::new(),
        )
        .expect("recall");
        assert!(outcome.hits.is_empty());
    }

    #[test]
    fn functional_prompt_budget_drops_whole_lines_only() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());
        let scopes = resolve_scopes("cli", "direct", Some("sam"), "default");
        for index in 0..20 {
            store
                .upsert(
                    &entry_in_scope(
                        &scopes.chat,
                        MemoryKind::Episodic,
                        &format!("budget note number {index} about the rollout"),
                        0.6,
                    ),
                    NOW_MS,
                )
                .expect("upsert");
        }

        let recall_config = RecallSection {
            max_results: 20,
            max_prompt_chars: 200,
            user_preference_layer_results: 2,
        };
        let outcome = run_recall(
            &store,
            &recall_config,
            &RecallRequest {
                user_text: "rollout budget note",
                reply_to_text: None,
                scopes: &scopes,
            },
            NOW_MS,
            &CancelToken::new(),
        )
        .expect("recall");

        let rendered = outcome.rendered.expect("rendered");
        assert!(rendered.chars().count() <= 200);
        for line in rendered.lines() {
            assert!(line.starts_with("- [episodic] budget note number"));
            assert!(line.ends_with("about the rollout"));
        }
    }

    #[test]
    fn unit_cancelled_recall_returns_empty_outcome() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());
        let scopes = resolve_scopes("cli", "direct", None, "default");
        let cancel = CancelToken::new();
        cancel.cancel();

        let outcome = run_recall(
            &store,
            &RecallSection::default(),
            &RecallRequest {
                user_text: "anything at all",
                reply_to_text: None,
                scopes: &scopes,
            },
            NOW_MS,
            &cancel,
        )
        .expect("recall");
        assert!(outcome.cancelled);
        assert!(outcome.hits.is_empty());
        assert!(outcome.rendered.is_none());
    }

    #[test]
    fn regression_busy_store_degrades_recall_to_empty_outcome() {
        let scopes = resolve_scopes("cli", "direct", Some("sam"), "default");
        let outcome = run_recall(
            &FailingStore::busy(),
            &RecallSection::default(),
            &RecallRequest {
                user_text: "anything at all",
                reply_to_text: None,
                scopes: &scopes,
            },
            NOW_MS,
            &CancelToken::new(),
        )
        .expect("busy store must not fail the turn");
        assert!(outcome.hits.is_empty());
        assert!(outcome.rendered.is_none());
        assert!(!outcome.cancelled);
    }

    #[test]
    fn regression_corrupt_store_error_still_surfaces() {
        let scopes = resolve_scopes("cli", "direct", Some("sam"), "default");
        let error = run_recall(
            &FailingStore::corrupt(),
            &RecallSection::default(),
            &RecallRequest {
                user_text: "anything at all",
                reply_to_text: None,
                scopes: &scopes,
            },
            NOW_MS,
            &CancelToken::new(),
        )
        .expect_err("corruption must surface");
        assert!(matches!(error, MemoryError::Corrupt(_)));
    }

    #[test]
    fn unit_soft_deadline_constant_is_two_seconds() {
        assert_eq!(SEARCH_SOFT_DEADLINE.as_secs(), 2);
    }

    #[test]
    fn unit_assemble_block_empty_input_renders_nothing() {
        assert_eq!(assemble_block(Vec::new(), 100), None);
        assert_eq!(assemble_block(vec!["x".repeat(50)], 10), None);
    }

    proptest! {
        #[test]
        fn property_assembled_block_is_bounded_prefix_of_whole_lines(
            texts in proptest::collection::vec("[a-z]{1,40}", 0..20),
            max_chars in 1usize..400,
        ) {
            let lines = texts
                .iter()
                .map(|text| format!("- [fact] {text}"))
                .collect::<Vec<_>>();
            let block = assemble_block(lines.clone(), max_chars);
            if let Some(block) = block {
                prop_assert!(block.chars().count() <= max_chars);
                let rendered = block.lines().collect::<Vec<_>>();
                prop_assert_eq!(rendered.len().min(lines.len()), rendered.len());
                for (rendered_line, expected) in rendered.iter().zip(lines.iter()) {
                    prop_assert_eq!(*rendered_line, expected.as_str());
                }
            }
        }
    }
}
