//! Heuristic candidate extraction from conversational turns.
//!
//! Mode `heuristic` is the only extractor in v1: plain cue-phrase scans over
//! sentence-level statements, no model calls, no regex machinery. Confidence
//! reflects cue strength; importance starts from kind defaults and is
//! nudged by emphasis markers.

use std::collections::HashSet;

use crate::entry::{normalize_for_dedupe, MemoryKind};

const EPISODIC_SUMMARY_MAX_CHARS: usize = 200;

const STRONG_CUE_CONFIDENCE: f64 = 0.9;
const FACT_STRONG_CONFIDENCE: f64 = 0.85;
const WEAK_CUE_CONFIDENCE: f64 = 0.8;

const PREFERENCE_BASE_IMPORTANCE: f64 = 0.7;
const FACT_BASE_IMPORTANCE: f64 = 0.65;
const DECISION_BASE_IMPORTANCE: f64 = 0.75;
const EPISODIC_BASE_IMPORTANCE: f64 = 0.6;
const EMPHASIS_IMPORTANCE_BONUS: f64 = 0.1;

const DECISION_CUES_STRONG: &[&str] = &[
    "we'll go with",
    "we will go with",
    "let's go with",
    "we decided",
    "decided to",
    "settled on",
];
const DECISION_CUES_WEAK: &[&str] = &["going with", "i'll go with"];

const PREFERENCE_CUES_STRONG: &[&str] = &[
    "i prefer",
    "i always",
    "i never",
    "always use",
    "never use",
    "don't use",
    "do not use",
    "i'd rather",
];
const PREFERENCE_CUES_WEAK: &[&str] = &["i like", "i want", "i love", "works best for me"];

const FACT_CUES_WEAK: &[&str] = &["i am ", "i'm ", "i work", "i live", "i use "];

const EPISODIC_CUES: &[&str] = &[
    "finished",
    "completed",
    "wrapped up",
    "started",
    "deployed",
    "shipped",
    "working on",
    "blocked on",
    "next step",
    "picking up",
    "left off",
    "tomorrow",
];

/// One typed candidate produced from a turn, pre-gate.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedCandidate {
    pub kind: MemoryKind,
    pub text: String,
    pub importance: f64,
    pub confidence: f64,
}

/// Derives zero or more candidates from a turn. `assistant_text` is only
/// provided when assistant capture is switched on.
pub fn extract_candidates(
    user_text: &str,
    assistant_text: Option<&str>,
) -> Vec<ExtractedCandidate> {
    let mut candidates = Vec::new();
    collect_from_text(user_text, &mut candidates);
    if let Some(assistant) = assistant_text {
        collect_from_text(assistant, &mut candidates);
    }
    dedupe_within_turn(candidates)
}

fn collect_from_text(text: &str, candidates: &mut Vec<ExtractedCandidate>) {
    let before = candidates.len();
    for statement in split_statements(text) {
        if let Some(candidate) = classify_statement(&statement) {
            candidates.push(candidate);
        }
    }
    // Continuity fallback: a turn that advances ongoing work but matches no
    // typed cue becomes a compact episodic marker.
    if candidates.len() == before {
        if let Some(candidate) = episodic_fallback(text) {
            candidates.push(candidate);
        }
    }
}

fn classify_statement(statement: &str) -> Option<ExtractedCandidate> {
    let lowered = statement.to_lowercase();

    if let Some(confidence) =
        cue_confidence(&lowered, DECISION_CUES_STRONG, DECISION_CUES_WEAK)
    {
        return Some(ExtractedCandidate {
            kind: MemoryKind::Decision,
            text: statement.to_string(),
            importance: DECISION_BASE_IMPORTANCE,
            confidence,
        });
    }

    if let Some(confidence) =
        cue_confidence(&lowered, PREFERENCE_CUES_STRONG, PREFERENCE_CUES_WEAK)
    {
        let importance = if lowered.contains("always") || lowered.contains("never") {
            (PREFERENCE_BASE_IMPORTANCE + EMPHASIS_IMPORTANCE_BONUS).min(1.0)
        } else {
            PREFERENCE_BASE_IMPORTANCE
        };
        return Some(ExtractedCandidate {
            kind: MemoryKind::Preference,
            text: statement.to_string(),
            importance,
            confidence,
        });
    }

    if let Some(confidence) = fact_confidence(&lowered) {
        return Some(ExtractedCandidate {
            kind: MemoryKind::Fact,
            text: statement.to_string(),
            importance: FACT_BASE_IMPORTANCE,
            confidence,
        });
    }

    None
}

fn cue_confidence(lowered: &str, strong: &[&str], weak: &[&str]) -> Option<f64> {
    if strong.iter().any(|cue| lowered.contains(cue)) {
        return Some(STRONG_CUE_CONFIDENCE);
    }
    if weak.iter().any(|cue| lowered.contains(cue)) {
        return Some(WEAK_CUE_CONFIDENCE);
    }
    None
}

fn fact_confidence(lowered: &str) -> Option<f64> {
    let possessive_assertion = lowered.starts_with("my ") && lowered.contains(" is ");
    if possessive_assertion || lowered.contains("my name is") {
        return Some(FACT_STRONG_CONFIDENCE);
    }
    if FACT_CUES_WEAK.iter().any(|cue| lowered.starts_with(cue)) {
        return Some(WEAK_CUE_CONFIDENCE);
    }
    None
}

fn episodic_fallback(text: &str) -> Option<ExtractedCandidate> {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return None;
    }
    let lowered = normalized.to_lowercase();
    if !EPISODIC_CUES.iter().any(|cue| lowered.contains(cue)) {
        return None;
    }
    Some(ExtractedCandidate {
        kind: MemoryKind::Episodic,
        text: truncate_at_word_boundary(&normalized, EPISODIC_SUMMARY_MAX_CHARS),
        importance: EPISODIC_BASE_IMPORTANCE,
        confidence: WEAK_CUE_CONFIDENCE,
    })
}

fn split_statements(text: &str) -> Vec<String> {
    text.split(|character: char| matches!(character, '\n' | '.' | '!' | '?'))
        .map(|segment| segment.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|segment| !segment.is_empty())
        .collect()
}

fn truncate_at_word_boundary(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let clipped = text.chars().take(max_chars).collect::<String>();
    match clipped.rfind(' ') {
        Some(cut) if cut > 0 => clipped[..cut].to_string(),
        _ => clipped,
    }
}

fn dedupe_within_turn(candidates: Vec<ExtractedCandidate>) -> Vec<ExtractedCandidate> {
    let mut seen = HashSet::new();
    let mut deduped = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let key = (candidate.kind, normalize_for_dedupe(&candidate.text));
        if seen.insert(key) {
            deduped.push(candidate);
        }
    }
    deduped
}
