use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Typed category of a memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Preference,
    Fact,
    Decision,
    Episodic,
}

impl MemoryKind {
    pub const ALL: [MemoryKind; 4] = [
        MemoryKind::Preference,
        MemoryKind::Fact,
        MemoryKind::Decision,
        MemoryKind::Episodic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MemoryKind::Preference => "preference",
            MemoryKind::Fact => "fact",
            MemoryKind::Decision => "decision",
            MemoryKind::Episodic => "episodic",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ParseMemoryKindError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "preference" => Ok(MemoryKind::Preference),
            "fact" => Ok(MemoryKind::Fact),
            "decision" => Ok(MemoryKind::Decision),
            "episodic" => Ok(MemoryKind::Episodic),
            other => Err(ParseMemoryKindError(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown memory kind '{0}'")]
pub struct ParseMemoryKindError(pub String);

/// How an entry came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    Auto,
    Manual,
    Backfill,
}

impl MemorySource {
    pub fn as_str(self) -> &'static str {
        match self {
            MemorySource::Auto => "auto",
            MemorySource::Manual => "manual",
            MemorySource::Backfill => "backfill",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ParseMemorySourceError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(MemorySource::Auto),
            "manual" => Ok(MemorySource::Manual),
            "backfill" => Ok(MemorySource::Backfill),
            other => Err(ParseMemorySourceError(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown memory source '{0}'")]
pub struct ParseMemorySourceError(pub String);

/// Canonical persisted memory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: i64,
    pub kind: MemoryKind,
    pub scope_key: String,
    pub text: String,
    pub channel: String,
    pub chat_id: Option<String>,
    pub sender_id: Option<String>,
    pub importance: f64,
    pub confidence: f64,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
    pub last_seen_at_unix_ms: u64,
    pub hit_count: u64,
    pub source: MemorySource,
    pub expires_at_unix_ms: u64,
}

/// Insert payload handed to the store; the store assigns `id`, timestamps
/// derive from the caller-provided clock.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMemoryEntry {
    pub kind: MemoryKind,
    pub scope_key: String,
    pub text: String,
    pub channel: String,
    pub chat_id: Option<String>,
    pub sender_id: Option<String>,
    pub importance: f64,
    pub confidence: f64,
    pub source: MemorySource,
    pub expires_at_unix_ms: u64,
}

/// Normalizes entry text for the dedupe key: lowercase, collapsed internal
/// whitespace, leading/trailing ASCII punctuation stripped. Stronger
/// normalization (unicode folding, stemming) is intentionally absent.
pub fn normalize_for_dedupe(text: &str) -> String {
    let collapsed = text
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    collapsed
        .trim_matches(|character: char| character.is_ascii_punctuation())
        .trim()
        .to_string()
}
