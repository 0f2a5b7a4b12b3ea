use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::entry::MemoryKind;
use crate::error::{MemoryError, MemoryResult};

const DEFAULT_ROOT_DIR: &str = "~/.nanobot";
const DEFAULT_DB_RELATIVE_PATH: &str = "memory/longterm.db";
const DEFAULT_WAL_STATE_DIR: &str = "memory/session-state";
const MIN_PROMPT_CHARS: usize = 64;

const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1_000;

/// Store backend selector. Only `sqlite_fts` is implemented; the hybrid
/// lexical+vector variant is a reserved name the engine refuses to start
/// with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryBackendKind {
    #[default]
    SqliteFts,
    ReservedHybrid,
}

impl MemoryBackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryBackendKind::SqliteFts => "sqlite_fts",
            MemoryBackendKind::ReservedHybrid => "reserved_hybrid",
        }
    }
}

/// Candidate extraction strategy. Heuristic is the only mode in v1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    #[default]
    Heuristic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct MemorySection {
    pub enabled: bool,
    pub db_path: Option<PathBuf>,
    pub backend: MemoryBackendKind,
    pub workspace_id: String,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: None,
            backend: MemoryBackendKind::SqliteFts,
            workspace_id: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct RecallSection {
    pub max_results: usize,
    pub max_prompt_chars: usize,
    pub user_preference_layer_results: usize,
}

impl Default for RecallSection {
    fn default() -> Self {
        Self {
            max_results: 8,
            max_prompt_chars: 2_400,
            user_preference_layer_results: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct CaptureSection {
    pub enabled: bool,
    pub mode: CaptureMode,
    pub min_confidence: f64,
    pub min_importance: f64,
    pub channels: Vec<String>,
    pub capture_assistant: bool,
    pub max_entries_per_turn: usize,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: CaptureMode::Heuristic,
            min_confidence: 0.78,
            min_importance: 0.6,
            channels: vec![
                "cli".to_string(),
                "telegram".to_string(),
                "whatsapp".to_string(),
                "discord".to_string(),
            ],
            capture_assistant: false,
            max_entries_per_turn: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct RetentionSection {
    pub episodic_days: u64,
    pub fact_days: u64,
    pub preference_days: u64,
    pub decision_days: u64,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            episodic_days: 90,
            fact_days: 3_650,
            preference_days: 3_650,
            decision_days: 3_650,
        }
    }
}

impl RetentionSection {
    pub fn days_for(&self, kind: MemoryKind) -> u64 {
        match kind {
            MemoryKind::Episodic => self.episodic_days,
            MemoryKind::Fact => self.fact_days,
            MemoryKind::Preference => self.preference_days,
            MemoryKind::Decision => self.decision_days,
        }
    }

    /// Expiry instant for a row created at `now_unix_ms`.
    pub fn expires_at_unix_ms(&self, kind: MemoryKind, now_unix_ms: u64) -> u64 {
        now_unix_ms.saturating_add(self.days_for(kind).saturating_mul(MILLIS_PER_DAY))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct WalSection {
    pub enabled: bool,
    pub state_dir: PathBuf,
}

impl Default for WalSection {
    fn default() -> Self {
        Self {
            enabled: true,
            state_dir: PathBuf::from(DEFAULT_WAL_STATE_DIR),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct EmbeddingSection {
    pub enabled: bool,
}

/// Typed engine configuration mirroring the documented key table. Unknown
/// keys inside any memory-owned section fail the load with the offending
/// key named.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct MemoryConfig {
    pub root_dir: PathBuf,
    pub memory: MemorySection,
    pub recall: RecallSection,
    pub capture: CaptureSection,
    pub retention: RetentionSection,
    pub wal: WalSection,
    pub embedding: EmbeddingSection,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(DEFAULT_ROOT_DIR),
            memory: MemorySection::default(),
            recall: RecallSection::default(),
            capture: CaptureSection::default(),
            retention: RetentionSection::default(),
            wal: WalSection::default(),
            embedding: EmbeddingSection::default(),
        }
    }
}

impl MemoryConfig {
    /// Extracts the memory-owned sections from a full runtime config value.
    /// Sections the file does not carry fall back to defaults; sections it
    /// does carry are parsed strictly.
    pub fn from_config_value(value: &serde_json::Value) -> MemoryResult<Self> {
        let root = match value {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => {
                return Ok(Self::default());
            }
            other => {
                return Err(MemoryError::ConfigInvalid(format!(
                    "config root must be an object (found {})",
                    json_type_name(other)
                )));
            }
        };

        let mut relevant = serde_json::Map::new();
        for key in [
            "rootDir",
            "memory",
            "recall",
            "capture",
            "retention",
            "wal",
            "embedding",
        ] {
            if let Some(section) = root.get(key) {
                relevant.insert(key.to_string(), section.clone());
            }
        }

        serde_json::from_value(serde_json::Value::Object(relevant))
            .map_err(|error| MemoryError::ConfigInvalid(error.to_string()))
    }

    /// Loads config from a JSON file. A missing file yields defaults; an
    /// unreadable or malformed file is a hard error.
    pub fn load(path: &Path) -> MemoryResult<Self> {
        if !path.exists() {
            return Ok(Self::default().with_expanded_home());
        }
        let raw = std::fs::read_to_string(path).map_err(|error| {
            MemoryError::ConfigInvalid(format!("failed to read {}: {error}", path.display()))
        })?;
        let value = serde_json::from_str::<serde_json::Value>(&raw).map_err(|error| {
            MemoryError::ConfigInvalid(format!("failed to parse {}: {error}", path.display()))
        })?;
        Ok(Self::from_config_value(&value)?.with_expanded_home())
    }

    /// Expands a leading `~` in the root and explicit db path against the
    /// process home directory.
    pub fn with_expanded_home(mut self) -> Self {
        self.root_dir = expand_home(&self.root_dir);
        if let Some(db_path) = self.memory.db_path.take() {
            self.memory.db_path = Some(expand_home(&db_path));
        }
        self
    }

    /// Resolved canonical store location.
    pub fn db_path(&self) -> PathBuf {
        self.memory
            .db_path
            .clone()
            .unwrap_or_else(|| self.root_dir.join(DEFAULT_DB_RELATIVE_PATH))
    }

    /// Root of the human-readable workspace tree.
    pub fn workspace_dir(&self) -> PathBuf {
        self.root_dir.join("workspace")
    }

    /// Directory holding the markdown mirrors.
    pub fn workspace_memory_dir(&self) -> PathBuf {
        self.workspace_dir().join("memory")
    }

    /// Directory holding per-session WAL files.
    pub fn wal_dir(&self) -> PathBuf {
        self.workspace_dir().join(&self.wal.state_dir)
    }

    /// Validates bounds the engine refuses to start without.
    pub fn validate(&self) -> MemoryResult<()> {
        if self.memory.backend == MemoryBackendKind::ReservedHybrid {
            return Err(MemoryError::ConfigInvalid(
                "backend 'reserved_hybrid' is reserved and not implemented; use 'sqlite_fts'"
                    .to_string(),
            ));
        }
        if self.memory.workspace_id.trim().is_empty() {
            return Err(MemoryError::ConfigInvalid(
                "memory.workspaceId must not be empty".to_string(),
            ));
        }
        if self.recall.max_results == 0 {
            return Err(MemoryError::ConfigInvalid(
                "recall.maxResults must be at least 1".to_string(),
            ));
        }
        if self.recall.max_prompt_chars < MIN_PROMPT_CHARS {
            return Err(MemoryError::ConfigInvalid(format!(
                "recall.maxPromptChars must be at least {MIN_PROMPT_CHARS} (found {})",
                self.recall.max_prompt_chars
            )));
        }
        for (name, value) in [
            ("capture.minConfidence", self.capture.min_confidence),
            ("capture.minImportance", self.capture.min_importance),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(MemoryError::ConfigInvalid(format!(
                    "{name} must be finite and within 0.0..=1.0 (found {value})"
                )));
            }
        }
        if self.capture.max_entries_per_turn == 0 {
            return Err(MemoryError::ConfigInvalid(
                "capture.maxEntriesPerTurn must be at least 1".to_string(),
            ));
        }
        for (name, days) in [
            ("retention.episodicDays", self.retention.episodic_days),
            ("retention.factDays", self.retention.fact_days),
            ("retention.preferenceDays", self.retention.preference_days),
            ("retention.decisionDays", self.retention.decision_days),
        ] {
            if days == 0 {
                return Err(MemoryError::ConfigInvalid(format!(
                    "{name} must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

fn expand_home(path: &Path) -> PathBuf {
    let Some(raw) = path.to_str() else {
        return path.to_path_buf();
    };
    let Some(rest) = raw.strip_prefix('~') else {
        return path.to_path_buf();
    };
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from);
    match home {
        Some(home) => home.join(rest.trim_start_matches('/')),
        None => path.to_path_buf(),
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
