//! Per-session append-only markers around generation.
//!
//! One markdown file per session key, `PRE` before the model runs and
//! `POST` after, so a crash between the two is visible on restart. Appends
//! are serialized per session; failures are logged and never block the
//! turn. Rotation is external.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

/// Upper bound on a sanitized session file stem.
pub const WAL_SAFE_KEY_MAX_CHARS: usize = 120;

const WAL_SAFE_KEY_HASH_CHARS: usize = 8;

/// Sanitizes a session key into a filesystem-safe stem: lowercased, any
/// character outside `[a-z0-9_-]` replaced with `_`, overlong keys
/// truncated with a stable hash suffix so distinct keys stay distinct.
pub fn safe_session_key(raw: &str) -> String {
    let sanitized = raw
        .to_lowercase()
        .chars()
        .map(|character| match character {
            'a'..='z' | '0'..='9' | '_' | '-' => character,
            _ => '_',
        })
        .collect::<String>();
    if sanitized.chars().count() <= WAL_SAFE_KEY_MAX_CHARS {
        return sanitized;
    }

    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    let digest = hasher.finalize();
    let suffix = digest
        .iter()
        .take(WAL_SAFE_KEY_HASH_CHARS / 2)
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();

    let prefix_chars = WAL_SAFE_KEY_MAX_CHARS - WAL_SAFE_KEY_HASH_CHARS - 1;
    let prefix = sanitized.chars().take(prefix_chars).collect::<String>();
    format!("{prefix}-{suffix}")
}

/// Appends pre/post generation markers to per-session state files.
#[derive(Debug)]
pub struct WalWriter {
    state_dir: PathBuf,
    enabled: bool,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WalWriter {
    pub fn new(state_dir: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            state_dir: state_dir.into(),
            enabled,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn state_dir(&self) -> &Path {
        self.state_dir.as_path()
    }

    /// Marks the start of a turn, before retrieval and generation.
    pub fn append_pre(&self, session_key: &str, turn_summary: &str, now_unix_ms: u64) {
        self.append_marker(session_key, "PRE", turn_summary, now_unix_ms);
    }

    /// Marks the end of a turn, after capture.
    pub fn append_post(&self, session_key: &str, assistant_summary: &str, now_unix_ms: u64) {
        self.append_marker(session_key, "POST", assistant_summary, now_unix_ms);
    }

    fn append_marker(&self, session_key: &str, marker: &str, payload: &str, now_unix_ms: u64) {
        if !self.enabled {
            return;
        }
        let safe_key = safe_session_key(session_key);
        let session_lock = self.session_lock(&safe_key);
        let _guard = match session_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(error) = self.write_marker_line(&safe_key, marker, payload, now_unix_ms) {
            tracing::warn!(
                session_key = safe_key.as_str(),
                marker,
                error = format!("{error:#}"),
                "session-state append failed; continuing turn"
            );
        }
    }

    fn write_marker_line(
        &self,
        safe_key: &str,
        marker: &str,
        payload: &str,
        now_unix_ms: u64,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).with_context(|| {
            format!(
                "failed to create session-state directory {}",
                self.state_dir.display()
            )
        })?;
        let path = self.state_dir.join(format!("{safe_key}.md"));
        let flattened = payload.split_whitespace().collect::<Vec<_>>().join(" ");
        let line = format!(
            "[{}] {marker} {flattened}",
            datetime_from_unix_ms(now_unix_ms).to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open session-state file {}", path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append marker to {}", path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush session-state file {}", path.display()))?;
        Ok(())
    }

    fn session_lock(&self, safe_key: &str) -> Arc<Mutex<()>> {
        let mut locks = match self.session_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(safe_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn datetime_from_unix_ms(unix_ms: u64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(unix_ms as i64).unwrap_or_else(Utc::now)
}
