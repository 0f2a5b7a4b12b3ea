//! Workspace markdown mirroring for accepted entries.
//!
//! Mirrors are informational; the canonical truth is the store, and a
//! mirror failure never fails the pipeline that triggered it.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::entry::MemoryKind;

/// Appends one-line summaries of inserted entries under the workspace
/// memory directory.
#[derive(Debug, Clone)]
pub struct MirrorWriter {
    memory_dir: PathBuf,
}

impl MirrorWriter {
    pub fn new(memory_dir: impl Into<PathBuf>) -> Self {
        Self {
            memory_dir: memory_dir.into(),
        }
    }

    pub fn memory_dir(&self) -> &Path {
        self.memory_dir.as_path()
    }

    /// Appends a mirror line for a freshly inserted entry and returns the
    /// file it landed in. Dedupe merges are not mirrored.
    pub fn append_insert(
        &self,
        kind: MemoryKind,
        scope_key: &str,
        text: &str,
        now_unix_ms: u64,
    ) -> Result<PathBuf> {
        let timestamp = datetime_from_unix_ms(now_unix_ms);
        let path = self.mirror_path(kind, &timestamp);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create mirror directory {}", parent.display()))?;
        }

        let flattened = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let line = format!(
            "- [{}] ({scope_key}) {flattened}",
            timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open mirror file {}", path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append mirror line to {}", path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush mirror file {}", path.display()))?;
        Ok(path)
    }

    fn mirror_path(&self, kind: MemoryKind, timestamp: &DateTime<Utc>) -> PathBuf {
        match kind {
            MemoryKind::Episodic => self
                .memory_dir
                .join("episodic")
                .join(format!("{}.md", timestamp.format("%Y-%m-%d"))),
            MemoryKind::Preference => self.memory_dir.join("semantic").join("preferences.md"),
            MemoryKind::Fact => self.memory_dir.join("semantic").join("facts.md"),
            MemoryKind::Decision => self.memory_dir.join("semantic").join("decisions.md"),
        }
    }
}

fn datetime_from_unix_ms(unix_ms: u64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(unix_ms as i64).unwrap_or_else(Utc::now)
}
