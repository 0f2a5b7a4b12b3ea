//! Scoped, ranked long-term memory for the nanobot runtime.
//!
//! Captures salient facts, preferences, decisions, and episodic markers
//! from conversational turns under safety and quality gates, recalls a
//! bounded relevance-ranked context slice per turn, and keeps per-session
//! pre/post generation markers for crash-visible continuity.

pub mod backfill;
pub mod capture;
pub mod config;
pub mod engine;
pub mod entry;
pub mod error;
pub mod extract;
pub mod hygiene;
pub mod mirror;
pub mod recall;
pub mod safety;
pub mod scope;
pub mod store;
pub mod telemetry;
pub mod wal;

pub use config::{MemoryBackendKind, MemoryConfig};
pub use engine::{CancelToken, EngineStatus, MemoryEngine, SearchScopeSelector, TurnContext};
pub use entry::{MemoryEntry, MemoryKind, MemorySource};
pub use error::{MemoryError, MemoryResult};
pub use recall::{RecallHit, RecallOutcome};
pub use scope::{resolve_scopes, ResolvedScopes, ScopeLevel};
pub use telemetry::TelemetrySnapshot;
