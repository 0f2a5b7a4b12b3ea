use serde::{Deserialize, Serialize};

use crate::entry::MemoryKind;

const SCOPE_FALLBACK_CHANNEL: &str = "unknown-channel";
const SCOPE_FALLBACK_CHAT: &str = "unknown-chat";
const SCOPE_FALLBACK_WORKSPACE: &str = "default";

/// Isolation level an entry is written to or recalled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeLevel {
    Chat,
    User,
    Global,
}

impl ScopeLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ScopeLevel::Chat => "chat",
            ScopeLevel::User => "user",
            ScopeLevel::Global => "global",
        }
    }
}

/// Scope keys resolved for one turn. The key strings are the isolation
/// boundary: recall never crosses them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedScopes {
    pub chat: String,
    pub user: String,
    pub global: String,
}

impl ResolvedScopes {
    pub fn key_for(&self, level: ScopeLevel) -> &str {
        match level {
            ScopeLevel::Chat => &self.chat,
            ScopeLevel::User => &self.user,
            ScopeLevel::Global => &self.global,
        }
    }
}

/// Maps turn identity to scope keys. Pure; empty components fall back to
/// stable placeholders so a malformed turn cannot alias another scope.
pub fn resolve_scopes(
    channel: &str,
    chat_id: &str,
    sender_id: Option<&str>,
    workspace_id: &str,
) -> ResolvedScopes {
    let channel = normalize_component(channel, SCOPE_FALLBACK_CHANNEL);
    let chat_id = normalize_component(chat_id, SCOPE_FALLBACK_CHAT);
    let workspace_id = normalize_component(workspace_id, SCOPE_FALLBACK_WORKSPACE);
    let user_id = sender_id
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(chat_id.as_str());

    ResolvedScopes {
        chat: format!("channel:{channel}:chat:{chat_id}"),
        user: format!("channel:{channel}:user:{user_id}"),
        global: format!("workspace:{workspace_id}:global"),
    }
}

/// Default write scope per kind. Extractor output cannot override this;
/// manual inserts may.
pub fn default_scope_for_kind(kind: MemoryKind) -> ScopeLevel {
    match kind {
        MemoryKind::Preference | MemoryKind::Fact => ScopeLevel::User,
        MemoryKind::Decision | MemoryKind::Episodic => ScopeLevel::Chat,
    }
}

fn normalize_component(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}
