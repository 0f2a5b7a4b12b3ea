//! Pre-persistence gate rejecting unsafe or low-value candidate text.
//!
//! Every candidate passes through here before it can reach the store,
//! whatever its source pipeline. Rejections are expected traffic: they are
//! counted per reason, not logged at warn.

use serde::Serialize;

/// Inclusive character bounds for candidate text.
pub const MIN_CANDIDATE_CHARS: usize = 8;
pub const MAX_CANDIDATE_CHARS: usize = 1_024;

/// Phrases that attempt to override assistant instructions. Matched against
/// lowercased candidate text.
const INJECTION_MARKERS: &[&str] = &[
    "ignore previous instructions",
    "ignore all previous instructions",
    "ignore the above",
    "disregard previous instructions",
    "disregard all prior",
    "override your instructions",
    "forget your instructions",
    "forget everything above",
    "new instructions:",
    "you must obey",
    "system prompt",
    "jailbreak",
];

/// Prefixes that read as role impersonation rather than user content.
const ROLE_PREFIXES: &[&str] = &["system:", "assistant:", "[system]", "<|system|>", "### system"];

/// Leading tokens that mark a bare shell invocation.
const COMMAND_PREFIXES: &[&str] = &[
    "$ ", "#!", "./", "sudo ", "rm ", "mv ", "cp ", "cd ", "ls ", "cat ", "git ", "curl ",
    "wget ", "ssh ", "docker ", "kubectl ", "npm ", "cargo ", "pip ",
];

/// Word count below which a command-prefixed candidate is considered bare
/// (no descriptive content around the invocation).
const BARE_COMMAND_MAX_WORDS: usize = 8;

/// Why a candidate was rejected. Labels feed the per-reason drop counter
/// buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyRejection {
    Empty,
    TooShort,
    TooLong,
    CodeFence,
    PromptInjection,
    BareCommand,
    PureUrl,
    PureDigits,
}

impl SafetyRejection {
    pub fn as_str(self) -> &'static str {
        match self {
            SafetyRejection::Empty => "empty",
            SafetyRejection::TooShort => "too_short",
            SafetyRejection::TooLong => "too_long",
            SafetyRejection::CodeFence => "code_fence",
            SafetyRejection::PromptInjection => "prompt_injection",
            SafetyRejection::BareCommand => "bare_command",
            SafetyRejection::PureUrl => "pure_url",
            SafetyRejection::PureDigits => "pure_digits",
        }
    }
}

/// Accept/reject verdict for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyVerdict {
    Accept,
    Reject(SafetyRejection),
}

impl SafetyVerdict {
    pub fn is_accept(self) -> bool {
        matches!(self, SafetyVerdict::Accept)
    }
}

/// Screens a whole inbound turn before extraction runs. Only the
/// content-shaped checks apply here: a predominantly fenced or
/// instruction-overriding turn is dropped wholesale, so hostile text never
/// reaches the extractor. Length bounds stay per-candidate.
pub fn screen_turn(text: &str) -> SafetyVerdict {
    if is_predominantly_fenced(text) {
        return SafetyVerdict::Reject(SafetyRejection::CodeFence);
    }
    let lowered = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    if INJECTION_MARKERS.iter().any(|marker| lowered.contains(marker))
        || ROLE_PREFIXES.iter().any(|prefix| lowered.starts_with(prefix))
    {
        return SafetyVerdict::Reject(SafetyRejection::PromptInjection);
    }
    SafetyVerdict::Accept
}

/// Runs every check in fixed order and returns the first rejection.
pub fn evaluate_candidate(text: &str) -> SafetyVerdict {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return SafetyVerdict::Reject(SafetyRejection::Empty);
    }

    let char_count = normalized.chars().count();
    if char_count < MIN_CANDIDATE_CHARS {
        return SafetyVerdict::Reject(SafetyRejection::TooShort);
    }
    if char_count > MAX_CANDIDATE_CHARS {
        return SafetyVerdict::Reject(SafetyRejection::TooLong);
    }

    // Fence check runs on the raw text: normalization collapses the
    // newlines that fences depend on.
    if is_predominantly_fenced(text) {
        return SafetyVerdict::Reject(SafetyRejection::CodeFence);
    }

    let lowered = normalized.to_lowercase();
    if INJECTION_MARKERS.iter().any(|marker| lowered.contains(marker))
        || ROLE_PREFIXES.iter().any(|prefix| lowered.starts_with(prefix))
    {
        return SafetyVerdict::Reject(SafetyRejection::PromptInjection);
    }

    if is_bare_command(&lowered) {
        return SafetyVerdict::Reject(SafetyRejection::BareCommand);
    }

    if is_pure_url(&normalized) {
        return SafetyVerdict::Reject(SafetyRejection::PureUrl);
    }

    if is_pure_digits(&normalized) {
        return SafetyVerdict::Reject(SafetyRejection::PureDigits);
    }

    SafetyVerdict::Accept
}

/// True when more than half of the text sits between ``` fence markers, or
/// the whole candidate is one fenced block.
fn is_predominantly_fenced(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.starts_with("```") && trimmed.ends_with("```") && trimmed.len() > 6 {
        return true;
    }

    let mut fenced_chars = 0usize;
    let mut inside = false;
    for line in trimmed.lines() {
        if line.trim_start().starts_with("```") {
            inside = !inside;
            fenced_chars += line.chars().count();
            continue;
        }
        if inside {
            fenced_chars += line.chars().count();
        }
    }
    let total_chars = trimmed.chars().count();
    total_chars > 0 && fenced_chars * 2 > total_chars
}

fn is_bare_command(lowered: &str) -> bool {
    let has_prefix = COMMAND_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix));
    if !has_prefix {
        return false;
    }
    lowered.split_whitespace().count() <= BARE_COMMAND_MAX_WORDS
}

fn is_pure_url(normalized: &str) -> bool {
    let mut tokens = normalized.split_whitespace();
    let Some(first) = tokens.next() else {
        return false;
    };
    if tokens.next().is_some() {
        return false;
    }
    first.starts_with("http://") || first.starts_with("https://") || first.starts_with("www.")
}

fn is_pure_digits(normalized: &str) -> bool {
    let meaningful = normalized
        .chars()
        .filter(|character| !character.is_whitespace() && !character.is_ascii_punctuation())
        .collect::<Vec<_>>();
    !meaningful.is_empty() && meaningful.iter().all(char::is_ascii_digit)
}
