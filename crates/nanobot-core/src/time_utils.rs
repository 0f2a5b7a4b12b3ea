use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as whole seconds since the unix epoch.
pub fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

/// Current wall-clock time as milliseconds since the unix epoch.
pub fn current_unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

/// Returns true when `expires_at_unix_ms` is at or before `now_unix_ms`.
pub fn is_expired_unix_ms(expires_at_unix_ms: u64, now_unix_ms: u64) -> bool {
    expires_at_unix_ms <= now_unix_ms
}
