use thiserror::Error;

/// Anticipated failure kinds crossing the engine's public boundary.
///
/// Unanticipated conditions are folded into [`MemoryError::Internal`] so
/// callers never see a raw backend error type.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("memory store busy after retries: {0}")]
    StoreBusy(String),

    #[error("memory store corrupt: {0}")]
    Corrupt(String),

    #[error("memory store quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("invalid memory configuration: {0}")]
    ConfigInvalid(String),

    #[error("internal memory engine error: {0}")]
    Internal(String),
}

impl MemoryError {
    /// Stable machine-readable label used in logs and operator output.
    pub fn kind_label(&self) -> &'static str {
        match self {
            MemoryError::StoreUnavailable(_) => "store_unavailable",
            MemoryError::StoreBusy(_) => "store_busy",
            MemoryError::Corrupt(_) => "corrupt",
            MemoryError::QuotaExceeded(_) => "quota_exceeded",
            MemoryError::ConfigInvalid(_) => "config_invalid",
            MemoryError::Internal(_) => "internal",
        }
    }

    /// True when a retry at the call site could plausibly succeed. Busy
    /// and unavailable stores share the degrade-don't-fail policy; the
    /// pipelines drop to empty results on these, while corruption
    /// surfaces.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MemoryError::StoreBusy(_) | MemoryError::StoreUnavailable(_)
        )
    }
}

impl From<anyhow::Error> for MemoryError {
    fn from(error: anyhow::Error) -> Self {
        MemoryError::Internal(format!("{error:#}"))
    }
}

pub type MemoryResult<T> = Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::MemoryError;

    #[test]
    fn unit_kind_labels_are_stable() {
        assert_eq!(
            MemoryError::StoreUnavailable("gone".to_string()).kind_label(),
            "store_unavailable"
        );
        assert_eq!(
            MemoryError::ConfigInvalid("bad".to_string()).kind_label(),
            "config_invalid"
        );
        assert_eq!(
            MemoryError::Internal("boom".to_string()).kind_label(),
            "internal"
        );
    }

    #[test]
    fn unit_busy_and_unavailable_are_retryable() {
        assert!(MemoryError::StoreBusy("locked".to_string()).is_retryable());
        assert!(MemoryError::StoreUnavailable("gone".to_string()).is_retryable());
        assert!(!MemoryError::Corrupt("bad page".to_string()).is_retryable());
        assert!(!MemoryError::ConfigInvalid("bad".to_string()).is_retryable());
        assert!(!MemoryError::Internal("boom".to_string()).is_retryable());
    }
}
