use std::time::Duration;

/// Classified failures that callers branch on.
///
/// Library code returns `anyhow::Error`; when a failure needs a decision
/// (retry, rotate, fall back) it is raised as a `RotorError` and recovered
/// with `err.downcast_ref::<RotorError>()`.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RotorError {
    #[error("All keys in pool '{pool}' exhausted")]
    KeysExhausted { pool: String, wait_ms: Option<u64> },

    #[error("Rate limited by '{source_name}': {message}")]
    RateLimited {
        source_name: String,
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Operation '{operation}' timed out after {after_ms} ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("Rotation phase '{phase}' failed: {message}")]
    PhaseFailed { phase: String, message: String },

    #[error("Provider '{provider}' failed: {message}")]
    ProviderFailed { provider: String, message: String },

    #[error("All {attempted} providers failed; last error: {last_error}")]
    AllProvidersFailed { attempted: usize, last_error: String },

    #[error("No provider supports request type '{0}'")]
    NoProviderForType(String),

    #[error("Circuit '{name}' is open")]
    CircuitOpen { name: String },

    #[error("State record '{key}' changed concurrently (expected revision {expected:?}, found {found:?})")]
    StateConflict {
        key: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("Secret store error: {0}")]
    SecretStore(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RotorError {
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::KeysExhausted { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    pub fn is_state_conflict(&self) -> bool {
        matches!(self, Self::StateConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_keys_exhausted() {
        let err = RotorError::KeysExhausted {
            pool: "primary".into(),
            wait_ms: Some(1500),
        };
        assert_eq!(
            err.to_string(),
            "All keys in pool 'primary' exhausted"
        );
        assert!(err.is_exhausted());
        assert!(!err.is_rate_limited());
    }

    #[test]
    fn test_display_rate_limited() {
        let err = RotorError::RateLimited {
            source_name: "vision-a".into(),
            message: "429 Too Many Requests".into(),
            retry_after_ms: None,
        };
        assert_eq!(
            err.to_string(),
            "Rate limited by 'vision-a': 429 Too Many Requests"
        );
        assert!(err.is_rate_limited());
    }

    #[test]
    fn test_timeout_constructor_uses_millis() {
        let err = RotorError::timeout("restore-session", Duration::from_secs(3));
        assert_eq!(
            err.to_string(),
            "Operation 'restore-session' timed out after 3000 ms"
        );
    }

    #[test]
    fn test_display_phase_failed() {
        let err = RotorError::PhaseFailed {
            phase: "rotate-ip".into(),
            message: "proxy refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "Rotation phase 'rotate-ip' failed: proxy refused"
        );
    }

    #[test]
    fn test_display_all_providers_failed() {
        let err = RotorError::AllProvidersFailed {
            attempted: 3,
            last_error: "boom".into(),
        };
        assert_eq!(err.to_string(), "All 3 providers failed; last error: boom");
    }

    #[test]
    fn test_state_conflict_classification() {
        let err = RotorError::StateConflict {
            key: "coordinator/worker-1".into(),
            expected: Some(3),
            found: Some(4),
        };
        assert!(err.is_state_conflict());
        assert!(err.to_string().contains("coordinator/worker-1"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync + 'static>() {}
        assert_send_sync::<RotorError>();
    }
}
