/// Errors surfaced across the broker's tool-facing and internal APIs.
///
/// Every public operation that can fail returns `Result<T, BrokerError>` (or
/// `anyhow::Result<T>` internally, converted at the boundary). Variant order
/// roughly follows the request path: validation, policy, lookup, capacity,
/// execution, and finally the catch-all `Internal`.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("policy rejected: {reason}")]
    PolicyRejected { reason: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("language '{0}' is not supported")]
    Unsupported(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("circuit open for '{0}'; try again later")]
    CircuitOpen(String),

    #[error("execution timed out after {elapsed_ms} ms (limit {limit_ms} ms)")]
    Timeout { elapsed_ms: u64, limit_ms: u64 },

    #[error("{stream} output exceeded {cap_bytes} byte cap")]
    OutputOverflow { stream: String, cap_bytes: usize },

    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("timed out waiting for an execution slot after {waited_ms} ms")]
    QueueTimeout { waited_ms: u64 },

    /// Any other unexpected error. `correlation_id` is the per-request UUID
    /// attached to the tool invocation's tracing span (§3/§4.12); it starts
    /// empty at construction time deep in the stack and is filled in by
    /// [`BrokerError::with_correlation_id`] once the error reaches the tool
    /// handler that knows the request's id.
    #[error("internal error: {message}")]
    Internal {
        correlation_id: String,
        message: String,
    },
}

impl BrokerError {
    /// The stable error-kind tag reported to callers (§7), distinct from the
    /// human-readable `Display` message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::PolicyRejected { .. } => "policy_rejected",
            Self::NotFound { .. } => "not_found",
            Self::Unsupported(_) => "unsupported",
            Self::RateLimited(_) => "rate_limited",
            Self::CircuitOpen(_) => "circuit_open",
            Self::Timeout { .. } => "timeout",
            Self::OutputOverflow { .. } => "output_overflow",
            Self::SpawnFailed(_) => "spawn_failed",
            Self::QueueTimeout { .. } => "queue_timeout",
            Self::Internal { .. } => "internal",
        }
    }

    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Build an `Internal` error with no correlation id yet — used deep in
    /// the stack, away from the request boundary that owns one.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            correlation_id: String::new(),
            message: message.into(),
        }
    }

    /// Stamp a correlation id onto an `Internal` error that doesn't have one
    /// yet. A no-op for every other variant and for an `Internal` error that
    /// already carries an id (an inner call already attached its own).
    pub fn with_correlation_id(self, id: &str) -> Self {
        match self {
            Self::Internal { correlation_id, message } if correlation_id.is_empty() => {
                Self::Internal {
                    correlation_id: id.to_string(),
                    message,
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_bad_request() {
        let err = BrokerError::BadRequest("missing 'language' field".into());
        assert_eq!(err.to_string(), "bad request: missing 'language' field");
    }

    #[test]
    fn test_display_policy_rejected() {
        let err = BrokerError::PolicyRejected {
            reason: "blocked import: os.system".into(),
        };
        assert_eq!(err.to_string(), "policy rejected: blocked import: os.system");
    }

    #[test]
    fn test_display_not_found() {
        let err = BrokerError::not_found("session", "01J...");
        assert_eq!(err.to_string(), "session not found: 01J...");
    }

    #[test]
    fn test_display_unsupported() {
        let err = BrokerError::Unsupported("cobol".into());
        assert_eq!(err.to_string(), "language 'cobol' is not supported");
    }

    #[test]
    fn test_display_rate_limited() {
        let err = BrokerError::RateLimited("client 'acme' exceeded 10 req/s".into());
        assert_eq!(
            err.to_string(),
            "rate limited: client 'acme' exceeded 10 req/s"
        );
    }

    #[test]
    fn test_display_circuit_open() {
        let err = BrokerError::CircuitOpen("python".into());
        assert_eq!(
            err.to_string(),
            "circuit open for 'python'; try again later"
        );
    }

    #[test]
    fn test_display_timeout() {
        let err = BrokerError::Timeout {
            elapsed_ms: 30_000,
            limit_ms: 30_000,
        };
        assert_eq!(
            err.to_string(),
            "execution timed out after 30000 ms (limit 30000 ms)"
        );
    }

    #[test]
    fn test_display_output_overflow() {
        let err = BrokerError::OutputOverflow {
            stream: "stdout".into(),
            cap_bytes: 10 * 1024 * 1024,
        };
        assert_eq!(
            err.to_string(),
            "stdout output exceeded 10485760 byte cap"
        );
    }

    #[test]
    fn test_display_spawn_failed() {
        let err = BrokerError::SpawnFailed("ENOENT: python3 not found".into());
        assert_eq!(
            err.to_string(),
            "failed to spawn process: ENOENT: python3 not found"
        );
    }

    #[test]
    fn test_display_queue_timeout() {
        let err = BrokerError::QueueTimeout { waited_ms: 5_000 };
        assert_eq!(
            err.to_string(),
            "timed out waiting for an execution slot after 5000 ms"
        );
    }

    #[test]
    fn test_display_internal() {
        let err = BrokerError::internal("store connection lost");
        assert_eq!(err.to_string(), "internal error: store connection lost");
    }

    #[test]
    fn test_with_correlation_id_fills_empty_only() {
        let err = BrokerError::internal("boom").with_correlation_id("abc-123");
        match err {
            BrokerError::Internal { correlation_id, .. } => assert_eq!(correlation_id, "abc-123"),
            _ => panic!("expected Internal"),
        }

        let err = BrokerError::internal("boom")
            .with_correlation_id("first")
            .with_correlation_id("second");
        match err {
            BrokerError::Internal { correlation_id, .. } => assert_eq!(correlation_id, "first"),
            _ => panic!("expected Internal"),
        }
    }

    #[test]
    fn test_with_correlation_id_is_noop_for_other_variants() {
        let err = BrokerError::BadRequest("x".into()).with_correlation_id("abc");
        assert_eq!(err.to_string(), "bad request: x");
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(BrokerError::BadRequest("x".into()).kind(), "bad_request");
        assert_eq!(
            BrokerError::not_found("session", "x").kind(),
            "not_found"
        );
        assert_eq!(
            BrokerError::Timeout {
                elapsed_ms: 1,
                limit_ms: 1
            }
            .kind(),
            "timeout"
        );
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BrokerError>();
    }

    #[test]
    fn test_display_boundary_values() {
        let err = BrokerError::QueueTimeout { waited_ms: 0 };
        assert_eq!(
            err.to_string(),
            "timed out waiting for an execution slot after 0 ms"
        );

        let err = BrokerError::Timeout {
            elapsed_ms: u64::MAX,
            limit_ms: u64::MAX,
        };
        assert!(err.to_string().contains(&u64::MAX.to_string()));
    }
}
