//! Remote text-generation dependency.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use genq_resilience::{BreakerError, CircuitBreaker, Retryable};

/// Failure from the generation dependency.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerateError {
    #[error("generation request failed: {0}")]
    Request(String),
    #[error("generation service unavailable: {0}")]
    Unavailable(String),
    #[error("generation rejected by circuit breaker: {0}")]
    Rejected(String),
    #[error("generation cancelled")]
    Cancelled,
    #[error("generation deadline exceeded")]
    DeadlineExceeded,
}

impl GenerateError {
    /// The call never reached the remote side.
    pub fn is_rejection(&self) -> bool {
        matches!(self, GenerateError::Rejected(_))
    }
}

impl Retryable for GenerateError {
    fn is_retryable(&self) -> bool {
        matches!(self, GenerateError::Request(_) | GenerateError::Unavailable(_))
    }
}

/// Slow, rate-limited, occasionally failing text generator.
///
/// Implementations must be safe to call from several workers at once.
#[async_trait::async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, input_text: &str, context: &JsonValue) -> Result<String, GenerateError>;
}

/// [`Generator`] decorator that routes every call through a circuit breaker.
///
/// Breaker rejections surface as [`GenerateError::Rejected`].
pub struct BreakerGuardedGenerator {
    inner: Arc<dyn Generator>,
    breaker: Arc<CircuitBreaker>,
}

impl BreakerGuardedGenerator {
    pub fn new(inner: Arc<dyn Generator>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }
}

#[async_trait::async_trait]
impl Generator for BreakerGuardedGenerator {
    async fn generate(&self, input_text: &str, context: &JsonValue) -> Result<String, GenerateError> {
        let result = self
            .breaker
            .call(|| self.inner.generate(input_text, context))
            .await;

        match result {
            Ok(text) => Ok(text),
            Err(BreakerError::Inner(err)) => Err(err),
            Err(rejection) => Err(GenerateError::Rejected(rejection.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use genq_resilience::{CircuitBreakerConfig, CircuitState};

    struct AlwaysDown {
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Generator for AlwaysDown {
        async fn generate(&self, _input: &str, _ctx: &JsonValue) -> Result<String, GenerateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(GenerateError::Unavailable("503".to_string()))
        }
    }

    #[tokio::test]
    async fn guarded_generator_opens_and_rejects() {
        let inner = Arc::new(AlwaysDown {
            calls: AtomicU32::new(0),
        });
        let breaker = Arc::new(
            CircuitBreaker::new("generator", CircuitBreakerConfig::default().with_failure_threshold(2))
                .unwrap(),
        );
        let guarded = BreakerGuardedGenerator::new(inner.clone(), breaker.clone());

        for _ in 0..2 {
            let err = guarded.generate("text", &JsonValue::Null).await.unwrap_err();
            assert!(matches!(err, GenerateError::Unavailable(_)));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = guarded.generate("text", &JsonValue::Null).await.unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancellation_is_not_retryable() {
        assert!(!GenerateError::Cancelled.is_retryable());
        assert!(!GenerateError::DeadlineExceeded.is_retryable());
        assert!(!GenerateError::Rejected("open".into()).is_retryable());
        assert!(GenerateError::Request("500".into()).is_retryable());
    }
}
