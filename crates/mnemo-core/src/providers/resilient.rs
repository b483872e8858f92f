//! Resilient provider wrappers
//!
//! Wrap one primary and one optional fallback implementation of the embed or
//! rerank contract. Every call tries the primary first; on success the
//! failure counter resets, on error it increments and the fallback (when
//! configured) is invoked with the same arguments. The counter is advisory:
//! `max_primary_failures` is a warning threshold, not a circuit breaker;
//! the primary is always attempted first.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{info, warn};

use super::{
    EmbedOptions, PassageReranker, ProviderError, ProviderResult, RerankOptions, RerankScore,
    Vectorizer,
};

/// Default warning threshold for consecutive primary failures
pub const DEFAULT_MAX_PRIMARY_FAILURES: u32 = 3;

// ============================================================================
// FAILOVER CORE
// ============================================================================

struct Failover<T: ?Sized> {
    primary: Arc<T>,
    fallback: Option<Arc<T>>,
    max_primary_failures: u32,
    primary_failures: AtomicU32,
}

impl<T: ?Sized> Failover<T> {
    fn new(primary: Arc<T>, fallback: Option<Arc<T>>, max_primary_failures: u32) -> Self {
        Self {
            primary,
            fallback,
            max_primary_failures,
            primary_failures: AtomicU32::new(0),
        }
    }

    fn on_success(&self) {
        self.primary_failures.store(0, Ordering::Relaxed);
    }

    fn on_primary_failure(&self, operation: &str, error: &ProviderError) -> u32 {
        let count = self.primary_failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!("Primary provider {operation} failed (count: {count}): {error}");
        if count >= self.max_primary_failures {
            warn!(
                "Primary provider exceeded {} failures, relying on fallback",
                self.max_primary_failures
            );
        }
        count
    }

    fn failure_count(&self) -> u32 {
        self.primary_failures.load(Ordering::Relaxed)
    }
}

macro_rules! with_fallback {
    ($self:expr, $operation:literal, $call:expr) => {{
        let primary = Arc::clone(&$self.inner.primary);
        match $call(primary).await {
            Ok(result) => {
                $self.inner.on_success();
                return Ok(result);
            }
            Err(primary_error) => {
                $self.inner.on_primary_failure($operation, &primary_error);
                let Some(fallback) = $self.inner.fallback.clone() else {
                    return Err(primary_error);
                };
                info!("Falling back for {}", $operation);
                match $call(fallback).await {
                    Ok(result) => Ok(result),
                    Err(fallback_error) => Err(ProviderError::BothFailed {
                        primary: primary_error.to_string(),
                        fallback: fallback_error.to_string(),
                    }),
                }
            }
        }
    }};
}

// ============================================================================
// RESILIENT VECTORIZER
// ============================================================================

/// Embedding service with automatic failover
pub struct ResilientVectorizer {
    inner: Failover<dyn Vectorizer>,
}

impl ResilientVectorizer {
    /// Wrap a primary and an optional fallback embedding provider
    pub fn new(
        primary: Arc<dyn Vectorizer>,
        fallback: Option<Arc<dyn Vectorizer>>,
        max_primary_failures: u32,
    ) -> Self {
        Self {
            inner: Failover::new(primary, fallback, max_primary_failures.max(1)),
        }
    }

    /// Primary without a fallback
    pub fn without_fallback(primary: Arc<dyn Vectorizer>) -> Self {
        Self::new(primary, None, DEFAULT_MAX_PRIMARY_FAILURES)
    }

    /// Current consecutive primary failure count (advisory)
    pub fn primary_failure_count(&self) -> u32 {
        self.inner.failure_count()
    }
}

#[async_trait]
impl Vectorizer for ResilientVectorizer {
    async fn embed(&self, text: &str, opts: &EmbedOptions) -> ProviderResult<Vec<f32>> {
        with_fallback!(self, "embed", |service: Arc<dyn Vectorizer>| {
            let text = text.to_string();
            let opts = opts.clone();
            async move { service.embed(&text, &opts).await }
        })
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        opts: &EmbedOptions,
    ) -> ProviderResult<Vec<Vec<f32>>> {
        with_fallback!(self, "embed_batch", |service: Arc<dyn Vectorizer>| {
            let texts = texts.to_vec();
            let opts = opts.clone();
            async move { service.embed_batch(&texts, &opts).await }
        })
    }

    fn model_name(&self) -> &str {
        self.inner.primary.model_name()
    }
}

// ============================================================================
// RESILIENT RERANKER
// ============================================================================

/// Rerank service with automatic failover
pub struct ResilientReranker {
    inner: Failover<dyn PassageReranker>,
}

impl ResilientReranker {
    /// Wrap a primary and an optional fallback rerank provider
    pub fn new(
        primary: Arc<dyn PassageReranker>,
        fallback: Option<Arc<dyn PassageReranker>>,
        max_primary_failures: u32,
    ) -> Self {
        Self {
            inner: Failover::new(primary, fallback, max_primary_failures.max(1)),
        }
    }

    /// Primary without a fallback
    pub fn without_fallback(primary: Arc<dyn PassageReranker>) -> Self {
        Self::new(primary, None, DEFAULT_MAX_PRIMARY_FAILURES)
    }

    /// Current consecutive primary failure count (advisory)
    pub fn primary_failure_count(&self) -> u32 {
        self.inner.failure_count()
    }
}

#[async_trait]
impl PassageReranker for ResilientReranker {
    async fn rerank(
        &self,
        query: &str,
        passages: &[String],
        opts: &RerankOptions,
    ) -> ProviderResult<Vec<RerankScore>> {
        with_fallback!(self, "rerank", |service: Arc<dyn PassageReranker>| {
            let query = query.to_string();
            let passages = passages.to_vec();
            let opts = opts.clone();
            async move { service.rerank(&query, &passages, &opts).await }
        })
    }

    fn model_name(&self) -> &str {
        self.inner.primary.model_name()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedVectorizer {
        fail: bool,
        calls: AtomicUsize,
        dims: usize,
    }

    impl ScriptedVectorizer {
        fn ok(dims: usize) -> Self {
            Self { fail: false, calls: AtomicUsize::new(0), dims }
        }
        fn failing() -> Self {
            Self { fail: true, calls: AtomicUsize::new(0), dims: 4 }
        }
    }

    #[async_trait]
    impl Vectorizer for ScriptedVectorizer {
        async fn embed(&self, _text: &str, _opts: &EmbedOptions) -> ProviderResult<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ProviderError::Timeout)
            } else {
                Ok(vec![1.0; self.dims])
            }
        }

        async fn embed_batch(
            &self,
            texts: &[String],
            opts: &EmbedOptions,
        ) -> ProviderResult<Vec<Vec<f32>>> {
            let mut out = Vec::new();
            for text in texts {
                out.push(self.embed(text, opts).await?);
            }
            Ok(out)
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    #[tokio::test]
    async fn test_primary_success_resets_counter() {
        let service = ResilientVectorizer::without_fallback(Arc::new(ScriptedVectorizer::ok(4)));
        service.embed("x", &EmbedOptions::document()).await.unwrap();
        assert_eq!(service.primary_failure_count(), 0);
    }

    #[tokio::test]
    async fn test_failover_serves_from_fallback_and_counts() {
        let fallback = Arc::new(ScriptedVectorizer::ok(4));
        let service = ResilientVectorizer::new(
            Arc::new(ScriptedVectorizer::failing()),
            Some(fallback.clone()),
            3,
        );

        for _ in 0..2 {
            let vector = service.embed("x", &EmbedOptions::document()).await.unwrap();
            assert_eq!(vector.len(), 4);
        }
        assert_eq!(service.primary_failure_count(), 2);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_fallback_propagates_primary_error() {
        let service = ResilientVectorizer::without_fallback(Arc::new(ScriptedVectorizer::failing()));
        let err = service.embed("x", &EmbedOptions::document()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout));
        assert_eq!(service.primary_failure_count(), 1);
    }

    #[tokio::test]
    async fn test_both_failing_yields_combined_error() {
        let service = ResilientVectorizer::new(
            Arc::new(ScriptedVectorizer::failing()),
            Some(Arc::new(ScriptedVectorizer::failing())),
            3,
        );
        let err = service.embed("x", &EmbedOptions::document()).await.unwrap_err();
        assert!(matches!(err, ProviderError::BothFailed { .. }));
    }
}
