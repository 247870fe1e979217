//! Request orchestration: cache lookup, provider selection, per-provider
//! retry wrapped by the circuit breaker, failover across backends, and cache
//! population.

use crate::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::cache::{InMemoryCache, ResponseCache, cache_key};
use crate::providers::{Provider, ProviderError};
use crate::registry::ProviderRegistry;
use crate::types::{CompletionRequest, CompletionResponse, RetryPolicy, StreamChunk};
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Errors crossing the request manager boundary. Callers see exactly these
/// four kinds; raw adapter errors only escape wrapped in `Provider` or as the
/// final cause inside `AllProvidersFailed`.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("circuit breaker open for provider {0}")]
    CircuitOpen(String),

    #[error("no providers available")]
    NoProvidersAvailable,

    #[error("all {attempted} candidate provider(s) failed (last error: {source})")]
    AllProvidersFailed {
        attempted: usize,
        #[source]
        source: Box<RequestError>,
    },
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub retry: RetryPolicy,
    /// TTL for cached responses. Invalidation is TTL-only; upstream model
    /// changes within the window serve stale content.
    pub cache_ttl: Duration,
    /// Deadline applied to every individual provider call.
    pub call_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            cache_ttl: Duration::from_secs(3600),
            call_timeout: Duration::from_secs(120),
        }
    }
}

/// Read-only aggregate for observability.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatistics {
    pub total_providers: usize,
    pub healthy_providers: usize,
    pub circuit_breaker_states: HashMap<String, BreakerSnapshot>,
}

/// Produces a [`CompletionResponse`] for a [`CompletionRequest`], maximizing
/// success probability while respecting circuit state and cache.
pub struct RequestManager {
    registry: Arc<ProviderRegistry>,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<dyn ResponseCache>,
    config: ManagerConfig,
}

impl RequestManager {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        breaker: Arc<CircuitBreaker>,
        cache: Arc<dyn ResponseCache>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            registry,
            breaker,
            cache,
            config,
        }
    }

    /// Default breaker, in-memory cache, default retry/TTL/timeout.
    pub fn with_defaults(registry: Arc<ProviderRegistry>) -> Self {
        Self::new(
            registry,
            Arc::new(CircuitBreaker::default()),
            Arc::new(InMemoryCache::new()),
            ManagerConfig::default(),
        )
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Execute a completion, failing over across candidate providers.
    ///
    /// With `provider_id` set, only that provider is attempted; otherwise the
    /// healthy providers whose circuits admit requests are tried in
    /// descending-priority order, ties broken by registration order.
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        provider_id: Option<&str>,
    ) -> Result<CompletionResponse, RequestError> {
        let started = Instant::now();
        let key = (!request.stream).then(|| cache_key(request));

        if let Some(key) = &key {
            match self.cache.get(key).await {
                Ok(Some(mut response)) => {
                    debug!(%key, "cache hit");
                    response.cached = true;
                    response.latency_ms = started.elapsed().as_millis() as u64;
                    return Ok(response);
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "cache read failed, treating as miss"),
            }
        }

        let candidates = self.candidates(provider_id);
        if candidates.is_empty() {
            return Err(RequestError::NoProvidersAvailable);
        }

        let attempted = candidates.len();
        let mut last_err = None;
        for provider in candidates {
            let id = provider.descriptor().id.clone();
            match self.execute_with_retry(provider.as_ref(), request).await {
                Ok(response) => {
                    if let Some(key) = &key {
                        if let Err(err) = self
                            .cache
                            .set(key, response.clone(), self.config.cache_ttl)
                            .await
                        {
                            warn!(error = %err, "cache write failed, skipping");
                        }
                    }
                    return Ok(response);
                }
                Err(err) => {
                    // Circuit-open gating carries no signal about provider
                    // health, so only actual provider faults feed the breaker.
                    if matches!(err, RequestError::Provider(_)) {
                        self.breaker.record_failure(&id);
                    }
                    warn!(provider_id = %id, error = %err, "provider exhausted, trying next candidate");
                    last_err = Some(err);
                }
            }
        }

        Err(RequestError::AllProvidersFailed {
            attempted,
            source: Box::new(last_err.unwrap_or(RequestError::NoProvidersAvailable)),
        })
    }

    /// Stream a completion, failing over at any error.
    ///
    /// Failover restarts emission from the beginning with the next candidate:
    /// a consumer may receive a partial chunk sequence from a failed provider
    /// before the replacement provider's full sequence. Nothing is buffered.
    /// Streaming responses are never cached.
    pub fn stream_complete(
        &self,
        request: &CompletionRequest,
        provider_id: Option<&str>,
    ) -> Result<BoxStream<'static, Result<StreamChunk, RequestError>>, RequestError> {
        let candidates = self.candidates(provider_id);
        if candidates.is_empty() {
            return Err(RequestError::NoProvidersAvailable);
        }

        let breaker = Arc::clone(&self.breaker);
        let request = request.clone();
        let stream = async_stream::stream! {
            let attempted = candidates.len();
            let mut last_err = None;
            for provider in candidates {
                let id = provider.descriptor().id.clone();
                if !breaker.should_allow_request(&id) {
                    last_err = Some(RequestError::CircuitOpen(id));
                    continue;
                }
                let mut inner = provider.stream_complete(&request);
                let mut failed = false;
                while let Some(event) = inner.next().await {
                    match event {
                        Ok(chunk) => yield Ok(chunk),
                        Err(err) => {
                            warn!(provider_id = %id, error = %err, "stream failed, failing over");
                            breaker.record_failure(&id);
                            last_err = Some(RequestError::Provider(err));
                            failed = true;
                            break;
                        }
                    }
                }
                if !failed {
                    breaker.record_success(&id);
                    return;
                }
            }
            yield Err(RequestError::AllProvidersFailed {
                attempted,
                source: Box::new(last_err.unwrap_or(RequestError::NoProvidersAvailable)),
            });
        };
        Ok(Box::pin(stream))
    }

    pub fn statistics(&self) -> ManagerStatistics {
        ManagerStatistics {
            total_providers: self.registry.len(),
            healthy_providers: self.registry.healthy_providers().len(),
            circuit_breaker_states: self.breaker.all_snapshots(),
        }
    }

    /// Ordered candidate list for one request. An explicit id bypasses the
    /// health and circuit filters; the breaker is still consulted per attempt
    /// in [`execute_with_retry`](Self::execute_with_retry).
    fn candidates(&self, provider_id: Option<&str>) -> Vec<Arc<dyn Provider>> {
        match provider_id {
            Some(id) => self.registry.get(id).into_iter().collect(),
            None => {
                let mut list: Vec<_> = self
                    .registry
                    .healthy_providers()
                    .into_iter()
                    .filter(|p| self.breaker.should_allow_request(&p.descriptor().id))
                    .collect();
                // Stable sort keeps registration order for equal priorities.
                list.sort_by_key(|p| std::cmp::Reverse(p.descriptor().priority));
                debug!(candidates = list.len(), "selected candidate providers");
                list
            }
        }
    }

    /// Retry loop against one provider. Each attempt re-checks the circuit
    /// and runs under `call_timeout`; delays between attempts follow the
    /// retry policy's backoff schedule.
    async fn execute_with_retry(
        &self,
        provider: &dyn Provider,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, RequestError> {
        let id = provider.descriptor().id.clone();
        let policy = &self.config.retry;
        let attempts = policy.max_attempts.max(1);

        let mut last_err = None;
        for attempt in 0..attempts {
            if !self.breaker.should_allow_request(&id) {
                return Err(RequestError::CircuitOpen(id));
            }

            let started = Instant::now();
            let outcome =
                match tokio::time::timeout(self.config.call_timeout, provider.complete(request))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Timeout {
                        elapsed_ms: self.config.call_timeout.as_millis() as u64,
                    }),
                };

            match outcome {
                Ok(mut response) => {
                    self.breaker.record_success(&id);
                    response.provider_id = id;
                    response.cached = false;
                    response.latency_ms = started.elapsed().as_millis() as u64;
                    return Ok(response);
                }
                Err(err) => {
                    debug!(provider_id = %id, attempt = attempt + 1, error = %err, "attempt failed");
                    last_err = Some(err);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(policy.delay_for(attempt)).await;
                    }
                }
            }
        }

        Err(RequestError::Provider(last_err.unwrap_or_else(|| {
            ProviderError::Other("no attempt made".into())
        })))
    }
}
