use serde::{Deserialize, Serialize};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Provider identity & configuration
// ---------------------------------------------------------------------------

/// Which vendor API family a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Google,
    Custom,
}

/// Advisory rate limits for a backend. Enforced by the adapter, not this layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u32,
}

/// Static configuration for one backend.
///
/// Immutable once registered; replacing a provider means registering a new
/// descriptor under a new id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    /// Unique, stable identifier (e.g. "openai-primary").
    pub id: String,
    /// Human-friendly display name.
    pub name: String,
    pub kind: ProviderKind,
    /// Higher priority is tried first.
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
}

impl ProviderDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            priority: 0,
            rate_limit: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }
}

// ---------------------------------------------------------------------------
// Completion request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Input to a completion call. Either `prompt`, `messages`, or both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// When true the request is served by `stream_complete` and never cached.
    #[serde(default)]
    pub stream: bool,
}

impl CompletionRequest {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Default::default()
        }
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Completion response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Output of a completion call.
///
/// `cached`, `latency_ms` and `provider_id` are stamped by the request
/// manager; adapters only fill in `content`, `usage` and `model`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: Usage,
    pub latency_ms: u64,
    pub cached: bool,
    pub provider_id: String,
    pub model: String,
}

/// One fragment of a streaming completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    Delta {
        content: String,
    },
    Done {
        usage: Usage,
        model: String,
        provider_id: String,
    },
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Backoff schedule for retries against a single provider.
///
/// The delay before retry `k` (zero-based) is
/// `min(initial_delay * backoff_multiplier^k, max_delay)`, so the sequence is
/// non-decreasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per provider, including the first. At least 1.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Must be greater than 1.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after the `k`-th failed attempt (zero-based).
    pub fn delay_for(&self, k: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let factor = self.backoff_multiplier.powf(k as f64);
        // Once the factor alone reaches the cap ratio, multiplying would
        // overflow Duration for large k; the answer is max_delay either way.
        let cap = self.max_delay.as_secs_f64() / self.initial_delay.as_secs_f64();
        if !factor.is_finite() || factor >= cap {
            return self.max_delay;
        }
        self.initial_delay.mul_f64(factor).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_sequence_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(10_000));
        assert_eq!(policy.delay_for(20), Duration::from_millis(10_000));
    }

    #[test]
    fn delay_stays_capped_for_huge_attempt_indexes() {
        let policy = RetryPolicy::default();
        // Beyond ~attempt 64 the uncapped product would exceed Duration::MAX;
        // the cap must win instead of panicking.
        assert_eq!(policy.delay_for(79), Duration::from_millis(10_000));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(10_000));
    }

    #[test]
    fn zero_initial_delay_yields_zero_delays() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::ZERO,
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(100), Duration::ZERO);
    }

    #[test]
    fn delay_sequence_is_non_decreasing() {
        let policy = RetryPolicy {
            max_attempts: 8,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_millis(5000),
            backoff_multiplier: 1.7,
        };
        let mut prev = Duration::ZERO;
        for k in 0..10 {
            let d = policy.delay_for(k);
            assert!(d >= prev, "delay regressed at k={}", k);
            assert!(d <= policy.max_delay);
            prev = d;
        }
    }

    #[test]
    fn descriptor_builder_sets_fields() {
        let desc = ProviderDescriptor::new("openai-1", "OpenAI", ProviderKind::OpenAi)
            .with_priority(5)
            .with_rate_limit(RateLimit {
                requests_per_minute: 60,
                tokens_per_minute: 90_000,
            });
        assert_eq!(desc.id, "openai-1");
        assert_eq!(desc.priority, 5);
        assert_eq!(desc.rate_limit.unwrap().requests_per_minute, 60);
    }
}
