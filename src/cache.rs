//! Response cache contract plus the in-memory and null backends.
//!
//! The request manager treats every cache error as a miss/no-op: caching is a
//! performance optimization, never a correctness requirement.

use crate::types::{CompletionRequest, CompletionResponse, Message};
use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
#[error("cache error: {0}")]
pub struct CacheError(pub String);

/// Content-addressed get/set store with TTL. Both operations may fail.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CompletionResponse>, CacheError>;

    async fn set(
        &self,
        key: &str,
        response: CompletionResponse,
        ttl: Duration,
    ) -> Result<(), CacheError>;
}

/// The semantically relevant request fields, in a fixed order. Serializing
/// this struct (rather than the raw request) keeps the hash independent of
/// whitespace and of fields like `stream` that do not affect the answer.
#[derive(Serialize)]
struct KeyMaterial<'a> {
    prompt: &'a Option<String>,
    system_prompt: &'a Option<String>,
    messages: &'a [Message],
    temperature: &'a Option<f64>,
    max_tokens: &'a Option<u32>,
}

/// Deterministic cache key for a non-streaming request: SHA-256 over the
/// canonical serialization of the semantically relevant fields.
pub fn cache_key(request: &CompletionRequest) -> String {
    let material = KeyMaterial {
        prompt: &request.prompt,
        system_prompt: &request.system_prompt,
        messages: &request.messages,
        temperature: &request.temperature,
        max_tokens: &request.max_tokens,
    };
    // KeyMaterial only contains types whose serialization cannot fail.
    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}

/// Process-local cache backed by a hash map, expiring entries on read and
/// purging opportunistically on write.
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, (CompletionResponse, Instant)>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResponseCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CompletionResponse>, CacheError> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((response, expires_at)) if Instant::now() < *expires_at => {
                Ok(Some(response.clone()))
            }
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        response: CompletionResponse,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert(key.to_string(), (response, now + ttl));
        Ok(())
    }
}

/// Cache that stores nothing. Useful for disabling deduplication without
/// touching the manager's call sites.
pub struct NullCache;

#[async_trait]
impl ResponseCache for NullCache {
    async fn get(&self, _key: &str) -> Result<Option<CompletionResponse>, CacheError> {
        Ok(None)
    }

    async fn set(
        &self,
        _key: &str,
        _response: CompletionResponse,
        _ttl: Duration,
    ) -> Result<(), CacheError> {
        Ok(())
    }
}
