pub mod breaker;
pub mod cache;
pub mod manager;
pub mod providers;
pub mod registry;
pub mod types;

// Re-exports for convenience
pub use breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use cache::{CacheError, InMemoryCache, NullCache, ResponseCache, cache_key};
pub use manager::{ManagerConfig, ManagerStatistics, RequestError, RequestManager};
pub use providers::{Provider, ProviderError};
pub use registry::{ProviderRegistry, RegistryError};
pub use types::*;
