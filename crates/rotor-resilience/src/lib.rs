//! Resilience primitives: retry with backoff, circuit breaking and a leased
//! priority work queue.

pub mod circuit_breaker;
pub mod queue;
pub mod retry;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
pub use queue::{QueueEvent, QueueItem, QueueManager, QueueStats, QueueStatus};
pub use retry::{RetryManager, classify, find_cause};
