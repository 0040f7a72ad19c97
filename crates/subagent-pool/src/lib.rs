//! Sandboxed subagent container pool: admission control (rate limiter +
//! circuit breaker + per-worker in-flight cap), worker lifecycle, request
//! correlation over a shared duplex stream, and the task executor that
//! ties them together.
//!
//! The injection sanitizer (component C8) lives in `subagent-protocol`
//! instead, so both this crate and the `subagent-worker` binary link the
//! identical detection/redaction logic.

pub mod circuit_breaker;
pub mod config;
pub mod container;
pub mod error;
pub mod executor;
pub mod pool;
pub mod rate_limiter;
pub mod secrets;
pub mod worker;

pub use circuit_breaker::{CircuitBreaker, CircuitDecision};
pub use config::{PoolConfig, PullPolicy};
pub use container::{container_env, AttachedStream, ContainerAdapter, FakeAdapter, InspectResult};
pub use error::{AdapterError, AdapterOp, PoolError, SubagentErrorCode};
pub use executor::execute_task;
pub use pool::{Pool, PoolMetrics, WorkerHealth};
pub use rate_limiter::RateLimiter;
pub use secrets::{InMemorySecretStore, SecretStore};
pub use worker::{PendingEntry, Worker, WorkerStatus};

#[cfg(feature = "docker")]
pub use container::docker::DockerAdapter;
