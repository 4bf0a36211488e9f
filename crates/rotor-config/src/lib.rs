//! Engine configuration loading and validation (`.rotor/config.toml`).

pub mod config;
mod config_merge;
pub mod paths;
pub mod validate;

pub use config::{
    CircuitBreakerConfig, CoordinatorConfig, IpRotationConfig, KeyPoolConfig, ProvidersConfig,
    QueueConfig, RetryConfig, RotorConfig, SessionBackend, SessionStoreConfig, VaultConfig,
};
pub use validate::validate_config;
