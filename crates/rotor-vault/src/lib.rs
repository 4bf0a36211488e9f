//! Credential and state storage in a secret-management backend (Vault KV v2),
//! with caching, retry and an environment-variable fallback.

pub mod backend;
pub mod store;

pub use backend::{MemorySecretBackend, SecretBackend, VaultBackend};
pub use store::{CredentialBundle, CredentialSource, SecretStore, deep_merge};
