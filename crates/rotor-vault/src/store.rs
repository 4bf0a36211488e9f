//! Cached credential loading with retry and environment fallback.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rotor_config::VaultConfig;
use rotor_core::{Credential, RotorError};
use rotor_resilience::RetryManager;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{SecretBackend, VaultBackend};

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialSource {
    Vault,
    Environment,
}

/// Named credential slots (`primary-1`, `primary-2`, `fallback`, ...).
#[derive(Debug, Clone)]
pub struct CredentialBundle {
    pub slots: BTreeMap<String, Credential>,
    pub source: CredentialSource,
    pub loaded_at: DateTime<Utc>,
}

impl CredentialBundle {
    /// Slots in `order` that exist, or every slot except `fallback_slot`
    /// (sorted by name) when `order` is empty.
    pub fn primary(&self, order: &[String], fallback_slot: Option<&str>) -> Vec<Credential> {
        if order.is_empty() {
            return self
                .slots
                .iter()
                .filter(|(slot, _)| Some(slot.as_str()) != fallback_slot)
                .map(|(_, credential)| credential.clone())
                .collect();
        }
        order
            .iter()
            .filter_map(|slot| self.slots.get(slot).cloned())
            .collect()
    }

    pub fn slot(&self, name: &str) -> Option<&Credential> {
        self.slots.get(name)
    }
}

/// Recursively merge `patch` into `target`: objects merge key by key,
/// anything else replaces.
pub fn deep_merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

pub struct SecretStore {
    backend: Option<Arc<dyn SecretBackend>>,
    config: VaultConfig,
    retry: RetryManager,
    env: EnvLookup,
    cache: Mutex<Option<(Instant, CredentialBundle)>>,
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("backend", &self.backend.as_ref().map(|b| b.name().to_string()))
            .field("keys_path", &self.config.keys_path)
            .finish_non_exhaustive()
    }
}

impl SecretStore {
    pub fn new(backend: Option<Arc<dyn SecretBackend>>, config: VaultConfig) -> Self {
        let retry = RetryManager::new("secret-store", &config.retry);
        Self {
            backend,
            config,
            retry,
            env: Arc::new(|name: &str| std::env::var(name).ok()),
            cache: Mutex::new(None),
        }
    }

    /// Vault when `[vault].enabled`, otherwise environment variables only.
    pub fn from_config(config: &VaultConfig) -> Result<Self> {
        let backend: Option<Arc<dyn SecretBackend>> = if config.enabled {
            Some(Arc::new(VaultBackend::from_config(config)?))
        } else {
            None
        };
        Ok(Self::new(backend, config.clone()))
    }

    /// Replace how fallback environment variables are looked up.
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Arc::new(lookup);
        self
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    /// Load credential slots, served from cache while younger than
    /// `cache_ttl`. Backend failures are retried, then the environment
    /// fallback is used.
    pub async fn load_keys(&self) -> Result<CredentialBundle> {
        let mut cache = self.cache.lock().await;
        if let Some((loaded, bundle)) = cache.as_ref() {
            if loaded.elapsed() < self.config.cache_ttl() {
                return Ok(bundle.clone());
            }
        }

        let bundle = match self.load_from_backend().await {
            Ok(Some(bundle)) => bundle,
            Ok(None) => self.load_from_env()?,
            Err(err) => {
                warn!(error = %err, "Secret backend unavailable, using environment credentials");
                self.load_from_env()
                    .with_context(|| format!("Secret backend failed: {err}"))?
            }
        };
        info!(
            slots = bundle.slots.len(),
            source = ?bundle.source,
            "Loaded credentials"
        );
        *cache = Some((Instant::now(), bundle.clone()));
        Ok(bundle)
    }

    pub async fn invalidate_cache(&self) {
        *self.cache.lock().await = None;
    }

    pub async fn save_state(&self, state: &Value) -> Result<()> {
        let Some(backend) = &self.backend else {
            debug!("No secret backend; state not mirrored");
            return Ok(());
        };
        let path = self.config.state_path.as_str();
        self.retry
            .execute(|_| async move { backend.write(path, state).await })
            .await
    }

    pub async fn load_state(&self) -> Result<Option<Value>> {
        let Some(backend) = &self.backend else {
            return Ok(None);
        };
        let path = self.config.state_path.as_str();
        self.retry
            .execute(|_| async move { backend.read(path).await })
            .await
    }

    /// Deep-merge `stats` into the stored key statistics.
    pub async fn update_key_stats(&self, stats: Value) -> Result<()> {
        let Some(backend) = &self.backend else {
            debug!("No secret backend; key stats not mirrored");
            return Ok(());
        };
        let path = self.config.stats_path.as_str();
        let stats = &stats;
        self.retry
            .execute(|_| async move {
                let mut current = backend
                    .read(path)
                    .await?
                    .unwrap_or_else(|| Value::Object(Default::default()));
                deep_merge(&mut current, stats.clone());
                backend.write(path, &current).await
            })
            .await
    }

    async fn load_from_backend(&self) -> Result<Option<CredentialBundle>> {
        let Some(backend) = &self.backend else {
            return Ok(None);
        };
        let path = self.config.keys_path.as_str();
        let Some(document) = self
            .retry
            .execute(|_| async move { backend.read(path).await })
            .await?
        else {
            warn!(path, "No credentials stored in secret backend");
            return Ok(None);
        };

        let Value::Object(entries) = document else {
            return Err(RotorError::SecretStore(format!(
                "Credential document at '{path}' is not an object"
            ))
            .into());
        };
        let slots: BTreeMap<String, Credential> = entries
            .into_iter()
            .filter_map(|(slot, value)| {
                let secret = value.as_str()?.trim().to_string();
                (!secret.is_empty()).then(|| (slot.clone(), Credential::new(slot, secret)))
            })
            .collect();
        if slots.is_empty() {
            return Ok(None);
        }
        Ok(Some(CredentialBundle {
            slots,
            source: CredentialSource::Vault,
            loaded_at: Utc::now(),
        }))
    }

    fn load_from_env(&self) -> Result<CredentialBundle> {
        let slots: BTreeMap<String, Credential> = self
            .config
            .env_fallback
            .iter()
            .filter_map(|(slot, var)| {
                let secret = (self.env)(var.as_str())?.trim().to_string();
                (!secret.is_empty()).then(|| (slot.clone(), Credential::new(slot.clone(), secret)))
            })
            .collect();
        if slots.is_empty() {
            return Err(RotorError::SecretStore(
                "No credentials available from secret backend or environment".into(),
            )
            .into());
        }
        Ok(CredentialBundle {
            slots,
            source: CredentialSource::Environment,
            loaded_at: Utc::now(),
        })
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
