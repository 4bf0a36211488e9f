use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use rotor_config::VaultConfig;
use rotor_core::RotorError;
use serde_json::{Value, json};
use tracing::debug;

/// Path-addressed JSON documents.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    fn name(&self) -> &str;

    /// `None` when nothing is stored at `path`.
    async fn read(&self, path: &str) -> Result<Option<Value>>;

    async fn write(&self, path: &str, data: &Value) -> Result<()>;
}

/// HashiCorp Vault KV v2 over HTTP.
pub struct VaultBackend {
    address: String,
    mount: String,
    token: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for VaultBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultBackend")
            .field("address", &self.address)
            .field("mount", &self.mount)
            .finish_non_exhaustive()
    }
}

impl VaultBackend {
    /// Build from `[vault]`, reading the token from `token_env`.
    pub fn from_config(config: &VaultConfig) -> Result<Self> {
        let token = std::env::var(&config.token_env).map_err(|_| {
            RotorError::SecretStore(format!(
                "Vault token variable {} is not set",
                config.token_env
            ))
        })?;
        Self::new(&config.address, &config.mount, token, config.request_timeout())
    }

    pub fn new(
        address: &str,
        mount: &str,
        token: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Vault HTTP client")?;
        Ok(Self {
            address: address.trim_end_matches('/').to_string(),
            mount: mount.trim_matches('/').to_string(),
            token: token.into(),
            client,
        })
    }

    fn data_url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}/data/{}",
            self.address,
            self.mount,
            path.trim_start_matches('/')
        )
    }
}

fn backend_error(path: &str, status: StatusCode, body: &str) -> anyhow::Error {
    let snippet: String = body.chars().take(200).collect();
    RotorError::SecretStore(format!("Vault {status} for '{path}': {snippet}")).into()
}

#[async_trait]
impl SecretBackend for VaultBackend {
    fn name(&self) -> &str {
        "vault"
    }

    async fn read(&self, path: &str) -> Result<Option<Value>> {
        let url = self.data_url(path);
        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .with_context(|| format!("Vault read failed for '{path}'"))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(path, "Vault path empty");
            return Ok(None);
        }
        let body = response
            .text()
            .await
            .with_context(|| format!("Failed to read Vault response for '{path}'"))?;
        if !status.is_success() {
            return Err(backend_error(path, status, &body));
        }
        let mut envelope: Value = serde_json::from_str(&body)
            .with_context(|| format!("Vault returned invalid JSON for '{path}'"))?;
        Ok(envelope
            .get_mut("data")
            .and_then(|data| data.get_mut("data"))
            .map(Value::take))
    }

    async fn write(&self, path: &str, data: &Value) -> Result<()> {
        let url = self.data_url(path);
        let response = self
            .client
            .post(&url)
            .header("X-Vault-Token", &self.token)
            .json(&json!({ "data": data }))
            .send()
            .await
            .with_context(|| format!("Vault write failed for '{path}'"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(backend_error(path, status, &body));
        }
        Ok(())
    }
}

/// Process-local backend for tests and embedding. `fail_next(n)` makes the
/// next `n` operations fail.
#[derive(Debug, Default)]
pub struct MemorySecretBackend {
    documents: Mutex<HashMap<String, Value>>,
    failures: AtomicU32,
    operations: AtomicU32,
}

impl MemorySecretBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(self, path: &str, data: Value) -> Self {
        self.documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), data);
        self
    }

    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Total read/write calls, including injected failures.
    pub fn operations(&self) -> u32 {
        self.operations.load(Ordering::SeqCst)
    }

    pub fn document(&self, path: &str) -> Option<Value> {
        self.documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    fn check_failure(&self) -> Result<()> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RotorError::SecretStore("injected backend failure".into()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl SecretBackend for MemorySecretBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read(&self, path: &str) -> Result<Option<Value>> {
        self.check_failure()?;
        Ok(self.document(path))
    }

    async fn write(&self, path: &str, data: &Value) -> Result<()> {
        self.check_failure()?;
        self.documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), data.clone());
        Ok(())
    }
}
