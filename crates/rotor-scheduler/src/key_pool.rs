//! Credential pool with eligibility filtering, selection strategies and
//! exhaustion handling.
//!
//! Every selection filters out keys that are rate-limited, over their daily
//! window, past `max_consecutive_errors` or marked unhealthy. When nothing is
//! eligible the pool raises [`RotorError::KeysExhausted`] carrying the
//! shortest wait until a key frees up; that class alone is retried, and once
//! the retries are spent the configured fallback credential is handed out.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rotor_config::KeyPoolConfig;
use rotor_core::{Credential, KeyMetrics, RotationReason, RotorError, SelectionStrategy};
use rotor_resilience::{RetryManager, classify};
use rotor_session::{StateStore, load_typed, update_typed};
use rotor_vault::CredentialBundle;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeySource {
    Primary,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct KeySelection {
    pub credential: Credential,
    pub source: KeySource,
}

/// Result of probing one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyHealth {
    pub id: String,
    pub fingerprint: String,
    pub healthy: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyStatus {
    pub id: String,
    pub fingerprint: String,
    pub eligible: bool,
    pub metrics: KeyMetrics,
}

/// Checks whether a credential is still accepted upstream.
#[async_trait]
pub trait KeyChecker: Send + Sync {
    async fn check(&self, credential: &Credential) -> Result<bool>;
}

/// Persisted form of the pool, stored under `key-pool/{name}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    #[serde(default)]
    pub next_index: usize,
    #[serde(default)]
    pub current: Option<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, KeyMetrics>,
}

pub fn pool_state_key(pool: &str) -> String {
    format!("key-pool/{pool}")
}

/// Read a pool's persisted metrics without loading any secrets.
pub async fn load_pool_snapshot(store: &dyn StateStore, pool: &str) -> Result<Option<PoolSnapshot>> {
    Ok(load_typed::<PoolSnapshot>(store, &pool_state_key(pool))
        .await?
        .map(|(_, snapshot)| snapshot))
}

#[derive(Debug)]
struct Entry {
    credential: Credential,
    metrics: KeyMetrics,
}

#[derive(Debug)]
struct PoolInner {
    entries: Vec<Entry>,
    /// Where the next round-robin scan starts.
    next_index: usize,
    current: Option<String>,
}

pub struct KeyPoolManager {
    config: KeyPoolConfig,
    inner: Mutex<PoolInner>,
    fallback: Option<Credential>,
    exhaustion_retry: RetryManager,
    state: Option<Arc<dyn StateStore>>,
}

impl std::fmt::Debug for KeyPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPoolManager")
            .field("pool", &self.config.name)
            .field("strategy", &self.config.strategy)
            .field("has_fallback", &self.fallback.is_some())
            .finish_non_exhaustive()
    }
}

fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive().succ_opt().unwrap_or(now.date_naive());
    tomorrow.and_hms_opt(0, 0, 0).map_or(now, |t| t.and_utc())
}

impl KeyPoolManager {
    pub fn new(
        config: KeyPoolConfig,
        credentials: Vec<Credential>,
        fallback: Option<Credential>,
    ) -> Result<Self> {
        if credentials.is_empty() {
            return Err(RotorError::InvalidConfig(format!(
                "Key pool '{}' has no primary credentials",
                config.name
            ))
            .into());
        }
        let mut seen = HashSet::new();
        for credential in &credentials {
            if !seen.insert(credential.id.as_str()) {
                return Err(RotorError::InvalidConfig(format!(
                    "Key pool '{}' lists '{}' twice",
                    config.name, credential.id
                ))
                .into());
            }
        }

        let exhaustion_retry =
            RetryManager::new(format!("key-pool:{}", config.name), &config.exhaustion_retry)
                .with_predicate(|err, _| classify(err).is_some_and(RotorError::is_exhausted));
        let entries = credentials
            .into_iter()
            .map(|credential| Entry {
                credential,
                metrics: KeyMetrics::default(),
            })
            .collect();
        Ok(Self {
            config,
            inner: Mutex::new(PoolInner {
                entries,
                next_index: 0,
                current: None,
            }),
            fallback,
            exhaustion_retry,
            state: None,
        })
    }

    /// Build from loaded secret slots: `config.slots` (or every non-fallback
    /// slot) form the pool, `config.fallback_slot` the fallback.
    pub fn from_bundle(config: KeyPoolConfig, bundle: &CredentialBundle) -> Result<Self> {
        let fallback_slot = config.fallback_slot.clone();
        let primary = bundle.primary(&config.slots, fallback_slot.as_deref());
        let fallback = fallback_slot
            .as_deref()
            .and_then(|slot| bundle.slot(slot))
            .cloned();
        if fallback_slot.is_some() && fallback.is_none() {
            warn!(pool = %config.name, slot = ?fallback_slot, "Fallback slot not present in secrets");
        }
        Self::new(config, primary, fallback)
    }

    /// Attach a state store and restore any metrics persisted for this pool.
    pub async fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Result<Self> {
        if let Some(snapshot) = load_pool_snapshot(store.as_ref(), &self.config.name).await? {
            let mut inner = self.lock();
            let mut restored = 0usize;
            for entry in inner.entries.iter_mut() {
                if let Some(metrics) = snapshot.metrics.get(&entry.credential.id) {
                    entry.metrics = metrics.clone();
                    restored += 1;
                }
            }
            if snapshot.next_index < inner.entries.len() {
                inner.next_index = snapshot.next_index;
            }
            let current = snapshot
                .current
                .filter(|id| inner.entries.iter().any(|e| &e.credential.id == id));
            inner.current = current;
            debug!(pool = %self.config.name, restored, "Restored key pool metrics");
        }
        self.state = Some(store);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_eligible(&self, metrics: &KeyMetrics, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        let window = if metrics.window_started_on == Some(today) {
            metrics.window_requests
        } else {
            0
        };
        metrics.healthy
            && !metrics.is_rate_limited_at(now)
            && metrics.consecutive_errors < self.config.max_consecutive_errors
            && self.config.max_requests_per_key.is_none_or(|max| window < max)
    }

    /// How long until `metrics` becomes eligible by the passage of time
    /// alone. `None` for keys that need a success or health check instead.
    fn wait_until_eligible(&self, metrics: &KeyMetrics, now: DateTime<Utc>) -> Option<Duration> {
        if !metrics.healthy || metrics.consecutive_errors >= self.config.max_consecutive_errors {
            return None;
        }
        let mut until = now;
        if let Some(limited) = metrics.rate_limited_until.filter(|t| *t > now) {
            until = until.max(limited);
        }
        let window_full = self.config.max_requests_per_key.is_some_and(|max| {
            metrics.window_started_on == Some(now.date_naive()) && metrics.window_requests >= max
        });
        if window_full {
            until = until.max(next_utc_midnight(now));
        }
        (until - now).to_std().ok()
    }

    /// Pick a key at `now`, avoiding `avoid` unless it is the only eligible
    /// one. Only the cursor and the current key change; requests are charged
    /// when their outcome is recorded.
    fn select_at(&self, now: DateTime<Utc>, avoid: Option<&str>) -> Result<Credential> {
        let mut inner = self.lock();
        let total = inner.entries.len();
        let mut eligible: Vec<usize> = (0..total)
            .filter(|&i| self.is_eligible(&inner.entries[i].metrics, now))
            .collect();
        if eligible.len() > 1 {
            if let Some(avoid) = avoid {
                eligible.retain(|&i| inner.entries[i].credential.id != avoid);
            }
        }

        if eligible.is_empty() {
            let wait = inner
                .entries
                .iter()
                .filter_map(|e| self.wait_until_eligible(&e.metrics, now))
                .min();
            return Err(RotorError::KeysExhausted {
                pool: self.config.name.clone(),
                wait_ms: wait.map(|w| w.as_millis() as u64),
            }
            .into());
        }

        let chosen = match self.config.strategy {
            SelectionStrategy::RoundRobin => {
                let start = inner.next_index % total;
                (0..total)
                    .map(|offset| (start + offset) % total)
                    .find(|i| eligible.contains(i))
                    .unwrap_or(eligible[0])
            }
            SelectionStrategy::LeastUsed => eligible
                .iter()
                .copied()
                .min_by_key(|&i| inner.entries[i].metrics.total_requests)
                .unwrap_or(eligible[0]),
            SelectionStrategy::Random => eligible[rand::thread_rng().gen_range(0..eligible.len())],
            SelectionStrategy::LowestErrorRate => eligible
                .iter()
                .copied()
                .min_by(|&a, &b| {
                    inner.entries[a]
                        .metrics
                        .error_rate()
                        .total_cmp(&inner.entries[b].metrics.error_rate())
                })
                .unwrap_or(eligible[0]),
        };

        inner.next_index = (chosen + 1) % total;
        let credential = inner.entries[chosen].credential.clone();
        inner.current = Some(credential.id.clone());
        Ok(credential)
    }

    async fn acquire(&self, avoid: Option<String>) -> Result<KeySelection> {
        let result = self
            .exhaustion_retry
            .execute(|_| std::future::ready(self.select_at(Utc::now(), avoid.as_deref())))
            .await;
        match result {
            Ok(credential) => {
                debug!(
                    pool = %self.config.name,
                    key = %credential.id,
                    fingerprint = %credential.fingerprint(),
                    "Selected key"
                );
                self.persist().await;
                Ok(KeySelection {
                    credential,
                    source: KeySource::Primary,
                })
            }
            Err(err) if classify(&err).is_some_and(RotorError::is_exhausted) => {
                let Some(fallback) = &self.fallback else {
                    return Err(err);
                };
                warn!(
                    pool = %self.config.name,
                    key = %fallback.id,
                    fingerprint = %fallback.fingerprint(),
                    "Primary pool exhausted, using fallback key"
                );
                self.lock().current = Some(fallback.id.clone());
                Ok(KeySelection {
                    credential: fallback.clone(),
                    source: KeySource::Fallback,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Next key by the configured strategy.
    pub async fn get_next_key(&self) -> Result<KeySelection> {
        self.acquire(None).await
    }

    /// Move off the current key. The current key is reused only when it is
    /// the sole eligible one.
    pub async fn rotate_key(&self, reason: RotationReason) -> Result<KeySelection> {
        let previous = self.current_key();
        let selection = self.acquire(previous.clone()).await?;
        info!(
            pool = %self.config.name,
            reason = %reason,
            previous = previous.as_deref().unwrap_or("-"),
            current = %selection.credential.id,
            "Rotated key"
        );
        Ok(selection)
    }

    /// Apply `update` to the metrics of `id`. The fallback key has no
    /// metrics; updates for it are ignored.
    async fn update_metrics<F>(&self, id: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut KeyMetrics),
    {
        {
            let mut inner = self.lock();
            match inner.entries.iter_mut().find(|e| e.credential.id == id) {
                Some(entry) => update(&mut entry.metrics),
                None if self.fallback.as_ref().is_some_and(|f| f.id == id) => return Ok(()),
                None => bail!("Unknown key '{id}' in pool '{}'", self.config.name),
            }
        }
        self.persist().await;
        Ok(())
    }

    /// Take `id` out of rotation until `retry_after` (or the configured
    /// default cooldown) has passed. A key that is already limited keeps the
    /// later of the two deadlines.
    pub async fn mark_key_exhausted(
        &self,
        id: &str,
        reason: &str,
        retry_after: Option<Duration>,
    ) -> Result<()> {
        self.limit_key(id, reason, retry_after, false).await
    }

    /// A request made with `id` was rejected as rate limited: charge it and
    /// take the key out of rotation.
    pub async fn record_rate_limited(
        &self,
        id: &str,
        reason: &str,
        retry_after: Option<Duration>,
    ) -> Result<()> {
        self.limit_key(id, reason, retry_after, true).await
    }

    async fn limit_key(
        &self,
        id: &str,
        reason: &str,
        retry_after: Option<Duration>,
        counted: bool,
    ) -> Result<()> {
        let cooldown = retry_after.unwrap_or_else(|| self.config.default_rate_limit_cooldown());
        let now = Utc::now();
        let until = now
            + chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::days(365));
        warn!(
            pool = %self.config.name,
            key = id,
            reason,
            cooldown_ms = cooldown.as_millis() as u64,
            "Key rate limited"
        );
        self.update_metrics(id, |m| {
            // Re-marking a key that is still limited is the same event.
            if counted || !m.is_rate_limited_at(now) {
                m.rate_limit_count += 1;
            }
            if counted {
                m.count_request(now);
            }
            m.rate_limited_until = Some(m.rate_limited_until.map_or(until, |t| t.max(until)));
            m.last_error = Some(reason.to_string());
            m.last_error_at = Some(now);
        })
        .await
    }

    pub async fn record_success(&self, id: &str) -> Result<()> {
        self.update_metrics(id, |m| {
            m.count_request(Utc::now());
            m.successful_requests += 1;
            m.consecutive_errors = 0;
        })
        .await
    }

    pub async fn record_failure(&self, id: &str, error: &str) -> Result<()> {
        let max = self.config.max_consecutive_errors;
        let pool = self.config.name.clone();
        self.update_metrics(id, |m| {
            m.count_request(Utc::now());
            m.failed_requests += 1;
            m.consecutive_errors += 1;
            m.last_error = Some(error.to_string());
            m.last_error_at = Some(Utc::now());
            if m.consecutive_errors == max {
                warn!(pool = %pool, key = id, errors = max, "Key disabled after consecutive errors");
            }
        })
        .await
    }

    /// Check every primary key, bounded by `health_check_timeout` each.
    /// Healthy keys get their error streak cleared.
    pub async fn run_health_checks(&self, checker: &dyn KeyChecker) -> Vec<KeyHealth> {
        let credentials: Vec<Credential> = self
            .lock()
            .entries
            .iter()
            .map(|e| e.credential.clone())
            .collect();
        let timeout = self.config.health_check_timeout();

        let mut results = Vec::with_capacity(credentials.len());
        for credential in credentials {
            let (healthy, error) = match tokio::time::timeout(timeout, checker.check(&credential)).await {
                Ok(Ok(true)) => (true, None),
                Ok(Ok(false)) => (false, Some("check rejected key".to_string())),
                Ok(Err(err)) => (false, Some(format!("{err:#}"))),
                Err(_) => (
                    false,
                    Some(RotorError::timeout("key health check", timeout).to_string()),
                ),
            };
            if let Some(entry) = self
                .lock()
                .entries
                .iter_mut()
                .find(|e| e.credential.id == credential.id)
            {
                entry.metrics.healthy = healthy;
                if healthy {
                    entry.metrics.consecutive_errors = 0;
                } else {
                    entry.metrics.last_error = error.clone();
                    entry.metrics.last_error_at = Some(Utc::now());
                }
            }
            if !healthy {
                warn!(pool = %self.config.name, key = %credential.id, error = ?error, "Key failed health check");
            }
            results.push(KeyHealth {
                fingerprint: credential.fingerprint(),
                id: credential.id,
                healthy,
                error,
            });
        }
        self.persist().await;
        results
    }

    pub fn current_key(&self) -> Option<String> {
        self.lock().current.clone()
    }

    pub fn eligible_count(&self) -> usize {
        let now = Utc::now();
        self.lock()
            .entries
            .iter()
            .filter(|e| self.is_eligible(&e.metrics, now))
            .count()
    }

    pub fn metrics(&self) -> Vec<KeyStatus> {
        let now = Utc::now();
        self.lock()
            .entries
            .iter()
            .map(|e| KeyStatus {
                id: e.credential.id.clone(),
                fingerprint: e.credential.fingerprint(),
                eligible: self.is_eligible(&e.metrics, now),
                metrics: e.metrics.clone(),
            })
            .collect()
    }

    /// Per-key counters shaped for the secret store's stats record.
    pub fn stats_json(&self) -> Value {
        let stats: serde_json::Map<String, Value> = self
            .lock()
            .entries
            .iter()
            .map(|e| {
                let m = &e.metrics;
                (
                    e.credential.id.clone(),
                    json!({
                        "fingerprint": e.credential.fingerprint(),
                        "total_requests": m.total_requests,
                        "successful_requests": m.successful_requests,
                        "failed_requests": m.failed_requests,
                        "rate_limit_count": m.rate_limit_count,
                        "healthy": m.healthy,
                        "last_used_at": m.last_used_at,
                    }),
                )
            })
            .collect();
        Value::Object(stats)
    }

    fn snapshot(&self) -> PoolSnapshot {
        let inner = self.lock();
        PoolSnapshot {
            next_index: inner.next_index,
            current: inner.current.clone(),
            metrics: inner
                .entries
                .iter()
                .map(|e| (e.credential.id.clone(), e.metrics.clone()))
                .collect(),
        }
    }

    async fn persist(&self) {
        let Some(store) = &self.state else {
            return;
        };
        let snapshot = self.snapshot();
        let key = pool_state_key(&self.config.name);
        let written = update_typed::<PoolSnapshot, _, _>(store.as_ref(), &key, |stored| {
            *stored = snapshot.clone();
            Ok(())
        })
        .await;
        if let Err(err) = written {
            warn!(pool = %self.config.name, error = %err, "Failed to persist key pool state");
        }
    }
}

#[cfg(test)]
#[path = "key_pool_tests.rs"]
mod tests;
