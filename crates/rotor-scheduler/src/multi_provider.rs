//! Ranked fallback over pluggable solving providers.
//!
//! Providers that support a request type are ordered by
//! `cost_per_solve + preference_index * preference_weight` and tried in turn
//! until one succeeds. Each provider runs at most one task at a time; calls
//! go through its circuit breaker when breakers are enabled, otherwise
//! through the shared retry policy. With a key pool attached, every call
//! carries the pool's next credential and its outcome is recorded on that
//! key. A provider's daily quota is charged only by successful solves.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rotor_config::{CircuitBreakerConfig, ProvidersConfig, RetryConfig};
use rotor_core::{
    AgentResult, ConfidenceScorer, ConsensusDecision, ConsensusEngine, Credential, RotorError,
};
use rotor_resilience::{
    BreakerSnapshot, CircuitBreaker, CircuitState, RetryManager, classify, find_cause,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::key_pool::KeyPoolManager;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveRequest {
    /// Request type, matched against `supported_types`.
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl SolveRequest {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub answer: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SolveOutcome {
    pub provider: String,
    pub solution: Solution,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(value.as_millis() as u64)
}

#[async_trait]
pub trait SolveProvider: Send + Sync {
    fn name(&self) -> &str;

    fn cost_per_solve(&self) -> f64;

    fn supported_types(&self) -> Vec<String>;

    fn supports(&self, kind: &str) -> bool {
        self.supported_types().iter().any(|t| t == kind)
    }

    /// Whether the provider has what it needs to run, e.g. an endpoint or
    /// its own API key.
    fn is_configured(&self) -> bool {
        true
    }

    /// `credential` is the key pool's pick when a pool is attached.
    async fn solve(
        &self,
        request: &SolveRequest,
        credential: Option<&Credential>,
    ) -> Result<Solution>;

    async fn health_check(&self) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderQuota {
    pub name: String,
    pub configured: bool,
    pub supported_types: Vec<String>,
    /// Successful solves since UTC midnight.
    pub requests_today: u64,
    pub daily_limit: Option<u64>,
    /// `None` when unlimited.
    pub remaining: Option<u64>,
    pub cost_per_solve: f64,
    pub circuit: Option<CircuitState>,
    /// Configured, under quota and not behind an open circuit.
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub name: String,
    pub healthy: bool,
    pub error: Option<String>,
}

/// Every provider's answer plus the reconciled decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsensusOutcome {
    pub decision: ConsensusDecision,
    pub outcomes: Vec<SolveOutcome>,
    /// `(provider, error)` for providers that failed.
    pub errors: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct DailyUsage {
    day: Option<NaiveDate>,
    count: u64,
}

struct Slot {
    provider: Arc<dyn SolveProvider>,
    breaker: Option<CircuitBreaker>,
    exclusive: tokio::sync::Mutex<()>,
    usage: Mutex<DailyUsage>,
    daily_limit: Option<u64>,
    score: f64,
}

impl Slot {
    fn name(&self) -> &str {
        self.provider.name()
    }

    fn used_today(&self, today: NaiveDate) -> u64 {
        let usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        if usage.day == Some(today) { usage.count } else { 0 }
    }

    fn has_quota(&self, today: NaiveDate) -> bool {
        self.daily_limit
            .is_none_or(|limit| self.used_today(today) < limit)
    }

    fn record_use(&self, today: NaiveDate) {
        let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        if usage.day != Some(today) {
            usage.day = Some(today);
            usage.count = 0;
        }
        usage.count += 1;
    }

    fn circuit_open(&self) -> bool {
        self.breaker
            .as_ref()
            .is_some_and(|b| b.state() == CircuitState::Open)
    }

    fn is_available(&self, today: NaiveDate) -> bool {
        self.provider.is_configured() && self.has_quota(today) && !self.circuit_open()
    }
}

/// Run one provider exclusively, through its breaker or the retry policy.
async fn run_slot(
    slot: &Slot,
    request: &SolveRequest,
    retry: &RetryManager,
    keys: Option<&KeyPoolManager>,
) -> Result<(Solution, Duration)> {
    let _exclusive = slot.exclusive.lock().await;
    // Quota may have been used up while waiting for the slot.
    if !slot.has_quota(Utc::now().date_naive()) {
        return Err(RotorError::ProviderFailed {
            provider: slot.name().to_string(),
            message: "daily limit reached".to_string(),
        }
        .into());
    }
    let credential = match keys {
        Some(keys) => Some(keys.get_next_key().await?.credential),
        None => None,
    };
    let started = Instant::now();
    let result = match &slot.breaker {
        Some(breaker) => {
            breaker
                .execute(|| slot.provider.solve(request, credential.as_ref()))
                .await
        }
        None => {
            retry
                .execute(|_| slot.provider.solve(request, credential.as_ref()))
                .await
        }
    };
    if let (Some(keys), Some(credential)) = (keys, &credential) {
        record_key_outcome(keys, &credential.id, &result).await;
    }
    let solution = result?;
    slot.record_use(Utc::now().date_naive());
    Ok((solution, started.elapsed()))
}

async fn record_key_outcome(keys: &KeyPoolManager, id: &str, result: &Result<Solution>) {
    let recorded = match result {
        Ok(_) => keys.record_success(id).await,
        // The breaker rejected the call before anything went upstream.
        Err(err) if find_cause(err, |e| matches!(e, RotorError::CircuitOpen { .. })).is_some() => {
            return;
        }
        Err(err) => match find_cause(err, RotorError::is_rate_limited) {
            Some(RotorError::RateLimited {
                message,
                retry_after_ms,
                ..
            }) => {
                keys.record_rate_limited(id, message, retry_after_ms.map(Duration::from_millis))
                    .await
            }
            _ => keys.record_failure(id, &format!("{err:#}")).await,
        },
    };
    if let Err(err) = recorded {
        warn!(key = id, error = %err, "Failed to record key outcome");
    }
}

pub struct MultiProvider {
    slots: Vec<Arc<Slot>>,
    keys: Option<Arc<KeyPoolManager>>,
    retry: RetryManager,
    consensus: ConsensusEngine,
    health_timeout: Duration,
}

impl std::fmt::Debug for MultiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.slots.iter().map(|s| s.name()).collect();
        f.debug_struct("MultiProvider")
            .field("providers", &names)
            .finish_non_exhaustive()
    }
}

impl MultiProvider {
    pub fn new(
        providers: Vec<Arc<dyn SolveProvider>>,
        config: &ProvidersConfig,
        breaker: &CircuitBreakerConfig,
        retry: &RetryConfig,
    ) -> Self {
        let preference_index = |name: &str| {
            config
                .preference
                .iter()
                .position(|p| p == name)
                .unwrap_or(config.preference.len())
        };
        let mut slots: Vec<Arc<Slot>> = providers
            .into_iter()
            .map(|provider| {
                let name = provider.name().to_string();
                let score = provider.cost_per_solve()
                    + preference_index(&name) as f64 * config.preference_weight;
                Arc::new(Slot {
                    breaker: breaker
                        .enabled
                        .then(|| CircuitBreaker::new(format!("provider:{name}"), breaker)),
                    exclusive: tokio::sync::Mutex::new(()),
                    usage: Mutex::new(DailyUsage::default()),
                    daily_limit: config.daily_limits.get(&name).copied(),
                    score,
                    provider,
                })
            })
            .collect();
        slots.sort_by(|a, b| a.score.total_cmp(&b.score));

        let retry = RetryManager::new("providers", retry).with_predicate(|err, _| {
            !matches!(
                classify(err),
                Some(
                    RotorError::Timeout { .. }
                        | RotorError::InvalidConfig(_)
                        | RotorError::RateLimited { .. }
                        | RotorError::CircuitOpen { .. }
                )
            )
        });
        let consensus = ConsensusEngine::new(
            ConfidenceScorer::default(),
            config.consensus_min_confidence,
            config.consensus_min_agreement,
        );
        Self {
            slots,
            keys: None,
            retry,
            consensus,
            health_timeout: config.health_check_timeout(),
        }
    }

    /// Hand every provider call a credential from `keys`.
    pub fn with_key_pool(mut self, keys: Arc<KeyPoolManager>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Provider names in ranking order.
    pub fn ranking(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.name().to_string()).collect()
    }

    fn supporting(&self, kind: &str) -> Result<Vec<Arc<Slot>>> {
        let slots: Vec<Arc<Slot>> = self
            .slots
            .iter()
            .filter(|s| s.provider.supports(kind))
            .cloned()
            .collect();
        if slots.is_empty() {
            return Err(RotorError::NoProviderForType(kind.to_string()).into());
        }
        Ok(slots)
    }

    /// Try supporting providers in rank order; first success wins. When all
    /// fail, the last provider's error is kept as the source of
    /// [`RotorError::AllProvidersFailed`].
    pub async fn solve(&self, request: &SolveRequest) -> Result<SolveOutcome> {
        let today = Utc::now().date_naive();
        let mut attempted = 0usize;
        let mut last: Option<(String, anyhow::Error)> = None;

        for slot in self.supporting(&request.kind)? {
            if !slot.provider.is_configured() {
                debug!(provider = %slot.name(), "Provider not configured, skipping");
                continue;
            }
            if !slot.has_quota(today) {
                debug!(provider = %slot.name(), "Daily limit reached, skipping provider");
                continue;
            }
            attempted += 1;
            match run_slot(&slot, request, &self.retry, self.keys.as_deref()).await {
                Ok((solution, elapsed)) => {
                    info!(
                        provider = %slot.name(),
                        kind = %request.kind,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Solved"
                    );
                    return Ok(SolveOutcome {
                        provider: slot.name().to_string(),
                        solution,
                        elapsed,
                    });
                }
                Err(err) => {
                    warn!(provider = %slot.name(), error = %err, "Provider failed, trying next");
                    last = Some((slot.name().to_string(), err));
                }
            }
        }
        Err(match last {
            Some((provider, err)) => {
                let summary = RotorError::AllProvidersFailed {
                    attempted,
                    last_error: format!("{provider}: {err:#}"),
                };
                err.context(summary)
            }
            None => RotorError::AllProvidersFailed {
                attempted,
                last_error: "no configured provider had quota left today".to_string(),
            }
            .into(),
        })
    }

    /// Ask every supporting provider concurrently and reconcile the answers.
    pub async fn solve_with_consensus(&self, request: &SolveRequest) -> Result<ConsensusOutcome> {
        let today = Utc::now().date_naive();
        let mut tasks = JoinSet::new();
        for slot in self.supporting(&request.kind)? {
            if !slot.provider.is_configured() || !slot.has_quota(today) {
                continue;
            }
            let retry = self.retry.clone();
            let keys = self.keys.clone();
            let request = request.clone();
            tasks.spawn(async move {
                let result = run_slot(&slot, &request, &retry, keys.as_deref()).await;
                (slot.name().to_string(), result)
            });
        }

        let mut outcomes = Vec::new();
        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((provider, Ok((solution, elapsed)))) => outcomes.push(SolveOutcome {
                    provider,
                    solution,
                    elapsed,
                }),
                Ok((provider, Err(err))) => errors.push((provider, format!("{err:#}"))),
                Err(err) => errors.push(("<task>".to_string(), err.to_string())),
            }
        }
        outcomes.sort_by(|a, b| a.provider.cmp(&b.provider));
        errors.sort();

        let results: Vec<AgentResult> = outcomes
            .iter()
            .map(|o| {
                let mut result =
                    AgentResult::new(&o.provider, &o.solution.answer, o.solution.confidence);
                result.solve_time = o.elapsed;
                result
            })
            .collect();
        let decision = self.consensus.compare_answers(&results);
        info!(
            kind = %request.kind,
            answers = outcomes.len(),
            failures = errors.len(),
            action = ?decision.action,
            "Consensus reached"
        );
        Ok(ConsensusOutcome {
            decision,
            outcomes,
            errors,
        })
    }

    pub fn quota_status(&self) -> Vec<ProviderQuota> {
        let today = Utc::now().date_naive();
        self.slots
            .iter()
            .map(|slot| {
                let used = slot.used_today(today);
                ProviderQuota {
                    name: slot.name().to_string(),
                    configured: slot.provider.is_configured(),
                    supported_types: slot.provider.supported_types(),
                    requests_today: used,
                    daily_limit: slot.daily_limit,
                    remaining: slot.daily_limit.map(|limit| limit.saturating_sub(used)),
                    cost_per_solve: slot.provider.cost_per_solve(),
                    circuit: slot.breaker.as_ref().map(CircuitBreaker::state),
                    available: slot.is_available(today),
                }
            })
            .collect()
    }

    /// Best-ranked available provider for `kind`.
    pub fn recommended_provider(&self, kind: &str) -> Option<String> {
        let today = Utc::now().date_naive();
        self.slots
            .iter()
            .find(|s| s.provider.supports(kind) && s.is_available(today))
            .map(|s| s.name().to_string())
    }

    pub async fn health_check_all(&self) -> Vec<ProviderHealth> {
        let mut report = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let (healthy, error) =
                match tokio::time::timeout(self.health_timeout, slot.provider.health_check()).await {
                    Ok(Ok(true)) => (true, None),
                    Ok(Ok(false)) => (false, Some("health check reported unhealthy".to_string())),
                    Ok(Err(err)) => (false, Some(format!("{err:#}"))),
                    Err(_) => (
                        false,
                        Some(RotorError::timeout("provider health check", self.health_timeout).to_string()),
                    ),
                };
            report.push(ProviderHealth {
                name: slot.name().to_string(),
                healthy,
                error,
            });
        }
        report
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.slots
            .iter()
            .filter_map(|s| s.breaker.as_ref().map(CircuitBreaker::snapshot))
            .collect()
    }

    /// Successful solves today by provider name.
    pub fn usage(&self) -> BTreeMap<String, u64> {
        let today = Utc::now().date_naive();
        self.slots
            .iter()
            .map(|s| (s.name().to_string(), s.used_today(today)))
            .collect()
    }
}

#[cfg(test)]
#[path = "multi_provider_tests.rs"]
mod tests;
