use anyhow::{Context, Result};
use rotor_core::SelectionStrategy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config_merge::{merge_toml_values, warn_unknown_sections};
use crate::paths;

/// Top-level engine configuration.
///
/// Every section and field has a serde default, so an empty file (or no
/// file at all) yields a working configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RotorConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub key_pool: KeyPoolConfig,
    #[serde(default)]
    pub ip_rotation: IpRotationConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub session_store: SessionStoreConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

/// Exponential backoff settings shared by every retrying component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fraction of `base_delay_ms` added as random jitter, in `[0, 1]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter() -> f64 {
    0.3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Wrap each provider in a breaker. When false providers use the retry policy.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_breaker_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            cooldown_ms: default_breaker_cooldown_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

fn default_true() -> bool {
    true
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_breaker_cooldown_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_visibility_timeout_ms")]
    pub visibility_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub dead_letter_enabled: bool,
    /// Return items whose lease expired to pending (off: only an event is emitted).
    #[serde(default)]
    pub requeue_expired_leases: bool,
    /// How many completed items, and separately how many terminally failed
    /// items when dead-lettering is off, are kept for inspection.
    #[serde(default = "default_completed_retention")]
    pub completed_retention: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_queue_max_retries(),
            visibility_timeout_ms: default_visibility_timeout_ms(),
            dead_letter_enabled: true,
            requeue_expired_leases: false,
            completed_retention: default_completed_retention(),
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }
}

fn default_queue_max_retries() -> u32 {
    3
}
fn default_visibility_timeout_ms() -> u64 {
    300_000
}
fn default_completed_retention() -> usize {
    1_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPoolConfig {
    /// Pool name used in logs, errors and state keys.
    #[serde(default = "default_pool_name")]
    pub name: String,
    #[serde(default)]
    pub strategy: SelectionStrategy,
    /// Per-key daily request cap. `None` means unlimited.
    #[serde(default)]
    pub max_requests_per_key: Option<u64>,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    /// Cooldown applied by `mark_key_exhausted` when no retry-after is known.
    #[serde(default = "default_rate_limit_cooldown_ms")]
    pub default_rate_limit_cooldown_ms: u64,
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,
    /// Retry policy for the exhausted-pool case.
    #[serde(default)]
    pub exhaustion_retry: RetryConfig,
    /// Secret slot returned when the primary pool stays exhausted.
    #[serde(default)]
    pub fallback_slot: Option<String>,
    /// Secret slots that make up the primary pool. Empty = every non-fallback slot.
    #[serde(default)]
    pub slots: Vec<String>,
}

impl Default for KeyPoolConfig {
    fn default() -> Self {
        Self {
            name: default_pool_name(),
            strategy: SelectionStrategy::default(),
            max_requests_per_key: None,
            max_consecutive_errors: default_max_consecutive_errors(),
            default_rate_limit_cooldown_ms: default_rate_limit_cooldown_ms(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
            exhaustion_retry: RetryConfig::default(),
            fallback_slot: None,
            slots: Vec::new(),
        }
    }
}

impl KeyPoolConfig {
    pub fn default_rate_limit_cooldown(&self) -> Duration {
        Duration::from_millis(self.default_rate_limit_cooldown_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

fn default_pool_name() -> String {
    "primary".to_string()
}
fn default_max_consecutive_errors() -> u32 {
    3
}
fn default_rate_limit_cooldown_ms() -> u64 {
    60_000
}
fn default_health_check_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpRotationConfig {
    #[serde(default = "default_min_requests")]
    pub min_requests_before_rotation: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests_before_rotation: u64,
    /// Idle period after every identity change, drawn uniformly in minutes.
    #[serde(default = "default_min_pause_minutes")]
    pub min_pause_minutes: u64,
    #[serde(default = "default_max_pause_minutes")]
    pub max_pause_minutes: u64,
    /// Append old->new identity bindings to `bindings.jsonl` in the state dir.
    #[serde(default = "default_true")]
    pub audit_bindings: bool,
}

impl Default for IpRotationConfig {
    fn default() -> Self {
        Self {
            min_requests_before_rotation: default_min_requests(),
            max_requests_before_rotation: default_max_requests(),
            min_pause_minutes: default_min_pause_minutes(),
            max_pause_minutes: default_max_pause_minutes(),
            audit_bindings: true,
        }
    }
}

fn default_min_requests() -> u64 {
    50
}
fn default_max_requests() -> u64 {
    150
}
fn default_min_pause_minutes() -> u64 {
    2
}
fn default_max_pause_minutes() -> u64 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Key under which this process persists its state. Defaults to `default`.
    #[serde(default = "default_process_id")]
    pub process_id: String,
    #[serde(default = "default_rotation_cooldown_ms")]
    pub rotation_cooldown_ms: u64,
    /// A persisted in-progress marker older than this is treated as abandoned.
    #[serde(default = "default_rotation_lock_timeout_ms")]
    pub rotation_lock_timeout_ms: u64,
    #[serde(default = "default_rotation_interval_min_ms")]
    pub rotation_interval_min_ms: u64,
    #[serde(default = "default_rotation_interval_max_ms")]
    pub rotation_interval_max_ms: u64,
    #[serde(default = "default_session_restore_timeout_ms")]
    pub session_restore_timeout_ms: u64,
    /// Resume the worker if a later phase fails after it was paused.
    #[serde(default)]
    pub resume_worker_on_failure: bool,
    /// Start the interval-based rotation loop together with the coordinator.
    #[serde(default)]
    pub scheduled_rotation: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            process_id: default_process_id(),
            rotation_cooldown_ms: default_rotation_cooldown_ms(),
            rotation_lock_timeout_ms: default_rotation_lock_timeout_ms(),
            rotation_interval_min_ms: default_rotation_interval_min_ms(),
            rotation_interval_max_ms: default_rotation_interval_max_ms(),
            session_restore_timeout_ms: default_session_restore_timeout_ms(),
            resume_worker_on_failure: false,
            scheduled_rotation: false,
        }
    }
}

impl CoordinatorConfig {
    pub fn rotation_cooldown(&self) -> Duration {
        Duration::from_millis(self.rotation_cooldown_ms)
    }

    pub fn rotation_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.rotation_lock_timeout_ms)
    }

    pub fn session_restore_timeout(&self) -> Duration {
        Duration::from_millis(self.session_restore_timeout_ms)
    }
}

fn default_process_id() -> String {
    "default".to_string()
}
fn default_rotation_cooldown_ms() -> u64 {
    60_000
}
fn default_rotation_lock_timeout_ms() -> u64 {
    600_000
}
fn default_rotation_interval_min_ms() -> u64 {
    30 * 60_000
}
fn default_rotation_interval_max_ms() -> u64 {
    60 * 60_000
}
fn default_session_restore_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionBackend {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStoreConfig {
    #[serde(default)]
    pub backend: SessionBackend,
    /// Snapshots older than this are treated as missing. `None` keeps them forever.
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: Option<u64>,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            backend: SessionBackend::default(),
            ttl_secs: default_session_ttl_secs(),
        }
    }
}

impl SessionStoreConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

fn default_session_ttl_secs() -> Option<u64> {
    Some(24 * 60 * 60)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_vault_address")]
    pub address: String,
    /// KV v2 mount point.
    #[serde(default = "default_vault_mount")]
    pub mount: String,
    #[serde(default = "default_keys_path")]
    pub keys_path: String,
    #[serde(default = "default_state_path")]
    pub state_path: String,
    #[serde(default = "default_stats_path")]
    pub stats_path: String,
    /// Environment variable holding the Vault token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Slot name -> environment variable used when Vault is unavailable.
    #[serde(default)]
    pub env_fallback: BTreeMap<String, String>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_vault_address(),
            mount: default_vault_mount(),
            keys_path: default_keys_path(),
            state_path: default_state_path(),
            stats_path: default_stats_path(),
            token_env: default_token_env(),
            cache_ttl_ms: default_cache_ttl_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            retry: RetryConfig::default(),
            env_fallback: BTreeMap::new(),
        }
    }
}

impl VaultConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_vault_address() -> String {
    "http://127.0.0.1:8200".to_string()
}
fn default_vault_mount() -> String {
    "secret".to_string()
}
fn default_keys_path() -> String {
    "rotor/keys".to_string()
}
fn default_state_path() -> String {
    "rotor/state".to_string()
}
fn default_stats_path() -> String {
    "rotor/key-stats".to_string()
}
fn default_token_env() -> String {
    "VAULT_TOKEN".to_string()
}
fn default_cache_ttl_ms() -> u64 {
    30_000
}
fn default_request_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Provider names in order of preference; unlisted providers rank last.
    #[serde(default)]
    pub preference: Vec<String>,
    /// Score added per preference position on top of `cost_per_solve`.
    #[serde(default = "default_preference_weight")]
    pub preference_weight: f64,
    /// Per-provider daily request cap.
    #[serde(default)]
    pub daily_limits: BTreeMap<String, u64>,
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,
    #[serde(default = "default_consensus_min_confidence")]
    pub consensus_min_confidence: f64,
    #[serde(default = "default_consensus_min_agreement")]
    pub consensus_min_agreement: f64,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            preference: Vec::new(),
            preference_weight: default_preference_weight(),
            daily_limits: BTreeMap::new(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
            consensus_min_confidence: default_consensus_min_confidence(),
            consensus_min_agreement: default_consensus_min_agreement(),
        }
    }
}

impl ProvidersConfig {
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

fn default_preference_weight() -> f64 {
    0.001
}
fn default_consensus_min_confidence() -> f64 {
    0.7
}
fn default_consensus_min_agreement() -> f64 {
    0.5
}

impl RotorConfig {
    /// Resolve configuration for a project.
    ///
    /// `explicit` wins outright when given. Otherwise the user config
    /// (`~/.config/rotor/config.toml`) is deep-merged with the project config
    /// (`{project}/.rotor/config.toml`), project keys overriding. Returns the
    /// defaults when neither file exists.
    pub fn load(explicit: Option<&Path>, project_root: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_path(path);
        }
        let user_path = paths::user_config_path();
        let project_path = paths::project_config_path(project_root);
        Self::load_with_paths(user_path.as_deref(), &project_path)
    }

    /// Load config from explicit paths. Testable without global filesystem state.
    pub fn load_with_paths(user_path: Option<&Path>, project_path: &Path) -> Result<Self> {
        let user_path = user_path.filter(|p| p.exists());
        let project_exists = project_path.exists();

        match (user_path, project_exists) {
            (None, false) => Ok(Self::default()),
            (Some(user), false) => Self::load_from_path(user),
            (None, true) => Self::load_from_path(project_path),
            (Some(user), true) => Self::load_merged(user, project_path),
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let raw: toml::Value = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        warn_unknown_sections(&raw, &path.display().to_string());
        raw.try_into::<Self>()
            .with_context(|| format!("Invalid config: {}", path.display()))
    }

    fn load_merged(base_path: &Path, overlay_path: &Path) -> Result<Self> {
        let base_str = std::fs::read_to_string(base_path)
            .with_context(|| format!("Failed to read user config: {}", base_path.display()))?;
        let overlay_str = std::fs::read_to_string(overlay_path).with_context(|| {
            format!("Failed to read project config: {}", overlay_path.display())
        })?;

        let base_val: toml::Value = toml::from_str(&base_str)
            .with_context(|| format!("Failed to parse user config: {}", base_path.display()))?;
        let overlay_val: toml::Value = toml::from_str(&overlay_str).with_context(|| {
            format!("Failed to parse project config: {}", overlay_path.display())
        })?;
        warn_unknown_sections(&base_val, &base_path.display().to_string());
        warn_unknown_sections(&overlay_val, &overlay_path.display().to_string());

        merge_toml_values(base_val, overlay_val)
            .try_into::<Self>()
            .context("Invalid merged config")
    }

    /// Write the config as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))
    }

    /// Default location for a new project config.
    pub fn project_config_path(project_root: &Path) -> PathBuf {
        paths::project_config_path(project_root)
    }

    /// Generate default config TOML with comments as a template.
    pub fn default_template() -> String {
        r#"# rotor configuration
# Location: {project}/.rotor/config.toml (overrides ~/.config/rotor/config.toml)

[retry]
max_attempts = 3
base_delay_ms = 1000
max_delay_ms = 30000
jitter = 0.3            # fraction of base_delay_ms added at random

[circuit_breaker]
enabled = true
failure_threshold = 5   # consecutive failures before opening
success_threshold = 2   # half-open successes before closing
cooldown_ms = 30000

[queue]
max_retries = 3
visibility_timeout_ms = 300000
dead_letter_enabled = true
requeue_expired_leases = false

[key_pool]
name = "primary"
strategy = "round-robin"  # round-robin | least-used | random | lowest-error-rate
# max_requests_per_key = 1000   # per UTC day
max_consecutive_errors = 3
default_rate_limit_cooldown_ms = 60000
# fallback_slot = "fallback"

[ip_rotation]
min_requests_before_rotation = 50
max_requests_before_rotation = 150
min_pause_minutes = 2
max_pause_minutes = 5

[coordinator]
process_id = "default"
rotation_cooldown_ms = 60000
rotation_lock_timeout_ms = 600000
rotation_interval_min_ms = 1800000
rotation_interval_max_ms = 3600000
session_restore_timeout_ms = 30000
resume_worker_on_failure = false

[session_store]
backend = "file"        # file | memory
ttl_secs = 86400

[vault]
enabled = false
address = "http://127.0.0.1:8200"
mount = "secret"
keys_path = "rotor/keys"
token_env = "VAULT_TOKEN"
cache_ttl_ms = 30000
# [vault.env_fallback]
# primary-1 = "ROTOR_KEY_PRIMARY_1"
# fallback = "ROTOR_KEY_FALLBACK"

[providers]
# preference = ["vision-a", "vision-b", "ocr"]
preference_weight = 0.001
# [providers.daily_limits]
# vision-a = 1500
"#
        .to_string()
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
