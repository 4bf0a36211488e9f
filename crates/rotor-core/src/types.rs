use chrono::{DateTime, NaiveDate, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Output format for CLI responses
#[derive(Clone, Debug, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Why a rotation was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationReason {
    /// Request counter reached the randomized threshold.
    Threshold,
    /// Upstream answered with a rate-limit signal.
    RateLimit,
    /// Upstream refused the identity outright.
    Ban,
    /// Background interval fired.
    Scheduled,
    /// Operator asked for it.
    Manual,
    /// Repeated errors on the current identity.
    Error,
}

impl RotationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Threshold => "threshold",
            Self::RateLimit => "rate-limit",
            Self::Ban => "ban",
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
            Self::Error => "error",
        }
    }

    /// Emergency reasons skip the request counter and rotate immediately.
    pub fn is_emergency(&self) -> bool {
        matches!(self, Self::RateLimit | Self::Ban)
    }
}

impl fmt::Display for RotationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RotationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "threshold" => Ok(Self::Threshold),
            "rate-limit" => Ok(Self::RateLimit),
            "ban" => Ok(Self::Ban),
            "scheduled" => Ok(Self::Scheduled),
            "manual" => Ok(Self::Manual),
            "error" => Ok(Self::Error),
            other => Err(format!(
                "Invalid rotation reason '{other}'. Valid values: threshold, rate-limit, ban, scheduled, manual, error"
            )),
        }
    }
}

/// Ordered phases of a coordinated rotation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationPhase {
    PauseWorker,
    SaveSession,
    RotateIp,
    RotateKey,
    CreateSession,
    RestoreSession,
    ResumeWorker,
}

impl RotationPhase {
    /// Execution order. No phase starts before the previous one resolves.
    pub const ORDER: [RotationPhase; 7] = [
        Self::PauseWorker,
        Self::SaveSession,
        Self::RotateIp,
        Self::RotateKey,
        Self::CreateSession,
        Self::RestoreSession,
        Self::ResumeWorker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PauseWorker => "pause-worker",
            Self::SaveSession => "save-session",
            Self::RotateIp => "rotate-ip",
            Self::RotateKey => "rotate-key",
            Self::CreateSession => "create-session",
            Self::RestoreSession => "restore-session",
            Self::ResumeWorker => "resume-worker",
        }
    }
}

impl fmt::Display for RotationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key selection strategy over the eligible set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    #[default]
    RoundRobin,
    LeastUsed,
    Random,
    LowestErrorRate,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::LeastUsed => "least-used",
            Self::Random => "random",
            Self::LowestErrorRate => "lowest-error-rate",
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider credential. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub secret: String,
}

impl Credential {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: secret.into(),
        }
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.secret)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Short SHA-256 fingerprint used wherever a secret would otherwise be logged.
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    digest.iter().take(6).map(|b| format!("{b:02x}")).collect()
}

/// Usage counters for one credential.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyMetrics {
    #[serde(default)]
    pub total_requests: u64,
    #[serde(default)]
    pub successful_requests: u64,
    #[serde(default)]
    pub failed_requests: u64,
    #[serde(default)]
    pub rate_limit_count: u64,
    #[serde(default)]
    pub consecutive_errors: u32,
    /// Requests counted in the current UTC-day window.
    #[serde(default)]
    pub window_requests: u64,
    #[serde(default)]
    pub window_started_on: Option<NaiveDate>,
    #[serde(default)]
    pub rate_limited_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
}

fn default_healthy() -> bool {
    true
}

impl Default for KeyMetrics {
    fn default() -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            rate_limit_count: 0,
            consecutive_errors: 0,
            window_requests: 0,
            window_started_on: None,
            rate_limited_until: None,
            last_used_at: None,
            last_error_at: None,
            last_error: None,
            healthy: true,
        }
    }
}

impl KeyMetrics {
    /// Failure ratio; a key with no traffic counts as 0.
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }

    pub fn is_rate_limited_at(&self, now: DateTime<Utc>) -> bool {
        self.rate_limited_until.is_some_and(|until| until > now)
    }

    /// Reset the daily window when `today` differs from the stored day.
    pub fn roll_window(&mut self, today: NaiveDate) {
        if self.window_started_on != Some(today) {
            self.window_requests = 0;
            self.window_started_on = Some(today);
        }
    }

    /// Charge one completed request to the totals and the daily window.
    pub fn count_request(&mut self, now: DateTime<Utc>) {
        self.roll_window(now.date_naive());
        self.window_requests += 1;
        self.total_requests += 1;
        self.last_used_at = Some(now);
    }
}

/// Browser cookie as captured by the session adapter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub expires: Option<i64>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub same_site: Option<String>,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: String::new(),
            path: default_cookie_path(),
            expires: None,
            http_only: false,
            secure: false,
            same_site: None,
        }
    }
}

/// Working-session state captured before a rotation and restored after it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub captured_at: DateTime<Utc>,
    pub url: String,
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub local_storage: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl SessionSnapshot {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            session_id: ulid::Ulid::new().to_string(),
            captured_at: Utc::now(),
            url: url.into(),
            cookies: Vec::new(),
            local_storage: BTreeMap::new(),
            metadata: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_reason_roundtrip() {
        for reason in [
            RotationReason::Threshold,
            RotationReason::RateLimit,
            RotationReason::Ban,
            RotationReason::Scheduled,
            RotationReason::Manual,
            RotationReason::Error,
        ] {
            let parsed: RotationReason = reason.as_str().parse().unwrap();
            assert_eq!(parsed, reason);
        }
    }

    #[test]
    fn test_rotation_reason_invalid() {
        let err = "sideways".parse::<RotationReason>().unwrap_err();
        assert!(err.contains("sideways"));
    }

    #[test]
    fn test_emergency_reasons() {
        assert!(RotationReason::RateLimit.is_emergency());
        assert!(RotationReason::Ban.is_emergency());
        assert!(!RotationReason::Threshold.is_emergency());
        assert!(!RotationReason::Scheduled.is_emergency());
    }

    #[test]
    fn test_phase_order_is_fixed() {
        let names: Vec<_> = RotationPhase::ORDER.iter().map(|p| p.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "pause-worker",
                "save-session",
                "rotate-ip",
                "rotate-key",
                "create-session",
                "restore-session",
                "resume-worker",
            ]
        );
    }

    #[test]
    fn test_strategy_serde_kebab_case() {
        let json = serde_json::to_string(&SelectionStrategy::LowestErrorRate).unwrap();
        assert_eq!(json, "\"lowest-error-rate\"");
        let parsed: SelectionStrategy = serde_json::from_str("\"least-used\"").unwrap();
        assert_eq!(parsed, SelectionStrategy::LeastUsed);
    }

    #[test]
    fn test_credential_debug_hides_secret() {
        let cred = Credential::new("primary-1", "sk-very-secret");
        let debug = format!("{cred:?}");
        assert!(!debug.contains("sk-very-secret"));
        assert!(debug.contains("primary-1"));
        assert_eq!(cred.fingerprint().len(), 12);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
    }

    #[test]
    fn test_error_rate_zero_requests() {
        let metrics = KeyMetrics::default();
        assert_eq!(metrics.error_rate(), 0.0);
        let metrics = KeyMetrics {
            total_requests: 4,
            failed_requests: 1,
            ..Default::default()
        };
        assert!((metrics.error_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_roll_window_resets_on_new_day() {
        let day1 = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2026, 1, 2).unwrap();
        let mut metrics = KeyMetrics::default();
        metrics.roll_window(day1);
        metrics.window_requests = 7;
        metrics.roll_window(day1);
        assert_eq!(metrics.window_requests, 7);
        metrics.roll_window(day2);
        assert_eq!(metrics.window_requests, 0);
        assert_eq!(metrics.window_started_on, Some(day2));
    }

    #[test]
    fn test_metrics_deserialize_defaults_healthy() {
        let metrics: KeyMetrics = serde_json::from_str("{}").unwrap();
        assert!(metrics.healthy);
        assert_eq!(metrics.total_requests, 0);
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let mut snapshot = SessionSnapshot::new("https://example.test/work");
        snapshot.cookies.push(Cookie::new("sid", "42"));
        snapshot
            .local_storage
            .insert("token".to_string(), "t-1".to_string());
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: SessionSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
