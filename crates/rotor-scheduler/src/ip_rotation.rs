//! Request-counted and emergency network-identity rotation.
//!
//! State lives in the versioned state store under `ip-rotation/{process_id}`
//! and is written on every mutation. Each identity change is also appended
//! to a JSONL audit log of old->new bindings.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rotor_config::IpRotationConfig;
use rotor_core::RotationReason;
use rotor_session::{StateStore, load_typed, update_typed};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const BINDING_SCHEMA_VERSION: u8 = 1;
const BINDINGS_FILE_NAME: &str = "bindings.jsonl";

/// Supplies and changes the outward network identity (proxy exit, IP).
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_identity(&self) -> Result<String>;

    /// Switch to a new identity and return it.
    async fn rotate_identity(&self) -> Result<String>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RotationState {
    #[serde(default)]
    pub current_identity: Option<String>,
    #[serde(default)]
    pub request_count: u64,
    /// 0 until the first draw.
    #[serde(default)]
    pub rotation_threshold: u64,
    #[serde(default)]
    pub last_rotation_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_rotations: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackOutcome {
    pub should_rotate: bool,
    pub reason: Option<RotationReason>,
    pub request_count: u64,
    pub threshold: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityRotation {
    pub previous: Option<String>,
    pub current: String,
    pub reason: RotationReason,
    pub next_threshold: u64,
    #[serde(serialize_with = "serialize_millis")]
    pub paused_for: Duration,
    pub rotated_at: DateTime<Utc>,
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(value.as_millis() as u64)
}

/// One line of `bindings.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityBinding {
    pub v: u8,
    pub ts: DateTime<Utc>,
    pub process_id: String,
    pub previous: Option<String>,
    pub current: String,
    pub reason: RotationReason,
    pub total_rotations: u64,
}

pub fn rotation_state_key(process_id: &str) -> String {
    format!("ip-rotation/{process_id}")
}

pub async fn load_rotation_state(
    store: &dyn StateStore,
    process_id: &str,
) -> Result<Option<RotationState>> {
    Ok(load_typed::<RotationState>(store, &rotation_state_key(process_id))
        .await?
        .map(|(_, state)| state))
}

/// Draw uniformly from `[min, max]`, never repeating `previous` when the
/// window holds more than one value.
pub fn draw_threshold<R: Rng + ?Sized>(min: u64, max: u64, previous: Option<u64>, rng: &mut R) -> u64 {
    if min >= max {
        return min;
    }
    match previous.filter(|p| (min..=max).contains(p)) {
        Some(previous) => {
            let value = rng.gen_range(min..max);
            if value >= previous { value + 1 } else { value }
        }
        None => rng.gen_range(min..=max),
    }
}

/// Audit log location inside a state directory.
pub fn bindings_path(state_dir: &Path) -> PathBuf {
    state_dir.join(BINDINGS_FILE_NAME)
}

/// Append-only JSONL record of identity changes.
#[derive(Debug, Clone)]
pub struct BindingAuditLog {
    path: PathBuf,
}

impl BindingAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, binding: &IdentityBinding) -> Result<()> {
        let mut line = serde_json::to_vec(binding).context("Failed to encode identity binding")?;
        line.push(b'\n');
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || append_line(&path, &line))
            .await
            .context("Binding append task panicked")?
    }
}

fn append_line(path: &Path, line: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(line)
        .with_context(|| format!("Failed to append to {}", path.display()))
}

/// Read an audit log. A missing file is empty; malformed lines are skipped.
pub fn read_bindings(path: &Path) -> Result<Vec<IdentityBinding>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("Failed to read {}", path.display()));
        }
    };
    let mut bindings = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(binding) => bindings.push(binding),
            Err(err) => warn!(path = %path.display(), line = index + 1, error = %err, "Skipping malformed binding"),
        }
    }
    Ok(bindings)
}

pub struct IpRotationManager {
    config: IpRotationConfig,
    process_id: String,
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn StateStore>,
    audit: Option<BindingAuditLog>,
}

impl std::fmt::Debug for IpRotationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpRotationManager")
            .field("process_id", &self.process_id)
            .field("audit", &self.audit)
            .finish_non_exhaustive()
    }
}

impl IpRotationManager {
    pub fn new(
        config: IpRotationConfig,
        process_id: impl Into<String>,
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            config,
            process_id: process_id.into(),
            provider,
            store,
            audit: None,
        }
    }

    pub fn with_audit_log(mut self, log: BindingAuditLog) -> Self {
        self.audit = Some(log);
        self
    }

    fn state_key(&self) -> String {
        rotation_state_key(&self.process_id)
    }

    fn draw(&self, previous: Option<u64>) -> u64 {
        draw_threshold(
            self.config.min_requests_before_rotation,
            self.config.max_requests_before_rotation,
            previous,
            &mut rand::thread_rng(),
        )
    }

    pub async fn state(&self) -> Result<RotationState> {
        Ok(load_rotation_state(self.store.as_ref(), &self.process_id)
            .await?
            .unwrap_or_default())
    }

    /// Count one request. `should_rotate` turns true once the counter reaches
    /// the current threshold.
    pub async fn track_request(&self) -> Result<TrackOutcome> {
        let min = self.config.min_requests_before_rotation;
        let max = self.config.max_requests_before_rotation;
        update_typed::<RotationState, _, _>(self.store.as_ref(), &self.state_key(), |state| {
            if state.rotation_threshold == 0 {
                state.rotation_threshold = draw_threshold(min, max, None, &mut rand::thread_rng());
            }
            state.request_count += 1;
            let should_rotate = state.request_count >= state.rotation_threshold;
            Ok(TrackOutcome {
                should_rotate,
                reason: should_rotate.then_some(RotationReason::Threshold),
                request_count: state.request_count,
                threshold: state.rotation_threshold,
            })
        })
        .await
    }

    /// Change identity, redraw the threshold, then idle for the configured
    /// pause before returning.
    pub async fn perform_rotation_with_pause(&self, reason: RotationReason) -> Result<IdentityRotation> {
        info!(process_id = %self.process_id, reason = %reason, "Rotating identity");
        self.rotate(reason).await
    }

    /// Rotate immediately regardless of the request counter.
    pub async fn emergency_rotation(&self, reason: RotationReason) -> Result<IdentityRotation> {
        warn!(process_id = %self.process_id, reason = %reason, "Emergency identity rotation");
        self.rotate(reason).await
    }

    async fn rotate(&self, reason: RotationReason) -> Result<IdentityRotation> {
        let stored = self.state().await?;
        let previous = match stored.current_identity {
            Some(identity) => Some(identity),
            None => self.provider.current_identity().await.ok(),
        };
        let current = self
            .provider
            .rotate_identity()
            .await
            .context("Identity provider failed to rotate")?;
        let rotated_at = Utc::now();

        let (next_threshold, total_rotations) = update_typed::<RotationState, _, _>(
            self.store.as_ref(),
            &self.state_key(),
            |state| {
                let previous_threshold = (state.rotation_threshold > 0).then_some(state.rotation_threshold);
                state.rotation_threshold = self.draw(previous_threshold);
                state.current_identity = Some(current.clone());
                state.request_count = 0;
                state.last_rotation_at = Some(rotated_at);
                state.total_rotations += 1;
                Ok((state.rotation_threshold, state.total_rotations))
            },
        )
        .await?;

        if let Some(audit) = &self.audit {
            let binding = IdentityBinding {
                v: BINDING_SCHEMA_VERSION,
                ts: rotated_at,
                process_id: self.process_id.clone(),
                previous: previous.clone(),
                current: current.clone(),
                reason,
                total_rotations,
            };
            if let Err(err) = audit.append(&binding).await {
                warn!(path = %audit.path().display(), error = %err, "Failed to record identity binding");
            }
        }

        let paused_for = self.draw_pause();
        info!(
            process_id = %self.process_id,
            previous = previous.as_deref().unwrap_or("-"),
            current = %current,
            next_threshold,
            pause_secs = paused_for.as_secs(),
            "Identity rotated, pausing"
        );
        tokio::time::sleep(paused_for).await;

        Ok(IdentityRotation {
            previous,
            current,
            reason,
            next_threshold,
            paused_for,
            rotated_at,
        })
    }

    fn draw_pause(&self) -> Duration {
        let min = self.config.min_pause_minutes * 60;
        let max = self.config.max_pause_minutes * 60;
        let secs = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        Duration::from_secs(secs)
    }
}
