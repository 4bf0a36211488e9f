//! Serialized credential and identity rotation.
//!
//! [`SyncCoordinator`] is the only place that rotates. A rotation pauses the
//! worker, snapshots the browser session, rotates identity then key,
//! recreates and restores the session and resumes the worker, strictly in
//! that order. Exclusivity comes from an in-process flag plus a persisted
//! lock record (`coordinator/{process_id}`) that another process, or a
//! restart after a crash, sees. A lock older than `rotation_lock_timeout`
//! is abandoned and may be taken over.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use rotor_config::CoordinatorConfig;
use rotor_core::{RotationPhase, RotationReason, RotorError};
use rotor_resilience::{BreakerSnapshot, QueueStats};
use rotor_session::{SessionStore, StateStore, load_typed, update_typed};
use rotor_vault::SecretStore;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ip_rotation::IpRotationManager;
use crate::key_pool::KeyPoolManager;
use crate::multi_provider::MultiProvider;
use crate::worker::{BrowserSession, RotationContext, WorkerControl};

type QueueStatsFn = Arc<dyn Fn() -> QueueStats + Send + Sync>;

/// Persisted coordinator record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncCoordinatorState {
    #[serde(default)]
    pub rotation_in_progress: bool,
    #[serde(default)]
    pub rotation_id: Option<String>,
    #[serde(default)]
    pub rotation_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_rotation_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_rotation_reason: Option<RotationReason>,
    #[serde(default)]
    pub last_key_rotation_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_ip_rotation_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub total_rotations: u64,
    #[serde(default)]
    pub failed_rotations: u64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_session_snapshot: Option<String>,
    #[serde(default)]
    pub current_key: Option<String>,
    #[serde(default)]
    pub current_identity: Option<String>,
}

impl SyncCoordinatorState {
    fn lock_is_fresh(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if !self.rotation_in_progress {
            return false;
        }
        self.rotation_started_at
            .and_then(|started| (now - started).to_std().ok())
            .is_some_and(|age| age < timeout)
    }
}

pub fn coordinator_state_key(process_id: &str) -> String {
    format!("coordinator/{process_id}")
}

pub async fn load_coordinator_state(
    store: &dyn StateStore,
    process_id: &str,
) -> Result<Option<SyncCoordinatorState>> {
    Ok(load_typed::<SyncCoordinatorState>(store, &coordinator_state_key(process_id))
        .await?
        .map(|(_, state)| state))
}

/// Clear a persisted in-progress marker regardless of its age. Returns the
/// rotation id that was cleared.
pub async fn force_unlock(store: &dyn StateStore, process_id: &str) -> Result<Option<String>> {
    update_typed::<SyncCoordinatorState, _, _>(store, &coordinator_state_key(process_id), |state| {
        if !state.rotation_in_progress {
            return Ok(None);
        }
        state.rotation_in_progress = false;
        state.rotation_started_at = None;
        Ok(state.rotation_id.clone())
    })
    .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationStatus {
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    RotationInProgress,
    CooldownActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseStatus {
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: RotationPhase,
    pub status: PhaseStatus,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationOutcome {
    pub status: RotationStatus,
    pub rotation_id: Option<String>,
    pub reason: RotationReason,
    #[serde(default)]
    pub skip_reason: Option<SkipReason>,
    #[serde(default)]
    pub phases: Vec<PhaseRecord>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub key_id: Option<String>,
}

impl RotationOutcome {
    fn skipped(reason: RotationReason, skip: SkipReason) -> Self {
        Self {
            status: RotationStatus::Skipped,
            rotation_id: None,
            reason,
            skip_reason: Some(skip),
            phases: Vec::new(),
            error: None,
            identity: None,
            key_id: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == RotationStatus::Completed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub eligible_keys: usize,
    pub total_keys: usize,
    pub worker_paused: bool,
    pub rotation_in_progress: bool,
    pub breakers: Vec<BreakerSnapshot>,
    pub queue: Option<QueueStats>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorStats {
    pub process_id: String,
    pub state: SyncCoordinatorState,
    pub scheduled_rotation: bool,
    pub current_key: Option<String>,
    pub eligible_keys: usize,
}

/// What `recover()` found at startup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub abandoned_rotation: Option<String>,
    /// A fresh lock was left in place.
    pub lock_held: bool,
    pub last_session_snapshot: Option<String>,
}

/// Everything a coordinator drives.
pub struct Collaborators {
    pub state: Arc<dyn StateStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub keys: Arc<KeyPoolManager>,
    pub identity: Arc<IpRotationManager>,
    pub worker: Arc<dyn WorkerControl>,
    pub browser: Arc<dyn BrowserSession>,
}

enum Admission {
    Acquired { abandoned: Option<String> },
    InProgress,
    Cooldown,
}

/// Clears the in-process flag even if the rotation future is dropped.
struct RotatingGuard<'a>(&'a AtomicBool);

impl Drop for RotatingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct ScheduledTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Phase bookkeeping for one rotation.
struct PhaseLog {
    rotation_id: String,
    reason: RotationReason,
    records: Vec<PhaseRecord>,
}

impl PhaseLog {
    async fn run<T, Fut>(&mut self, phase: RotationPhase, task: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        info!(rotation_id = %self.rotation_id, phase = %phase, reason = %self.reason, "Phase started");
        let started = Instant::now();
        let result = task.await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(value) => {
                debug!(rotation_id = %self.rotation_id, phase = %phase, elapsed_ms, "Phase completed");
                self.records.push(PhaseRecord {
                    phase,
                    status: PhaseStatus::Completed,
                    elapsed_ms,
                    error: None,
                });
                Ok(value)
            }
            Err(err) => {
                let message = format!("{err:#}");
                error!(
                    rotation_id = %self.rotation_id,
                    phase = %phase,
                    reason = %self.reason,
                    error = %message,
                    "Phase failed"
                );
                self.records.push(PhaseRecord {
                    phase,
                    status: PhaseStatus::Failed,
                    elapsed_ms,
                    error: Some(message.clone()),
                });
                Err(RotorError::PhaseFailed {
                    phase: phase.as_str().to_string(),
                    message,
                }
                .into())
            }
        }
    }

    fn skip(&mut self, phase: RotationPhase, why: &str) {
        debug!(rotation_id = %self.rotation_id, phase = %phase, why, "Phase skipped");
        self.records.push(PhaseRecord {
            phase,
            status: PhaseStatus::Skipped,
            elapsed_ms: 0,
            error: None,
        });
    }

    fn completed(&self, phase: RotationPhase) -> bool {
        self.records
            .iter()
            .any(|r| r.phase == phase && r.status == PhaseStatus::Completed)
    }
}

/// Results of the phases that produce something.
#[derive(Default)]
struct Progress {
    snapshot_id: Option<String>,
    identity: Option<String>,
    ip_rotated_at: Option<DateTime<Utc>>,
    key_id: Option<String>,
    key_rotated_at: Option<DateTime<Utc>>,
}

pub struct SyncCoordinator {
    config: CoordinatorConfig,
    state: Arc<dyn StateStore>,
    sessions: Arc<dyn SessionStore>,
    keys: Arc<KeyPoolManager>,
    identity: Arc<IpRotationManager>,
    worker: Arc<dyn WorkerControl>,
    browser: Arc<dyn BrowserSession>,
    secrets: Option<Arc<SecretStore>>,
    providers: Option<Arc<MultiProvider>>,
    queue_stats: Option<QueueStatsFn>,
    rotating: AtomicBool,
    scheduled: Mutex<Option<ScheduledTask>>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("process_id", &self.config.process_id)
            .field("rotating", &self.rotating.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SyncCoordinator {
    pub fn new(config: CoordinatorConfig, parts: Collaborators) -> Self {
        Self {
            config,
            state: parts.state,
            sessions: parts.sessions,
            keys: parts.keys,
            identity: parts.identity,
            worker: parts.worker,
            browser: parts.browser,
            secrets: None,
            providers: None,
            queue_stats: None,
            rotating: AtomicBool::new(false),
            scheduled: Mutex::new(None),
        }
    }

    /// Mirror key stats and coordinator state after each completed rotation.
    pub fn with_secret_store(mut self, secrets: Arc<SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Include provider circuit breakers in [`SyncCoordinator::health`].
    pub fn with_providers(mut self, providers: Arc<MultiProvider>) -> Self {
        self.providers = Some(providers);
        self
    }

    pub fn with_queue_stats<F>(mut self, stats: F) -> Self
    where
        F: Fn() -> QueueStats + Send + Sync + 'static,
    {
        self.queue_stats = Some(Arc::new(stats));
        self
    }

    pub fn process_id(&self) -> &str {
        &self.config.process_id
    }

    fn state_key(&self) -> String {
        coordinator_state_key(&self.config.process_id)
    }

    pub async fn state(&self) -> Result<SyncCoordinatorState> {
        Ok(load_coordinator_state(self.state.as_ref(), &self.config.process_id)
            .await?
            .unwrap_or_default())
    }

    /// Run one rotation transaction. Never returns an error: failures become
    /// a `failed` outcome.
    pub async fn coordinate_rotation(&self, ctx: RotationContext) -> RotationOutcome {
        let reason = ctx.reason;
        if self
            .rotating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(reason = %reason, "Rotation already running in this process");
            return RotationOutcome::skipped(reason, SkipReason::RotationInProgress);
        }
        let _guard = RotatingGuard(&self.rotating);

        let rotation_id = ulid::Ulid::new().to_string();
        match self.admit(&rotation_id).await {
            Ok(Admission::Acquired { abandoned }) => {
                if let Some(abandoned) = abandoned {
                    warn!(rotation_id = %rotation_id, abandoned = %abandoned, "Took over abandoned rotation lock");
                }
            }
            Ok(Admission::InProgress) => {
                info!(reason = %reason, "Rotation skipped: another rotation holds the lock");
                return RotationOutcome::skipped(reason, SkipReason::RotationInProgress);
            }
            Ok(Admission::Cooldown) => {
                info!(reason = %reason, "Rotation skipped: cooldown active");
                return RotationOutcome::skipped(reason, SkipReason::CooldownActive);
            }
            Err(err) => {
                error!(reason = %reason, error = %err, "Failed to acquire rotation lock");
                return RotationOutcome {
                    status: RotationStatus::Failed,
                    rotation_id: Some(rotation_id),
                    reason,
                    skip_reason: None,
                    phases: Vec::new(),
                    error: Some(format!("{err:#}")),
                    identity: None,
                    key_id: None,
                };
            }
        }

        info!(
            rotation_id = %rotation_id,
            reason = %reason,
            http_status = ?ctx.http_status,
            emergency = ctx.is_emergency(),
            "Rotation started"
        );
        let mut log = PhaseLog {
            rotation_id: rotation_id.clone(),
            reason,
            records: Vec::new(),
        };
        let mut progress = Progress::default();
        let result = self.run_phases(&ctx, &mut log, &mut progress).await;

        let error = match result {
            Ok(()) => {
                self.finish_success(&rotation_id, reason, &progress).await;
                info!(
                    rotation_id = %rotation_id,
                    reason = %reason,
                    identity = progress.identity.as_deref().unwrap_or("-"),
                    key = progress.key_id.as_deref().unwrap_or("-"),
                    "Rotation completed"
                );
                None
            }
            Err(err) => {
                let message = err.to_string();
                if self.config.resume_worker_on_failure
                    && log.completed(RotationPhase::PauseWorker)
                    && !log.completed(RotationPhase::ResumeWorker)
                {
                    match self.worker.resume(reason, &ctx).await {
                        Ok(()) => warn!(rotation_id = %rotation_id, "Resumed worker after failed rotation"),
                        Err(resume_err) => {
                            error!(rotation_id = %rotation_id, error = %resume_err, "Failed to resume worker")
                        }
                    }
                }
                self.finish_failure(&rotation_id, &message).await;
                Some(message)
            }
        };

        RotationOutcome {
            status: if error.is_none() {
                RotationStatus::Completed
            } else {
                RotationStatus::Failed
            },
            rotation_id: Some(rotation_id),
            reason,
            skip_reason: None,
            phases: log.records,
            error,
            identity: progress.identity,
            key_id: progress.key_id,
        }
    }

    /// Take the persisted lock, or report why not.
    async fn admit(&self, rotation_id: &str) -> Result<Admission> {
        let lock_timeout = self.config.rotation_lock_timeout();
        let cooldown = self.config.rotation_cooldown();
        update_typed::<SyncCoordinatorState, _, _>(self.state.as_ref(), &self.state_key(), |state| {
            let now = Utc::now();
            if state.lock_is_fresh(now, lock_timeout) {
                return Ok(Admission::InProgress);
            }
            let cooling = state
                .last_rotation_at
                .and_then(|last| (now - last).to_std().ok())
                .is_some_and(|since| since < cooldown);
            if cooling {
                return Ok(Admission::Cooldown);
            }
            let abandoned = state
                .rotation_in_progress
                .then(|| state.rotation_id.clone().unwrap_or_default());
            state.rotation_in_progress = true;
            state.rotation_id = Some(rotation_id.to_string());
            state.rotation_started_at = Some(now);
            Ok(Admission::Acquired { abandoned })
        })
        .await
        .context("Failed to update coordinator state")
    }

    async fn run_phases(
        &self,
        ctx: &RotationContext,
        log: &mut PhaseLog,
        progress: &mut Progress,
    ) -> Result<()> {
        let reason = ctx.reason;

        log.run(RotationPhase::PauseWorker, self.worker.pause(reason, ctx))
            .await?;

        let snapshot = log
            .run(RotationPhase::SaveSession, async {
                let snapshot = self.browser.capture_session().await?;
                self.sessions
                    .save_session(&snapshot)
                    .await
                    .context("Failed to persist session snapshot")?;
                Ok(snapshot)
            })
            .await?;
        progress.snapshot_id = Some(snapshot.session_id.clone());

        let rotation = log
            .run(RotationPhase::RotateIp, async {
                if ctx.is_emergency() {
                    self.identity.emergency_rotation(reason).await
                } else {
                    self.identity.perform_rotation_with_pause(reason).await
                }
            })
            .await?;
        progress.identity = Some(rotation.current);
        progress.ip_rotated_at = Some(rotation.rotated_at);

        let selection = log
            .run(RotationPhase::RotateKey, self.keys.rotate_key(reason))
            .await?;
        progress.key_id = Some(selection.credential.id);
        progress.key_rotated_at = Some(Utc::now());

        if self.browser.supports_new_session() {
            log.run(
                RotationPhase::CreateSession,
                self.browser.create_new_session(),
            )
            .await?;
        } else {
            log.skip(RotationPhase::CreateSession, "browser adapter keeps its session");
        }

        let timeout = self.config.session_restore_timeout();
        log.run(RotationPhase::RestoreSession, async {
            // Restore from the persisted copy; the captured value is the
            // fallback when the store already expired it.
            let stored = self.sessions.get_session(&snapshot.session_id).await?;
            let source = stored.as_ref().unwrap_or(&snapshot);
            match tokio::time::timeout(timeout, self.browser.restore_session(source)).await {
                Ok(restored) => restored,
                Err(_) => Err(RotorError::timeout(RotationPhase::RestoreSession.as_str(), timeout).into()),
            }
        })
        .await?;

        log.run(RotationPhase::ResumeWorker, self.worker.resume(reason, ctx))
            .await?;
        Ok(())
    }

    async fn finish_success(&self, rotation_id: &str, reason: RotationReason, progress: &Progress) {
        let now = Utc::now();
        let updated = update_typed::<SyncCoordinatorState, _, _>(
            self.state.as_ref(),
            &self.state_key(),
            |state| {
                if state.rotation_id.as_deref() == Some(rotation_id) {
                    state.rotation_in_progress = false;
                    state.rotation_started_at = None;
                }
                state.last_rotation_at = Some(now);
                state.last_rotation_reason = Some(reason);
                state.last_ip_rotation_at = progress.ip_rotated_at;
                state.last_key_rotation_at = progress.key_rotated_at;
                state.request_count = 0;
                state.total_rotations += 1;
                state.last_error = None;
                state.last_session_snapshot = progress.snapshot_id.clone();
                state.current_key = progress.key_id.clone();
                state.current_identity = progress.identity.clone();
                Ok(state.clone())
            },
        )
        .await;
        let state = match updated {
            Ok(state) => state,
            Err(err) => {
                error!(rotation_id, error = %err, "Failed to record completed rotation");
                return;
            }
        };

        if let Some(secrets) = &self.secrets {
            if let Err(err) = secrets.update_key_stats(self.keys.stats_json()).await {
                warn!(rotation_id, error = %err, "Failed to push key stats to secret store");
            }
            match serde_json::to_value(&state) {
                Ok(value) => {
                    if let Err(err) = secrets.save_state(&value).await {
                        warn!(rotation_id, error = %err, "Failed to mirror coordinator state");
                    }
                }
                Err(err) => warn!(rotation_id, error = %err, "Failed to encode coordinator state"),
            }
        }
    }

    async fn finish_failure(&self, rotation_id: &str, message: &str) {
        let updated = update_typed::<SyncCoordinatorState, _, _>(
            self.state.as_ref(),
            &self.state_key(),
            |state| {
                if state.rotation_id.as_deref() == Some(rotation_id) {
                    state.rotation_in_progress = false;
                    state.rotation_started_at = None;
                }
                state.failed_rotations += 1;
                state.last_error = Some(message.to_string());
                Ok(())
            },
        )
        .await;
        if let Err(err) = updated {
            error!(rotation_id, error = %err, "Failed to record failed rotation");
        }
    }

    /// Count a completed worker request; rotates when the identity manager
    /// reports its threshold.
    pub async fn record_request(&self) -> Result<Option<RotationOutcome>> {
        let count = update_typed::<SyncCoordinatorState, _, _>(
            self.state.as_ref(),
            &self.state_key(),
            |state| {
                state.request_count += 1;
                Ok(state.request_count)
            },
        )
        .await?;
        let tracked = self.identity.track_request().await?;
        if !tracked.should_rotate {
            return Ok(None);
        }
        let mut ctx = RotationContext::new(tracked.reason.unwrap_or(RotationReason::Threshold));
        ctx.requests_since_rotation = Some(count);
        Ok(Some(self.coordinate_rotation(ctx).await))
    }

    /// Mark the current key exhausted and rotate immediately.
    pub async fn handle_rate_limit(&self, mut ctx: RotationContext) -> RotationOutcome {
        if !ctx.reason.is_emergency() {
            ctx.reason = RotationReason::RateLimit;
        }
        if let Some(current) = self.keys.current_key() {
            let why = ctx
                .detail
                .clone()
                .unwrap_or_else(|| ctx.reason.as_str().to_string());
            if let Err(err) = self
                .keys
                .mark_key_exhausted(&current, &why, ctx.retry_after)
                .await
            {
                warn!(key = %current, error = %err, "Failed to mark key exhausted");
            }
        }
        self.coordinate_rotation(ctx).await
    }

    /// Start rotating on a random interval in
    /// `[rotation_interval_min, rotation_interval_max]`, redrawn every cycle.
    /// Returns false when a loop is already running.
    pub fn start_scheduled_rotation(self: &Arc<Self>) -> bool {
        let mut scheduled = self.scheduled.lock().unwrap_or_else(|e| e.into_inner());
        if scheduled.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            return false;
        }
        let token = CancellationToken::new();
        let this = Arc::clone(self);
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                let interval = this.draw_interval();
                debug!(interval_ms = interval.as_millis() as u64, "Next scheduled rotation");
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let outcome = this
                    .coordinate_rotation(RotationContext::new(RotationReason::Scheduled))
                    .await;
                info!(status = ?outcome.status, skip_reason = ?outcome.skip_reason, "Scheduled rotation finished");
            }
            debug!("Scheduled rotation stopped");
        });
        *scheduled = Some(ScheduledTask { token, handle });
        info!(process_id = %self.config.process_id, "Scheduled rotation started");
        true
    }

    /// Stop the interval loop. A rotation already running completes first.
    pub async fn stop_scheduled_rotation(&self) {
        let task = self
            .scheduled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.token.cancel();
            if let Err(err) = task.handle.await {
                warn!(error = %err, "Scheduled rotation task ended abnormally");
            }
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    fn draw_interval(&self) -> Duration {
        let min = self.config.rotation_interval_min_ms;
        let max = self.config.rotation_interval_max_ms;
        let ms = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        Duration::from_millis(ms)
    }

    /// Startup recovery: clear a lock abandoned by a crashed rotation.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let lock_timeout = self.config.rotation_lock_timeout();
        let report = update_typed::<SyncCoordinatorState, _, _>(
            self.state.as_ref(),
            &self.state_key(),
            |state| {
                let now = Utc::now();
                let mut report = RecoveryReport {
                    abandoned_rotation: None,
                    lock_held: false,
                    last_session_snapshot: state.last_session_snapshot.clone(),
                };
                if !state.rotation_in_progress {
                    return Ok(report);
                }
                if state.lock_is_fresh(now, lock_timeout) {
                    report.lock_held = true;
                    return Ok(report);
                }
                let abandoned = state.rotation_id.clone().unwrap_or_default();
                state.rotation_in_progress = false;
                state.rotation_started_at = None;
                state.last_error = Some(format!("Rotation {abandoned} abandoned; lock cleared on recovery"));
                report.abandoned_rotation = Some(abandoned);
                Ok(report)
            },
        )
        .await?;
        match (&report.abandoned_rotation, report.lock_held) {
            (Some(id), _) => warn!(rotation_id = %id, "Recovered abandoned rotation lock"),
            (None, true) => warn!("Rotation lock held by a live rotation; left in place"),
            (None, false) => debug!("No rotation to recover"),
        }
        Ok(report)
    }

    pub async fn stats(&self) -> Result<CoordinatorStats> {
        Ok(CoordinatorStats {
            process_id: self.config.process_id.clone(),
            state: self.state().await?,
            scheduled_rotation: self.is_scheduled(),
            current_key: self.keys.current_key(),
            eligible_keys: self.keys.eligible_count(),
        })
    }

    pub async fn health(&self) -> Result<HealthReport> {
        let state = self.state().await?;
        let eligible_keys = self.keys.eligible_count();
        let total_keys = self.keys.metrics().len();
        let breakers = self
            .providers
            .as_ref()
            .map(|p| p.breaker_snapshots())
            .unwrap_or_default();
        let queue = self.queue_stats.as_ref().map(|stats| stats());

        let breaker_open = breakers
            .iter()
            .any(|b| b.state != rotor_resilience::CircuitState::Closed);
        let dead_letters = queue.as_ref().is_some_and(|q| q.dead_letter > 0);
        let status = if eligible_keys == 0 {
            HealthStatus::Unhealthy
        } else if breaker_open || dead_letters || state.last_error.is_some() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Ok(HealthReport {
            status,
            eligible_keys,
            total_keys,
            worker_paused: self.worker.is_paused(),
            rotation_in_progress: self.rotating.load(Ordering::Acquire) || state.rotation_in_progress,
            breakers,
            queue,
            last_error: state.last_error,
        })
    }
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;
