//! Collaborator interfaces the coordinator drives during a rotation.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rotor_core::{RotationReason, RotorError, SessionSnapshot};
use rotor_resilience::find_cause;
use serde::{Deserialize, Serialize};

/// Why a rotation was requested, passed through to every collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationContext {
    pub reason: RotationReason,
    #[serde(default)]
    pub http_status: Option<u16>,
    #[serde(default)]
    pub requests_since_rotation: Option<u64>,
    /// Server-provided back-off for the current key.
    #[serde(default, with = "optional_millis")]
    pub retry_after: Option<Duration>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl RotationContext {
    pub fn new(reason: RotationReason) -> Self {
        Self {
            reason,
            http_status: None,
            requests_since_rotation: None,
            retry_after: None,
            detail: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Context for [`crate::SyncCoordinator::handle_rate_limit`] from a failed
    /// call, when a [`RotorError::RateLimited`] sits anywhere in its chain.
    pub fn from_rate_limit(err: &anyhow::Error) -> Option<Self> {
        let Some(RotorError::RateLimited {
            source_name,
            message,
            retry_after_ms,
        }) = find_cause(err, RotorError::is_rate_limited)
        else {
            return None;
        };
        let mut ctx = Self::new(RotationReason::RateLimit)
            .with_status(429)
            .with_detail(format!("{source_name}: {message}"));
        ctx.retry_after = retry_after_ms.map(Duration::from_millis);
        Some(ctx)
    }

    /// Rate-limit/ban reasons and HTTP 429/403 take the emergency path.
    pub fn is_emergency(&self) -> bool {
        self.reason.is_emergency() || matches!(self.http_status, Some(429 | 403))
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// The long-running worker being protected.
#[async_trait]
pub trait WorkerControl: Send + Sync {
    async fn pause(&self, reason: RotationReason, ctx: &RotationContext) -> Result<()>;
    async fn resume(&self, reason: RotationReason, ctx: &RotationContext) -> Result<()>;
    fn is_paused(&self) -> bool;
}

/// Browser automation adapter owning the working session.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn capture_session(&self) -> Result<SessionSnapshot>;

    async fn restore_session(&self, snapshot: &SessionSnapshot) -> Result<()>;

    /// Whether [`BrowserSession::create_new_session`] does anything.
    fn supports_new_session(&self) -> bool {
        false
    }

    async fn create_new_session(&self) -> Result<()> {
        Ok(())
    }
}
