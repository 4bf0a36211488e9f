//! Rotation engine: key pool, identity rotation, multi-provider failover and
//! the coordinator that serializes rotations.

pub mod coordinator;
pub mod ip_rotation;
pub mod key_pool;
pub mod multi_provider;
pub mod rate_limit;
pub mod worker;

pub use coordinator::{
    Collaborators, CoordinatorStats, HealthReport, HealthStatus, PhaseRecord, PhaseStatus,
    RecoveryReport, RotationOutcome, RotationStatus, SkipReason, SyncCoordinator,
    SyncCoordinatorState, force_unlock, load_coordinator_state,
};
pub use ip_rotation::{
    BindingAuditLog, IdentityBinding, IdentityProvider, IdentityRotation, IpRotationManager,
    RotationState, TrackOutcome, bindings_path, load_rotation_state, read_bindings,
};
pub use key_pool::{
    KeyHealth, KeyPoolManager, KeyChecker, KeySelection, KeySource, KeyStatus, PoolSnapshot,
    load_pool_snapshot,
};
pub use multi_provider::{
    ConsensusOutcome, MultiProvider, ProviderHealth, ProviderQuota, SolveOutcome, SolveProvider,
    SolveRequest, Solution,
};
pub use rate_limit::{
    RateLimitDetected, ResponseClass, classify_response, detect_rate_limit, parse_retry_after,
    rate_limit_error,
};
pub use worker::{BrowserSession, RotationContext, WorkerControl};
