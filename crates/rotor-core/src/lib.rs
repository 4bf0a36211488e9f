//! Shared types, error taxonomy and the consensus engine.

pub mod consensus;
pub mod error;
pub mod types;

pub use consensus::{
    AgentResult, ConfidenceScorer, ConsensusAction, ConsensusDecision, ConsensusEngine, VoteTally,
    normalize_answer,
};
pub use error::RotorError;
pub use types::{
    Cookie, Credential, KeyMetrics, OutputFormat, RotationPhase, RotationReason,
    SelectionStrategy, SessionSnapshot, fingerprint,
};
