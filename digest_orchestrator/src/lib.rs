//! Digest Orchestrator - Core Library
//!
//! Runs a five-stage agent workflow that turns a user's learned topic
//! preferences into a personalized digest, with per-agent circuit breaking,
//! stage fallbacks, vector memory, and online preference learning.

pub mod agent;
pub mod cli;
pub mod context;
pub mod error;
pub mod fallback;
pub mod health;
pub mod locks;
pub mod memory;
pub mod orchestrator;
pub mod plan;
pub mod preference;
pub mod settings;
pub mod telemetry;

pub use agent::{Agent, AgentKind, AgentRegistry, AgentResult, CapabilityProvider, TemplateProvider};
pub use context::{DigestRequest, Stage, StagePayload, WorkflowState};
pub use error::{FailureKind, OrchestratorError, ProviderError};
pub use health::{CircuitState, HealthMonitor, HealthSnapshot};
pub use memory::RetrievalMemory;
pub use orchestrator::{
    AbortCode, AbortReason, DigestContent, DigestHistoryEntry, Orchestrator, UserDataCleared,
    Warning, WorkflowOutcome,
};
pub use preference::{
    EngagementEvent, EngagementStats, PreferenceLearner, PreferenceProfile, SignalType,
};
pub use settings::Settings;
