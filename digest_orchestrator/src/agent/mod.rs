//! Agents: a fixed task vocabulary in front of one capability provider.

pub mod provider;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::context::StagePayload;
use crate::error::FailureKind;
use crate::health::{HealthMonitor, HealthSnapshot};

pub use provider::{CapabilityProvider, TemplateProvider};

/// The closed set of agent variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Discovery,
    PromptInterpretation,
    Preference,
    Drafting,
    Visualization,
}

impl AgentKind {
    pub const ALL: [AgentKind; 5] = [
        AgentKind::Discovery,
        AgentKind::PromptInterpretation,
        AgentKind::Preference,
        AgentKind::Drafting,
        AgentKind::Visualization,
    ];

    /// Identifier used for health tracking.
    pub fn id(self) -> &'static str {
        match self {
            AgentKind::Discovery => "discovery",
            AgentKind::PromptInterpretation => "prompt_interpretation",
            AgentKind::Preference => "preference",
            AgentKind::Drafting => "drafting",
            AgentKind::Visualization => "visualization",
        }
    }

    /// Task vocabulary declared by this variant.
    pub fn tasks(self) -> &'static [&'static str] {
        match self {
            AgentKind::Discovery => &[
                "search_by_preferences",
                "search_custom_prompt",
                "get_trending_content",
            ],
            AgentKind::PromptInterpretation => &["process_prompt", "analyze_prompt", "enhance_prompt"],
            AgentKind::Preference => &[
                "get_preferences",
                "analyze_preferences",
                "recommend_preferences",
            ],
            AgentKind::Drafting => &[
                "analyze_preferences",
                "structure_content",
                "generate_sections",
                "enhance_with_memory",
                "format_output",
                "generate_subject_lines",
                "format_for_delivery",
            ],
            AgentKind::Visualization => &["generate_mindmap", "create_topic_mindmap"],
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Outcome of one task call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AgentResult {
    Success(StagePayload),
    Failure { kind: FailureKind, detail: String },
}

impl AgentResult {
    pub fn failure(kind: FailureKind, detail: impl Into<String>) -> Self {
        AgentResult::Failure {
            kind,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStats {
    pub id: String,
    pub kind: AgentKind,
    pub provider: String,
    pub total_requests: u64,
    pub error_count: u64,
    pub supported_tasks: Vec<String>,
}

/// One agent variant bound to a provider.
pub struct Agent {
    kind: AgentKind,
    provider: Arc<dyn CapabilityProvider>,
    health: Arc<HealthMonitor>,
    request_count: AtomicU64,
    error_count: AtomicU64,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("kind", &self.kind)
            .field("provider", &self.provider.name())
            .finish()
    }
}

impl Agent {
    pub fn new(
        kind: AgentKind,
        provider: Arc<dyn CapabilityProvider>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            kind,
            provider,
            health,
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    pub fn id(&self) -> &'static str {
        self.kind.id()
    }

    pub fn supported_tasks(&self) -> Vec<String> {
        self.kind.tasks().iter().map(|t| t.to_string()).collect()
    }

    pub fn supports(&self, task: &str) -> bool {
        self.kind.tasks().iter().any(|t| *t == task)
    }

    /// Run `task` against the provider. Provider errors never escape; they
    /// come back as `AgentResult::Failure`.
    #[instrument(skip(self, context), fields(agent = %self.kind))]
    pub async fn execute(&self, task: &str, context: &Value) -> AgentResult {
        self.request_count.fetch_add(1, Ordering::Relaxed);

        if !self.supports(task) {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            return AgentResult::failure(
                FailureKind::UnsupportedTask,
                format!("agent '{}' does not support task '{}'", self.kind, task),
            );
        }

        let result = match self.provider.call(task, context).await {
            Ok(value) => match StagePayload::from_value(value) {
                Ok(payload) => AgentResult::Success(payload),
                Err(detail) => AgentResult::failure(FailureKind::InvalidPayload, detail),
            },
            Err(e) => AgentResult::failure(e.kind(), e.to_string()),
        };

        match &result {
            AgentResult::Success(_) => debug!("Task {} succeeded", task),
            AgentResult::Failure { kind, detail } => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                warn!("Task {} failed ({}): {}", task, kind, detail);
            }
        }
        result
    }

    /// Map-in, map-out form of [`Agent::execute`] for external callers.
    pub async fn execute_wire(&self, task: &str, context: Value) -> Value {
        let result = self.execute(task, &context).await;
        serde_json::to_value(&result).unwrap_or_else(|e| {
            json!({
                "status": "failure",
                "kind": FailureKind::InvalidPayload,
                "detail": e.to_string(),
            })
        })
    }

    pub fn health_check(&self) -> HealthSnapshot {
        self.health.get_health(self.id())
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            id: self.id().to_string(),
            kind: self.kind,
            provider: self.provider.name().to_string(),
            total_requests: self.request_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            supported_tasks: self.supported_tasks(),
        }
    }
}

/// Agents by kind.
#[derive(Debug, Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<AgentKind, Arc<Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every variant backed by the same provider.
    pub fn with_provider(provider: Arc<dyn CapabilityProvider>, health: Arc<HealthMonitor>) -> Self {
        let mut registry = Self::new();
        for kind in AgentKind::ALL {
            registry.register(Agent::new(kind, provider.clone(), health.clone()));
        }
        registry
    }

    /// Add or replace the agent for its kind.
    pub fn register(&mut self, agent: Agent) {
        self.agents.insert(agent.kind(), Arc::new(agent));
    }

    pub fn get(&self, kind: AgentKind) -> Option<Arc<Agent>> {
        self.agents.get(&kind).cloned()
    }

    pub fn stats(&self) -> Vec<AgentStats> {
        let mut stats: Vec<AgentStats> = self.agents.values().map(|a| a.stats()).collect();
        stats.sort_by_key(|s| s.kind);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::settings::HealthConfig;
    use async_trait::async_trait;

    struct Scripted(Result<Value, ProviderError>);

    #[async_trait]
    impl CapabilityProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn call(&self, _task: &str, _input: &Value) -> Result<Value, ProviderError> {
            self.0.clone()
        }
    }

    fn agent(kind: AgentKind, reply: Result<Value, ProviderError>) -> Agent {
        Agent::new(
            kind,
            Arc::new(Scripted(reply)),
            Arc::new(HealthMonitor::new(HealthConfig::default())),
        )
    }

    #[tokio::test]
    async fn test_unsupported_task_is_rejected_without_calling_provider() {
        let agent = agent(AgentKind::Visualization, Ok(json!({"body": "x"})));
        let result = agent.execute("search_by_preferences", &json!({})).await;
        assert!(matches!(
            result,
            AgentResult::Failure { kind: FailureKind::UnsupportedTask, .. }
        ));
        assert_eq!(agent.stats().error_count, 1);
    }

    #[tokio::test]
    async fn test_provider_errors_become_failures() {
        let agent = agent(
            AgentKind::Discovery,
            Err(ProviderError::RateLimited("slow down".into())),
        );
        let result = agent.execute("get_trending_content", &json!({})).await;
        assert!(matches!(result, AgentResult::Failure { kind: FailureKind::Transient, .. }));

        let agent = agent_with_body_less_reply();
        let result = agent.execute("generate_mindmap", &json!({})).await;
        assert!(matches!(
            result,
            AgentResult::Failure { kind: FailureKind::InvalidPayload, .. }
        ));
    }

    fn agent_with_body_less_reply() -> Agent {
        agent(AgentKind::Visualization, Ok(json!({"metadata": {}})))
    }

    #[tokio::test]
    async fn test_wire_format() {
        let agent = agent(AgentKind::Drafting, Ok(json!({"body": "hi", "metadata": {"title": "t"}})));
        let reply = agent.execute_wire("format_output", json!({})).await;
        assert_eq!(reply["status"], "success");
        assert_eq!(reply["body"], "hi");
        assert_eq!(reply["metadata"]["title"], "t");

        let reply = agent.execute_wire("nope", json!({})).await;
        assert_eq!(reply["status"], "failure");
        assert_eq!(reply["kind"], "unsupported_task");
        assert!(reply["detail"].as_str().unwrap().contains("nope"));
    }

    #[test]
    fn test_vocabularies_are_disjoint_where_expected() {
        let registry = AgentRegistry::with_provider(
            Arc::new(Scripted(Ok(json!({"body": ""})))),
            Arc::new(HealthMonitor::new(HealthConfig::default())),
        );
        assert_eq!(registry.stats().len(), 5);
        let drafting = registry.get(AgentKind::Drafting).unwrap();
        assert!(drafting.supports("analyze_preferences"));
        assert!(drafting.supports("generate_subject_lines"));
        assert!(!drafting.supports("generate_mindmap"));
        assert_eq!(drafting.health_check().consecutive_failures, 0);
    }
}
