//! Workflow driver: runs the stage state machine for one user at a time,
//! routes agent calls through the health monitor, and substitutes fallback
//! output for degraded non-critical stages.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::agent::{AgentKind, AgentRegistry, AgentResult, CapabilityProvider, TemplateProvider};
use crate::context::{
    DigestRequest, RunInput, Stage, StagePayload, StageRecord, WorkflowContext, WorkflowState,
};
use crate::error::{FailureKind, OrchestratorError};
use crate::fallback::{fallback, truncate_chars};
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::locks::{ActiveRun, ActiveRuns, UserLocks};
use crate::memory::{RetrievalMemory, ScoredRecord};
use crate::plan::{Executor, PlanBuilder, PlanStep};
use crate::preference::{
    EngagementEvent, EngagementStats, LearnerError, PreferenceLearner, PreferenceProfile,
};
use crate::settings::Settings;

/// One degraded stage or skipped optional branch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Warning {
    pub stage: Stage,
    pub reason: String,
}

/// The finished digest.
#[derive(Debug, Clone, Serialize)]
pub struct DigestContent {
    pub content_id: String,
    pub title: String,
    pub body: String,
    pub subject_lines: Vec<String>,
    pub topics: Vec<String>,
    pub mindmap: Option<String>,
    pub metadata: Map<String, Value>,
}

/// Stable, user-visible abort codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortCode {
    StageFailed,
    CircuitOpen,
    PlanInvalid,
    UnsupportedTask,
    NoContent,
    DeadlineExceeded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbortReason {
    pub code: AbortCode,
    pub stage: Option<Stage>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Completed {
        content: DigestContent,
        warnings: Vec<Warning>,
    },
    Aborted(AbortReason),
}

impl WorkflowOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, WorkflowOutcome::Completed { .. })
    }

    pub fn abort_code(&self) -> Option<AbortCode> {
        match self {
            WorkflowOutcome::Aborted(reason) => Some(reason.code),
            WorkflowOutcome::Completed { .. } => None,
        }
    }
}

/// A previously generated digest, as remembered for its user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigestHistoryEntry {
    pub content_id: String,
    pub title: String,
    pub topics: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// What [`Orchestrator::clear_user`] removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UserDataCleared {
    pub memory_records: usize,
    pub preferences_cleared: bool,
}

#[derive(Debug)]
struct StageFailure {
    kind: FailureKind,
    detail: String,
}

impl StageFailure {
    fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

pub struct Orchestrator {
    settings: Settings,
    agents: AgentRegistry,
    health: Arc<HealthMonitor>,
    memory: Arc<RetrievalMemory>,
    learner: Arc<PreferenceLearner>,
    active: ActiveRuns,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("agents", &self.agents)
            .field("active_runs", &self.active.list().len())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        agents: AgentRegistry,
        health: Arc<HealthMonitor>,
        memory: Arc<RetrievalMemory>,
        learner: Arc<PreferenceLearner>,
    ) -> Self {
        Self {
            settings,
            agents,
            health,
            memory,
            learner,
            active: ActiveRuns::new(),
        }
    }

    /// Wire every agent to `provider`, with hash-embedded memory and a fresh
    /// learner sharing one set of per-user locks.
    pub fn with_provider(settings: Settings, provider: Arc<dyn CapabilityProvider>) -> Self {
        let locks = Arc::new(UserLocks::new());
        let health = Arc::new(HealthMonitor::new(settings.health.clone()));
        let memory = Arc::new(RetrievalMemory::with_hash_embedder(
            settings.memory.clone(),
            locks.clone(),
        ));
        let learner = Arc::new(PreferenceLearner::new(
            settings.learner.clone(),
            memory.clone(),
            locks,
        ));
        let agents = AgentRegistry::with_provider(provider, health.clone());
        Self::new(settings, agents, health, memory, learner)
    }

    /// Fully offline orchestrator backed by [`TemplateProvider`].
    pub fn offline(settings: Settings) -> Self {
        Self::with_provider(settings, Arc::new(TemplateProvider::new()))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn memory(&self) -> &Arc<RetrievalMemory> {
        &self.memory
    }

    pub fn learner(&self) -> &Arc<PreferenceLearner> {
        &self.learner
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    /// Users with a run in flight.
    pub fn active_runs(&self) -> Vec<ActiveRun> {
        self.active.list()
    }

    /// Health of every registered agent.
    pub fn health_report(&self) -> Vec<HealthSnapshot> {
        self.agents
            .stats()
            .iter()
            .map(|stats| self.health.get_health(&stats.id))
            .collect()
    }

    /// Feed one engagement event to the learner.
    pub async fn record_event(
        &self,
        user_id: &str,
        event: EngagementEvent,
    ) -> Result<PreferenceProfile, LearnerError> {
        self.learner.record_event(user_id, event).await
    }

    pub async fn get_profile(&self, user_id: &str) -> PreferenceProfile {
        self.learner.get_profile(user_id).await
    }

    pub async fn engagement_stats(&self, user_id: &str) -> EngagementStats {
        self.learner.engagement_stats(user_id).await
    }

    /// The user's most recent digests, newest first.
    pub fn digest_history(&self, user_id: &str, limit: usize) -> Vec<DigestHistoryEntry> {
        self.memory
            .records_of_kind(user_id, "digest", limit)
            .into_iter()
            .map(|record| DigestHistoryEntry {
                content_id: meta_str(&record.metadata, "content_id"),
                title: meta_str(&record.metadata, "title"),
                topics: record
                    .metadata
                    .get("topics")
                    .and_then(Value::as_array)
                    .map(|topics| {
                        topics
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                created_at: record.created_at,
            })
            .collect()
    }

    /// Forget everything stored for `user_id`: memory records, the learned
    /// profile and engagement statistics. Refused while the user has a run
    /// in flight.
    pub async fn clear_user(&self, user_id: &str) -> Result<UserDataCleared, OrchestratorError> {
        if user_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "user id cannot be empty".to_string(),
            ));
        }
        let _guard = self.active.try_acquire(user_id, Uuid::new_v4())?;

        let memory_records = self.memory.clear_user(user_id).await;
        let preferences_cleared = self.learner.clear_user(user_id).await;
        info!(
            "Cleared user {}: {} memory records, preferences {}",
            user_id,
            memory_records,
            if preferences_cleared { "removed" } else { "absent" }
        );
        Ok(UserDataCleared {
            memory_records,
            preferences_cleared,
        })
    }

    /// Like [`Orchestrator::run`], aborting with `deadline_exceeded` once
    /// `deadline` elapses. Writes committed before the deadline are kept.
    pub async fn run_with_deadline(
        &self,
        user_id: &str,
        request: DigestRequest,
        deadline: Duration,
    ) -> Result<WorkflowOutcome, OrchestratorError> {
        match tokio::time::timeout(deadline, self.run(user_id, request)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("Run for user {} exceeded its {:?} deadline", user_id, deadline);
                Ok(WorkflowOutcome::Aborted(AbortReason {
                    code: AbortCode::DeadlineExceeded,
                    stage: None,
                    detail: format!("run did not finish within {:?}", deadline),
                }))
            }
        }
    }

    /// Generate one digest for `user_id`. Fails fast with `AlreadyRunning`
    /// if the user already has a run in flight.
    #[instrument(skip(self, request), fields(user_id = %user_id))]
    pub async fn run(
        &self,
        user_id: &str,
        request: DigestRequest,
    ) -> Result<WorkflowOutcome, OrchestratorError> {
        if user_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "user id cannot be empty".to_string(),
            ));
        }
        let request = request.normalized()?;
        let guard = self.active.try_acquire(user_id, Uuid::new_v4())?;
        let run_id = guard.run_id();

        let profile = self.learner.get_profile(user_id).await;
        let mut ctx = WorkflowContext::new(RunInput {
            run_id,
            user_id: user_id.to_string(),
            request,
            profile,
            started_at: Utc::now(),
        });
        let mut warnings: Vec<Warning> = Vec::new();
        let mut aborted: Option<AbortReason> = None;
        let mut state = WorkflowState::Idle.advance();
        info!("Starting run {} for user {}", run_id, user_id);

        while let Some(stage) = state.stage() {
            debug!("Run {} entering {}", run_id, stage);
            match self.run_stage(stage, &ctx, &mut warnings).await {
                Ok(record) => {
                    ctx.commit(record);
                    state = state.advance();
                }
                Err(reason) => {
                    warn!("Run {} aborted in {}: {:?}", run_id, stage, reason.code);
                    aborted = Some(reason);
                    state = WorkflowState::Failed;
                }
            }
        }
        info!("Run {} for user {} ended in {:?}", run_id, user_id, state);

        if let Some(reason) = aborted {
            return Ok(WorkflowOutcome::Aborted(reason));
        }
        let content = self.finalize(&ctx).await;
        info!(
            "Run {} completed for user {} with {} warnings",
            run_id,
            user_id,
            warnings.len()
        );
        Ok(WorkflowOutcome::Completed { content, warnings })
    }

    /// Execute one stage, degrading it if allowed. Discovery output is
    /// capped and committed to memory here.
    async fn run_stage(
        &self,
        stage: Stage,
        ctx: &WorkflowContext,
        warnings: &mut Vec<Warning>,
    ) -> Result<StageRecord, AbortReason> {
        let mut record = match self.execute_stage(stage, ctx, warnings).await {
            Ok(record) => record,
            Err(failure) => self.degrade(stage, ctx, failure, warnings)?,
        };

        if stage == Stage::Discovering {
            cap_articles(&mut record.output, ctx.input().request.max_articles);
            if record.output.get_array("articles").map_or(true, |a| a.is_empty()) {
                return Err(AbortReason {
                    code: AbortCode::NoContent,
                    stage: Some(stage),
                    detail: "discovery returned no articles".to_string(),
                });
            }
            self.commit_articles(ctx, &record.output).await;
        }
        Ok(record)
    }

    /// Decide what a stage failure means for the run: abort, or fall back.
    fn degrade(
        &self,
        stage: Stage,
        ctx: &WorkflowContext,
        failure: StageFailure,
        warnings: &mut Vec<Warning>,
    ) -> Result<StageRecord, AbortReason> {
        let abort = |code| AbortReason {
            code,
            stage: Some(stage),
            detail: failure.detail.clone(),
        };
        if failure.kind.is_programming_error() {
            let code = if failure.kind == FailureKind::UnsupportedTask {
                AbortCode::UnsupportedTask
            } else {
                AbortCode::PlanInvalid
            };
            return Err(abort(code));
        }
        if self.settings.orchestrator.is_critical(stage) {
            let code = if failure.kind == FailureKind::CircuitOpen {
                AbortCode::CircuitOpen
            } else {
                AbortCode::StageFailed
            };
            return Err(abort(code));
        }

        warn!("Stage {} degraded to fallback: {} ({})", stage, failure.detail, failure.kind);
        let keys: Vec<String> = Stage::ALL.iter().map(|s| s.key().to_string()).collect();
        let output = fallback(stage, &ctx.view(&keys, &[]));
        warnings.push(Warning {
            stage,
            reason: format!("{}: {}", failure.kind, failure.detail),
        });
        Ok(StageRecord {
            stage,
            steps: Vec::new(),
            output,
            degraded: true,
        })
    }

    async fn execute_stage(
        &self,
        stage: Stage,
        ctx: &WorkflowContext,
        warnings: &mut Vec<Warning>,
    ) -> Result<StageRecord, StageFailure> {
        let plan = PlanBuilder::for_stage(stage, ctx, &self.settings.orchestrator)
            .map_err(|e| StageFailure::new(e.kind(), e.to_string()))?;

        let mut steps: Vec<(String, StagePayload)> = Vec::with_capacity(plan.steps().len());
        let last = plan.steps().len().saturating_sub(1);
        for (index, step) in plan.steps().iter().enumerate() {
            let prior: Vec<(String, StagePayload)> = steps
                .iter()
                .filter(|(name, _)| step.depends_on.contains(name))
                .cloned()
                .collect();
            let validate_as = (index == last).then_some(stage);

            let payload = match step.executor {
                Executor::MemoryRecall => self.recall_step(ctx).await,
                Executor::Agent(kind) if step.is_fan_out() => {
                    self.fan_out(stage, kind, step, ctx, &prior, validate_as, warnings)
                        .await?
                }
                Executor::Agent(kind) => {
                    let view = ctx.view(&step.consumes, &prior);
                    match self.invoke(kind, &step.task_name, &view, validate_as).await {
                        AgentResult::Success(payload) => payload,
                        AgentResult::Failure { kind, detail }
                            if step.optional && !kind.is_programming_error() =>
                        {
                            debug!("Skipping optional step {} in {}: {}", step.task_name, stage, detail);
                            warnings.push(Warning {
                                stage,
                                reason: format!("{}: {} failed: {}", kind, step.task_name, detail),
                            });
                            continue;
                        }
                        AgentResult::Failure { kind, detail } => {
                            return Err(StageFailure::new(
                                kind,
                                format!("{} failed: {}", step.task_name, detail),
                            ))
                        }
                    }
                }
            };
            steps.push((step.task_name.clone(), payload));
        }

        let output = match steps.last() {
            Some((_, payload)) => payload.clone(),
            None => return Err(StageFailure::new(FailureKind::PlanInvalid, "plan produced no steps")),
        };
        stage
            .validate(&output)
            .map_err(|detail| StageFailure::new(FailureKind::InvalidPayload, detail))?;

        Ok(StageRecord {
            stage,
            steps,
            output,
            degraded: false,
        })
    }

    /// Call one agent task with timeout, bounded retries for transient
    /// failures, and a single health outcome per call. With `validate_as`,
    /// a payload that does not fit the stage counts as an `invalid_payload`
    /// failure.
    async fn invoke(
        &self,
        kind: AgentKind,
        task: &str,
        view: &Value,
        validate_as: Option<Stage>,
    ) -> AgentResult {
        let Some(agent) = self.agents.get(kind) else {
            return AgentResult::failure(
                FailureKind::Unavailable,
                format!("no agent registered for {}", kind),
            );
        };
        if !agent.supports(task) {
            // Rejected by the agent itself; never retried, never charged to health.
            return agent.execute(task, view).await;
        }

        let permit = match self.health.acquire(agent.id()) {
            Ok(permit) => permit,
            Err(open) => {
                debug!("Skipping {} on {}: {}", task, kind, open);
                return AgentResult::failure(FailureKind::CircuitOpen, open.to_string());
            }
        };

        let retry = &self.settings.retry;
        let call_timeout = self.settings.orchestrator.agent_timeout();
        let started = Instant::now();
        let mut attempt: u32 = 0;
        let result = loop {
            let result = match tokio::time::timeout(call_timeout, agent.execute(task, view)).await {
                Ok(result) => result,
                Err(_) => AgentResult::failure(
                    FailureKind::Timeout,
                    format!("{} timed out after {:?}", task, call_timeout),
                ),
            };
            match &result {
                AgentResult::Failure { kind, detail }
                    if kind.is_transient() && attempt < retry.max_retries =>
                {
                    attempt += 1;
                    let delay = retry.backoff(attempt);
                    debug!(
                        "Retrying {} on {} in {:?} (attempt {}): {}",
                        task, agent.id(), delay, attempt, detail
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => break result,
            }
        };
        let result = match (result, validate_as) {
            (AgentResult::Success(payload), Some(stage)) => match stage.validate(&payload) {
                Ok(()) => AgentResult::Success(payload),
                Err(detail) => AgentResult::failure(FailureKind::InvalidPayload, detail),
            },
            (result, _) => result,
        };

        let latency = started.elapsed();
        match &result {
            AgentResult::Success(_) => permit.record_success(latency),
            AgentResult::Failure { kind, detail } if kind.counts_against_health() => {
                permit.record_failure(latency, detail)
            }
            AgentResult::Failure { .. } => drop(permit),
        }
        result
    }

    /// Run every branch of a fan-out step, at most `max_fan_out` at a time,
    /// and merge the successful ones.
    #[allow(clippy::too_many_arguments)]
    async fn fan_out(
        &self,
        stage: Stage,
        kind: AgentKind,
        step: &PlanStep,
        ctx: &WorkflowContext,
        prior: &[(String, StagePayload)],
        validate_as: Option<Stage>,
        warnings: &mut Vec<Warning>,
    ) -> Result<StagePayload, StageFailure> {
        let semaphore = Semaphore::new(self.settings.orchestrator.max_fan_out.max(1));
        let base_view = ctx.view(&step.consumes, prior);

        let calls = step.branches.iter().map(|branch| {
            let semaphore = &semaphore;
            let mut view = base_view.clone();
            if let Some(fields) = view.as_object_mut() {
                fields.insert("branch".to_string(), branch.params.clone());
            }
            async move {
                let result = match semaphore.acquire().await {
                    Ok(_slot) => self.invoke(kind, &step.task_name, &view, validate_as).await,
                    Err(e) => AgentResult::failure(FailureKind::Unavailable, e.to_string()),
                };
                (branch, result)
            }
        });
        let results = join_all(calls).await;

        let mut articles: Vec<Value> = Vec::new();
        let mut seen_urls: HashSet<String> = HashSet::new();
        let mut topics: Vec<Value> = Vec::new();
        let mut succeeded = 0usize;
        let mut required_failure: Option<StageFailure> = None;
        let mut last_failure: Option<StageFailure> = None;

        for (branch, result) in results {
            match result {
                AgentResult::Success(payload) => {
                    succeeded += 1;
                    topics.push(json!(branch.label));
                    for article in payload.get_array("articles").cloned().unwrap_or_default() {
                        let url = article["url"].as_str().unwrap_or_default().to_string();
                        if url.is_empty() || seen_urls.insert(url) {
                            articles.push(article);
                        }
                    }
                }
                AgentResult::Failure { kind, detail } => {
                    let failure = StageFailure::new(
                        kind,
                        format!("{} branch '{}' failed: {}", step.task_name, branch.label, detail),
                    );
                    if branch.required {
                        required_failure.get_or_insert(failure);
                    } else {
                        warnings.push(Warning {
                            stage,
                            reason: format!("{}: {}", kind, failure.detail),
                        });
                        last_failure = Some(failure);
                    }
                }
            }
        }

        if let Some(failure) = required_failure {
            return Err(failure);
        }
        if succeeded == 0 {
            return Err(last_failure.unwrap_or_else(|| {
                StageFailure::new(FailureKind::EmptyResult, "fan-out produced no branches")
            }));
        }

        Ok(StagePayload::new(format!(
            "Merged {} articles from {} of {} branches",
            articles.len(),
            succeeded,
            step.branches.len()
        ))
        .with_meta("articles", articles)
        .with_meta("topics", topics))
    }

    /// Local memory lookup feeding the preference stage.
    async fn recall_step(&self, ctx: &WorkflowContext) -> StagePayload {
        let input = ctx.input();
        let query = match ctx.output(Stage::Discovering) {
            Some(discovered) => discovered
                .get_array("articles")
                .map(|articles| {
                    articles
                        .iter()
                        .filter_map(|a| a["title"].as_str())
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .unwrap_or_default(),
            None => String::new(),
        };
        let query = if query.is_empty() {
            input.profile.top_topics(5).join(" ")
        } else {
            truncate_chars(&query, 4_000)
        };

        let run_id = input.run_id.to_string();
        let related: Vec<Value> = match self.memory.recall(&input.user_id, &query, None).await {
            Ok(hits) => hits
                .into_iter()
                // Articles committed earlier in this run are not history.
                .filter(|hit| hit.record.metadata.get("run_id").and_then(Value::as_str) != Some(run_id.as_str()))
                .map(related_entry)
                .collect(),
            Err(e) => {
                warn!("Memory recall failed for user {}: {}", input.user_id, e);
                Vec::new()
            }
        };

        StagePayload::new(format!("Recalled {} related items", related.len()))
            .with_meta("related", related)
    }

    async fn commit_articles(&self, ctx: &WorkflowContext, discovered: &StagePayload) {
        let input = ctx.input();
        let articles = discovered.get_array("articles").cloned().unwrap_or_default();
        let mut stored = 0usize;
        for article in articles {
            let title = article["title"].as_str().unwrap_or_default();
            let summary = article["summary"].as_str().unwrap_or_default();
            let text = format!("{}\n{}", title, summary);
            let mut metadata = Map::new();
            metadata.insert("kind".to_string(), json!("article"));
            metadata.insert("title".to_string(), json!(title));
            metadata.insert("url".to_string(), article["url"].clone());
            metadata.insert("topic".to_string(), article["topic"].clone());
            metadata.insert("run_id".to_string(), json!(input.run_id.to_string()));

            match self.memory.remember(&input.user_id, &text, metadata).await {
                Ok(_) => stored += 1,
                Err(e) => warn!("Failed to store article '{}': {}", title, e),
            }
        }
        debug!("Committed {} discovered articles for user {}", stored, input.user_id);
    }

    /// Assemble the digest, store it, and register its topics.
    async fn finalize(&self, ctx: &WorkflowContext) -> DigestContent {
        let input = ctx.input();
        let drafting = ctx.output(Stage::Drafting);
        let formatting = ctx.output(Stage::Formatting);

        let title = drafting
            .and_then(|d| d.get_str("title"))
            .unwrap_or("Personalized Digest")
            .to_string();
        let body = formatting
            .map(|f| f.body.clone())
            .or_else(|| drafting.map(|d| d.body.clone()))
            .unwrap_or_default();
        let subject_lines = formatting
            .map(|f| f.strings("subject_lines"))
            .unwrap_or_default();
        let mindmap = ctx
            .output(Stage::Enhancing)
            .and_then(|e| e.get_str("mindmap"))
            .map(str::to_string);

        let mut topics = drafting.map(|d| d.strings("topics")).unwrap_or_default();
        if topics.is_empty() {
            if let Some(discovered) = ctx.output(Stage::Discovering) {
                for article in discovered.get_array("articles").map(Vec::as_slice).unwrap_or(&[]) {
                    if let Some(topic) = article["topic"].as_str() {
                        if !topics.iter().any(|t| t == topic) {
                            topics.push(topic.to_string());
                        }
                    }
                }
            }
        }
        if topics.is_empty() {
            topics = input.profile.top_topics(self.settings.orchestrator.max_discovery_topics);
        }

        let article_count = ctx
            .output(Stage::Discovering)
            .and_then(|d| d.get_array("articles"))
            .map_or(0, Vec::len);
        let degraded: Vec<Value> = ctx
            .completed()
            .filter(|record| record.degraded)
            .map(|record| json!(record.stage))
            .collect();

        let content_id = format!("digest-{}", input.run_id);
        let mut metadata = Map::new();
        metadata.insert("run_id".to_string(), json!(input.run_id.to_string()));
        metadata.insert("user_id".to_string(), json!(input.user_id));
        metadata.insert("article_count".to_string(), json!(article_count));
        metadata.insert("degraded_stages".to_string(), Value::Array(degraded));
        metadata.insert("started_at".to_string(), json!(input.started_at.to_rfc3339()));
        metadata.insert("completed_at".to_string(), json!(Utc::now().to_rfc3339()));

        let mut memory_meta = Map::new();
        memory_meta.insert("kind".to_string(), json!("digest"));
        memory_meta.insert("content_id".to_string(), json!(content_id));
        memory_meta.insert("title".to_string(), json!(title));
        memory_meta.insert("topics".to_string(), json!(topics));
        if let Err(e) = self.memory.remember(&input.user_id, &body, memory_meta).await {
            warn!("Failed to store digest {}: {}", content_id, e);
        }
        self.learner.register_content(&content_id, &topics);

        DigestContent {
            content_id,
            title,
            body,
            subject_lines,
            topics,
            mindmap,
            metadata,
        }
    }
}

fn related_entry(hit: ScoredRecord) -> Value {
    json!({
        "content_hash": hit.record.content_hash,
        "score": hit.score,
        "metadata": hit.record.metadata,
    })
}

fn meta_str(metadata: &Map<String, Value>, key: &str) -> String {
    metadata
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn cap_articles(payload: &mut StagePayload, max_articles: usize) {
    if let Some(Value::Array(articles)) = payload.metadata.get_mut("articles") {
        articles.truncate(max_articles);
    }
}
