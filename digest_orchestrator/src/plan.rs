//! Stage task plans: ordered, dependency-checked sub-task lists.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

use crate::agent::AgentKind;
use crate::context::{Stage, WorkflowContext};
use crate::error::FailureKind;
use crate::fallback::DEFAULT_TOPICS;
use crate::settings::OrchestratorConfig;

/// Who runs a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "agent")]
pub enum Executor {
    Agent(AgentKind),
    /// Local similarity query against the retrieval memory.
    MemoryRecall,
}

/// One parallel sub-call of a fan-out step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Branch {
    pub label: String,
    pub params: Value,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanStep {
    pub task_name: String,
    pub executor: Executor,
    pub depends_on: Vec<String>,
    pub consumes: Vec<String>,
    pub branches: Vec<Branch>,
    /// A failed optional step is skipped with a warning; later steps run
    /// without its output.
    pub optional: bool,
}

impl PlanStep {
    pub fn agent(kind: AgentKind, task_name: &str) -> Self {
        Self::new(Executor::Agent(kind), task_name)
    }

    pub fn memory_recall(task_name: &str) -> Self {
        Self::new(Executor::MemoryRecall, task_name)
    }

    fn new(executor: Executor, task_name: &str) -> Self {
        Self {
            task_name: task_name.to_string(),
            executor,
            depends_on: Vec::new(),
            consumes: vec!["input".to_string()],
            branches: Vec::new(),
            optional: false,
        }
    }

    pub fn after(mut self, task_name: &str) -> Self {
        self.depends_on.push(task_name.to_string());
        self
    }

    pub fn consumes(mut self, key: &str) -> Self {
        if !self.consumes.iter().any(|k| k == key) {
            self.consumes.push(key.to_string());
        }
        self
    }

    pub fn fan_out(mut self, branches: Vec<Branch>) -> Self {
        self.branches = branches;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn is_fan_out(&self) -> bool {
        !self.branches.is_empty()
    }
}

/// Serialized plan entry: `{task_name, depends_on, consumes}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanDescriptor {
    pub task_name: String,
    pub depends_on: Vec<String>,
    pub consumes: Vec<String>,
}

/// Validated plan for one stage.
#[derive(Debug, Clone, Serialize)]
pub struct TaskPlan {
    stage: Stage,
    steps: Vec<PlanStep>,
}

impl TaskPlan {
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn descriptor(&self) -> Vec<PlanDescriptor> {
        self.steps
            .iter()
            .map(|step| PlanDescriptor {
                task_name: step.task_name.clone(),
                depends_on: step.depends_on.clone(),
                consumes: step.consumes.clone(),
            })
            .collect()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan for {0} has no steps")]
    Empty(Stage),

    #[error("task '{0}' appears more than once")]
    DuplicateTask(String),

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    MissingDependency { task: String, dependency: String },

    #[error("task '{task}' depends on later task '{dependency}'")]
    OutOfOrder { task: String, dependency: String },

    #[error("dependency cycle among tasks {0:?}")]
    Cycle(Vec<String>),

    #[error("task '{task}' consumes '{key}', which is not in the context yet")]
    MissingContext { task: String, key: String },

    #[error("agent '{agent}' does not support task '{task}'")]
    UnsupportedTask { task: String, agent: AgentKind },
}

impl PlanError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PlanError::UnsupportedTask { .. } => FailureKind::UnsupportedTask,
            _ => FailureKind::PlanInvalid,
        }
    }
}

/// Collects steps for a stage and validates them against the context.
#[derive(Debug)]
pub struct PlanBuilder {
    stage: Stage,
    steps: Vec<PlanStep>,
}

impl PlanBuilder {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: PlanStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Validate and freeze the plan.
    pub fn build(self, ctx: &WorkflowContext) -> Result<TaskPlan, PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::Empty(self.stage));
        }

        let mut position: HashMap<&str, usize> = HashMap::new();
        for (index, step) in self.steps.iter().enumerate() {
            if position.insert(step.task_name.as_str(), index).is_some() {
                return Err(PlanError::DuplicateTask(step.task_name.clone()));
            }
        }

        for step in &self.steps {
            for dependency in &step.depends_on {
                if !position.contains_key(dependency.as_str()) {
                    return Err(PlanError::MissingDependency {
                        task: step.task_name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        check_acyclic(&self.steps)?;

        for (index, step) in self.steps.iter().enumerate() {
            for dependency in &step.depends_on {
                if position[dependency.as_str()] >= index {
                    return Err(PlanError::OutOfOrder {
                        task: step.task_name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
            for key in &step.consumes {
                if !ctx.has_key(key) {
                    return Err(PlanError::MissingContext {
                        task: step.task_name.clone(),
                        key: key.clone(),
                    });
                }
            }
            if let Executor::Agent(kind) = step.executor {
                if !kind.tasks().iter().any(|t| *t == step.task_name) {
                    return Err(PlanError::UnsupportedTask {
                        task: step.task_name.clone(),
                        agent: kind,
                    });
                }
            }
        }

        drop(position);
        Ok(TaskPlan {
            stage: self.stage,
            steps: self.steps,
        })
    }

    /// The standard plan for `stage` given what the run has produced so far.
    pub fn for_stage(
        stage: Stage,
        ctx: &WorkflowContext,
        config: &OrchestratorConfig,
    ) -> Result<TaskPlan, PlanError> {
        let builder = PlanBuilder::new(stage);
        let builder = match stage {
            Stage::Discovering => {
                if ctx.input().request.custom_prompt.is_some() {
                    builder
                        .step(
                            PlanStep::agent(AgentKind::PromptInterpretation, "process_prompt")
                                .optional(),
                        )
                        .step(
                            PlanStep::agent(AgentKind::Discovery, "search_custom_prompt")
                                .after("process_prompt"),
                        )
                } else {
                    builder.step(
                        PlanStep::agent(AgentKind::Discovery, "search_by_preferences")
                            .consumes("profile")
                            .fan_out(discovery_branches(ctx, config.max_discovery_topics)),
                    )
                }
            }
            Stage::RetrievingPreferences => builder
                .step(PlanStep::memory_recall("recall_memory").consumes("discovering"))
                .step(
                    PlanStep::agent(AgentKind::Preference, "get_preferences")
                        .after("recall_memory")
                        .consumes("profile"),
                ),
            Stage::Drafting => builder
                .step(
                    PlanStep::agent(AgentKind::Drafting, "analyze_preferences")
                        .consumes("retrieving_preferences"),
                )
                .step(
                    PlanStep::agent(AgentKind::Drafting, "structure_content")
                        .after("analyze_preferences")
                        .consumes("discovering"),
                )
                .step(
                    PlanStep::agent(AgentKind::Drafting, "generate_sections")
                        .after("structure_content"),
                )
                .step(
                    PlanStep::agent(AgentKind::Drafting, "enhance_with_memory")
                        .after("generate_sections")
                        .consumes("retrieving_preferences"),
                )
                .step(
                    PlanStep::agent(AgentKind::Drafting, "format_output")
                        .after("enhance_with_memory")
                        .after("analyze_preferences"),
                ),
            Stage::Enhancing => builder.step(
                PlanStep::agent(AgentKind::Visualization, "generate_mindmap").consumes("drafting"),
            ),
            Stage::Formatting => builder
                .step(
                    PlanStep::agent(AgentKind::Drafting, "generate_subject_lines")
                        .consumes("drafting"),
                )
                .step(
                    PlanStep::agent(AgentKind::Drafting, "format_for_delivery")
                        .after("generate_subject_lines")
                        .consumes("drafting")
                        .consumes("enhancing"),
                ),
        };
        builder.build(ctx)
    }
}

/// One search branch per topic. The top-ranked topic is required, the rest
/// are best effort.
fn discovery_branches(ctx: &WorkflowContext, max_topics: usize) -> Vec<Branch> {
    let input = ctx.input();
    let mut topics: Vec<String> = if input.request.topics.is_empty() {
        input.profile.top_topics(max_topics.max(1))
    } else {
        input.request.topics.clone()
    };
    if topics.is_empty() {
        topics = DEFAULT_TOPICS.iter().map(|t| t.to_string()).collect();
    }
    topics.truncate(max_topics.max(1));

    topics
        .into_iter()
        .enumerate()
        .map(|(index, topic)| Branch {
            label: topic.clone(),
            params: json!({ "topic": topic }),
            required: index == 0,
        })
        .collect()
}

/// Kahn's algorithm over the step graph; any step left with a non-zero
/// in-degree sits on a cycle.
fn check_acyclic(steps: &[PlanStep]) -> Result<(), PlanError> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        in_degree.entry(step.task_name.as_str()).or_insert(0);
        for dependency in &step.depends_on {
            *in_degree.entry(step.task_name.as_str()).or_insert(0) += 1;
            dependents
                .entry(dependency.as_str())
                .or_default()
                .push(step.task_name.as_str());
        }
    }

    let mut ready: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut visited: HashSet<&str> = HashSet::new();
    while let Some(name) = ready.pop_front() {
        visited.insert(name);
        for dependent in dependents.get(name).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(*dependent);
                }
            }
        }
    }

    if visited.len() == in_degree.len() {
        return Ok(());
    }
    let mut stuck: Vec<String> = steps
        .iter()
        .map(|s| s.task_name.clone())
        .filter(|name| !visited.contains(name.as_str()))
        .collect();
    stuck.sort();
    Err(PlanError::Cycle(stuck))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{DigestRequest, RunInput, StagePayload, StageRecord};
    use crate::preference::PreferenceProfile;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn context(request: DigestRequest) -> WorkflowContext {
        let weights: BTreeMap<String, f64> =
            [("rust".to_string(), 0.7), ("music".to_string(), 0.3)].into_iter().collect();
        WorkflowContext::new(RunInput {
            run_id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            request,
            profile: PreferenceProfile::from_weights(weights).unwrap(),
            started_at: Utc::now(),
        })
    }

    fn commit(ctx: &mut WorkflowContext, stage: Stage) {
        ctx.commit(StageRecord {
            stage,
            steps: Vec::new(),
            output: StagePayload::new(""),
            degraded: false,
        });
    }

    #[test]
    fn test_drafting_plan_descriptor() {
        let mut ctx = context(DigestRequest::default());
        commit(&mut ctx, Stage::Discovering);
        commit(&mut ctx, Stage::RetrievingPreferences);

        let plan = PlanBuilder::for_stage(Stage::Drafting, &ctx, &OrchestratorConfig::default()).unwrap();
        let names: Vec<String> = plan.descriptor().into_iter().map(|d| d.task_name).collect();
        assert_eq!(
            names,
            vec![
                "analyze_preferences",
                "structure_content",
                "generate_sections",
                "enhance_with_memory",
                "format_output"
            ]
        );
        let descriptor = serde_json::to_value(plan.descriptor()).unwrap();
        assert_eq!(descriptor[1]["depends_on"], json!(["analyze_preferences"]));
        assert_eq!(descriptor[1]["consumes"], json!(["input", "discovering"]));
    }

    #[test]
    fn test_missing_context_is_a_construction_error() {
        let ctx = context(DigestRequest::default());
        let err = PlanBuilder::for_stage(Stage::Drafting, &ctx, &OrchestratorConfig::default()).unwrap_err();
        assert!(matches!(err, PlanError::MissingContext { .. }));
        assert_eq!(err.kind(), FailureKind::PlanInvalid);
    }

    #[test]
    fn test_cycles_and_ordering_are_rejected() {
        let ctx = context(DigestRequest::default());
        let cyclic = PlanBuilder::new(Stage::Drafting)
            .step(PlanStep::agent(AgentKind::Drafting, "structure_content").after("generate_sections"))
            .step(PlanStep::agent(AgentKind::Drafting, "generate_sections").after("structure_content"))
            .build(&ctx)
            .unwrap_err();
        assert_eq!(
            cyclic,
            PlanError::Cycle(vec!["generate_sections".into(), "structure_content".into()])
        );

        let late = PlanBuilder::new(Stage::Drafting)
            .step(PlanStep::agent(AgentKind::Drafting, "format_output").after("generate_sections"))
            .step(PlanStep::agent(AgentKind::Drafting, "generate_sections"))
            .build(&ctx)
            .unwrap_err();
        assert!(matches!(late, PlanError::OutOfOrder { .. }));

        let unknown = PlanBuilder::new(Stage::Drafting)
            .step(PlanStep::agent(AgentKind::Drafting, "format_output").after("ghost"))
            .build(&ctx)
            .unwrap_err();
        assert!(matches!(unknown, PlanError::MissingDependency { .. }));

        assert_eq!(
            PlanBuilder::new(Stage::Enhancing).build(&ctx).unwrap_err(),
            PlanError::Empty(Stage::Enhancing)
        );
    }

    #[test]
    fn test_unsupported_task_is_caught_at_build_time() {
        let ctx = context(DigestRequest::default());
        let err = PlanBuilder::new(Stage::Enhancing)
            .step(PlanStep::agent(AgentKind::Visualization, "format_output"))
            .build(&ctx)
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::UnsupportedTask);
    }

    #[test]
    fn test_discovery_fans_out_over_profile_topics() {
        let ctx = context(DigestRequest::default());
        let plan = PlanBuilder::for_stage(Stage::Discovering, &ctx, &OrchestratorConfig::default()).unwrap();
        let branches = &plan.steps()[0].branches;
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[0].label, "rust");
        assert!(branches[0].required);
        assert!(!branches[1].required);

        let ctx = context(DigestRequest::default().with_prompt("latest ai news"));
        let plan = PlanBuilder::for_stage(Stage::Discovering, &ctx, &OrchestratorConfig::default()).unwrap();
        assert_eq!(plan.steps().len(), 2);
        assert_eq!(plan.steps()[1].depends_on, vec!["process_prompt"]);
        assert!(plan.steps()[0].optional);
        assert!(!plan.steps()[1].optional);
    }
}
