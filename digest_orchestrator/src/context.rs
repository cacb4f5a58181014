//! Per-run workflow state: stages, payloads and the append-only context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::preference::PreferenceProfile;

/// One step of the digest workflow, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovering,
    RetrievingPreferences,
    Drafting,
    Enhancing,
    Formatting,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Discovering,
        Stage::RetrievingPreferences,
        Stage::Drafting,
        Stage::Enhancing,
        Stage::Formatting,
    ];

    /// Context key under which the stage output is stored.
    pub fn key(self) -> &'static str {
        match self {
            Stage::Discovering => "discovering",
            Stage::RetrievingPreferences => "retrieving_preferences",
            Stage::Drafting => "drafting",
            Stage::Enhancing => "enhancing",
            Stage::Formatting => "formatting",
        }
    }

    pub fn from_key(key: &str) -> Option<Stage> {
        Stage::ALL.into_iter().find(|stage| stage.key() == key)
    }

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Discovering => Some(Stage::RetrievingPreferences),
            Stage::RetrievingPreferences => Some(Stage::Drafting),
            Stage::Drafting => Some(Stage::Enhancing),
            Stage::Enhancing => Some(Stage::Formatting),
            Stage::Formatting => None,
        }
    }

    /// Check the minimal metadata schema every output of this stage must satisfy.
    pub fn validate(self, payload: &StagePayload) -> Result<(), String> {
        let require_array = |key: &str| {
            payload
                .get_array(key)
                .map(|_| ())
                .ok_or_else(|| format!("{} output is missing array '{}'", self, key))
        };
        let require_str = |key: &str| {
            payload
                .get_str(key)
                .map(|_| ())
                .ok_or_else(|| format!("{} output is missing string '{}'", self, key))
        };

        match self {
            Stage::Discovering => require_array("articles"),
            Stage::RetrievingPreferences => require_array("topics"),
            Stage::Drafting => {
                require_str("title")?;
                require_array("sections")
            }
            Stage::Enhancing => require_str("mindmap"),
            Stage::Formatting => match payload.get_array("subject_lines") {
                Some(lines) if !lines.is_empty() => Ok(()),
                Some(_) => Err(format!("{} output has no subject lines", self)),
                None => Err(format!("{} output is missing array 'subject_lines'", self)),
            },
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Workflow state machine. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Idle,
    Discovering,
    RetrievingPreferences,
    Drafting,
    Enhancing,
    Formatting,
    Done,
    Failed,
}

impl WorkflowState {
    /// The stage being executed in this state, if any.
    pub fn stage(self) -> Option<Stage> {
        match self {
            WorkflowState::Discovering => Some(Stage::Discovering),
            WorkflowState::RetrievingPreferences => Some(Stage::RetrievingPreferences),
            WorkflowState::Drafting => Some(Stage::Drafting),
            WorkflowState::Enhancing => Some(Stage::Enhancing),
            WorkflowState::Formatting => Some(Stage::Formatting),
            WorkflowState::Idle | WorkflowState::Done | WorkflowState::Failed => None,
        }
    }

    /// State entered after the current one completes successfully.
    pub fn advance(self) -> WorkflowState {
        match self {
            WorkflowState::Idle => WorkflowState::Discovering,
            WorkflowState::Done | WorkflowState::Failed => self,
            running => running
                .stage()
                .and_then(Stage::next)
                .map(WorkflowState::from)
                .unwrap_or(WorkflowState::Done),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowState::Done | WorkflowState::Failed)
    }
}

impl From<Stage> for WorkflowState {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Discovering => WorkflowState::Discovering,
            Stage::RetrievingPreferences => WorkflowState::RetrievingPreferences,
            Stage::Drafting => WorkflowState::Drafting,
            Stage::Enhancing => WorkflowState::Enhancing,
            Stage::Formatting => WorkflowState::Formatting,
        }
    }
}

/// Uniform result shape: a content body plus a metadata map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagePayload {
    pub body: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl StagePayload {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            metadata: Map::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Parse provider output. A missing or non-string `body` is rejected, a
    /// missing `metadata` map is treated as empty.
    pub fn from_value(value: Value) -> Result<Self, String> {
        let Value::Object(mut object) = value else {
            return Err("provider output is not an object".to_string());
        };
        let body = match object.remove("body") {
            Some(Value::String(body)) => body,
            Some(_) => return Err("'body' is not a string".to_string()),
            None => return Err("'body' is missing".to_string()),
        };
        let metadata = match object.remove("metadata") {
            Some(Value::Object(metadata)) => metadata,
            None | Some(Value::Null) => Map::new(),
            Some(_) => return Err("'metadata' is not an object".to_string()),
        };
        Ok(Self { body, metadata })
    }

    pub fn to_value(&self) -> Value {
        json!({ "body": self.body, "metadata": self.metadata })
    }

    pub fn get_array(&self, key: &str) -> Option<&Vec<Value>> {
        self.metadata.get(key).and_then(Value::as_array)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// String entries of a metadata array, skipping anything else.
    pub fn strings(&self, key: &str) -> Vec<String> {
        self.get_array(key)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Parameters of one digest request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DigestRequest {
    pub custom_prompt: Option<String>,
    pub topics: Vec<String>,
    pub max_articles: usize,
    pub days_back: u32,
}

impl Default for DigestRequest {
    fn default() -> Self {
        Self {
            custom_prompt: None,
            topics: Vec::new(),
            max_articles: 10,
            days_back: 3,
        }
    }
}

impl DigestRequest {
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.custom_prompt = Some(prompt.into());
        self
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_articles(mut self, max_articles: usize) -> Self {
        self.max_articles = max_articles;
        self
    }

    /// Trim and lowercase topics, drop blanks, and reject unusable limits.
    pub fn normalized(mut self) -> Result<Self, OrchestratorError> {
        if self.max_articles == 0 {
            return Err(OrchestratorError::InvalidRequest(
                "max_articles must be at least 1".to_string(),
            ));
        }
        if self.days_back == 0 {
            return Err(OrchestratorError::InvalidRequest(
                "days_back must be at least 1".to_string(),
            ));
        }
        self.custom_prompt = self
            .custom_prompt
            .map(|prompt| prompt.trim().to_string())
            .filter(|prompt| !prompt.is_empty());

        let mut topics: Vec<String> = Vec::with_capacity(self.topics.len());
        for topic in self.topics.iter().map(|t| t.trim().to_lowercase()) {
            if !topic.is_empty() && !topics.contains(&topic) {
                topics.push(topic);
            }
        }
        self.topics = topics;
        Ok(self)
    }
}

/// Immutable input of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunInput {
    pub run_id: Uuid,
    pub user_id: String,
    pub request: DigestRequest,
    pub profile: PreferenceProfile,
    pub started_at: DateTime<Utc>,
}

/// Everything one stage produced.
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    /// Output of each plan step, in execution order.
    pub steps: Vec<(String, StagePayload)>,
    pub output: StagePayload,
    pub degraded: bool,
}

/// Accumulated results of one in-flight run. Stage records are appended
/// once and never rewritten.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    input: RunInput,
    stages: Vec<StageRecord>,
}

impl WorkflowContext {
    pub fn new(input: RunInput) -> Self {
        Self {
            input,
            stages: Vec::with_capacity(Stage::ALL.len()),
        }
    }

    pub fn input(&self) -> &RunInput {
        &self.input
    }

    /// Append a stage record. Returns `false` without touching the context if
    /// the stage already committed.
    pub fn commit(&mut self, record: StageRecord) -> bool {
        if self.record(record.stage).is_some() {
            return false;
        }
        self.stages.push(record);
        true
    }

    pub fn record(&self, stage: Stage) -> Option<&StageRecord> {
        self.stages.iter().find(|record| record.stage == stage)
    }

    pub fn output(&self, stage: Stage) -> Option<&StagePayload> {
        self.record(stage).map(|record| &record.output)
    }

    pub fn completed(&self) -> impl Iterator<Item = &StageRecord> {
        self.stages.iter()
    }

    /// Whether a plan step may consume `key` right now.
    pub fn has_key(&self, key: &str) -> bool {
        match key {
            "input" | "profile" => true,
            other => Stage::from_key(other)
                .map(|stage| self.record(stage).is_some())
                .unwrap_or(false),
        }
    }

    /// Read-only view handed to agents and the fallback generator: the run
    /// input plus only the stage outputs and prior step outputs requested.
    pub fn view(&self, consumes: &[String], prior_steps: &[(String, StagePayload)]) -> Value {
        let mut stages = Map::new();
        for key in consumes {
            if let Some(payload) = Stage::from_key(key).and_then(|stage| self.output(stage)) {
                stages.insert(key.clone(), payload.to_value());
            }
        }

        let mut steps = Map::new();
        for (name, payload) in prior_steps {
            steps.insert(name.clone(), payload.to_value());
        }

        json!({
            "user_id": self.input.user_id,
            "run_id": self.input.run_id.to_string(),
            "request": self.input.request,
            "profile": self.input.profile,
            "stages": stages,
            "steps": steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> WorkflowContext {
        WorkflowContext::new(RunInput {
            run_id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            request: DigestRequest::default(),
            profile: PreferenceProfile::uniform(&["technology".to_string()]),
            started_at: Utc::now(),
        })
    }

    fn record(stage: Stage, body: &str) -> StageRecord {
        StageRecord {
            stage,
            steps: Vec::new(),
            output: StagePayload::new(body).with_meta("articles", json!([])),
            degraded: false,
        }
    }

    #[test]
    fn test_state_machine_walks_every_stage() {
        let mut state = WorkflowState::Idle;
        let mut visited = Vec::new();
        while !state.is_terminal() {
            state = state.advance();
            if let Some(stage) = state.stage() {
                visited.push(stage);
            }
        }
        assert_eq!(visited, Stage::ALL.to_vec());
        assert_eq!(state, WorkflowState::Done);
        assert_eq!(WorkflowState::Failed.advance(), WorkflowState::Failed);
    }

    #[test]
    fn test_commit_never_overwrites() {
        let mut ctx = context();
        assert!(!ctx.has_key("discovering"));
        assert!(ctx.commit(record(Stage::Discovering, "first")));
        assert!(!ctx.commit(record(Stage::Discovering, "second")));
        assert_eq!(ctx.output(Stage::Discovering).unwrap().body, "first");
        assert!(ctx.has_key("discovering"));
        assert!(ctx.has_key("input"));
        assert!(!ctx.has_key("nonsense"));
    }

    #[test]
    fn test_view_only_exposes_consumed_stages() {
        let mut ctx = context();
        ctx.commit(record(Stage::Discovering, "found"));
        let hidden = ctx.view(&[], &[]);
        assert!(hidden["stages"].as_object().unwrap().is_empty());

        let steps = vec![("structure_content".to_string(), StagePayload::new("outline"))];
        let view = ctx.view(&["discovering".to_string()], &steps);
        assert_eq!(view["stages"]["discovering"]["body"], "found");
        assert_eq!(view["steps"]["structure_content"]["body"], "outline");
        assert_eq!(view["user_id"], "u1");
    }

    #[test]
    fn test_payload_parsing_requires_string_body() {
        assert!(StagePayload::from_value(json!({"metadata": {}})).is_err());
        assert!(StagePayload::from_value(json!({"body": 3})).is_err());
        assert!(StagePayload::from_value(json!("text")).is_err());

        let payload = StagePayload::from_value(json!({"body": "ok"})).unwrap();
        assert!(payload.metadata.is_empty());
    }

    #[test]
    fn test_stage_schemas() {
        let drafting = StagePayload::new("d").with_meta("title", "T");
        assert!(Stage::Drafting.validate(&drafting).is_err());
        let drafting = drafting.with_meta("sections", json!([]));
        assert!(Stage::Drafting.validate(&drafting).is_ok());

        let formatting = StagePayload::new("f").with_meta("subject_lines", json!([]));
        assert!(Stage::Formatting.validate(&formatting).is_err());
    }

    #[test]
    fn test_request_normalization() {
        let request = DigestRequest::default()
            .with_prompt("   ")
            .with_topics([" AI ", "ai", "", "Rust"])
            .normalized()
            .unwrap();
        assert_eq!(request.custom_prompt, None);
        assert_eq!(request.topics, vec!["ai", "rust"]);

        let err = DigestRequest::default().with_max_articles(0).normalized();
        assert!(matches!(err, Err(OrchestratorError::InvalidRequest(_))));
    }
}
