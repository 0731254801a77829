//! Workflow definitions, executions and step records.

use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::WorkflowError;

/// Context shared by all steps of one execution.
pub type Context = Map<String, Value>;

// ── Definitions ─────────────────────────────────────────────────────

/// Publication status of a workflow definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    Draft,
    #[default]
    Active,
    Archived,
}

impl DefinitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }
}

impl FromStr for DefinitionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown definition status '{other}'")),
        }
    }
}

/// What happens to the execution when a step fails terminally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Fail the execution and skip all pending steps.
    #[default]
    Abort,
    /// Mark the step skipped and carry on.
    Skip,
    /// Keep the step failed, unblock its dependents.
    Continue,
}

/// Workflow-level failure handling layered above per-step retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub on_error: OnError,
    /// Failures tolerated under `continue` before the execution fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failures: Option<u32>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            on_error: OnError::default(),
            max_failures: None,
        }
    }
}

/// One step of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Step handler routing key.
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub config: Value,
    /// Steps that must be resolved before this one may run.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Explicit jump target taken after this step completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, step_type: impl Into<String>, order: i64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type: step_type.into(),
            order,
            config: Value::Object(Map::new()),
            dependencies: Vec::new(),
            next_step_id: None,
            max_retries: None,
            timeout_ms: None,
        }
    }

    /// Builder: set the handler config.
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Builder: add a dependency.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    /// Builder: set an explicit jump target.
    pub fn then(mut self, step_id: impl Into<String>) -> Self {
        self.next_step_id = Some(step_id.into());
        self
    }

    /// Builder: set a per-step retry budget.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Builder: set a per-step timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Conditional branch targets declared in the config.
    pub fn branch_targets(&self) -> Vec<&str> {
        ["on_true", "on_false"]
            .iter()
            .filter_map(|key| self.config.get(*key).and_then(Value::as_str))
            .collect()
    }

    /// Every step this one may jump to explicitly.
    pub fn jump_targets(&self) -> Vec<&str> {
        let mut targets = self.branch_targets();
        if let Some(next) = self.next_step_id.as_deref() {
            targets.push(next);
        }
        targets
    }
}

/// A named, ordered collection of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub status: DefinitionStatus,
    /// Seeded into the execution context before the start input.
    #[serde(default)]
    pub variables: Context,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<StepSpec>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            steps,
            status: DefinitionStatus::Active,
            variables: Context::new(),
            error_policy: ErrorPolicy::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set the error policy.
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Builder: set the starting variables.
    pub fn with_variables(mut self, variables: Context) -> Self {
        self.variables = variables;
        self
    }

    pub fn step(&self, step_id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Ids of steps that only run when something jumps to them.
    pub fn jump_only_steps(&self) -> HashSet<&str> {
        self.steps.iter().flat_map(|s| s.jump_targets()).collect()
    }

    /// Attempt budget for a step's queue task.
    pub fn max_attempts_for(&self, step: &StepSpec) -> u32 {
        step.max_retries.unwrap_or(self.error_policy.max_retries) + 1
    }
}

// ── Executions ──────────────────────────────────────────────────────

/// State of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Aborted,
}

impl ExecutionStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: ExecutionStatus) -> bool {
        use ExecutionStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Aborted) |
            (Running, Completed) | (Running, Failed) | (Running, Aborted) | (Running, Paused) |
            (Paused, Running) | (Paused, Aborted)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown execution status '{other}'")),
        }
    }
}

/// One concrete run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub context: Context,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_id: Option<String>,
    /// Completed steps in completion order.
    pub executed_step_ids: Vec<String>,
    pub completed_steps: u32,
    pub failed_steps: u32,
    pub total_steps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(definition: &WorkflowDefinition, context: Context) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id: definition.id.clone(),
            status: ExecutionStatus::Pending,
            context,
            current_step_id: None,
            executed_step_ids: Vec::new(),
            completed_steps: 0,
            failed_steps: 0,
            total_steps: definition.steps.len() as u32,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `target`, stamping start/finish times.
    pub fn transition_to(&mut self, target: ExecutionStatus) -> Result<(), WorkflowError> {
        if !self.status.can_transition_to(target) {
            return Err(WorkflowError::InvalidTransition {
                id: self.id,
                state: self.status.to_string(),
                target: target.to_string(),
            });
        }

        let now = Utc::now();
        if target == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if target.is_terminal() {
            self.completed_at = Some(now);
            self.duration_ms = self
                .started_at
                .map(|start| (now - start).num_milliseconds().max(0) as u64);
        }
        self.status = target;
        self.updated_at = now;
        Ok(())
    }

    /// Percentage of steps that reached completed or failed.
    pub fn progress_percent(&self) -> f64 {
        if self.total_steps == 0 {
            return 100.0;
        }
        f64::from(self.completed_steps + self.failed_steps) * 100.0 / f64::from(self.total_steps)
    }
}

// ── Step records ────────────────────────────────────────────────────

/// Status of one step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown step status '{other}'")),
        }
    }
}

/// Progress of one step within one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    pub execution_id: Uuid,
    pub step_id: String,
    pub status: StepStatus,
    /// Queue task currently carrying this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Re-executions after the first attempt.
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Jump chosen when the step completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,
}

impl StepExecutionRecord {
    pub fn pending(execution_id: Uuid, step: &StepSpec) -> Self {
        Self {
            execution_id,
            step_id: step.id.clone(),
            status: StepStatus::Pending,
            task_id: None,
            input: step.config.clone(),
            output: None,
            error_message: None,
            retry_count: 0,
            execution_time_ms: None,
            started_at: None,
            completed_at: None,
            next_step_id: None,
        }
    }

    /// Close the record with a terminal status.
    pub fn finish(&mut self, status: StepStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        if let Some(start) = self.started_at {
            self.execution_time_ms = Some((now - start).num_milliseconds().max(0) as u64);
        }
    }
}
