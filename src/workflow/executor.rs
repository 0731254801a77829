//! Step dispatch by type.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::model::{Context, StepSpec};
use crate::error::StepError;

/// Result of running one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    /// Merged into the execution context.
    #[serde(default)]
    pub output: Context,
    /// Overrides the step's `next_step_id` for this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_override: Option<String>,
}

impl StepOutput {
    pub fn new(output: Context) -> Self {
        Self {
            output,
            next_override: None,
        }
    }

    /// Builder: jump to `step_id` next.
    pub fn jump_to(mut self, step_id: impl Into<String>) -> Self {
        self.next_override = Some(step_id.into());
        self
    }
}

/// Implementation of one step type.
#[async_trait]
pub trait StepHandler: Send + Sync {
    fn step_type(&self) -> &str;

    /// Run `step` against a snapshot of the execution context.
    async fn execute(&self, step: &StepSpec, context: &Context) -> Result<StepOutput, StepError>;
}

/// Registry of step handlers plus the per-step timeout.
pub struct StepExecutor {
    handlers: RwLock<HashMap<String, Arc<dyn StepHandler>>>,
    default_timeout: Duration,
}

impl StepExecutor {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            default_timeout,
        }
    }

    pub fn register(&self, handler: Arc<dyn StepHandler>) {
        let step_type = handler.step_type().to_string();
        debug!(step_type = %step_type, "Registered step handler");
        self.handlers.write().insert(step_type, handler);
    }

    pub fn has_type(&self, step_type: &str) -> bool {
        self.handlers.read().contains_key(step_type)
    }

    /// Registered step types, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn timeout_for(&self, step: &StepSpec) -> Duration {
        step.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout)
    }

    /// Run `step` with its handler, bounded by its timeout.
    pub async fn execute(&self, step: &StepSpec, context: &Context) -> Result<StepOutput, StepError> {
        let handler = self
            .handlers
            .read()
            .get(&step.step_type)
            .cloned()
            .ok_or_else(|| StepError::UnknownType {
                step_type: step.step_type.clone(),
            })?;

        let timeout = self.timeout_for(step);
        match tokio::time::timeout(timeout, handler.execute(step, context)).await {
            Ok(result) => result,
            Err(_) => Err(StepError::Timeout {
                step_id: step.id.clone(),
                timeout,
            }),
        }
    }
}
