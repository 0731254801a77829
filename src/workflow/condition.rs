//! Built-in step handlers: `condition` branching and `set` assignment.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::executor::{StepHandler, StepOutput};
use super::model::{Context, StepSpec};
use crate::error::StepError;

/// Evaluates a condition expression against the execution context.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, context: &Context) -> Result<bool, StepError>;
}

/// Treats the expression as a dotted context path, optionally negated with
/// a leading `!`, and tests the value for truthiness.
///
/// Missing paths, `null`, `false`, `0`, `""`, `[]` and `{}` are falsy.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextKeyEvaluator;

impl ContextKeyEvaluator {
    fn lookup<'a>(path: &str, context: &'a Context) -> Option<&'a Value> {
        let mut parts = path.split('.');
        let mut current = context.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

impl ExpressionEvaluator for ContextKeyEvaluator {
    fn evaluate(&self, expression: &str, context: &Context) -> Result<bool, StepError> {
        let expression = expression.trim();
        let (negate, path) = match expression.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, expression),
        };
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(StepError::Evaluation(format!(
                "invalid context path '{expression}'"
            )));
        }
        Ok(truthy(Self::lookup(path, context)) != negate)
    }
}

/// Chooses the next step from `config.on_true` / `config.on_false`.
///
/// Outputs `{ "<step id>": bool }` so later steps can see the decision.
pub struct ConditionStep {
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl ConditionStep {
    pub fn new(evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self { evaluator }
    }
}

impl Default for ConditionStep {
    fn default() -> Self {
        Self::new(Arc::new(ContextKeyEvaluator))
    }
}

#[async_trait]
impl StepHandler for ConditionStep {
    fn step_type(&self) -> &str {
        "condition"
    }

    async fn execute(&self, step: &StepSpec, context: &Context) -> Result<StepOutput, StepError> {
        let expression = step
            .config
            .get("expression")
            .and_then(Value::as_str)
            .ok_or_else(|| StepError::InvalidConfig {
                step_id: step.id.clone(),
                reason: "missing string field 'expression'".into(),
            })?;

        let result = self.evaluator.evaluate(expression, context)?;
        let branch = if result { "on_true" } else { "on_false" };

        let mut output = Context::new();
        output.insert(step.id.clone(), Value::Bool(result));
        let mut out = StepOutput::new(output);
        out.next_override = step
            .config
            .get(branch)
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(out)
    }
}

/// Emits `config.values` as its output.
pub struct SetStep;

#[async_trait]
impl StepHandler for SetStep {
    fn step_type(&self) -> &str {
        "set"
    }

    async fn execute(&self, step: &StepSpec, _context: &Context) -> Result<StepOutput, StepError> {
        match step.config.get("values") {
            None | Some(Value::Null) => Ok(StepOutput::default()),
            Some(Value::Object(values)) => Ok(StepOutput::new(values.clone())),
            Some(_) => Err(StepError::InvalidConfig {
                step_id: step.id.clone(),
                reason: "'values' must be an object".into(),
            }),
        }
    }
}
