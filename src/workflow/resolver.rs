//! Definition validation and next-step resolution.
//!
//! Precedence when picking what runs next: an explicit jump (handler
//! override, else `next_step_id`) beats `dependencies`, which beat `order`.
//! Steps targeted by a jump or a condition branch only run once something
//! jumps to them.

use std::collections::{HashMap, HashSet};

use super::model::{OnError, StepExecutionRecord, StepSpec, StepStatus, WorkflowDefinition};
use crate::error::WorkflowError;

/// Check a definition before it is stored.
///
/// `is_known_type` reports whether a step type has a registered handler.
pub fn validate(
    definition: &WorkflowDefinition,
    is_known_type: impl Fn(&str) -> bool,
) -> Result<(), WorkflowError> {
    let invalid = |msg: String| -> Result<(), WorkflowError> {
        Err(WorkflowError::InvalidDefinition(msg))
    };

    if definition.name.trim().is_empty() {
        return invalid("workflow name must not be empty".into());
    }
    if definition.steps.is_empty() {
        return invalid("workflow must have at least one step".into());
    }

    let mut ids = HashSet::new();
    for step in &definition.steps {
        if step.id.trim().is_empty() {
            return invalid("step id must not be empty".into());
        }
        if !ids.insert(step.id.as_str()) {
            return invalid(format!("duplicate step id '{}'", step.id));
        }
    }

    for step in &definition.steps {
        if !is_known_type(&step.step_type) {
            return invalid(format!(
                "step '{}' has unknown type '{}'",
                step.id, step.step_type
            ));
        }
        for dep in &step.dependencies {
            if !ids.contains(dep.as_str()) {
                return invalid(format!("step '{}' depends on unknown step '{dep}'", step.id));
            }
        }
        for target in step.jump_targets() {
            if !ids.contains(target) {
                return invalid(format!("step '{}' jumps to unknown step '{target}'", step.id));
            }
        }
    }

    if let Some(cycle_at) = find_cycle(definition) {
        return invalid(format!("dependency cycle through step '{cycle_at}'"));
    }
    Ok(())
}

/// DFS over dependency and jump edges. Returns a step on a cycle, if any.
fn find_cycle(definition: &WorkflowDefinition) -> Option<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    // step -> steps that must not come before it
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in &definition.steps {
        for dep in &step.dependencies {
            edges.entry(dep.as_str()).or_default().push(step.id.as_str());
        }
        for target in step.jump_targets() {
            edges.entry(step.id.as_str()).or_default().push(target);
        }
    }

    fn visit<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Option<&'a str> {
        match marks.get(node) {
            Some(Mark::Visiting) => return Some(node),
            Some(Mark::Done) => return None,
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        for &next in edges.get(node).into_iter().flatten() {
            if let Some(hit) = visit(next, edges, marks) {
                return Some(hit);
            }
        }
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    definition
        .steps
        .iter()
        .find_map(|s| visit(s.id.as_str(), &edges, &mut marks))
        .map(str::to_string)
}

/// Current status of every step, keyed by id.
pub fn step_statuses(records: &[StepExecutionRecord]) -> HashMap<&str, StepStatus> {
    records
        .iter()
        .map(|r| (r.step_id.as_str(), r.status))
        .collect()
}

/// Jump targets chosen by completed steps.
fn activated_jumps(records: &[StepExecutionRecord]) -> HashSet<&str> {
    records
        .iter()
        .filter(|r| r.status == StepStatus::Completed)
        .filter_map(|r| r.next_step_id.as_deref())
        .collect()
}

/// Pending steps that may be dispatched now, in definition order.
pub fn runnable_steps<'a>(
    definition: &'a WorkflowDefinition,
    records: &[StepExecutionRecord],
) -> Vec<&'a StepSpec> {
    let statuses = step_statuses(records);
    let jump_only = definition.jump_only_steps();
    let activated = activated_jumps(records);
    let continue_on_error = definition.error_policy.on_error == OnError::Continue;

    let status_of = |id: &str| statuses.get(id).copied().unwrap_or(StepStatus::Pending);
    let resolved = |id: &str| match status_of(id) {
        StepStatus::Completed | StepStatus::Skipped => true,
        StepStatus::Failed => continue_on_error,
        StepStatus::Pending | StepStatus::Running => false,
    };
    // A pending jump-only step nobody jumped to does not hold back later steps.
    let dormant = |id: &str| {
        jump_only.contains(id) && !activated.contains(id) && status_of(id) == StepStatus::Pending
    };

    definition
        .steps
        .iter()
        .filter(|step| status_of(&step.id) == StepStatus::Pending)
        .filter(|step| !jump_only.contains(step.id.as_str()) || activated.contains(step.id.as_str()))
        .filter(|step| step.dependencies.iter().all(|dep| resolved(dep)))
        .filter(|step| {
            !step.dependencies.is_empty()
                || jump_only.contains(step.id.as_str())
                || definition
                    .steps
                    .iter()
                    .filter(|other| other.order < step.order)
                    .all(|other| status_of(&other.id).is_terminal() || dormant(&other.id))
        })
        .collect()
}

/// Steps made unreachable by `source` completing and jumping to `target`.
///
/// Covers the untaken branches of a condition and every pending,
/// dependency-free step ordered between `source` and `target`.
pub fn bypassed_steps<'a>(
    definition: &'a WorkflowDefinition,
    records: &[StepExecutionRecord],
    source: &StepSpec,
    target: Option<&str>,
) -> Vec<&'a str> {
    let statuses = step_statuses(records);
    let jump_only = definition.jump_only_steps();
    let pending = |id: &str| statuses.get(id).copied() == Some(StepStatus::Pending);

    let mut bypassed: Vec<&str> = Vec::new();
    for branch in source.branch_targets() {
        if Some(branch) != target
            && pending(branch)
            && let Some(step) = definition.step(branch)
        {
            bypassed.push(step.id.as_str());
        }
    }

    if let Some(target) = target.and_then(|t| definition.step(t)) {
        for step in &definition.steps {
            if step.order > source.order
                && step.order < target.order
                && step.dependencies.is_empty()
                && !jump_only.contains(step.id.as_str())
                && pending(&step.id)
                && !bypassed.contains(&step.id.as_str())
            {
                bypassed.push(step.id.as_str());
            }
        }
    }
    bypassed
}

/// Whether any step is dispatched or executing.
pub fn has_in_flight(records: &[StepExecutionRecord]) -> bool {
    records.iter().any(|r| r.status == StepStatus::Running)
}
