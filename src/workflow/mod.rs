//! Workflow definitions, step execution and the execution engine.

pub mod condition;
pub mod engine;
pub mod executor;
pub mod model;
pub mod resolver;
pub mod step_task;

pub use condition::{ConditionStep, ContextKeyEvaluator, ExpressionEvaluator, SetStep};
pub use engine::{STEP_TASK_TYPE, StepTaskPayload, WorkflowEngine};
pub use executor::{StepExecutor, StepHandler, StepOutput};
pub use model::{
    Context, DefinitionStatus, ErrorPolicy, ExecutionStatus, OnError, StepExecutionRecord,
    StepSpec, StepStatus, WorkflowDefinition, WorkflowExecution,
};
pub use step_task::WorkflowStepHandler;
