//! The seam between the two workflow encodings
//!
//! An [`Executor`] decides the order units run in and what happens to a
//! unit's result besides being recorded. The engine drives the loop.

use serde_json::Value;

use super::run::WorkflowRun;
use crate::processor::DataProcessor;
use crate::workflow::WorkflowDefinition;

/// Ordering and result propagation for one workflow encoding
pub trait Executor: Send + Sync {
    /// Execution order as indices into [`WorkflowDefinition::units`].
    ///
    /// Must be deterministic: a suspended run resumes by position.
    fn plan(&self, definition: &WorkflowDefinition) -> Vec<usize>;

    /// Called once `unit_id` produced `result` and it was recorded
    fn propagate(
        &self,
        _definition: &WorkflowDefinition,
        _unit_id: &str,
        _result: &Value,
        _run: &mut WorkflowRun,
        _processor: &DataProcessor,
    ) {
    }
}

/// Steps run strictly in declared order
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearExecutor;

impl Executor for LinearExecutor {
    fn plan(&self, definition: &WorkflowDefinition) -> Vec<usize> {
        (0..definition.units().len()).collect()
    }
}
