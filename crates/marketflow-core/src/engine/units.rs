//! Per-type unit handlers

use std::time::Duration;

use serde_json::{Value, json};

use super::FlowEngine;
use crate::condition;
use crate::connectors::PendingMarker;
use crate::error::{Error, Result};
use crate::processor::lookup;
use crate::template::{sole_placeholder, substitute, substitute_map, substitute_value};
use crate::workflow::{ErrorHandling, StepDefinition, StepKind};

/// What one unit produced
#[derive(Debug, Clone, PartialEq)]
pub(super) enum UnitOutcome {
    /// A result to record
    Done(Value),
    /// The connector handed back a pending marker
    Pending {
        connector_id: String,
        action_id: String,
        marker: PendingMarker,
    },
}

impl FlowEngine {
    pub(super) async fn execute_unit(
        &self,
        unit: &StepDefinition,
        context: &Value,
    ) -> Result<UnitOutcome> {
        let outcome = match unit.kind()? {
            StepKind::Action => return self.run_action(unit, context).await,
            StepKind::Decision => self.run_decision(unit, context)?,
            StepKind::Transformer => self.run_transformer(unit, context)?,
            StepKind::Validator => self.run_validator(unit, context)?,
            StepKind::Mapper => self.run_mapper(unit, context),
        };
        Ok(UnitOutcome::Done(outcome))
    }

    async fn run_action(&self, unit: &StepDefinition, context: &Value) -> Result<UnitOutcome> {
        let (connector_id, action_id) = unit.connector_action()?;
        let connector = self.connectors.get(connector_id)?;
        let params = substitute_map(&unit.parameters, context);
        let auth = self
            .credentials
            .get_credentials(connector_id)
            .await?
            .unwrap_or_default();

        let call = connector.execute_action(action_id, &params, &auth);
        let result = match self.config.connector_timeout_secs {
            0 => call.await?,
            seconds => tokio::time::timeout(Duration::from_secs(seconds), call)
                .await
                .map_err(|_| Error::Timeout {
                    connector: connector_id.to_string(),
                    action: action_id.to_string(),
                    seconds,
                })??,
        };

        Ok(match PendingMarker::from_result(&result) {
            Some(marker) => UnitOutcome::Pending {
                connector_id: connector_id.to_string(),
                action_id: action_id.to_string(),
                marker,
            },
            None => UnitOutcome::Done(result),
        })
    }

    fn run_decision(&self, unit: &StepDefinition, context: &Value) -> Result<Value> {
        let raw = unit
            .condition
            .as_deref()
            .ok_or_else(|| Error::missing_field(&unit.id, "condition"))?;
        let condition = substitute(raw, context);
        let result = condition::evaluate(&condition);
        let next_step = if result {
            &unit.true_path
        } else {
            &unit.false_path
        };
        Ok(json!({
            "condition": condition,
            "result": result,
            "next_step": next_step,
        }))
    }

    fn run_transformer(&self, unit: &StepDefinition, context: &Value) -> Result<Value> {
        if let Some(template) = &unit.template {
            return Ok(json!({"result": substitute(template, context)}));
        }
        if unit.transformations.is_empty() {
            return Err(Error::missing_field(&unit.id, "template or transformations"));
        }
        let input = unit_input(unit, context);
        let result = self
            .processor
            .apply_transformations(&input, &unit.transformations)?;
        Ok(json!({"result": result}))
    }

    fn run_validator(&self, unit: &StepDefinition, context: &Value) -> Result<Value> {
        for (_, rules) in unit.validation_rules.iter() {
            if let Some(unknown) = rules
                .iter()
                .find(|r| !self.processor.rules().contains(&r.rule_name))
            {
                return Err(Error::UnknownValidationRule {
                    rule: unknown.rule_name.clone(),
                });
            }
        }

        let input = unit_input(unit, context);
        let report = self.processor.validate_data(&input, &unit.validation_rules);
        if !report.valid && unit.error_handling != ErrorHandling::Continue {
            return Err(Error::Validation {
                step: unit.id.clone(),
                message: report.errors.join("; "),
            });
        }
        Ok(json!({"valid": report.valid, "errors": report.errors}))
    }

    fn run_mapper(&self, unit: &StepDefinition, context: &Value) -> Value {
        let input = unit_input(unit, context);
        json!({"result": self.processor.apply_field_mapping(&input, &unit.field_mapping)})
    }
}

/// Data a transformer, validator or mapper works on.
///
/// A string is a context path (optionally written as `{{ path }}`), any
/// other value a literal with placeholders substituted, and nothing at all
/// means the whole context.
fn unit_input(unit: &StepDefinition, context: &Value) -> Value {
    match &unit.input_data {
        None => context.clone(),
        Some(Value::String(s)) => {
            let path = sole_placeholder(s).unwrap_or_else(|| s.trim());
            lookup(context, path)
        }
        Some(literal) => substitute_value(literal, context),
    }
}
