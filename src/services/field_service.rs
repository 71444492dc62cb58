//! Field validation contract.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{WorkflowError, WorkflowResult};
use crate::models::field::{FieldEntry, FieldOrigin, FieldSet, FieldTemplate};

/// Validates raw form input against field templates and turns it into a
/// typed [`FieldSet`].
///
/// Failures are reported as [`WorkflowError::FieldValidation`] naming the
/// first offending field.
#[async_trait]
pub trait FieldService: Send + Sync {
    async fn validate_and_store(
        &self,
        templates: &[FieldTemplate],
        origin: FieldOrigin,
        values: &HashMap<String, Value>,
    ) -> WorkflowResult<FieldSet>;
}

/// Validates against the template field definitions only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateFieldService;

#[async_trait]
impl FieldService for TemplateFieldService {
    async fn validate_and_store(
        &self,
        templates: &[FieldTemplate],
        origin: FieldOrigin,
        values: &HashMap<String, Value>,
    ) -> WorkflowResult<FieldSet> {
        let mut unknown: Vec<&String> = values
            .keys()
            .filter(|key| !templates.iter().any(|t| &t.api_name == *key))
            .collect();
        unknown.sort();
        if let Some(api_name) = unknown.first() {
            return Err(WorkflowError::FieldValidation {
                api_name: api_name.to_string(),
                reason: "unknown field".to_string(),
            });
        }

        let mut fields = FieldSet::new();
        for template in templates {
            let parsed = match values.get(&template.api_name) {
                Some(raw) => template.kind.parse(raw).map_err(|reason| {
                    WorkflowError::FieldValidation {
                        api_name: template.api_name.clone(),
                        reason,
                    }
                })?,
                None => None,
            };
            if template.is_required && parsed.is_none() {
                return Err(WorkflowError::FieldValidation {
                    api_name: template.api_name.clone(),
                    reason: "value is required".to_string(),
                });
            }
            fields.insert(FieldEntry {
                api_name: template.api_name.clone(),
                origin: origin.clone(),
                value: parsed,
            });
        }
        Ok(fields)
    }
}
