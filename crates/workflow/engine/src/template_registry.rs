//! Template registry: stores compiled workflow templates
//!
//! Templates are immutable once registered and shared across every
//! instance through `Arc`. Registering a second template under an id
//! already in use is rejected.

use dashmap::DashMap;
use std::sync::Arc;
use workflow_types::{
    TemplateId, TemplateSpec, WorkflowError, WorkflowResult, WorkflowTemplate,
};

/// Registry of compiled workflow templates
#[derive(Default)]
pub struct TemplateRegistry {
    templates: DashMap<TemplateId, Arc<WorkflowTemplate>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and register a template
    pub fn register(&self, spec: TemplateSpec) -> WorkflowResult<TemplateId> {
        let template = WorkflowTemplate::compile(spec)?;
        self.register_compiled(template)
    }

    pub fn register_compiled(&self, template: WorkflowTemplate) -> WorkflowResult<TemplateId> {
        let id = template.id.clone();
        match self.templates.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(WorkflowError::TemplateAlreadyRegistered(id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                tracing::info!(
                    template_id = %id,
                    states = template.states.len(),
                    transitions = template.transitions.len(),
                    "Workflow template registered"
                );
                slot.insert(Arc::new(template));
                Ok(id)
            }
        }
    }

    pub fn get(&self, id: &TemplateId) -> WorkflowResult<Arc<WorkflowTemplate>> {
        self.templates
            .get(id)
            .map(|t| t.value().clone())
            .ok_or_else(|| WorkflowError::TemplateNotFound(id.clone()))
    }

    pub fn contains(&self, id: &TemplateId) -> bool {
        self.templates.contains_key(id)
    }

    /// Registered template ids, sorted
    pub fn list(&self) -> Vec<TemplateId> {
        let mut ids: Vec<TemplateId> = self.templates.iter().map(|t| t.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn count(&self) -> usize {
        self.templates.len()
    }
}
