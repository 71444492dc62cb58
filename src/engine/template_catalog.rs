//! Compiled template cache.
//!
//! A template version never changes once saved, so its compiled graph is
//! built once and shared as an `Arc`.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::WorkflowResult;
use crate::models::graph::CompiledTemplate;
use crate::store::WorkflowStore;

#[derive(Debug, Default)]
pub struct TemplateCatalog {
    compiled: DashMap<(Uuid, i32), Arc<CompiledTemplate>>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, compiled: CompiledTemplate) -> Arc<CompiledTemplate> {
        let key = (compiled.template.id, compiled.template.version);
        let compiled = Arc::new(compiled);
        self.compiled.insert(key, Arc::clone(&compiled));
        compiled
    }

    /// A specific version, compiling it from the store on first use.
    pub async fn get(
        &self,
        store: &dyn WorkflowStore,
        template_id: Uuid,
        version: i32,
    ) -> WorkflowResult<Arc<CompiledTemplate>> {
        if let Some(compiled) = self.compiled.get(&(template_id, version)) {
            return Ok(Arc::clone(compiled.value()));
        }
        let template = store.load_template(template_id, Some(version)).await?;
        debug!(%template_id, version, "Compiling template");
        Ok(self.insert(template.compile()?))
    }

    /// The newest stored version.
    pub async fn latest(
        &self,
        store: &dyn WorkflowStore,
        template_id: Uuid,
    ) -> WorkflowResult<Arc<CompiledTemplate>> {
        let template = store.load_template(template_id, None).await?;
        if let Some(compiled) = self.compiled.get(&(template_id, template.version)) {
            return Ok(Arc::clone(compiled.value()));
        }
        Ok(self.insert(template.compile()?))
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}
