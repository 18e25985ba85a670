use super::Journal;
use async_trait::async_trait;
use resource_framework::cancel::CancellationToken;
use resource_framework::definition::ResourceDefinition;
use resource_framework::error::{ApiError, HookError};
use resource_framework::expression::SparseFieldSetExpression;
use resource_framework::graph::ResourceGraph;
use resource_framework::hooks::ResourceHook;
use resource_framework::resource::Resource;

const PASSWORD: &str = "password";

/// Keeps `password` out of every read and journals deletions.
pub struct PersonDefinition {
    journal: Journal,
    public_attributes: SparseFieldSetExpression,
}

impl PersonDefinition {
    pub fn new(graph: &ResourceGraph, journal: Journal) -> Result<Self, ApiError> {
        let context = graph.resource_context("people")?;
        Ok(Self {
            journal,
            public_attributes: SparseFieldSetExpression::new(
                context.attribute_names().filter(|name| *name != PASSWORD),
            ),
        })
    }
}

#[async_trait]
impl ResourceDefinition for PersonDefinition {
    fn on_apply_sparse_field_set(
        &self,
        existing: Option<SparseFieldSetExpression>,
    ) -> Option<SparseFieldSetExpression> {
        Some(match existing {
            Some(mut requested) => {
                requested.attributes.remove(PASSWORD);
                requested
            }
            None => self.public_attributes.clone(),
        })
    }

    fn declares_hook(&self, hook: ResourceHook) -> bool {
        hook == ResourceHook::BeforeDelete
    }

    async fn on_resource_hook(
        &self,
        hook: ResourceHook,
        resources: &[Resource],
        _cancel: &CancellationToken,
    ) -> Result<(), HookError> {
        self.journal.record(hook, resources);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::resource_graph;
    use pretty_assertions::assert_eq;

    #[test]
    fn password_never_survives_the_fieldset_hook() {
        let definition = PersonDefinition::new(&resource_graph().unwrap(), Journal::new()).unwrap();

        let default = definition.on_apply_sparse_field_set(None).unwrap();
        assert_eq!(default.to_string(), "email,name");

        let requested = definition
            .on_apply_sparse_field_set(Some(SparseFieldSetExpression::new(["name", "password"])))
            .unwrap();
        assert_eq!(requested.to_string(), "name");
    }
}
