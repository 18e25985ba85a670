//! Articles are soft-deleted: setting `isDeleted` hides them from every read,
//! including when they are reached through an include.

use super::stamp_created_at;
use async_trait::async_trait;
use resource_framework::cancel::CancellationToken;
use resource_framework::definition::{ResourceDefinition, WriteOperationKind};
use resource_framework::error::{ApiError, HookError};
use resource_framework::expression::{
    FilterExpression, FilterOperator, FilterValue, SortElement, SortExpression,
};
use resource_framework::graph::{ChainUsage, ResourceGraph};
use resource_framework::resource::Resource;
use serde_json::Value;
use tracing::debug;

pub struct ArticleDefinition {
    not_deleted: FilterExpression,
    newest_first: SortExpression,
}

impl ArticleDefinition {
    pub fn new(graph: &ResourceGraph) -> Result<Self, ApiError> {
        let deleted = graph.resolve_chain("articles", "isDeleted", ChainUsage::Filter)?;
        let created = graph.resolve_chain("articles", "createdAt", ChainUsage::Sort)?;
        Ok(Self {
            not_deleted: FilterExpression::compare(
                deleted,
                FilterOperator::Ne,
                vec![FilterValue::Boolean(true)],
            ),
            newest_first: SortExpression::new(vec![SortElement {
                field: created,
                ascending: false,
            }]),
        })
    }
}

fn require_title(resource: &Resource, required: bool) -> Result<(), HookError> {
    let title = match resource.attribute("title") {
        Some(Value::String(title)) => title.trim(),
        None if !required => return Ok(()),
        _ => "",
    };
    if title.is_empty() {
        return Err(HookError::validation("An article needs a non-empty title.")
            .with_pointer("/data/attributes/title"));
    }
    Ok(())
}

#[async_trait]
impl ResourceDefinition for ArticleDefinition {
    fn on_apply_filter(&self, existing: Option<FilterExpression>) -> Option<FilterExpression> {
        Some(FilterExpression::and_optional(
            existing,
            self.not_deleted.clone(),
        ))
    }

    fn on_apply_sort(&self, existing: Option<SortExpression>) -> Option<SortExpression> {
        existing.or_else(|| Some(self.newest_first.clone()))
    }

    async fn on_prepare_write(
        &self,
        resource: &mut Resource,
        kind: WriteOperationKind,
        _cancel: &CancellationToken,
    ) -> Result<(), HookError> {
        match kind {
            WriteOperationKind::CreateResource => {
                require_title(resource, true)?;
                stamp_created_at(resource);
                resource
                    .attributes
                    .entry("isDeleted".to_string())
                    .or_insert(Value::Bool(false));
                debug!("Stamped new article");
            }
            WriteOperationKind::UpdateResource => require_title(resource, false)?,
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::resource_graph;
    use pretty_assertions::assert_eq;

    fn definition() -> ArticleDefinition {
        ArticleDefinition::new(&resource_graph().unwrap()).unwrap()
    }

    #[test]
    fn read_hooks_add_soft_delete_filter_and_default_sort() {
        let definition = definition();
        let filter = definition.on_apply_filter(None).unwrap();
        assert_eq!(filter.to_string(), "filter[isDeleted]=ne:true");
        assert_eq!(
            definition.on_apply_sort(None).unwrap().to_string(),
            "-createdAt"
        );
    }

    #[tokio::test]
    async fn create_stamps_and_defaults() {
        let mut article = Resource::new("articles").with_attribute("title", "Hello");
        definition()
            .on_prepare_write(
                &mut article,
                WriteOperationKind::CreateResource,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(article.attribute("isDeleted"), Some(&Value::Bool(false)));
        let created = article.attribute("createdAt").and_then(Value::as_str).unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(created).is_ok());
    }

    #[tokio::test]
    async fn blank_title_is_rejected_on_create_and_update() {
        let definition = definition();
        let cancel = CancellationToken::new();
        for (mut article, kind) in [
            (Resource::new("articles"), WriteOperationKind::CreateResource),
            (
                Resource::new("articles").with_attribute("title", "  "),
                WriteOperationKind::UpdateResource,
            ),
        ] {
            let error = definition
                .on_prepare_write(&mut article, kind, &cancel)
                .await
                .unwrap_err();
            assert_eq!(error.status, 422);
            assert_eq!(error.pointer.as_deref(), Some("/data/attributes/title"));
        }

        let mut untouched = Resource::new("articles").with_attribute("body", "text");
        assert!(definition
            .on_prepare_write(&mut untouched, WriteOperationKind::UpdateResource, &cancel)
            .await
            .is_ok());
    }
}
