use super::{stamp_created_at, Journal};
use async_trait::async_trait;
use resource_framework::cancel::CancellationToken;
use resource_framework::definition::{ResourceDefinition, WriteOperationKind};
use resource_framework::error::HookError;
use resource_framework::graph::RelationshipDescriptor;
use resource_framework::hooks::ResourceHook;
use resource_framework::resource::{RelationshipData, Resource, ResourceIdentifier};
use serde_json::Value;
use std::ops::RangeInclusive;

const PRIORITIES: RangeInclusive<i64> = 1..=5;

pub struct TodoItemDefinition {
    journal: Journal,
}

impl TodoItemDefinition {
    pub fn new(journal: Journal) -> Self {
        Self { journal }
    }
}

fn check_priority(resource: &Resource) -> Result<(), HookError> {
    match resource.attribute("priority") {
        None | Some(Value::Null) => Ok(()),
        Some(value) if value.as_i64().is_some_and(|p| PRIORITIES.contains(&p)) => Ok(()),
        Some(value) => Err(HookError::validation(format!(
            "Priority must be between {} and {}, got {value}.",
            PRIORITIES.start(),
            PRIORITIES.end()
        ))
        .with_pointer("/data/attributes/priority")),
    }
}

#[async_trait]
impl ResourceDefinition for TodoItemDefinition {
    async fn on_prepare_write(
        &self,
        resource: &mut Resource,
        kind: WriteOperationKind,
        _cancel: &CancellationToken,
    ) -> Result<(), HookError> {
        check_priority(resource)?;
        if kind == WriteOperationKind::CreateResource {
            stamp_created_at(resource);
            // Route an absent assignee through the relationship hook below.
            resource
                .relationships
                .entry("assignee".to_string())
                .or_insert(RelationshipData::ToOne(None));
        }
        Ok(())
    }

    /// A new item without an assignee is assigned to its owner.
    async fn on_set_to_one_relationship(
        &self,
        left: &Resource,
        relationship: &RelationshipDescriptor,
        right: Option<ResourceIdentifier>,
        kind: WriteOperationKind,
        _cancel: &CancellationToken,
    ) -> Result<Option<ResourceIdentifier>, HookError> {
        if kind != WriteOperationKind::CreateResource
            || relationship.name != "assignee"
            || right.is_some()
        {
            return Ok(right);
        }
        Ok(match left.relationship("owner") {
            Some(RelationshipData::ToOne(owner)) => owner.clone(),
            _ => None,
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
