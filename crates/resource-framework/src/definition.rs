//! # ResourceDefinition Trait
//!
//! The `ResourceDefinition` trait is the per-resource-type extension point of
//! the request pipeline. Read hooks rewrite the expressions produced by the
//! query-string reader; write hooks observe and adjust each mutation before
//! and after it reaches storage.
//!
//! # Provided Methods (Hooks)
//! Every method has a default implementation:
//! - Read hooks return their input unchanged.
//! - Write hooks return `Ok(())` (or the proposed relationship value).
//! - [`ResourceDefinition::declares_hook`] returns `false`, so cascading
//!   resource hooks skip the type entirely.
//!
//! A resource type overrides only the hooks it needs.
//!
//! # Hook Order
//! Reads: `on_apply_filter` → `on_apply_sort` → `on_apply_pagination` →
//! `on_apply_sparse_field_set` → `on_apply_includes`.
//!
//! Writes: `on_prepare_write` → relationship hooks → `on_writing` → commit →
//! `on_write_succeeded`. A [`HookError`] anywhere before the commit aborts
//! the operation and its batch.
//!
//! Payloads: `on_deserialize` sees every incoming create or update body
//! before local ids are resolved. `on_serialize` sees every resource on its
//! way out, primary and included alike.

use crate::cancel::CancellationToken;
use crate::error::HookError;
use crate::expression::{
    FilterExpression, IncludeExpression, PaginationExpression, QueryLayer, SortExpression,
    SparseFieldSetExpression,
};
use crate::graph::RelationshipDescriptor;
use crate::hooks::ResourceHook;
use crate::resource::{Resource, ResourceIdentifier, ResourceKey};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// The kind of write a hook is being invoked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOperationKind {
    CreateResource,
    UpdateResource,
    DeleteResource,
    SetRelationship,
    AddToRelationship,
    RemoveFromRelationship,
}

/// Per-resource-type hooks.
///
/// # Async & Cancellation
/// Write hooks are `async` so they can consult other services. Each receives
/// the request's [`CancellationToken`]; long-running hooks should race it.
#[async_trait]
pub trait ResourceDefinition: Send + Sync {
    fn on_apply_filter(&self, existing: Option<FilterExpression>) -> Option<FilterExpression> {
        existing
    }

    fn on_apply_sort(&self, existing: Option<SortExpression>) -> Option<SortExpression> {
        existing
    }

    fn on_apply_pagination(
        &self,
        existing: Option<PaginationExpression>,
    ) -> Option<PaginationExpression> {
        existing
    }

    fn on_apply_sparse_field_set(
        &self,
        existing: Option<SparseFieldSetExpression>,
    ) -> Option<SparseFieldSetExpression> {
        existing
    }

    fn on_apply_includes(&self, existing: Option<IncludeExpression>) -> Option<IncludeExpression> {
        existing
    }

    /// Rewrites a request body after parsing.
    fn on_deserialize(&self, _resource: &mut Resource) {}

    /// Rewrites a resource before it is returned.
    fn on_serialize(&self, _resource: &mut Resource) {}

    /// Extra `meta` entries attached to a returned resource.
    fn get_meta(&self, _resource: &Resource) -> Option<BTreeMap<String, Value>> {
        None
    }

    /// Validation and defaulting before anything is written.
    async fn on_prepare_write(
        &self,
        _resource: &mut Resource,
        _kind: WriteOperationKind,
        _cancel: &CancellationToken,
    ) -> Result<(), HookError> {
        Ok(())
    }

    /// Returns the to-one value that is actually assigned.
    async fn on_set_to_one_relationship(
        &self,
        _left: &Resource,
        _relationship: &RelationshipDescriptor,
        right: Option<ResourceIdentifier>,
        _kind: WriteOperationKind,
        _cancel: &CancellationToken,
    ) -> Result<Option<ResourceIdentifier>, HookError> {
        Ok(right)
    }

    /// Returns the to-many value that is actually assigned.
    async fn on_set_to_many_relationship(
        &self,
        _left: &Resource,
        _relationship: &RelationshipDescriptor,
        right: Vec<ResourceIdentifier>,
        _kind: WriteOperationKind,
        _cancel: &CancellationToken,
    ) -> Result<Vec<ResourceIdentifier>, HookError> {
        Ok(right)
    }

    /// Returns the members that are actually added. Empty adds nothing.
    async fn on_add_to_relationship(
        &self,
        _left: &ResourceKey,
        _relationship: &RelationshipDescriptor,
        right: Vec<ResourceIdentifier>,
        _cancel: &CancellationToken,
    ) -> Result<Vec<ResourceIdentifier>, HookError> {
        Ok(right)
    }

    /// Returns the members that are actually removed. Empty removes nothing.
    async fn on_remove_from_relationship(
        &self,
        _left: &ResourceKey,
        _relationship: &RelationshipDescriptor,
        right: Vec<ResourceIdentifier>,
        _cancel: &CancellationToken,
    ) -> Result<Vec<ResourceIdentifier>, HookError> {
        Ok(right)
    }

    /// Last chance to reject, immediately before the store is called.
    async fn on_writing(
        &self,
        _resource: &Resource,
        _kind: WriteOperationKind,
        _cancel: &CancellationToken,
    ) -> Result<(), HookError> {
        Ok(())
    }

    /// Runs after the batch committed. Failures cannot undo the commit.
    async fn on_write_succeeded(
        &self,
        _resource: &Resource,
        _kind: WriteOperationKind,
        _cancel: &CancellationToken,
    ) -> Result<(), HookError> {
        Ok(())
    }

    /// Whether [`ResourceDefinition::on_resource_hook`] handles `hook`.
    fn declares_hook(&self, _hook: ResourceHook) -> bool {
        false
    }

    /// Called once per cascade layer with the newly reached resources of
    /// this type.
    async fn on_resource_hook(
        &self,
        _hook: ResourceHook,
        _resources: &[Resource],
        _cancel: &CancellationToken,
    ) -> Result<(), HookError> {
        Ok(())
    }
}

/// Definition used for resource types that register none.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityDefinition;

impl ResourceDefinition for IdentityDefinition {}

/// Resource definitions by public resource type name.
#[derive(Clone)]
pub struct DefinitionRegistry {
    definitions: HashMap<String, Arc<dyn ResourceDefinition>>,
    identity: Arc<dyn ResourceDefinition>,
}

impl Default for DefinitionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self {
            definitions: HashMap::new(),
            identity: Arc::new(IdentityDefinition),
        }
    }

    pub fn register(
        mut self,
        resource_type: impl Into<String>,
        definition: impl ResourceDefinition + 'static,
    ) -> Self {
        self.definitions
            .insert(resource_type.into(), Arc::new(definition));
        self
    }

    pub fn register_shared(
        mut self,
        resource_type: impl Into<String>,
        definition: Arc<dyn ResourceDefinition>,
    ) -> Self {
        self.definitions.insert(resource_type.into(), definition);
        self
    }

    /// The registered definition, or the identity definition.
    pub fn get(&self, resource_type: &str) -> Arc<dyn ResourceDefinition> {
        self.definitions
            .get(resource_type)
            .cloned()
            .unwrap_or_else(|| self.identity.clone())
    }

    pub fn is_registered(&self, resource_type: &str) -> bool {
        self.definitions.contains_key(resource_type)
    }

    /// Runs the read hooks of the layer's resource type in their fixed order.
    ///
    /// Sparse field set hooks run for the primary type and every type
    /// reachable through the include tree, including types an includes hook
    /// added.
    pub fn apply_query_hooks(&self, mut layer: QueryLayer) -> QueryLayer {
        let definition = self.get(&layer.resource_type);
        debug!(resource_type = %layer.resource_type, "Applying query hooks");

        layer.filter = definition.on_apply_filter(layer.filter.take());
        layer.sort = definition.on_apply_sort(layer.sort.take());
        layer.pagination = definition.on_apply_pagination(layer.pagination.take());

        let mut visited = BTreeSet::new();
        let types = self.fieldset_types(&layer);
        self.apply_sparse_hooks(&mut layer, types, &mut visited);

        layer.include = definition.on_apply_includes(layer.include.take());

        let types = self.fieldset_types(&layer);
        self.apply_sparse_hooks(&mut layer, types, &mut visited);
        layer
    }

    fn fieldset_types(&self, layer: &QueryLayer) -> BTreeSet<String> {
        let mut types: BTreeSet<String> = layer.sparse_fieldsets.keys().cloned().collect();
        types.insert(layer.resource_type.clone());
        if let Some(include) = &layer.include {
            types.extend(include.reachable_types());
        }
        types
    }

    fn apply_sparse_hooks(
        &self,
        layer: &mut QueryLayer,
        types: BTreeSet<String>,
        visited: &mut BTreeSet<String>,
    ) {
        for resource_type in types {
            if !visited.insert(resource_type.clone()) {
                continue;
            }
            let existing = layer.sparse_fieldsets.remove(&resource_type);
            if let Some(fieldset) = self.get(&resource_type).on_apply_sparse_field_set(existing) {
                layer.sparse_fieldsets.insert(resource_type, fieldset);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AttrKind, Cardinality, FieldChain, FieldRef};
    use std::sync::Mutex;

    fn title_filter() -> FilterExpression {
        FilterExpression::compare(
            FieldChain {
                fields: vec![FieldRef::Attribute {
                    name: "title".into(),
                    kind: AttrKind::String,
                }],
            },
            crate::expression::FilterOperator::Eq,
            vec![crate::expression::FilterValue::String("x".into())],
        )
    }

    #[test]
    fn identity_definition_is_a_no_op() {
        let registry = DefinitionRegistry::new();
        let mut layer = QueryLayer::new("articles").with_filter(title_filter());
        layer.sparse_fieldsets.insert(
            "articles".into(),
            SparseFieldSetExpression::new(["title"]),
        );

        assert_eq!(registry.apply_query_hooks(layer.clone()), layer);
        assert!(!registry.get("articles").declares_hook(ResourceHook::BeforeDelete));

        let original = Resource::new("articles").with_id("1").with_attribute("title", "x");
        let mut resource = original.clone();
        registry.get("articles").on_deserialize(&mut resource);
        registry.get("articles").on_serialize(&mut resource);
        assert_eq!(resource, original);
    }

    #[tokio::test]
    async fn identity_write_hooks_pass_values_through() {
        let definition = IdentityDefinition;
        let cancel = CancellationToken::new();
        let relationship = RelationshipDescriptor::new("author", "people", Cardinality::ToOne);
        let left = Resource::new("articles");
        let right = Some(ResourceIdentifier::new("people", "1"));

        let applied = definition
            .on_set_to_one_relationship(
                &left,
                &relationship,
                right.clone(),
                WriteOperationKind::CreateResource,
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(applied, right);

        let mut resource = Resource::new("articles").with_attribute("title", "x");
        let before = resource.clone();
        definition
            .on_prepare_write(&mut resource, WriteOperationKind::CreateResource, &cancel)
            .await
            .unwrap();
        assert_eq!(resource, before);
    }

    struct Recording {
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl ResourceDefinition for Recording {
        fn on_apply_filter(&self, existing: Option<FilterExpression>) -> Option<FilterExpression> {
            self.calls.lock().unwrap().push("filter");
            existing
        }

        fn on_apply_sort(&self, existing: Option<SortExpression>) -> Option<SortExpression> {
            self.calls.lock().unwrap().push("sort");
            existing
        }

        fn on_apply_pagination(
            &self,
            existing: Option<PaginationExpression>,
        ) -> Option<PaginationExpression> {
            self.calls.lock().unwrap().push("pagination");
            existing
        }

        fn on_apply_sparse_field_set(
            &self,
            _existing: Option<SparseFieldSetExpression>,
        ) -> Option<SparseFieldSetExpression> {
            self.calls.lock().unwrap().push("fields");
            Some(SparseFieldSetExpression::new(["title"]))
        }

        fn on_apply_includes(&self, existing: Option<IncludeExpression>) -> Option<IncludeExpression> {
            self.calls.lock().unwrap().push("includes");
            existing
        }
    }

    #[test]
    fn read_hooks_run_in_fixed_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let registry = DefinitionRegistry::new().register(
            "articles",
            Recording {
                calls: calls.clone(),
            },
        );

        let layer = registry.apply_query_hooks(QueryLayer::new("articles"));

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["filter", "sort", "pagination", "fields", "includes"]
        );
        assert_eq!(
            layer.sparse_fieldset("articles"),
            Some(&SparseFieldSetExpression::new(["title"]))
        );
    }
}
