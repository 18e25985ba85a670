//! # Resource Hook Executor
//!
//! Fires a [`ResourceHook`] for a root set of resources and cascades it
//! through every relationship configured to carry that hook.
//!
//! The walk is breadth-first over an explicit visited set keyed by
//! [`ResourceKey`], so a resource reachable through several paths (or
//! through a cycle) is notified at most once per top-level call. Each layer
//! groups the newly reached resources by type and calls each declaring
//! type's definition once with that group. Types that do not declare the
//! hook are still traversed, but never called.
//!
//! Related resources are found two ways:
//! - forward: identifiers in the resource's relationship data;
//! - inverse: when the relationship names an inverse, resources of the
//!   right type whose inverse points at the current layer.

use crate::cancel::CancellationToken;
use crate::definition::DefinitionRegistry;
use crate::error::ApiError;
use crate::executor::QueryExecutor;
use crate::expression::{FilterExpression, FilterOperator, FilterValue, QueryLayer};
use crate::graph::{FieldChain, FieldRef, RelationshipDescriptor, ResourceGraph};
use crate::resource::{Resource, ResourceKey};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceHook {
    BeforeCreate,
    AfterCreate,
    BeforeRead,
    AfterRead,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
    OnReturn,
}

#[derive(Clone)]
pub struct ResourceHookExecutor {
    graph: Arc<ResourceGraph>,
    definitions: DefinitionRegistry,
}

impl ResourceHookExecutor {
    pub fn new(graph: Arc<ResourceGraph>, definitions: DefinitionRegistry) -> Self {
        Self { graph, definitions }
    }

    /// Fires `hook` for `roots` and everything reachable through cascading
    /// relationships. Returns the keys of the resources whose type was
    /// notified, in notification order.
    pub async fn fire<L>(
        &self,
        hook: ResourceHook,
        roots: Vec<Resource>,
        loader: &L,
        cancel: &CancellationToken,
    ) -> Result<Vec<ResourceKey>, ApiError>
    where
        L: QueryExecutor + ?Sized,
    {
        let mut visited: HashSet<ResourceKey> = HashSet::new();
        let mut notified = Vec::new();

        let mut layer: Vec<Resource> = roots
            .into_iter()
            .filter(|resource| match resource.key() {
                Some(key) => visited.insert(key),
                None => true,
            })
            .collect();

        let mut depth = 0usize;
        while !layer.is_empty() {
            cancel.check()?;
            debug!(?hook, depth, size = layer.len(), "Hook layer");

            let mut by_type: BTreeMap<String, Vec<Resource>> = BTreeMap::new();
            for resource in layer {
                by_type
                    .entry(resource.resource_type.clone())
                    .or_default()
                    .push(resource);
            }

            for (resource_type, resources) in &by_type {
                let definition = self.definitions.get(resource_type);
                if !definition.declares_hook(hook) {
                    continue;
                }
                cancel
                    .run(definition.on_resource_hook(hook, resources, cancel))
                    .await?;
                notified.extend(resources.iter().filter_map(Resource::key));
            }

            let mut next = Vec::new();
            for (resource_type, resources) in &by_type {
                let context = self.graph.resource_context(resource_type)?;
                for relationship in &context.relationships {
                    if !relationship.cascade_hooks.contains(&hook) {
                        continue;
                    }
                    let related = self
                        .related(resource_type, relationship, resources, loader, cancel)
                        .await?;
                    for resource in related {
                        if let Some(key) = resource.key() {
                            if visited.insert(key) {
                                next.push(resource);
                            }
                        }
                    }
                }
            }

            layer = next;
            depth += 1;
        }

        info!(?hook, notified = notified.len(), "Hook fired");
        Ok(notified)
    }

    async fn related<L>(
        &self,
        resource_type: &str,
        relationship: &RelationshipDescriptor,
        resources: &[Resource],
        loader: &L,
        cancel: &CancellationToken,
    ) -> Result<Vec<Resource>, ApiError>
    where
        L: QueryExecutor + ?Sized,
    {
        let Some(filter) = related_filter(&self.graph, resource_type, relationship, resources)?
        else {
            return Ok(Vec::new());
        };
        let layer = QueryLayer::new(&relationship.right_type).with_filter(filter);
        Ok(cancel.run(loader.execute(&layer, cancel)).await?)
    }
}

/// Filter selecting the resources on the right side of `relationship` for
/// the given left-side resources, or `None` when there can be none.
///
/// Forward identifiers stored on the left resources are matched by id. When
/// the relationship names an inverse, right resources whose inverse points
/// at one of the left resources match as well.
pub(crate) fn related_filter(
    graph: &ResourceGraph,
    resource_type: &str,
    relationship: &RelationshipDescriptor,
    resources: &[Resource],
) -> Result<Option<FilterExpression>, ApiError> {
    let right = graph.resource_context(&relationship.right_type)?;
    let mut terms = Vec::new();

    let mut forward: Vec<&str> = resources
        .iter()
        .filter_map(|resource| resource.relationship(&relationship.name))
        .flat_map(|data| data.identifiers())
        .filter_map(|identifier| identifier.id.as_deref())
        .collect();
    forward.sort_unstable();
    forward.dedup();
    if !forward.is_empty() {
        terms.push(FilterExpression::id_in(right.id_kind, forward));
    }

    if let Some(inverse) = &relationship.inverse {
        let left = graph.resource_context(resource_type)?;
        let back = graph.relationship(&relationship.right_type, inverse)?;
        let ids: Vec<FilterValue> = resources
            .iter()
            .filter_map(|resource| resource.id.as_deref())
            .map(|id| {
                FilterValue::parse_id(id, left.id_kind)
                    .unwrap_or_else(|_| FilterValue::String(id.to_string()))
            })
            .collect();
        if !ids.is_empty() {
            let chain = FieldChain {
                fields: vec![
                    FieldRef::Relationship {
                        name: back.name.clone(),
                        right_type: resource_type.to_string(),
                        cardinality: back.cardinality,
                    },
                    FieldRef::Id { kind: left.id_kind },
                ],
            };
            terms.push(FilterExpression::compare(chain, FilterOperator::In, ids));
        }
    }

    Ok(match terms.len() {
        0 => None,
        1 => terms.pop(),
        _ => Some(FilterExpression::Or(terms)),
    })
}
