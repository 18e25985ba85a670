//! # Resource Service
//!
//! Read side of the request pipeline. A request flows through:
//!
//! 1. [`QueryStringReader`]: parameters → [`QueryLayer`]
//! 2. [`DefinitionRegistry::apply_query_hooks`]: per-type rewrites
//! 3. [`QueryExecutor::execute`]: primary data
//! 4. follow-up `id in [...]` queries for every include path
//! 5. the `AfterRead` resource hook, `on_serialize` and `get_meta`
//! 6. the total count, when configured

use crate::cancel::CancellationToken;
use crate::definition::DefinitionRegistry;
use crate::error::{ApiError, ApiErrors};
use crate::executor::QueryExecutor;
use crate::expression::{FilterExpression, IncludeElement, QueryLayer};
use crate::hooks::{related_filter, ResourceHook, ResourceHookExecutor};
use crate::options::ApiOptions;
use crate::query::{QueryParameterKind, QueryStringReader};
use crate::graph::ResourceGraph;
use crate::resource::{Resource, ResourceKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryData {
    Single(Resource),
    List(Vec<Resource>),
}

/// Response document of a read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDocument {
    pub data: PrimaryData,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included: Vec<Resource>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, Value>,
}

impl ResourceDocument {
    pub fn resources(&self) -> &[Resource] {
        match &self.data {
            PrimaryData::Single(resource) => std::slice::from_ref(resource),
            PrimaryData::List(resources) => resources,
        }
    }

    /// The `meta.total` count, when it was requested.
    pub fn total(&self) -> Option<u64> {
        self.meta.get("total").and_then(Value::as_u64)
    }
}

pub struct ResourceService<E> {
    graph: Arc<ResourceGraph>,
    options: Arc<ApiOptions>,
    definitions: DefinitionRegistry,
    hooks: ResourceHookExecutor,
    disabled: HashMap<String, BTreeSet<QueryParameterKind>>,
    executor: E,
}

impl<E: QueryExecutor> ResourceService<E> {
    pub fn new(
        graph: Arc<ResourceGraph>,
        options: Arc<ApiOptions>,
        definitions: DefinitionRegistry,
        executor: E,
    ) -> Self {
        let hooks = ResourceHookExecutor::new(graph.clone(), definitions.clone());
        Self {
            graph,
            options,
            definitions,
            hooks,
            disabled: HashMap::new(),
            executor,
        }
    }

    /// Turns off parameter families on the endpoints of one resource type.
    pub fn with_disabled_parameters(
        mut self,
        resource_type: impl Into<String>,
        kinds: impl IntoIterator<Item = QueryParameterKind>,
    ) -> Self {
        self.disabled
            .entry(resource_type.into())
            .or_default()
            .extend(kinds);
        self
    }

    fn layer(
        &self,
        resource_type: &str,
        pairs: &[(String, String)],
    ) -> Result<QueryLayer, ApiErrors> {
        let disabled = self.disabled.get(resource_type).into_iter().flatten().copied();
        let layer = QueryStringReader::new(&self.graph, &self.options)
            .with_disabled(disabled)
            .read(resource_type, pairs)?;
        Ok(self.definitions.apply_query_hooks(layer))
    }

    /// A page of resources of one type.
    #[instrument(skip(self, pairs, cancel))]
    pub async fn get_all(
        &self,
        resource_type: &str,
        pairs: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<ResourceDocument, ApiErrors> {
        let layer = self.layer(resource_type, pairs)?;
        debug!(query = ?layer.to_query_pairs(), "Executing");

        let resources = cancel.run(self.executor.execute(&layer, cancel)).await?;
        let mut document = self.complete(&layer, PrimaryData::List(resources), cancel).await?;

        if self.options.include_total_resource_count {
            let total = cancel
                .run(self.executor.count(resource_type, layer.filter.as_ref(), cancel))
                .await?;
            document.meta.insert("total".to_string(), Value::from(total));
        }
        info!(count = document.resources().len(), "Read");
        Ok(document)
    }

    /// One resource by id. Pagination parameters do not apply.
    #[instrument(skip(self, pairs, cancel))]
    pub async fn get_by_id(
        &self,
        resource_type: &str,
        id: &str,
        pairs: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<ResourceDocument, ApiErrors> {
        let mut layer = self.layer(resource_type, pairs)?;
        let context = self.graph.resource_context(resource_type)?;
        layer.pagination = None;
        layer.filter = Some(FilterExpression::and_optional(
            layer.filter.take(),
            FilterExpression::id_in(context.id_kind, [id]),
        ));

        let resource = cancel
            .run(self.executor.execute(&layer, cancel))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::ResourceNotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            })?;
        Ok(self
            .complete(&layer, PrimaryData::Single(resource), cancel)
            .await?)
    }

    /// Adds included resources, per-resource meta and runs `AfterRead`.
    async fn complete(
        &self,
        layer: &QueryLayer,
        data: PrimaryData,
        cancel: &CancellationToken,
    ) -> Result<ResourceDocument, ApiError> {
        let mut document = ResourceDocument {
            data,
            included: Vec::new(),
            meta: BTreeMap::new(),
        };
        document.included = self.include(layer, document.resources(), cancel).await?;

        let primary = document.resources().to_vec();
        if !primary.is_empty() {
            self.hooks
                .fire(ResourceHook::AfterRead, primary, &self.executor, cancel)
                .await?;
        }

        match &mut document.data {
            PrimaryData::Single(resource) => self.outgoing(resource),
            PrimaryData::List(resources) => resources.iter_mut().for_each(|r| self.outgoing(r)),
        }
        for resource in &mut document.included {
            self.outgoing(resource);
        }
        Ok(document)
    }

    fn outgoing(&self, resource: &mut Resource) {
        let definition = self.definitions.get(&resource.resource_type);
        definition.on_serialize(resource);
        if let Some(meta) = definition.get_meta(resource) {
            resource.meta.extend(meta);
        }
    }

    /// Loads every include path level by level. Each related resource is
    /// included once, and never when it is already primary data.
    async fn include(
        &self,
        layer: &QueryLayer,
        primary: &[Resource],
        cancel: &CancellationToken,
    ) -> Result<Vec<Resource>, ApiError> {
        let Some(include) = &layer.include else {
            return Ok(Vec::new());
        };

        let mut seen: HashSet<ResourceKey> = primary.iter().filter_map(Resource::key).collect();
        let mut included = Vec::new();
        let mut pending: Vec<(&IncludeElement, String, Vec<Resource>)> = include
            .elements
            .iter()
            .map(|element| (element, layer.resource_type.clone(), primary.to_vec()))
            .collect();

        while let Some((element, left_type, parents)) = pending.pop() {
            let descriptor = self.graph.relationship(&left_type, &element.relationship)?;
            let Some(filter) = related_filter(&self.graph, &left_type, descriptor, &parents)?
            else {
                continue;
            };

            let definition = self.definitions.get(&element.right_type);
            let mut query = QueryLayer::new(element.right_type.clone())
                .with_filter(FilterExpression::and_optional(definition.on_apply_filter(None), filter));
            if let Some(fieldset) = layer.sparse_fieldset(&element.right_type) {
                query
                    .sparse_fieldsets
                    .insert(element.right_type.clone(), fieldset.clone());
            }

            let related = cancel.run(self.executor.execute(&query, cancel)).await?;
            debug!(
                relationship = %element.relationship,
                found = related.len(),
                "Included"
            );
            for resource in &related {
                if resource.key().is_some_and(|key| seen.insert(key)) {
                    included.push(resource.clone());
                }
            }
            for child in &element.children {
                pending.push((child, element.right_type.clone(), related.clone()));
            }
        }
        Ok(included)
    }
}
