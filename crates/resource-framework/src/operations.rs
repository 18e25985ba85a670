//! # Atomic Operations
//!
//! Applies an ordered list of operations as one all-or-nothing batch.
//!
//! ## Lifecycle
//! 1. **Validate**: every operation is checked before anything is written.
//!    That covers the batch size, the operation shape, resource types and field names,
//!    and local ids (each must be declared by a strictly earlier `add`).
//! 2. **Apply**: one store transaction is opened and the operations run
//!    strictly in sequence. A successful `add` registers its local id, so
//!    later operations can reference the server id.
//! 3. **Commit or Abort**: any failure rolls the transaction back and
//!    reports the zero-based index of the failing operation. After a commit,
//!    `on_write_succeeded` and the `After*` resource hooks run; their failures
//!    are logged and never undo the commit.
//!
//! ## Document Shape
//! ```json
//! {
//!   "atomic:operations": [
//!     { "op": "add", "data": { "type": "articles", "lid": "a1", "attributes": { "title": "Hi" } } },
//!     { "op": "add", "data": { "type": "comments",
//!         "relationships": { "article": { "type": "articles", "lid": "a1" } } } },
//!     { "op": "add", "ref": { "type": "articles", "lid": "a1", "relationship": "tags" },
//!       "data": [ { "type": "tags", "id": "1" } ] }
//!   ]
//! }
//! ```

use crate::cancel::CancellationToken;
use crate::definition::{DefinitionRegistry, ResourceDefinition, WriteOperationKind};
use crate::error::{ApiError, ApiErrors, BatchError};
use crate::executor::{ResourceStore, StoreTransaction};
use crate::expression::FilterExpression;
use crate::graph::{Cardinality, ResourceGraph};
use crate::hooks::{ResourceHook, ResourceHookExecutor};
use crate::options::ApiOptions;
use crate::query::{split_query_string, QueryStringReader};
use crate::resource::{RelationshipData, Resource, ResourceIdentifier, ResourceKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationCode {
    Get,
    Add,
    Update,
    Remove,
}

/// Target of an operation: a resource, or one of its relationships.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OperationRef {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
}

impl OperationRef {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_lid(mut self, lid: impl Into<String>) -> Self {
        self.lid = Some(lid.into());
        self
    }

    pub fn with_relationship(mut self, relationship: impl Into<String>) -> Self {
        self.relationship = Some(relationship.into());
        self
    }

    pub fn identifier(&self) -> ResourceIdentifier {
        ResourceIdentifier {
            resource_type: self.resource_type.clone(),
            id: self.id.clone(),
            lid: self.lid.clone(),
        }
    }

    fn addresses_resource(&self) -> bool {
        self.id.is_some() || self.lid.is_some()
    }
}

/// Operation payload: one resource object, or a list of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OperationData {
    Single(Resource),
    List(Vec<Resource>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub op: OperationCode,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub target: Option<OperationRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<OperationData>,
    /// Query-string pairs for `get`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<(String, String)>,
}

impl Operation {
    fn new(op: OperationCode, target: Option<OperationRef>, data: Option<OperationData>) -> Self {
        Self {
            op,
            target,
            data,
            params: Vec::new(),
        }
    }

    pub fn add(resource: Resource) -> Self {
        Self::new(OperationCode::Add, None, Some(OperationData::Single(resource)))
    }

    pub fn update(resource: Resource) -> Self {
        Self::new(OperationCode::Update, None, Some(OperationData::Single(resource)))
    }

    pub fn remove(target: OperationRef) -> Self {
        Self::new(OperationCode::Remove, Some(target), None)
    }

    pub fn get(target: OperationRef) -> Self {
        Self::new(OperationCode::Get, Some(target), None)
    }

    /// Replaces a relationship. `ToOne(None)` clears a to-one relationship.
    pub fn set_relationship(target: OperationRef, data: RelationshipData) -> Self {
        let data = match data {
            RelationshipData::ToOne(None) => None,
            RelationshipData::ToOne(Some(identifier)) => {
                Some(OperationData::Single(identifier.into()))
            }
            RelationshipData::ToMany(identifiers) => Some(members(identifiers)),
        };
        Self::new(OperationCode::Update, Some(target), data)
    }

    pub fn add_members(target: OperationRef, identifiers: Vec<ResourceIdentifier>) -> Self {
        Self::new(OperationCode::Add, Some(target), Some(members(identifiers)))
    }

    pub fn remove_members(target: OperationRef, identifiers: Vec<ResourceIdentifier>) -> Self {
        Self::new(OperationCode::Remove, Some(target), Some(members(identifiers)))
    }

    /// Sets `params` from a raw query string.
    pub fn with_params(mut self, query: &str) -> Self {
        self.params = split_query_string(query);
        self
    }

    fn relationship(&self) -> Option<&str> {
        self.target.as_ref()?.relationship.as_deref()
    }

    fn target(&self) -> Result<&OperationRef, ApiError> {
        self.target
            .as_ref()
            .ok_or_else(|| invalid("operation requires 'ref'"))
    }

    fn single(&self) -> Result<&Resource, ApiError> {
        match &self.data {
            Some(OperationData::Single(resource)) => Ok(resource),
            _ => Err(invalid("operation requires a single resource in 'data'")),
        }
    }

    fn list(&self) -> Result<Vec<ResourceIdentifier>, ApiError> {
        match &self.data {
            Some(OperationData::List(resources)) => {
                Ok(resources.iter().map(Resource::identifier).collect())
            }
            _ => Err(invalid("operation requires a list in 'data'")),
        }
    }

    /// The resource addressed by `ref` and/or a single `data` resource.
    fn target_identifier(&self) -> Result<ResourceIdentifier, ApiError> {
        let from_data = match &self.data {
            Some(OperationData::Single(resource)) => Some(resource.identifier()),
            _ => None,
        };
        match (&self.target, from_data) {
            (Some(target), Some(mut identifier)) => {
                if target.resource_type != identifier.resource_type {
                    return Err(ApiError::ResourceTypeMismatch {
                        expected: target.resource_type.clone(),
                        actual: identifier.resource_type,
                    });
                }
                if let (Some(left), Some(right)) = (&target.id, &identifier.id) {
                    if left != right {
                        return Err(invalid("'ref' and 'data' name different resources"));
                    }
                }
                identifier.id = identifier.id.or_else(|| target.id.clone());
                identifier.lid = identifier.lid.or_else(|| target.lid.clone());
                Ok(identifier)
            }
            (Some(target), None) => Ok(target.identifier()),
            (None, Some(identifier)) => Ok(identifier),
            (None, None) => Err(invalid("operation requires 'ref' or 'data'")),
        }
    }
}

fn members(identifiers: Vec<ResourceIdentifier>) -> OperationData {
    OperationData::List(identifiers.into_iter().map(Resource::from).collect())
}

fn invalid(reason: &str) -> ApiError {
    ApiError::InvalidOperation(reason.to_string())
}

fn first_error(errors: ApiErrors) -> ApiError {
    errors
        .0
        .into_iter()
        .next()
        .unwrap_or_else(|| invalid("query parameters are invalid"))
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OperationsDocument {
    #[serde(rename = "atomic:operations", alias = "operations")]
    pub operations: Vec<Operation>,
}

impl OperationsDocument {
    pub fn new(operations: Vec<Operation>) -> Self {
        Self { operations }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OperationResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<OperationData>,
}

impl OperationResult {
    fn empty() -> Self {
        Self::default()
    }

    fn single(resource: Resource) -> Self {
        Self {
            data: Some(OperationData::Single(resource)),
        }
    }

    /// The single resource this operation produced, if any.
    pub fn resource(&self) -> Option<&Resource> {
        match &self.data {
            Some(OperationData::Single(resource)) => Some(resource),
            _ => None,
        }
    }

    pub fn resources(&self) -> &[Resource] {
        match &self.data {
            Some(OperationData::List(resources)) => resources,
            Some(OperationData::Single(resource)) => std::slice::from_ref(resource),
            None => &[],
        }
    }
}

/// Request-local state of one batch.
#[derive(Default)]
struct Batch {
    local_ids: HashMap<String, ResourceKey>,
    written: Vec<(Resource, WriteOperationKind)>,
}

impl Batch {
    /// Replaces a local id with the server id it was assigned.
    fn resolve(&self, identifier: &mut ResourceIdentifier) -> Result<(), ApiError> {
        if identifier.id.is_some() {
            identifier.lid = None;
            return Ok(());
        }
        let lid = identifier.lid.take().ok_or_else(|| {
            ApiError::InvalidOperation(format!(
                "reference to '{}' requires 'id' or 'lid'",
                identifier.resource_type
            ))
        })?;
        let key = self
            .local_ids
            .get(&lid)
            .ok_or_else(|| ApiError::UnknownLocalId(lid.clone()))?;
        if key.resource_type != identifier.resource_type {
            return Err(ApiError::ResourceTypeMismatch {
                expected: key.resource_type.clone(),
                actual: identifier.resource_type.clone(),
            });
        }
        identifier.id = Some(key.id.clone());
        Ok(())
    }

    fn key(&self, identifier: &ResourceIdentifier) -> Result<ResourceKey, ApiError> {
        let mut identifier = identifier.clone();
        self.resolve(&mut identifier)?;
        identifier
            .key()
            .ok_or_else(|| invalid("reference could not be resolved"))
    }

    fn resolve_relationships(&self, resource: &mut Resource) -> Result<(), ApiError> {
        for data in resource.relationships.values_mut() {
            for identifier in data.identifiers_mut() {
                self.resolve(identifier)?;
            }
        }
        Ok(())
    }
}

/// Local ids declared so far during validation, with their resource type.
type Declared = HashMap<String, String>;

fn check_identifier(
    identifier: &ResourceIdentifier,
    expected_type: &str,
    declared: &Declared,
) -> Result<(), ApiError> {
    if identifier.resource_type != expected_type {
        return Err(ApiError::ResourceTypeMismatch {
            expected: expected_type.to_string(),
            actual: identifier.resource_type.clone(),
        });
    }
    match (&identifier.id, &identifier.lid) {
        (Some(_), _) => Ok(()),
        (None, Some(lid)) => match declared.get(lid) {
            None => Err(ApiError::UnknownLocalId(lid.clone())),
            Some(declared_type) if declared_type != &identifier.resource_type => {
                Err(ApiError::ResourceTypeMismatch {
                    expected: declared_type.clone(),
                    actual: identifier.resource_type.clone(),
                })
            }
            Some(_) => Ok(()),
        },
        (None, None) => Err(ApiError::InvalidOperation(format!(
            "reference to '{}' requires 'id' or 'lid'",
            identifier.resource_type
        ))),
    }
}

/// Runs atomic batches against a [`ResourceStore`].
pub struct OperationsProcessor<S> {
    graph: Arc<ResourceGraph>,
    options: Arc<ApiOptions>,
    definitions: DefinitionRegistry,
    hooks: ResourceHookExecutor,
    store: S,
}

impl<S: ResourceStore> OperationsProcessor<S> {
    pub fn new(
        graph: Arc<ResourceGraph>,
        options: Arc<ApiOptions>,
        definitions: DefinitionRegistry,
        store: S,
    ) -> Self {
        let hooks = ResourceHookExecutor::new(graph.clone(), definitions.clone());
        Self {
            graph,
            options,
            definitions,
            hooks,
            store,
        }
    }

    /// Applies every operation or none of them.
    #[instrument(skip(self, document, cancel), fields(operations = document.operations.len()))]
    pub async fn process(
        &self,
        document: OperationsDocument,
        cancel: &CancellationToken,
    ) -> Result<Vec<OperationResult>, BatchError> {
        let operations = document.operations;
        self.validate(&operations)?;

        // Begin and commit are not raced: once the store has acted, only an
        // owned handle can undo it.
        cancel.check().map_err(BatchError::whole)?;
        let transaction = self
            .store
            .begin_transaction()
            .await
            .map_err(BatchError::whole)?;
        debug!("Transaction started");

        let mut batch = Batch::default();
        let mut results = Vec::with_capacity(operations.len());
        for (index, operation) in operations.iter().enumerate() {
            let outcome = match cancel.check() {
                Ok(()) => {
                    self.apply(operation, transaction.as_ref(), &mut batch, cancel)
                        .await
                }
                Err(error) => Err(error),
            };
            match outcome {
                Ok(result) => results.push(result),
                Err(error) => {
                    warn!(index, op = ?operation.op, %error, "Operation failed");
                    abort(transaction.as_ref()).await;
                    return Err(BatchError::at(index, error));
                }
            }
        }

        if let Err(error) = cancel.check() {
            warn!(%error, "Cancelled before commit");
            abort(transaction.as_ref()).await;
            return Err(BatchError::whole(error));
        }
        if let Err(error) = transaction.commit().await {
            warn!(%error, "Commit failed");
            return Err(BatchError::whole(error));
        }
        info!(operations = results.len(), "Batch committed");

        self.after_commit(batch.written, cancel).await;
        Ok(results)
    }

    fn validate(&self, operations: &[Operation]) -> Result<(), BatchError> {
        let maximum = self.options.maximum_operations_per_request;
        if operations.len() > maximum {
            warn!(count = operations.len(), maximum, "Batch too large");
            return Err(BatchError::whole(ApiError::TooManyOperations {
                count: operations.len(),
                maximum,
            }));
        }
        if operations.is_empty() {
            return Err(BatchError::whole(invalid("batch contains no operations")));
        }

        let mut declared = Declared::new();
        for (index, operation) in operations.iter().enumerate() {
            self.check(operation, &mut declared).map_err(|error| {
                warn!(index, op = ?operation.op, %error, "Rejected operation");
                BatchError::at(index, error)
            })?;
        }
        Ok(())
    }

    fn check(&self, operation: &Operation, declared: &mut Declared) -> Result<(), ApiError> {
        match (operation.op, operation.relationship()) {
            (OperationCode::Get, relationship) => {
                if relationship.is_some() {
                    return Err(invalid("'get' cannot address a relationship"));
                }
                let target = operation.target()?;
                QueryStringReader::new(&self.graph, &self.options)
                    .read(&target.resource_type, &operation.params)
                    .map_err(first_error)?;
                if target.addresses_resource() {
                    check_identifier(&target.identifier(), &target.resource_type, declared)?;
                }
                Ok(())
            }
            (OperationCode::Add, None) => {
                let resource = operation.single()?;
                if let Some(target) = &operation.target {
                    if target.resource_type != resource.resource_type {
                        return Err(ApiError::ResourceTypeMismatch {
                            expected: target.resource_type.clone(),
                            actual: resource.resource_type.clone(),
                        });
                    }
                }
                self.check_resource(resource, declared)?;
                match (&resource.id, &resource.lid) {
                    (Some(_), Some(_)) => Err(invalid("'id' and 'lid' cannot both be set")),
                    (Some(_), None) if !self.options.allow_client_generated_ids => Err(
                        ApiError::ClientGeneratedIdNotAllowed(resource.resource_type.clone()),
                    ),
                    (None, Some(lid)) => {
                        if declared
                            .insert(lid.clone(), resource.resource_type.clone())
                            .is_some()
                        {
                            return Err(ApiError::DuplicateLocalId(lid.clone()));
                        }
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
            (OperationCode::Update, None) => {
                let resource = operation.single()?;
                let identifier = operation.target_identifier()?;
                self.check_resource(resource, declared)?;
                check_identifier(&identifier, &identifier.resource_type, declared)
            }
            (OperationCode::Remove, None) => {
                let identifier = operation.target_identifier()?;
                self.graph.resource_context(&identifier.resource_type)?;
                check_identifier(&identifier, &identifier.resource_type, declared)
            }
            (op, Some(name)) => {
                let target = operation.target()?;
                let descriptor = self.graph.relationship(&target.resource_type, name)?;
                check_identifier(&target.identifier(), &target.resource_type, declared)?;
                let mismatch = |expected| ApiError::CardinalityMismatch {
                    relationship: name.to_string(),
                    expected,
                };
                match (op, descriptor.cardinality, &operation.data) {
                    (OperationCode::Update, Cardinality::ToOne, None) => Ok(()),
                    (OperationCode::Update, Cardinality::ToOne, Some(OperationData::Single(r))) => {
                        check_identifier(&r.identifier(), &descriptor.right_type, declared)
                    }
                    (OperationCode::Update, Cardinality::ToOne, Some(OperationData::List(_))) => {
                        Err(mismatch("to-one"))
                    }
                    (_, Cardinality::ToOne, _) => Err(mismatch("to-many")),
                    (_, Cardinality::ToMany, Some(OperationData::List(resources))) => {
                        for resource in resources {
                            check_identifier(
                                &resource.identifier(),
                                &descriptor.right_type,
                                declared,
                            )?;
                        }
                        Ok(())
                    }
                    (_, Cardinality::ToMany, _) => Err(mismatch("to-many")),
                }
            }
        }
    }

    fn check_resource(&self, resource: &Resource, declared: &Declared) -> Result<(), ApiError> {
        let resource_type = &resource.resource_type;
        self.graph.resource_context(resource_type)?;
        for name in resource.attributes.keys() {
            let attribute = self.graph.attribute(resource_type, name)?;
            if !attribute.capabilities.allow_change {
                return Err(ApiError::AttributeReadOnly {
                    resource_type: resource_type.clone(),
                    attribute: name.clone(),
                });
            }
        }
        self.check_relationships(resource, declared)
    }

    fn check_relationships(&self, resource: &Resource, declared: &Declared) -> Result<(), ApiError> {
        for (name, data) in &resource.relationships {
            let descriptor = self.graph.relationship(&resource.resource_type, name)?;
            let expected = match (descriptor.cardinality, data) {
                (Cardinality::ToOne, RelationshipData::ToMany(_)) => Some("to-one"),
                (Cardinality::ToMany, RelationshipData::ToOne(_)) => Some("to-many"),
                _ => None,
            };
            if let Some(expected) = expected {
                return Err(ApiError::CardinalityMismatch {
                    relationship: name.clone(),
                    expected,
                });
            }
            for identifier in data.identifiers() {
                check_identifier(identifier, &descriptor.right_type, declared)?;
            }
        }
        Ok(())
    }

    /// Re-checks a payload after write hooks changed it. Hooks may set
    /// read-only attributes, but every field must exist with its declared
    /// shape and the type must stay the same.
    fn check_prepared(&self, resource: &Resource, expected_type: &str) -> Result<(), ApiError> {
        if resource.resource_type != expected_type {
            return Err(ApiError::ResourceTypeMismatch {
                expected: expected_type.to_string(),
                actual: resource.resource_type.clone(),
            });
        }
        for name in resource.attributes.keys() {
            self.graph.attribute(expected_type, name)?;
        }
        self.check_relationships(resource, &Declared::new())
    }

    fn outgoing(&self, mut resource: Resource) -> Resource {
        self.definitions
            .get(&resource.resource_type)
            .on_serialize(&mut resource);
        resource
    }

    async fn apply(
        &self,
        operation: &Operation,
        transaction: &dyn StoreTransaction,
        batch: &mut Batch,
        cancel: &CancellationToken,
    ) -> Result<OperationResult, ApiError> {
        debug!(op = ?operation.op, "Applying operation");
        match (operation.op, operation.relationship()) {
            (OperationCode::Get, _) => self.read(operation, transaction, batch, cancel).await,
            (OperationCode::Add, None) => self.create(operation, transaction, batch, cancel).await,
            (OperationCode::Update, None) => {
                self.update(operation, transaction, batch, cancel).await
            }
            (OperationCode::Remove, None) => {
                self.delete(operation, transaction, batch, cancel).await
            }
            (OperationCode::Update, Some(name)) => {
                self.set_relationship(operation, name, transaction, batch, cancel)
                    .await
            }
            (OperationCode::Add, Some(name)) => {
                self.change_members(operation, name, true, transaction, batch, cancel)
                    .await
            }
            (OperationCode::Remove, Some(name)) => {
                self.change_members(operation, name, false, transaction, batch, cancel)
                    .await
            }
        }
    }

    async fn read(
        &self,
        operation: &Operation,
        transaction: &dyn StoreTransaction,
        batch: &Batch,
        cancel: &CancellationToken,
    ) -> Result<OperationResult, ApiError> {
        let target = operation.target()?;
        let layer = QueryStringReader::new(&self.graph, &self.options)
            .read(&target.resource_type, &operation.params)
            .map_err(first_error)?;
        let mut layer = self.definitions.apply_query_hooks(layer);

        if !target.addresses_resource() {
            let resources = cancel.run(transaction.execute(&layer, cancel)).await?;
            return Ok(OperationResult {
                data: Some(OperationData::List(
                    resources.into_iter().map(|r| self.outgoing(r)).collect(),
                )),
            });
        }

        let key = batch.key(&target.identifier())?;
        let context = self.graph.resource_context(&key.resource_type)?;
        layer.filter = Some(FilterExpression::and_optional(
            layer.filter.take(),
            FilterExpression::id_in(context.id_kind, [key.id.as_str()]),
        ));
        let resource = cancel
            .run(transaction.execute(&layer, cancel))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| not_found(&key))?;
        Ok(OperationResult::single(self.outgoing(resource)))
    }

    async fn create(
        &self,
        operation: &Operation,
        transaction: &dyn StoreTransaction,
        batch: &mut Batch,
        cancel: &CancellationToken,
    ) -> Result<OperationResult, ApiError> {
        let kind = WriteOperationKind::CreateResource;
        let mut resource = operation.single()?.clone();
        let resource_type = resource.resource_type.clone();
        let definition = self.definitions.get(&resource_type);
        definition.on_deserialize(&mut resource);
        let lid = resource.lid.take();

        batch.resolve_relationships(&mut resource)?;
        cancel
            .run(definition.on_prepare_write(&mut resource, kind, cancel))
            .await?;
        self.apply_relationship_hooks(definition.as_ref(), &mut resource, kind, cancel)
            .await?;
        batch.resolve_relationships(&mut resource)?;
        self.check_prepared(&resource, &resource_type)?;
        self.ensure_related_exist(&resource, transaction, cancel)
            .await?;

        self.hooks
            .fire(ResourceHook::BeforeCreate, vec![resource.clone()], transaction, cancel)
            .await?;
        cancel
            .run(definition.on_writing(&resource, kind, cancel))
            .await?;
        let created = cancel.run(transaction.create(resource)).await?;

        if let (Some(lid), Some(key)) = (lid, created.key()) {
            debug!(lid, %key, "Local id assigned");
            batch.local_ids.insert(lid, key);
        }
        info!(resource_type = %created.resource_type, id = ?created.id, "Created");
        batch.written.push((created.clone(), kind));
        Ok(OperationResult::single(self.outgoing(created)))
    }

    async fn update(
        &self,
        operation: &Operation,
        transaction: &dyn StoreTransaction,
        batch: &mut Batch,
        cancel: &CancellationToken,
    ) -> Result<OperationResult, ApiError> {
        let kind = WriteOperationKind::UpdateResource;
        let key = batch.key(&operation.target_identifier()?)?;
        let existing = self.find_existing(&key, transaction, cancel).await?;
        let definition = self.definitions.get(&key.resource_type);

        let mut patch = operation.single()?.clone();
        definition.on_deserialize(&mut patch);
        patch.id = Some(key.id.clone());
        patch.lid = None;
        batch.resolve_relationships(&mut patch)?;
        cancel
            .run(definition.on_prepare_write(&mut patch, kind, cancel))
            .await?;
        self.apply_relationship_hooks(definition.as_ref(), &mut patch, kind, cancel)
            .await?;
        batch.resolve_relationships(&mut patch)?;
        self.check_prepared(&patch, &key.resource_type)?;
        self.ensure_related_exist(&patch, transaction, cancel).await?;

        self.hooks
            .fire(ResourceHook::BeforeUpdate, vec![existing], transaction, cancel)
            .await?;
        cancel.run(definition.on_writing(&patch, kind, cancel)).await?;
        let updated = cancel.run(transaction.update(patch)).await?;

        info!(%key, "Updated");
        batch.written.push((updated.clone(), kind));
        Ok(OperationResult::single(self.outgoing(updated)))
    }

    async fn delete(
        &self,
        operation: &Operation,
        transaction: &dyn StoreTransaction,
        batch: &mut Batch,
        cancel: &CancellationToken,
    ) -> Result<OperationResult, ApiError> {
        let kind = WriteOperationKind::DeleteResource;
        let key = batch.key(&operation.target_identifier()?)?;
        let existing = self.find_existing(&key, transaction, cancel).await?;
        let definition = self.definitions.get(&key.resource_type);

        let mut prepared = existing.clone();
        cancel
            .run(definition.on_prepare_write(&mut prepared, kind, cancel))
            .await?;
        self.hooks
            .fire(ResourceHook::BeforeDelete, vec![existing.clone()], transaction, cancel)
            .await?;
        cancel.run(definition.on_writing(&existing, kind, cancel)).await?;
        cancel.run(transaction.delete(&key)).await?;

        info!(%key, "Deleted");
        batch.written.push((existing, kind));
        Ok(OperationResult::empty())
    }

    async fn set_relationship(
        &self,
        operation: &Operation,
        name: &str,
        transaction: &dyn StoreTransaction,
        batch: &mut Batch,
        cancel: &CancellationToken,
    ) -> Result<OperationResult, ApiError> {
        let kind = WriteOperationKind::SetRelationship;
        let key = batch.key(&operation.target()?.identifier())?;
        let descriptor = self.graph.relationship(&key.resource_type, name)?;
        let existing = self.find_existing(&key, transaction, cancel).await?;
        let definition = self.definitions.get(&key.resource_type);

        let data = match descriptor.cardinality {
            Cardinality::ToOne => {
                let mut right = match &operation.data {
                    None => None,
                    Some(OperationData::Single(resource)) => Some(resource.identifier()),
                    Some(OperationData::List(_)) => {
                        return Err(ApiError::CardinalityMismatch {
                            relationship: name.to_string(),
                            expected: "to-one",
                        })
                    }
                };
                if let Some(identifier) = right.as_mut() {
                    batch.resolve(identifier)?;
                }
                let applied = cancel
                    .run(definition.on_set_to_one_relationship(
                        &existing, descriptor, right, kind, cancel,
                    ))
                    .await?;
                RelationshipData::ToOne(applied)
            }
            Cardinality::ToMany => {
                let mut right = operation.list()?;
                for identifier in &mut right {
                    batch.resolve(identifier)?;
                }
                let applied = cancel
                    .run(definition.on_set_to_many_relationship(
                        &existing, descriptor, right, kind, cancel,
                    ))
                    .await?;
                RelationshipData::ToMany(applied)
            }
        };

        let mut patch = Resource::new(key.resource_type.clone()).with_id(key.id.clone());
        patch.relationships.insert(name.to_string(), data);
        batch.resolve_relationships(&mut patch)?;
        self.ensure_related_exist(&patch, transaction, cancel).await?;

        self.hooks
            .fire(ResourceHook::BeforeUpdate, vec![existing], transaction, cancel)
            .await?;
        cancel.run(definition.on_writing(&patch, kind, cancel)).await?;
        let updated = cancel.run(transaction.update(patch)).await?;

        info!(%key, relationship = name, "Relationship replaced");
        batch.written.push((updated, kind));
        Ok(OperationResult::empty())
    }

    async fn change_members(
        &self,
        operation: &Operation,
        name: &str,
        adding: bool,
        transaction: &dyn StoreTransaction,
        batch: &mut Batch,
        cancel: &CancellationToken,
    ) -> Result<OperationResult, ApiError> {
        let key = batch.key(&operation.target()?.identifier())?;
        let descriptor = self.graph.relationship(&key.resource_type, name)?;
        if !descriptor.is_to_many() {
            return Err(ApiError::CardinalityMismatch {
                relationship: name.to_string(),
                expected: "to-many",
            });
        }
        let existing = self.find_existing(&key, transaction, cancel).await?;
        let definition = self.definitions.get(&key.resource_type);

        let mut right = operation.list()?;
        for identifier in &mut right {
            batch.resolve(identifier)?;
        }
        let (kind, mut applied) = if adding {
            let applied = cancel
                .run(definition.on_add_to_relationship(&key, descriptor, right, cancel))
                .await?;
            (WriteOperationKind::AddToRelationship, applied)
        } else {
            let applied = cancel
                .run(definition.on_remove_from_relationship(&key, descriptor, right, cancel))
                .await?;
            (WriteOperationKind::RemoveFromRelationship, applied)
        };
        for identifier in &mut applied {
            batch.resolve(identifier)?;
        }
        if applied.is_empty() {
            debug!(%key, relationship = name, "Nothing left to change");
            return Ok(OperationResult::empty());
        }
        if adding {
            for identifier in &applied {
                let related = batch.key(identifier)?;
                self.find_existing(&related, transaction, cancel).await?;
            }
        }

        self.hooks
            .fire(ResourceHook::BeforeUpdate, vec![existing.clone()], transaction, cancel)
            .await?;
        cancel.run(definition.on_writing(&existing, kind, cancel)).await?;
        if adding {
            cancel
                .run(transaction.add_to_relationship(&key, name, applied))
                .await?;
        } else {
            cancel
                .run(transaction.remove_from_relationship(&key, name, applied))
                .await?;
        }

        let changed = self.find_existing(&key, transaction, cancel).await?;
        info!(%key, relationship = name, adding, "Relationship members changed");
        batch.written.push((changed, kind));
        Ok(OperationResult::empty())
    }

    /// Runs the relationship hooks for every relationship in `resource`,
    /// replacing each value with the one the hook returns.
    async fn apply_relationship_hooks(
        &self,
        definition: &dyn ResourceDefinition,
        resource: &mut Resource,
        kind: WriteOperationKind,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError> {
        let names: Vec<String> = resource.relationships.keys().cloned().collect();
        for name in names {
            let descriptor = self.graph.relationship(&resource.resource_type, &name)?;
            let Some(data) = resource.relationships.remove(&name) else {
                continue;
            };
            let applied = match data {
                RelationshipData::ToOne(right) => RelationshipData::ToOne(
                    cancel
                        .run(definition.on_set_to_one_relationship(
                            resource, descriptor, right, kind, cancel,
                        ))
                        .await?,
                ),
                RelationshipData::ToMany(right) => RelationshipData::ToMany(
                    cancel
                        .run(definition.on_set_to_many_relationship(
                            resource, descriptor, right, kind, cancel,
                        ))
                        .await?,
                ),
            };
            resource.relationships.insert(name, applied);
        }
        Ok(())
    }

    async fn find_existing(
        &self,
        key: &ResourceKey,
        transaction: &dyn StoreTransaction,
        cancel: &CancellationToken,
    ) -> Result<Resource, ApiError> {
        cancel
            .run(transaction.find(key))
            .await?
            .ok_or_else(|| not_found(key))
    }

    async fn ensure_related_exist(
        &self,
        resource: &Resource,
        transaction: &dyn StoreTransaction,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError> {
        for data in resource.relationships.values() {
            for identifier in data.identifiers() {
                let key = identifier
                    .key()
                    .ok_or_else(|| invalid("reference could not be resolved"))?;
                self.find_existing(&key, transaction, cancel).await?;
            }
        }
        Ok(())
    }

    async fn after_commit(
        &self,
        written: Vec<(Resource, WriteOperationKind)>,
        cancel: &CancellationToken,
    ) {
        let mut created = Vec::new();
        let mut updated = Vec::new();
        let mut deleted = Vec::new();

        for (resource, kind) in written {
            let definition = self.definitions.get(&resource.resource_type);
            if let Err(error) = definition.on_write_succeeded(&resource, kind, cancel).await {
                warn!(
                    resource_type = %resource.resource_type,
                    id = ?resource.id,
                    ?kind,
                    %error,
                    "Post-commit hook failed"
                );
            }
            match kind {
                WriteOperationKind::CreateResource => created.push(resource),
                WriteOperationKind::DeleteResource => deleted.push(resource),
                _ => updated.push(resource),
            }
        }

        for (hook, roots) in [
            (ResourceHook::AfterCreate, created),
            (ResourceHook::AfterUpdate, updated),
            (ResourceHook::AfterDelete, deleted),
        ] {
            if roots.is_empty() {
                continue;
            }
            if let Err(error) = self.hooks.fire(hook, roots, &self.store, cancel).await {
                warn!(?hook, %error, "Post-commit resource hook failed");
            }
        }
    }
}

fn not_found(key: &ResourceKey) -> ApiError {
    ApiError::ResourceNotFound {
        resource_type: key.resource_type.clone(),
        id: key.id.clone(),
    }
}

async fn abort(transaction: &dyn StoreTransaction) {
    if let Err(error) = transaction.rollback().await {
        warn!(%error, "Rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutorError;
    use crate::graph::{AttrCapabilities, AttrKind, AttributeDescriptor, IdKind};
    use crate::mock::MockStore;
    use crate::store::StoreClient;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn graph() -> Arc<ResourceGraph> {
        let mut builder = ResourceGraph::builder();
        builder
            .add_resource("articles", "Article", IdKind::Integer)
            .attribute("title", AttrKind::String)
            .attribute_with(
                AttributeDescriptor::new("createdAt", AttrKind::String).capabilities(
                    AttrCapabilities {
                        allow_change: false,
                        ..Default::default()
                    },
                ),
            )
            .has_many("comments", "comments");
        builder
            .add_resource("comments", "Comment", IdKind::Integer)
            .attribute("text", AttrKind::String)
            .has_one("article", "articles");
        Arc::new(builder.build().unwrap())
    }

    fn processor(mock: &MockStore, options: ApiOptions) -> OperationsProcessor<StoreClient> {
        OperationsProcessor::new(
            graph(),
            Arc::new(options),
            DefinitionRegistry::new(),
            mock.client(),
        )
    }

    async fn rejected(operations: Vec<Operation>, options: ApiOptions) -> BatchError {
        let mock = MockStore::new();
        let error = processor(&mock, options)
            .process(OperationsDocument::new(operations), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(mock.requests().is_empty());
        mock.verify();
        error
    }

    fn article(lid: &str) -> Resource {
        Resource::new("articles")
            .with_lid(lid)
            .with_attribute("title", "Hello")
    }

    fn comment_on(lid: &str) -> Resource {
        Resource::new("comments")
            .with_attribute("text", "First")
            .with_to_one("article", Some(ResourceIdentifier::local("articles", lid)))
    }

    #[test]
    fn reads_either_document_key() {
        let operation = json!({
            "op": "add",
            "data": {"type": "articles", "lid": "a1", "attributes": {"title": "Hello"}}
        });
        let atomic: OperationsDocument =
            serde_json::from_value(json!({"atomic:operations": [operation.clone()]})).unwrap();
        let plain: OperationsDocument =
            serde_json::from_value(json!({"operations": [operation]})).unwrap();

        assert_eq!(atomic, plain);
        assert_eq!(atomic.operations, vec![Operation::add(article("a1"))]);
    }

    #[test]
    fn relationship_payloads_keep_their_shape() {
        let operation: Operation = serde_json::from_value(json!({
            "op": "add",
            "ref": {"type": "articles", "id": "1", "relationship": "comments"},
            "data": [{"type": "comments", "id": "4"}]
        }))
        .unwrap();
        assert_eq!(
            operation,
            Operation::add_members(
                OperationRef::new("articles").with_id("1").with_relationship("comments"),
                vec![ResourceIdentifier::new("comments", "4")],
            )
        );
    }

    #[tokio::test]
    async fn forward_local_id_reference_is_rejected_up_front() {
        let error = rejected(
            vec![Operation::add(comment_on("a1")), Operation::add(article("a1"))],
            ApiOptions::default(),
        )
        .await;
        assert_eq!(error, BatchError::at(0, ApiError::UnknownLocalId("a1".into())));
    }

    #[tokio::test]
    async fn duplicate_local_id_names_second_declaration() {
        let error = rejected(
            vec![Operation::add(article("a1")), Operation::add(article("a1"))],
            ApiOptions::default(),
        )
        .await;
        assert_eq!(error, BatchError::at(1, ApiError::DuplicateLocalId("a1".into())));
    }

    #[tokio::test]
    async fn batch_size_is_limited() {
        let options = ApiOptions {
            maximum_operations_per_request: 2,
            ..Default::default()
        };
        let operations = (0..3).map(|i| Operation::add(article(&format!("a{i}")))).collect();
        let error = rejected(operations, options).await;
        assert_eq!(error.index, None);
        assert_eq!(error.error.status(), 413);
    }

    #[tokio::test]
    async fn client_ids_and_read_only_attributes_are_rejected() {
        let error = rejected(
            vec![Operation::add(Resource::new("articles").with_id("9"))],
            ApiOptions::default(),
        )
        .await;
        assert_eq!(error.error.status(), 403);

        let error = rejected(
            vec![Operation::add(
                Resource::new("articles").with_attribute("createdAt", "2024-01-01"),
            )],
            ApiOptions::default(),
        )
        .await;
        assert!(matches!(error.error, ApiError::AttributeReadOnly { .. }));
    }

    #[tokio::test]
    async fn member_changes_need_a_to_many_relationship() {
        let error = rejected(
            vec![Operation::add_members(
                OperationRef::new("comments").with_id("1").with_relationship("article"),
                vec![ResourceIdentifier::new("articles", "1")],
            )],
            ApiOptions::default(),
        )
        .await;
        assert_eq!(
            error,
            BatchError::at(
                0,
                ApiError::CardinalityMismatch {
                    relationship: "article".into(),
                    expected: "to-many",
                }
            )
        );
    }

    #[tokio::test]
    async fn executor_failure_rolls_back_and_names_index() {
        let mock = MockStore::new();
        mock.expect_begin().return_ok(1);
        mock.expect_create_echo("1");
        mock.expect_create()
            .return_err(ExecutorError::Unavailable("disk".into()));

        let error = processor(&mock, ApiOptions::default())
            .process(
                OperationsDocument::new(vec![
                    Operation::add(article("a1")),
                    Operation::add(article("a2")),
                ]),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(error.index, Some(1));
        assert_eq!(error.error.status(), 503);
        assert_eq!(mock.requests(), vec!["begin", "create", "create", "rollback"]);
        mock.verify();
    }

    #[tokio::test]
    async fn commit_failure_is_reported_for_the_batch() {
        let mock = MockStore::new();
        mock.expect_begin().return_ok(1);
        mock.expect_create_echo("1");
        mock.expect_commit()
            .return_err(ExecutorError::Conflict("stale".into()));

        let error = processor(&mock, ApiOptions::default())
            .process(
                OperationsDocument::new(vec![Operation::add(article("a1"))]),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(error, BatchError::whole(ExecutorError::Conflict("stale".into())));
        mock.verify();
    }

    #[tokio::test]
    async fn cancelled_batch_never_begins() {
        let mock = MockStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let error = processor(&mock, ApiOptions::default())
            .process(OperationsDocument::new(vec![Operation::add(article("a1"))]), &cancel)
            .await
            .unwrap_err();

        assert_eq!(error, BatchError::whole(ApiError::Cancelled));
        assert!(mock.requests().is_empty());
        mock.verify();
    }

    /// Rewrites payloads in both directions and stamps fields on write.
    struct Stamping {
        extra: Option<(&'static str, Value)>,
    }

    #[async_trait::async_trait]
    impl ResourceDefinition for Stamping {
        fn on_deserialize(&self, resource: &mut Resource) {
            if let Some(Value::String(title)) = resource.attributes.get_mut("title") {
                *title = title.trim().to_string();
            }
        }

        fn on_serialize(&self, resource: &mut Resource) {
            if let Some(Value::String(title)) = resource.attributes.get_mut("title") {
                *title = title.to_uppercase();
            }
        }

        async fn on_prepare_write(
            &self,
            resource: &mut Resource,
            _kind: WriteOperationKind,
            _cancel: &CancellationToken,
        ) -> Result<(), crate::error::HookError> {
            resource
                .attributes
                .insert("createdAt".to_string(), Value::from("2024-01-01T00:00:00Z"));
            if let Some((name, value)) = &self.extra {
                resource.attributes.insert(name.to_string(), value.clone());
            }
            Ok(())
        }
    }

    fn stamping(
        mock: &MockStore,
        extra: Option<(&'static str, Value)>,
    ) -> OperationsProcessor<StoreClient> {
        OperationsProcessor::new(
            graph(),
            Arc::new(ApiOptions::default()),
            DefinitionRegistry::new().register("articles", Stamping { extra }),
            mock.client(),
        )
    }

    #[tokio::test]
    async fn payload_hooks_shape_stored_and_returned_resources() {
        let mock = MockStore::new();
        mock.expect_begin().return_ok(1);
        mock.expect_create_echo("1");
        mock.expect_commit().return_ok(());

        let results = stamping(&mock, None)
            .process(
                OperationsDocument::new(vec![Operation::add(
                    Resource::new("articles").with_attribute("title", "  hello "),
                )]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let created = results[0].resource().unwrap();
        assert_eq!(created.attribute("title"), Some(&json!("HELLO")));
        assert_eq!(created.attribute("createdAt"), Some(&json!("2024-01-01T00:00:00Z")));
        assert_eq!(mock.requests(), vec!["begin", "create", "commit"]);
        mock.verify();
    }

    #[tokio::test]
    async fn fields_added_by_hooks_are_checked_again() {
        let mock = MockStore::new();
        mock.expect_begin().return_ok(1);

        let error = stamping(&mock, Some(("bogus", json!(1))))
            .process(
                OperationsDocument::new(vec![Operation::add(article("a1"))]),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(
            error,
            BatchError::at(
                0,
                ApiError::UnknownField {
                    resource_type: "articles".into(),
                    field: "bogus".into()
                }
            )
        );
        assert_eq!(mock.requests(), vec!["begin", "rollback"]);
        mock.verify();
    }
}
