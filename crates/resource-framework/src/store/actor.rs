use super::client::StoreClient;
use super::evaluate::{self, Tables};
use super::message::{StoreRequest, TransactionId};
use crate::error::ExecutorError;
use crate::graph::{IdKind, ResourceGraph};
use crate::options::ApiOptions;
use crate::resource::{RelationshipData, Resource, ResourceIdentifier, ResourceKey};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct Transaction {
    tables: Tables,
    base_version: u64,
}

/// The in-memory reference store.
///
/// # Architecture Note
/// This struct is the "Server" half of the store. It owns every table and
/// every open transaction, and processes requests *sequentially* in its run
/// loop, so none of that state needs a lock.
///
/// # Transactions
/// `Begin` snapshots the committed tables. Reads and writes inside the
/// transaction work on that snapshot. `Commit` is optimistic: it fails with
/// [`ExecutorError::Conflict`] when another transaction committed after the
/// snapshot was taken. `Rollback` discards the snapshot.
///
/// # Ids
/// Resources created without an id get one from their type's [`IdKind`]:
/// a per-type counter for integer and text ids, a v4 uuid for guids.
/// Counters are never rewound, so a rolled back id is not reused.
pub struct StoreActor {
    receiver: mpsc::Receiver<StoreRequest>,
    graph: Arc<ResourceGraph>,
    maximum_page_size: Option<NonZeroU32>,
    committed: Tables,
    version: u64,
    next_ids: HashMap<String, u64>,
    transactions: HashMap<TransactionId, Transaction>,
    next_transaction: TransactionId,
}

impl StoreActor {
    /// Creates the actor and its client.
    ///
    /// `buffer_size` is the capacity of the request channel; callers wait
    /// for space when it is full.
    pub fn new(
        graph: Arc<ResourceGraph>,
        options: &ApiOptions,
        buffer_size: usize,
    ) -> (Self, StoreClient) {
        let (sender, receiver) = mpsc::channel(buffer_size);
        let actor = Self {
            receiver,
            graph,
            maximum_page_size: options.maximum_page_size,
            committed: Tables::default(),
            version: 0,
            next_ids: HashMap::new(),
            transactions: HashMap::new(),
            next_transaction: 1,
        };
        (actor, StoreClient::new(sender))
    }

    /// Processes requests until every client is dropped.
    pub async fn run(mut self) {
        info!(resources = self.graph.resource_contexts().count(), "Store started");

        while let Some(request) = self.receiver.recv().await {
            debug!(request = request.kind(), "Store request");
            self.handle(request);
        }

        if !self.transactions.is_empty() {
            warn!(open = self.transactions.len(), "Discarding open transactions");
        }
        info!(size = self.committed.len(), "Shutdown");
    }

    fn handle(&mut self, request: StoreRequest) {
        match request {
            StoreRequest::Execute {
                transaction,
                layer,
                respond_to,
            } => {
                let result = self.tables(transaction).and_then(|tables| {
                    evaluate::execute(tables, &layer, self.maximum_page_size)
                });
                let _ = respond_to.send(result);
            }
            StoreRequest::Count {
                transaction,
                resource_type,
                filter,
                respond_to,
            } => {
                let result = self
                    .tables(transaction)
                    .and_then(|tables| evaluate::count(tables, &resource_type, filter.as_ref()));
                let _ = respond_to.send(result);
            }
            StoreRequest::Begin { respond_to } => {
                let id = self.next_transaction;
                self.next_transaction += 1;
                self.transactions.insert(
                    id,
                    Transaction {
                        tables: self.committed.clone(),
                        base_version: self.version,
                    },
                );
                debug!(transaction = id, version = self.version, "Begin");
                let _ = respond_to.send(Ok(id));
            }
            StoreRequest::Find {
                transaction,
                key,
                respond_to,
            } => {
                let result = self
                    .tables(Some(transaction))
                    .map(|tables| tables.find(&key).cloned());
                let _ = respond_to.send(result);
            }
            StoreRequest::Create {
                transaction,
                resource,
                respond_to,
            } => {
                let _ = respond_to.send(self.create(transaction, resource));
            }
            StoreRequest::Update {
                transaction,
                resource,
                respond_to,
            } => {
                let _ = respond_to.send(self.update(transaction, resource));
            }
            StoreRequest::Delete {
                transaction,
                key,
                respond_to,
            } => {
                let _ = respond_to.send(self.delete(transaction, &key));
            }
            StoreRequest::AddToRelationship {
                transaction,
                left,
                relationship,
                right,
                respond_to,
            } => {
                let result = self.add_to_relationship(transaction, &left, &relationship, right);
                let _ = respond_to.send(result);
            }
            StoreRequest::RemoveFromRelationship {
                transaction,
                left,
                relationship,
                right,
                respond_to,
            } => {
                let result =
                    self.remove_from_relationship(transaction, &left, &relationship, right);
                let _ = respond_to.send(result);
            }
            StoreRequest::Commit {
                transaction,
                respond_to,
            } => {
                let _ = respond_to.send(self.commit(transaction));
            }
            StoreRequest::Rollback {
                transaction,
                respond_to,
            } => {
                let discarded = self.transactions.remove(&transaction).is_some();
                info!(transaction, discarded, "Rolled back");
                if let Some(respond_to) = respond_to {
                    let _ = respond_to.send(Ok(()));
                }
            }
            StoreRequest::OpenTransactions { respond_to } => {
                let _ = respond_to.send(Ok(self.transactions.len()));
            }
        }
    }

    fn tables(&self, transaction: Option<TransactionId>) -> Result<&Tables, ExecutorError> {
        match transaction {
            None => Ok(&self.committed),
            Some(id) => self
                .transactions
                .get(&id)
                .map(|t| &t.tables)
                .ok_or_else(|| unknown_transaction(id)),
        }
    }

    fn working_tables(&mut self, id: TransactionId) -> Result<&mut Tables, ExecutorError> {
        self.transactions
            .get_mut(&id)
            .map(|t| &mut t.tables)
            .ok_or_else(|| unknown_transaction(id))
    }

    fn generate_id(&mut self, resource_type: &str) -> Result<String, ExecutorError> {
        let context = self
            .graph
            .resource_context(resource_type)
            .map_err(|e| ExecutorError::Storage(e.to_string()))?;
        if context.id_kind == IdKind::Guid {
            return Ok(Uuid::new_v4().to_string());
        }
        let counter = self.next_ids.entry(resource_type.to_string()).or_insert(0);
        *counter += 1;
        Ok(counter.to_string())
    }

    fn create(
        &mut self,
        transaction: TransactionId,
        mut resource: Resource,
    ) -> Result<Resource, ExecutorError> {
        ensure_resolved(resource.relationships.values())?;
        let id = match resource.id.clone() {
            Some(id) => id,
            None => self.generate_id(&resource.resource_type)?,
        };
        resource.id = Some(id.clone());
        resource.lid = None;
        resource.meta.clear();

        let key = ResourceKey::new(resource.resource_type.clone(), id);
        let tables = self.working_tables(transaction)?;
        if tables.find(&key).is_some() {
            warn!(%key, "Already exists");
            return Err(ExecutorError::Conflict(format!("{key} already exists")));
        }
        tables.insert(resource.clone());
        info!(transaction, %key, "Created");
        Ok(resource)
    }

    fn update(
        &mut self,
        transaction: TransactionId,
        patch: Resource,
    ) -> Result<Resource, ExecutorError> {
        ensure_resolved(patch.relationships.values())?;
        let key = patch
            .key()
            .ok_or_else(|| ExecutorError::Storage("update without an id".to_string()))?;
        let tables = self.working_tables(transaction)?;
        let stored = tables
            .find_mut(&key)
            .ok_or_else(|| ExecutorError::NotFound(key.to_string()))?;
        stored.merge(patch);
        info!(transaction, %key, "Updated");
        Ok(stored.clone())
    }

    fn delete(&mut self, transaction: TransactionId, key: &ResourceKey) -> Result<(), ExecutorError> {
        let tables = self.working_tables(transaction)?;
        tables
            .remove(key)
            .ok_or_else(|| ExecutorError::NotFound(key.to_string()))?;
        tables.detach(key);
        info!(transaction, %key, "Deleted");
        Ok(())
    }

    fn add_to_relationship(
        &mut self,
        transaction: TransactionId,
        left: &ResourceKey,
        relationship: &str,
        right: Vec<ResourceIdentifier>,
    ) -> Result<(), ExecutorError> {
        ensure_resolved(std::iter::once(&RelationshipData::ToMany(right.clone())))?;
        let tables = self.working_tables(transaction)?;
        let stored = tables
            .find_mut(left)
            .ok_or_else(|| ExecutorError::NotFound(left.to_string()))?;
        let data = stored
            .relationships
            .entry(relationship.to_string())
            .or_insert_with(|| RelationshipData::ToMany(Vec::new()));
        let RelationshipData::ToMany(members) = data else {
            return Err(not_to_many(left, relationship));
        };
        for identifier in right {
            if !members.iter().any(|m| m.key() == identifier.key()) {
                members.push(identifier);
            }
        }
        info!(transaction, %left, relationship, "Added to relationship");
        Ok(())
    }

    fn remove_from_relationship(
        &mut self,
        transaction: TransactionId,
        left: &ResourceKey,
        relationship: &str,
        right: Vec<ResourceIdentifier>,
    ) -> Result<(), ExecutorError> {
        let tables = self.working_tables(transaction)?;
        let stored = tables
            .find_mut(left)
            .ok_or_else(|| ExecutorError::NotFound(left.to_string()))?;
        match stored.relationships.get_mut(relationship) {
            Some(RelationshipData::ToMany(members)) => {
                members.retain(|m| !right.iter().any(|r| r.key() == m.key()));
            }
            Some(RelationshipData::ToOne(_)) => return Err(not_to_many(left, relationship)),
            None => {}
        }
        info!(transaction, %left, relationship, "Removed from relationship");
        Ok(())
    }

    fn commit(&mut self, transaction: TransactionId) -> Result<(), ExecutorError> {
        let pending = self
            .transactions
            .remove(&transaction)
            .ok_or_else(|| unknown_transaction(transaction))?;
        if pending.base_version != self.version {
            warn!(
                transaction,
                base = pending.base_version,
                current = self.version,
                "Commit conflict"
            );
            return Err(ExecutorError::Conflict(format!(
                "transaction {transaction} was based on a stale snapshot"
            )));
        }
        self.committed = pending.tables;
        self.version += 1;
        info!(transaction, version = self.version, size = self.committed.len(), "Committed");
        Ok(())
    }
}

fn unknown_transaction(id: TransactionId) -> ExecutorError {
    ExecutorError::Storage(format!("unknown transaction {id}"))
}

fn not_to_many(left: &ResourceKey, relationship: &str) -> ExecutorError {
    ExecutorError::Storage(format!("'{relationship}' of {left} is not a to-many relationship"))
}

/// Stored relationships must name server ids.
fn ensure_resolved<'a>(
    relationships: impl IntoIterator<Item = &'a RelationshipData>,
) -> Result<(), ExecutorError> {
    for data in relationships {
        if let Some(identifier) = data.identifiers().into_iter().find(|i| i.id.is_none()) {
            return Err(ExecutorError::Storage(format!(
                "unresolved reference to '{}'",
                identifier.resource_type
            )));
        }
    }
    Ok(())
}
