//! # Executor Contract
//!
//! The boundary between the request pipeline and storage. The pipeline
//! hands over fully resolved, hook-adjusted [`QueryLayer`]s; an executor is
//! free to translate them into any storage query language.
//!
//! Failures are opaque [`ExecutorError`]s. Nothing on this side of the
//! boundary retries them.
//!
//! # Implementations
//! - [`crate::store::StoreClient`]: the in-memory reference store.
//! - [`crate::mock::MockStore`]: scripted responses for tests.

use crate::cancel::CancellationToken;
use crate::error::ExecutorError;
use crate::expression::{FilterExpression, QueryLayer};
use crate::resource::{Resource, ResourceIdentifier, ResourceKey};
use async_trait::async_trait;

/// Read side of storage.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Matching resources, filtered, sorted and paged as the layer says.
    async fn execute(
        &self,
        layer: &QueryLayer,
        cancel: &CancellationToken,
    ) -> Result<Vec<Resource>, ExecutorError>;

    /// Number of resources matching a top-level filter, ignoring paging.
    async fn count(
        &self,
        resource_type: &str,
        filter: Option<&FilterExpression>,
        cancel: &CancellationToken,
    ) -> Result<usize, ExecutorError>;
}

/// A store that can open write transactions.
#[async_trait]
pub trait ResourceStore: QueryExecutor {
    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>, ExecutorError>;
}

/// One storage-level transaction boundary.
///
/// Reads through the [`QueryExecutor`] half see the transaction's own
/// writes. Dropping a transaction that was neither committed nor rolled
/// back rolls it back.
#[async_trait]
pub trait StoreTransaction: QueryExecutor {
    async fn find(&self, key: &ResourceKey) -> Result<Option<Resource>, ExecutorError>;

    /// Stores a new resource, assigning a server id when it has none.
    async fn create(&self, resource: Resource) -> Result<Resource, ExecutorError>;

    /// Merges the given attributes and relationships into a stored resource.
    async fn update(&self, resource: Resource) -> Result<Resource, ExecutorError>;

    async fn delete(&self, key: &ResourceKey) -> Result<(), ExecutorError>;

    async fn add_to_relationship(
        &self,
        left: &ResourceKey,
        relationship: &str,
        right: Vec<ResourceIdentifier>,
    ) -> Result<(), ExecutorError>;

    async fn remove_from_relationship(
        &self,
        left: &ResourceKey,
        relationship: &str,
        right: Vec<ResourceIdentifier>,
    ) -> Result<(), ExecutorError>;

    async fn commit(&self) -> Result<(), ExecutorError>;

    async fn rollback(&self) -> Result<(), ExecutorError>;
}
