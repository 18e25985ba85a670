//! # StoreClient
//!
//! The interface half of the store actor. A `StoreClient` is a cheap,
//! cloneable handle around the actor's `mpsc::Sender`; every call sends a
//! [`StoreRequest`] carrying a `oneshot` reply channel and awaits the reply.
//!
//! Reads race the request's [`CancellationToken`]. Writes are raced by the
//! caller, which owns the transaction's lifetime.

use super::message::{Response, StoreRequest, TransactionId};
use crate::cancel::CancellationToken;
use crate::error::ExecutorError;
use crate::executor::{QueryExecutor, ResourceStore, StoreTransaction};
use crate::expression::{FilterExpression, QueryLayer};
use crate::resource::{Resource, ResourceIdentifier, ResourceKey};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

#[derive(Clone, Debug)]
pub struct StoreClient {
    sender: mpsc::Sender<StoreRequest>,
}

impl StoreClient {
    pub fn new(sender: mpsc::Sender<StoreRequest>) -> Self {
        Self { sender }
    }

    /// Transactions the store still holds open.
    pub async fn open_transactions(&self) -> Result<usize, ExecutorError> {
        self.request(|respond_to| StoreRequest::OpenTransactions { respond_to })
            .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Response<T>) -> StoreRequest,
    ) -> Result<T, ExecutorError> {
        send_request(&self.sender, build).await
    }
}

async fn send_request<T>(
    sender: &mpsc::Sender<StoreRequest>,
    build: impl FnOnce(Response<T>) -> StoreRequest,
) -> Result<T, ExecutorError> {
    let (respond_to, response) = oneshot::channel();
    sender
        .send(build(respond_to))
        .await
        .map_err(|_| ExecutorError::Unavailable("store actor closed".to_string()))?;
    response
        .await
        .map_err(|_| ExecutorError::Unavailable("store actor dropped the request".to_string()))?
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    request: impl std::future::Future<Output = Result<T, ExecutorError>>,
) -> Result<T, ExecutorError> {
    if cancel.is_cancelled() {
        return Err(ExecutorError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
        result = request => result,
    }
}

#[async_trait]
impl QueryExecutor for StoreClient {
    #[instrument(skip(self, layer, cancel), fields(resource_type = %layer.resource_type))]
    async fn execute(
        &self,
        layer: &QueryLayer,
        cancel: &CancellationToken,
    ) -> Result<Vec<Resource>, ExecutorError> {
        debug!("Sending request");
        let layer = layer.clone();
        cancellable(
            cancel,
            self.request(|respond_to| StoreRequest::Execute {
                transaction: None,
                layer,
                respond_to,
            }),
        )
        .await
    }

    #[instrument(skip(self, filter, cancel))]
    async fn count(
        &self,
        resource_type: &str,
        filter: Option<&FilterExpression>,
        cancel: &CancellationToken,
    ) -> Result<usize, ExecutorError> {
        debug!("Sending request");
        let resource_type = resource_type.to_string();
        let filter = filter.cloned();
        cancellable(
            cancel,
            self.request(|respond_to| StoreRequest::Count {
                transaction: None,
                resource_type,
                filter,
                respond_to,
            }),
        )
        .await
    }
}

#[async_trait]
impl ResourceStore for StoreClient {
    #[instrument(skip(self))]
    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>, ExecutorError> {
        debug!("Sending request");
        let id = self
            .request(|respond_to| StoreRequest::Begin { respond_to })
            .await?;
        Ok(Box::new(TransactionHandle {
            id,
            sender: self.sender.clone(),
            finished: AtomicBool::new(false),
        }))
    }
}

/// A transaction opened through [`StoreClient`].
pub struct TransactionHandle {
    id: TransactionId,
    sender: mpsc::Sender<StoreRequest>,
    finished: AtomicBool,
}

impl TransactionHandle {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Response<T>) -> StoreRequest,
    ) -> Result<T, ExecutorError> {
        send_request(&self.sender, build).await
    }
}

#[async_trait]
impl QueryExecutor for TransactionHandle {
    async fn execute(
        &self,
        layer: &QueryLayer,
        cancel: &CancellationToken,
    ) -> Result<Vec<Resource>, ExecutorError> {
        let layer = layer.clone();
        let transaction = Some(self.id);
        cancellable(
            cancel,
            self.request(|respond_to| StoreRequest::Execute {
                transaction,
                layer,
                respond_to,
            }),
        )
        .await
    }

    async fn count(
        &self,
        resource_type: &str,
        filter: Option<&FilterExpression>,
        cancel: &CancellationToken,
    ) -> Result<usize, ExecutorError> {
        let resource_type = resource_type.to_string();
        let filter = filter.cloned();
        let transaction = Some(self.id);
        cancellable(
            cancel,
            self.request(|respond_to| StoreRequest::Count {
                transaction,
                resource_type,
                filter,
                respond_to,
            }),
        )
        .await
    }
}

#[async_trait]
impl StoreTransaction for TransactionHandle {
    async fn find(&self, key: &ResourceKey) -> Result<Option<Resource>, ExecutorError> {
        let key = key.clone();
        self.request(|respond_to| StoreRequest::Find {
            transaction: self.id,
            key,
            respond_to,
        })
        .await
    }

    async fn create(&self, resource: Resource) -> Result<Resource, ExecutorError> {
        self.request(|respond_to| StoreRequest::Create {
            transaction: self.id,
            resource,
            respond_to,
        })
        .await
    }

    async fn update(&self, resource: Resource) -> Result<Resource, ExecutorError> {
        self.request(|respond_to| StoreRequest::Update {
            transaction: self.id,
            resource,
            respond_to,
        })
        .await
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), ExecutorError> {
        let key = key.clone();
        self.request(|respond_to| StoreRequest::Delete {
            transaction: self.id,
            key,
            respond_to,
        })
        .await
    }

    async fn add_to_relationship(
        &self,
        left: &ResourceKey,
        relationship: &str,
        right: Vec<ResourceIdentifier>,
    ) -> Result<(), ExecutorError> {
        let left = left.clone();
        let relationship = relationship.to_string();
        self.request(|respond_to| StoreRequest::AddToRelationship {
            transaction: self.id,
            left,
            relationship,
            right,
            respond_to,
        })
        .await
    }

    async fn remove_from_relationship(
        &self,
        left: &ResourceKey,
        relationship: &str,
        right: Vec<ResourceIdentifier>,
    ) -> Result<(), ExecutorError> {
        let left = left.clone();
        let relationship = relationship.to_string();
        self.request(|respond_to| StoreRequest::RemoveFromRelationship {
            transaction: self.id,
            left,
            relationship,
            right,
            respond_to,
        })
        .await
    }

    async fn commit(&self) -> Result<(), ExecutorError> {
        self.finished.store(true, Ordering::SeqCst);
        self.request(|respond_to| StoreRequest::Commit {
            transaction: self.id,
            respond_to,
        })
        .await
    }

    async fn rollback(&self) -> Result<(), ExecutorError> {
        self.finished.store(true, Ordering::SeqCst);
        self.request(|respond_to| StoreRequest::Rollback {
            transaction: self.id,
            respond_to: Some(respond_to),
        })
        .await
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if self.finished.load(Ordering::SeqCst) {
            return;
        }
        let request = StoreRequest::Rollback {
            transaction: self.id,
            respond_to: None,
        };
        if self.sender.try_send(request).is_err() {
            warn!(transaction = self.id, "Could not roll back dropped transaction");
        }
    }
}
