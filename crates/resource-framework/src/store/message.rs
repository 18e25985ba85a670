use crate::error::ExecutorError;
use crate::expression::{FilterExpression, QueryLayer};
use crate::resource::{Resource, ResourceIdentifier, ResourceKey};
use tokio::sync::oneshot;

/// One-shot reply channel used by the store actor.
pub type Response<T> = oneshot::Sender<Result<T, ExecutorError>>;

pub type TransactionId = u64;

/// Requests understood by the store actor.
///
/// Reads carry an optional transaction: `None` reads committed state, `Some`
/// reads the transaction's working copy. Writes always belong to a
/// transaction.
#[derive(Debug)]
pub enum StoreRequest {
    Execute {
        transaction: Option<TransactionId>,
        layer: QueryLayer,
        respond_to: Response<Vec<Resource>>,
    },
    Count {
        transaction: Option<TransactionId>,
        resource_type: String,
        filter: Option<FilterExpression>,
        respond_to: Response<usize>,
    },
    Begin {
        respond_to: Response<TransactionId>,
    },
    Find {
        transaction: TransactionId,
        key: ResourceKey,
        respond_to: Response<Option<Resource>>,
    },
    Create {
        transaction: TransactionId,
        resource: Resource,
        respond_to: Response<Resource>,
    },
    Update {
        transaction: TransactionId,
        resource: Resource,
        respond_to: Response<Resource>,
    },
    Delete {
        transaction: TransactionId,
        key: ResourceKey,
        respond_to: Response<()>,
    },
    AddToRelationship {
        transaction: TransactionId,
        left: ResourceKey,
        relationship: String,
        right: Vec<ResourceIdentifier>,
        respond_to: Response<()>,
    },
    RemoveFromRelationship {
        transaction: TransactionId,
        left: ResourceKey,
        relationship: String,
        right: Vec<ResourceIdentifier>,
        respond_to: Response<()>,
    },
    Commit {
        transaction: TransactionId,
        respond_to: Response<()>,
    },
    /// `respond_to` is `None` when sent from a dropped transaction handle.
    Rollback {
        transaction: TransactionId,
        respond_to: Option<Response<()>>,
    },
    /// Number of transactions neither committed nor rolled back.
    OpenTransactions {
        respond_to: Response<usize>,
    },
}

impl StoreRequest {
    /// Short name used in logs and mock verification.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreRequest::Execute { .. } => "execute",
            StoreRequest::Count { .. } => "count",
            StoreRequest::Begin { .. } => "begin",
            StoreRequest::Find { .. } => "find",
            StoreRequest::Create { .. } => "create",
            StoreRequest::Update { .. } => "update",
            StoreRequest::Delete { .. } => "delete",
            StoreRequest::AddToRelationship { .. } => "add_to_relationship",
            StoreRequest::RemoveFromRelationship { .. } => "remove_from_relationship",
            StoreRequest::Commit { .. } => "commit",
            StoreRequest::Rollback { .. } => "rollback",
            StoreRequest::OpenTransactions { .. } => "open_transactions",
        }
    }
}
