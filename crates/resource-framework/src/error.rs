//! # Framework Errors
//!
//! Error types shared by every layer of the request pipeline, and their
//! mapping onto the error objects returned to clients.
//!
//! - [`ApiError`]: a single request failure (malformed query, unknown name,
//!   hook rejection, storage failure).
//! - [`HookError`]: raised by resource definitions to veto a write.
//! - [`ExecutorError`]: opaque failure from the storage collaborator.
//! - [`BatchError`]: an [`ApiError`] tagged with the failing operation index.
//!
//! [`ErrorObject`] and [`ErrorDocument`] are the serializable client-facing
//! forms.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Failure reported by the storage collaborator. Never retried here.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutorError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Storage timed out")]
    Timeout,
    #[error("Stored resource not found: {0}")]
    NotFound(String),
    #[error("Concurrent modification detected: {0}")]
    Conflict(String),
    #[error("Storage operation cancelled")]
    Cancelled,
    #[error("Storage failure: {0}")]
    Storage(String),
}

/// A failure raised by a resource definition hook.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{title}")]
pub struct HookError {
    pub status: u16,
    pub title: String,
    pub detail: Option<String>,
    /// JSON pointer into the submitted resource, if the hook knows it.
    pub pointer: Option<String>,
}

impl HookError {
    pub fn validation(detail: impl Into<String>) -> Self {
        Self {
            status: 422,
            title: "Input validation failed.".to_string(),
            detail: Some(detail.into()),
            pointer: None,
        }
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self {
            status: 403,
            title: "The requested operation is not allowed.".to_string(),
            detail: Some(detail.into()),
            pointer: None,
        }
    }

    pub fn with_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.pointer = Some(pointer.into());
        self
    }
}

/// A single request failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    #[error("Resource type '{0}' does not exist.")]
    UnknownResourceType(String),

    #[error("Field '{field}' does not exist on resource type '{resource_type}'.")]
    UnknownField {
        resource_type: String,
        field: String,
    },

    #[error("Field path '{path}' is invalid: {reason}.")]
    InvalidField { path: String, reason: String },

    #[error("Filter operator '{operator}' is not supported.")]
    UnknownOperator { parameter: String, operator: String },

    #[error("Query parameter '{parameter}' is invalid: {reason}.")]
    InvalidQueryParameter { parameter: String, reason: String },

    #[error("Query parameter '{0}' is not supported.")]
    UnknownQueryParameter(String),

    #[error("Local id '{0}' is not declared by an earlier operation.")]
    UnknownLocalId(String),

    #[error("Local id '{0}' is declared more than once.")]
    DuplicateLocalId(String),

    #[error("Operation is invalid: {0}.")]
    InvalidOperation(String),

    #[error("Too many operations in request: {count} exceeds the maximum of {maximum}.")]
    TooManyOperations { count: usize, maximum: usize },

    #[error("Resource of type '{resource_type}' with id '{id}' does not exist.")]
    ResourceNotFound { resource_type: String, id: String },

    #[error("Relationship '{relationship}' expects {expected} data.")]
    CardinalityMismatch {
        relationship: String,
        expected: &'static str,
    },

    #[error("Resource type '{actual}' is incompatible with '{expected}'.")]
    ResourceTypeMismatch { expected: String, actual: String },

    #[error("Client-generated ids are not allowed for resource type '{0}'.")]
    ClientGeneratedIdNotAllowed(String),

    #[error("Attribute '{attribute}' of '{resource_type}' cannot be changed.")]
    AttributeReadOnly {
        resource_type: String,
        attribute: String,
    },

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error("Request was cancelled.")]
    Cancelled,

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl ApiError {
    pub fn invalid_parameter(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        ApiError::InvalidQueryParameter {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// HTTP-style status code.
    pub fn status(&self) -> u16 {
        match self {
            ApiError::ResourceNotFound { .. } => 404,
            ApiError::ResourceTypeMismatch { .. } => 409,
            ApiError::ClientGeneratedIdNotAllowed(_) => 403,
            ApiError::TooManyOperations { .. } => 413,
            ApiError::AttributeReadOnly { .. } => 422,
            ApiError::Hook(hook) => hook.status,
            ApiError::Cancelled => 499,
            ApiError::Executor(error) => match error {
                ExecutorError::NotFound(_) => 404,
                ExecutorError::Conflict(_) => 409,
                ExecutorError::Cancelled => 499,
                ExecutorError::Unavailable(_) => 503,
                ExecutorError::Timeout => 504,
                ExecutorError::Storage(_) => 500,
            },
            _ => 400,
        }
    }

    /// Stable application error code.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::UnknownResourceType(_) => "UNKNOWN_RESOURCE_TYPE",
            ApiError::UnknownField { .. } => "UNKNOWN_FIELD",
            ApiError::InvalidField { .. } => "INVALID_FIELD",
            ApiError::UnknownOperator { .. } => "UNKNOWN_OPERATOR",
            ApiError::InvalidQueryParameter { .. } => "INVALID_QUERY_PARAMETER",
            ApiError::UnknownQueryParameter(_) => "UNKNOWN_QUERY_PARAMETER",
            ApiError::UnknownLocalId(_) => "UNKNOWN_LOCAL_ID",
            ApiError::DuplicateLocalId(_) => "DUPLICATE_LOCAL_ID",
            ApiError::InvalidOperation(_) => "INVALID_OPERATION",
            ApiError::TooManyOperations { .. } => "TOO_MANY_OPERATIONS",
            ApiError::ResourceNotFound { .. } => "RESOURCE_NOT_FOUND",
            ApiError::CardinalityMismatch { .. } => "CARDINALITY_MISMATCH",
            ApiError::ResourceTypeMismatch { .. } => "RESOURCE_TYPE_MISMATCH",
            ApiError::ClientGeneratedIdNotAllowed(_) => "CLIENT_GENERATED_ID_NOT_ALLOWED",
            ApiError::AttributeReadOnly { .. } => "ATTRIBUTE_READ_ONLY",
            ApiError::Hook(_) => "HOOK_REJECTED",
            ApiError::Cancelled => "REQUEST_CANCELLED",
            ApiError::Executor(_) => "STORAGE_FAILURE",
        }
    }

    pub fn title(&self) -> String {
        match self {
            ApiError::UnknownResourceType(_)
            | ApiError::UnknownField { .. }
            | ApiError::InvalidField { .. }
            | ApiError::UnknownOperator { .. }
            | ApiError::InvalidQueryParameter { .. }
            | ApiError::UnknownQueryParameter(_) => {
                "The specified query string parameter is invalid.".to_string()
            }
            ApiError::UnknownLocalId(_) | ApiError::DuplicateLocalId(_) => {
                "Local id resolution failed.".to_string()
            }
            ApiError::InvalidOperation(_) | ApiError::TooManyOperations { .. } => {
                "The operation is invalid.".to_string()
            }
            ApiError::ResourceNotFound { .. } => "The requested resource does not exist.".to_string(),
            ApiError::CardinalityMismatch { .. } | ApiError::ResourceTypeMismatch { .. } => {
                "The relationship data is invalid.".to_string()
            }
            ApiError::ClientGeneratedIdNotAllowed(_) => {
                "Specifying the resource id is not allowed.".to_string()
            }
            ApiError::AttributeReadOnly { .. } => "Attribute is read-only.".to_string(),
            ApiError::Hook(hook) => hook.title.clone(),
            ApiError::Cancelled => "The request was cancelled.".to_string(),
            ApiError::Executor(_) => "An unhandled storage error occurred.".to_string(),
        }
    }

    /// Query-string parameter that caused the failure, if any.
    pub fn parameter(&self) -> Option<&str> {
        match self {
            ApiError::UnknownOperator { parameter, .. }
            | ApiError::InvalidQueryParameter { parameter, .. } => Some(parameter),
            ApiError::UnknownQueryParameter(parameter) => Some(parameter),
            _ => None,
        }
    }

    pub fn to_error_object(&self) -> ErrorObject {
        let pointer = match self {
            ApiError::Hook(hook) => hook.pointer.clone(),
            _ => None,
        };
        let detail = match self {
            ApiError::Hook(hook) => hook.detail.clone(),
            other => Some(other.to_string()),
        };
        let parameter = self.parameter().map(str::to_string);
        let source = if pointer.is_some() || parameter.is_some() {
            Some(ErrorSource { pointer, parameter })
        } else {
            None
        };

        ErrorObject {
            id: Uuid::new_v4().to_string(),
            status: self.status().to_string(),
            code: self.code().to_string(),
            title: self.title(),
            detail,
            source,
            meta: BTreeMap::new(),
        }
    }
}

/// Several request failures reported together.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{} request error(s), first: {}", .0.len(), first_message(.0))]
pub struct ApiErrors(pub Vec<ApiError>);

fn first_message(errors: &[ApiError]) -> String {
    errors.first().map(ToString::to_string).unwrap_or_default()
}

impl ApiErrors {
    pub fn single(error: ApiError) -> Self {
        Self(vec![error])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ApiError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<ApiError> for ApiErrors {
    fn from(error: ApiError) -> Self {
        Self::single(error)
    }
}

/// Failure of an atomic batch.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{}", describe_batch_failure(.index, .error))]
pub struct BatchError {
    /// Zero-based index of the failing operation. `None` when the batch as a
    /// whole failed (size limit, transaction begin or commit).
    pub index: Option<usize>,
    pub error: ApiError,
}

fn describe_batch_failure(index: &Option<usize>, error: &ApiError) -> String {
    match index {
        Some(index) => format!("operation {index} failed: {error}"),
        None => format!("batch failed: {error}"),
    }
}

impl BatchError {
    pub fn at(index: usize, error: impl Into<ApiError>) -> Self {
        Self {
            index: Some(index),
            error: error.into(),
        }
    }

    pub fn whole(error: impl Into<ApiError>) -> Self {
        Self {
            index: None,
            error: error.into(),
        }
    }

    /// Source pointer naming the failing operation.
    pub fn pointer(&self) -> Option<String> {
        let index = self.index?;
        let operation = format!("/atomic:operations[{index}]");
        match &self.error {
            ApiError::Hook(HookError {
                pointer: Some(inner),
                ..
            }) => Some(format!("{operation}{inner}")),
            _ => Some(operation),
        }
    }

    pub fn to_error_object(&self) -> ErrorObject {
        let mut object = self.error.to_error_object();
        if let Some(pointer) = self.pointer() {
            let source = object.source.get_or_insert_with(ErrorSource::default);
            source.pointer = Some(pointer);
        }
        object
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
}

/// Client-facing representation of one failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Unique occurrence id.
    pub id: String,
    pub status: String,
    pub code: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ErrorSource>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, Value>,
}

impl ErrorObject {
    fn status_code(&self) -> u16 {
        self.status.parse().unwrap_or(500)
    }
}

/// A set of error objects returned together for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDocument {
    pub errors: Vec<ErrorObject>,
}

impl ErrorDocument {
    /// The shared status when all errors agree, otherwise the hundred-class
    /// of the highest status.
    pub fn status(&self) -> u16 {
        let mut statuses = self.errors.iter().map(ErrorObject::status_code);
        let Some(first) = statuses.next() else {
            return 500;
        };
        let mut highest = first;
        let mut shared = true;
        for status in statuses {
            shared &= status == first;
            highest = highest.max(status);
        }
        if shared {
            first
        } else {
            highest / 100 * 100
        }
    }
}

impl From<&ApiErrors> for ErrorDocument {
    fn from(errors: &ApiErrors) -> Self {
        Self {
            errors: errors.iter().map(ApiError::to_error_object).collect(),
        }
    }
}

impl From<&ApiError> for ErrorDocument {
    fn from(error: &ApiError) -> Self {
        Self {
            errors: vec![error.to_error_object()],
        }
    }
}

impl From<&BatchError> for ErrorDocument {
    fn from(error: &BatchError) -> Self {
        Self {
            errors: vec![error.to_error_object()],
        }
    }
}
