//! # Mock Store & Testing Guide
//!
//! `MockStore` serves the same [`StoreRequest`] channel as the real
//! [`StoreActor`](crate::store::StoreActor), but answers from a queue of
//! scripted expectations instead of tables. Its [`StoreClient`] is the
//! production client type, so anything that accepts a `ResourceStore` can be
//! tested against it.
//!
//! ## When to use the Mock vs the Real Store
//!
//! | Feature | MockStore | StoreActor |
//! |---------|-----------|------------|
//! | **State** | None (expectations) | Real tables and transactions |
//! | **Error Injection** | Easy (`return_err`) | Hard (requires specific state) |
//! | **Use Case** | Failure paths of the processor/service | End-to-end behavior |
//!
//! ## Example
//! ```rust
//! use resource_framework::error::ExecutorError;
//! use resource_framework::executor::{ResourceStore, StoreTransaction};
//! use resource_framework::mock::MockStore;
//! use resource_framework::resource::Resource;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mock = MockStore::new();
//!     mock.expect_begin().return_ok(1);
//!     mock.expect_create().return_err(ExecutorError::Timeout);
//!
//!     let client = mock.client();
//!     let transaction = client.begin_transaction().await.unwrap();
//!     let result = transaction.create(Resource::new("tags")).await;
//!     assert_eq!(result, Err(ExecutorError::Timeout));
//!
//!     drop(transaction);
//!     mock.verify();
//! }
//! ```
//!
//! Rollbacks are always acknowledged and never consume an expectation;
//! [`MockStore::requests`] records every request kind for verification.

use crate::error::ExecutorError;
use crate::resource::Resource;
use crate::store::{StoreClient, StoreRequest, TransactionId};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

enum Expectation {
    Execute(Result<Vec<Resource>, ExecutorError>),
    Count(Result<usize, ExecutorError>),
    Begin(Result<TransactionId, ExecutorError>),
    Find(Result<Option<Resource>, ExecutorError>),
    Create(Result<Resource, ExecutorError>),
    /// Answers with the submitted resource, given this id.
    CreateEcho(String),
    Update(Result<Resource, ExecutorError>),
    Delete(Result<(), ExecutorError>),
    AddToRelationship(Result<(), ExecutorError>),
    RemoveFromRelationship(Result<(), ExecutorError>),
    Commit(Result<(), ExecutorError>),
}

type Queue = Arc<Mutex<VecDeque<Expectation>>>;

#[derive(Default)]
struct Journal {
    requests: Vec<&'static str>,
    mismatches: Vec<&'static str>,
}

pub struct MockStore {
    client: StoreClient,
    expectations: Queue,
    journal: Arc<Mutex<Journal>>,
    _handle: tokio::task::JoinHandle<()>,
}

impl Default for MockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStore {
    /// Must be called inside a Tokio runtime.
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::channel::<StoreRequest>(100);
        let expectations: Queue = Arc::new(Mutex::new(VecDeque::new()));
        let journal = Arc::new(Mutex::new(Journal::default()));
        let expectations_clone = expectations.clone();
        let journal_clone = journal.clone();

        let handle = tokio::spawn(async move {
            while let Some(request) = receiver.recv().await {
                let kind = request.kind();
                if let Ok(mut journal) = journal_clone.lock() {
                    journal.requests.push(kind);
                }

                if let StoreRequest::Rollback { respond_to, .. } = request {
                    if let Some(respond_to) = respond_to {
                        let _ = respond_to.send(Ok(()));
                    }
                    continue;
                }

                let expectation = expectations_clone
                    .lock()
                    .ok()
                    .and_then(|mut queue| queue.pop_front());

                if let Err(request) = answer(request, expectation) {
                    if let Ok(mut journal) = journal_clone.lock() {
                        journal.mismatches.push(kind);
                    }
                    reject(request);
                }
            }
        });

        Self {
            client: StoreClient::new(sender),
            expectations,
            journal,
            _handle: handle,
        }
    }

    pub fn client(&self) -> StoreClient {
        self.client.clone()
    }

    fn builder<T>(&self, wrap: fn(Result<T, ExecutorError>) -> Expectation) -> ExpectationBuilder<T> {
        ExpectationBuilder {
            expectations: self.expectations.clone(),
            wrap,
            _marker: PhantomData,
        }
    }

    pub fn expect_execute(&self) -> ExpectationBuilder<Vec<Resource>> {
        self.builder(Expectation::Execute)
    }

    pub fn expect_count(&self) -> ExpectationBuilder<usize> {
        self.builder(Expectation::Count)
    }

    pub fn expect_begin(&self) -> ExpectationBuilder<TransactionId> {
        self.builder(Expectation::Begin)
    }

    pub fn expect_find(&self) -> ExpectationBuilder<Option<Resource>> {
        self.builder(Expectation::Find)
    }

    pub fn expect_create(&self) -> ExpectationBuilder<Resource> {
        self.builder(Expectation::Create)
    }

    /// Expects a create and answers with the submitted resource under `id`.
    pub fn expect_create_echo(&self, id: impl Into<String>) {
        self.push(Expectation::CreateEcho(id.into()));
    }

    pub fn expect_update(&self) -> ExpectationBuilder<Resource> {
        self.builder(Expectation::Update)
    }

    pub fn expect_delete(&self) -> ExpectationBuilder<()> {
        self.builder(Expectation::Delete)
    }

    pub fn expect_add_to_relationship(&self) -> ExpectationBuilder<()> {
        self.builder(Expectation::AddToRelationship)
    }

    pub fn expect_remove_from_relationship(&self) -> ExpectationBuilder<()> {
        self.builder(Expectation::RemoveFromRelationship)
    }

    pub fn expect_commit(&self) -> ExpectationBuilder<()> {
        self.builder(Expectation::Commit)
    }

    fn push(&self, expectation: Expectation) {
        self.expectations.lock().unwrap().push_back(expectation);
    }

    /// Kinds of every request received so far, in order.
    pub fn requests(&self) -> Vec<&'static str> {
        self.journal.lock().unwrap().requests.clone()
    }

    /// Panics if expectations remain or a request did not match.
    pub fn verify(&self) {
        let remaining = self.expectations.lock().unwrap().len();
        if remaining > 0 {
            panic!("Not all expectations were met. {remaining} remaining");
        }
        let journal = self.journal.lock().unwrap();
        if !journal.mismatches.is_empty() {
            panic!("Unexpected requests: {:?}", journal.mismatches);
        }
    }
}

pub struct ExpectationBuilder<T> {
    expectations: Queue,
    wrap: fn(Result<T, ExecutorError>) -> Expectation,
    _marker: PhantomData<T>,
}

impl<T> ExpectationBuilder<T> {
    pub fn return_ok(self, value: T) {
        let expectation = (self.wrap)(Ok(value));
        self.expectations.lock().unwrap().push_back(expectation);
    }

    pub fn return_err(self, error: ExecutorError) {
        let expectation = (self.wrap)(Err(error));
        self.expectations.lock().unwrap().push_back(expectation);
    }
}

/// Answers `request` from `expectation`, or hands the request back.
fn answer(request: StoreRequest, expectation: Option<Expectation>) -> Result<(), StoreRequest> {
    match (request, expectation) {
        (StoreRequest::Execute { respond_to, .. }, Some(Expectation::Execute(response))) => {
            let _ = respond_to.send(response);
        }
        (StoreRequest::Count { respond_to, .. }, Some(Expectation::Count(response))) => {
            let _ = respond_to.send(response);
        }
        (StoreRequest::Begin { respond_to }, Some(Expectation::Begin(response))) => {
            let _ = respond_to.send(response);
        }
        (StoreRequest::Find { respond_to, .. }, Some(Expectation::Find(response))) => {
            let _ = respond_to.send(response);
        }
        (StoreRequest::Create { respond_to, .. }, Some(Expectation::Create(response))) => {
            let _ = respond_to.send(response);
        }
        (
            StoreRequest::Create {
                mut resource,
                respond_to,
                ..
            },
            Some(Expectation::CreateEcho(id)),
        ) => {
            resource.id = Some(id);
            resource.lid = None;
            let _ = respond_to.send(Ok(resource));
        }
        (StoreRequest::Update { respond_to, .. }, Some(Expectation::Update(response))) => {
            let _ = respond_to.send(response);
        }
        (StoreRequest::Delete { respond_to, .. }, Some(Expectation::Delete(response))) => {
            let _ = respond_to.send(response);
        }
        (
            StoreRequest::AddToRelationship { respond_to, .. },
            Some(Expectation::AddToRelationship(response)),
        ) => {
            let _ = respond_to.send(response);
        }
        (
            StoreRequest::RemoveFromRelationship { respond_to, .. },
            Some(Expectation::RemoveFromRelationship(response)),
        ) => {
            let _ = respond_to.send(response);
        }
        (StoreRequest::Commit { respond_to, .. }, Some(Expectation::Commit(response))) => {
            let _ = respond_to.send(response);
        }
        (request, _) => return Err(request),
    }
    Ok(())
}

fn reject(request: StoreRequest) {
    let message = format!("unexpected {} request", request.kind());
    let error = || ExecutorError::Storage(message.clone());
    match request {
        StoreRequest::Execute { respond_to, .. } => {
            let _ = respond_to.send(Err(error()));
        }
        StoreRequest::Count { respond_to, .. }
        | StoreRequest::OpenTransactions { respond_to } => {
            let _ = respond_to.send(Err(error()));
        }
        StoreRequest::Begin { respond_to } => {
            let _ = respond_to.send(Err(error()));
        }
        StoreRequest::Find { respond_to, .. } => {
            let _ = respond_to.send(Err(error()));
        }
        StoreRequest::Create { respond_to, .. } | StoreRequest::Update { respond_to, .. } => {
            let _ = respond_to.send(Err(error()));
        }
        StoreRequest::Delete { respond_to, .. }
        | StoreRequest::AddToRelationship { respond_to, .. }
        | StoreRequest::RemoveFromRelationship { respond_to, .. }
        | StoreRequest::Commit { respond_to, .. } => {
            let _ = respond_to.send(Err(error()));
        }
        StoreRequest::Rollback { respond_to, .. } => {
            if let Some(respond_to) = respond_to {
                let _ = respond_to.send(Ok(()));
            }
        }
    }
}
