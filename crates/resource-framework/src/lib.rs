//! # Resource Framework
//!
//! The request-processing core of a resource API server. It turns client
//! query parameters into a validated, hook-adjusted query plan, and applies a
//! list of mutation operations as one all-or-nothing batch.
//!
//! Transport, authentication and concrete persistence are out of scope. They
//! meet the core at narrow seams: raw query pairs and operation documents
//! come in, and the [`executor`] traits go out to storage.
//!
//! ## Architecture Overview
//!
//! ```text
//!  query pairs ──► QueryStringReader ──► QueryLayer ──┐
//!                        │                             │ DefinitionRegistry
//!                        ▼                             ▼ (read hooks)
//!                  ResourceGraph ◄──────────── ResourceService ──► QueryExecutor
//!                        ▲
//!  operations ──► OperationsProcessor ──► StoreTransaction (one per batch)
//!                        │
//!                        └──► ResourceHookExecutor (cascading lifecycle hooks)
//! ```
//!
//! 1. **Metadata Layer** ([`graph`]): the immutable registry of resource types,
//!    attributes and relationships. Every name is resolved here and nowhere else.
//! 2. **Expression Layer** ([`expression`], [`query`]): the typed filter, sort,
//!    include, pagination and sparse field set model, and the reader that
//!    builds it from the query string.
//! 3. **Extension Layer** ([`definition`], [`hooks`]): per-type hooks with
//!    identity defaults, and the cascading resource hook executor.
//! 4. **Pipeline Layer** ([`service`], [`operations`]): reads and atomic batches.
//! 5. **Storage Boundary** ([`executor`]): the traits a storage backend
//!    implements. [`store`] is an in-memory implementation built as a single
//!    Tokio actor; [`mock`] scripts responses for failure tests.
//!
//! ## Quick Start
//!
//! ```rust
//! use resource_framework::cancel::CancellationToken;
//! use resource_framework::definition::DefinitionRegistry;
//! use resource_framework::graph::{AttrKind, IdKind, ResourceGraph};
//! use resource_framework::operations::{Operation, OperationsDocument, OperationsProcessor};
//! use resource_framework::options::ApiOptions;
//! use resource_framework::query::split_query_string;
//! use resource_framework::resource::Resource;
//! use resource_framework::service::ResourceService;
//! use resource_framework::store::StoreActor;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut builder = ResourceGraph::builder();
//!     builder
//!         .add_resource("tags", "Tag", IdKind::Integer)
//!         .attribute("name", AttrKind::String);
//!     let graph = Arc::new(builder.build().unwrap());
//!     let options = Arc::new(ApiOptions::default());
//!
//!     let (actor, store) = StoreActor::new(graph.clone(), &options, 32);
//!     tokio::spawn(actor.run());
//!
//!     let processor = OperationsProcessor::new(
//!         graph.clone(),
//!         options.clone(),
//!         DefinitionRegistry::new(),
//!         store.clone(),
//!     );
//!     let cancel = CancellationToken::new();
//!     processor
//!         .process(
//!             OperationsDocument::new(vec![Operation::add(
//!                 Resource::new("tags").with_attribute("name", "rust"),
//!             )]),
//!             &cancel,
//!         )
//!         .await
//!         .unwrap();
//!
//!     let service = ResourceService::new(graph, options, DefinitionRegistry::new(), store);
//!     let document = service
//!         .get_all("tags", &split_query_string("filter[name]=rust"), &cancel)
//!         .await
//!         .unwrap();
//!     assert_eq!(document.resources().len(), 1);
//! }
//! ```
//!
//! ## Cancellation
//!
//! Every suspending call takes a [`cancel::CancellationToken`]. Observing it
//! aborts the request exactly like a validation failure: a batch is rolled
//! back and nothing becomes visible.

pub mod cancel;
pub mod definition;
pub mod error;
pub mod executor;
pub mod expression;
pub mod graph;
pub mod hooks;
pub mod mock;
pub mod operations;
pub mod options;
pub mod query;
pub mod resource;
pub mod service;
pub mod store;
pub mod tracing;

// Re-export core types for convenience
pub use cancel::CancellationToken;
pub use definition::{DefinitionRegistry, ResourceDefinition, WriteOperationKind};
pub use error::{ApiError, ApiErrors, BatchError, ErrorDocument, ExecutorError, HookError};
pub use executor::{QueryExecutor, ResourceStore, StoreTransaction};
pub use graph::ResourceGraph;
pub use hooks::{ResourceHook, ResourceHookExecutor};
pub use operations::{OperationsDocument, OperationsProcessor};
pub use options::ApiOptions;
pub use service::ResourceService;
