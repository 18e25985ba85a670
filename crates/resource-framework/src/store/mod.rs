//! # Reference Store
//!
//! An in-memory [`ResourceStore`](crate::executor::ResourceStore) built on
//! the actor pattern: one Tokio task ([`StoreActor`]) owns all tables and
//! processes [`StoreRequest`]s sequentially; any number of cloned
//! [`StoreClient`]s talk to it over an `mpsc` channel with `oneshot`
//! replies.
//!
//! ```rust
//! use resource_framework::graph::{AttrKind, IdKind, ResourceGraph};
//! use resource_framework::options::ApiOptions;
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
//!
//!     let (actor, client) = StoreActor::new(graph, &ApiOptions::default(), 32);
//!     let handle = tokio::spawn(actor.run());
//!
//!     // ... hand `client` to a ResourceService or OperationsProcessor ...
//!
//!     drop(client);
//!     handle.await.unwrap();
//! }
//! ```

mod actor;
mod client;
pub mod evaluate;
mod message;

pub use actor::StoreActor;
pub use client::{StoreClient, TransactionHandle};
pub use message::{Response, StoreRequest, TransactionId};
