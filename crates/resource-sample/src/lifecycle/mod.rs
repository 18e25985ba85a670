//! # System Lifecycle
//!
//! [`ApiSystem`] wires the sample domain onto the framework and owns the
//! runtime pieces:
//!
//! 1. **Graph** - built once from [`crate::model`] and shared read-only
//! 2. **Definitions** - registered from [`crate::definitions`]
//! 3. **Store Actor** - spawned on the Tokio runtime; every other component
//!    talks to it through cloned [`StoreClient`]s
//! 4. **Pipelines** - a [`ResourceService`] for reads and an
//!    [`OperationsProcessor`] for atomic batches
//!
//! ## Graceful Shutdown
//!
//! The store actor stops when its last client is dropped.
//! [`ApiSystem::shutdown`] drops the service and processor (the only client
//! owners) and then awaits the actor task, so every queued request is
//! answered before it returns.
//!
//! ```rust,ignore
//! let system = ApiSystem::new(ApiOptions::load())?;
//! let document = system.service.get_all("articles", &pairs, &cancel).await?;
//! system.shutdown().await?;
//! ```

use crate::definitions::{self, Journal};
use crate::model;
use resource_framework::error::ApiError;
use resource_framework::graph::{GraphError, ResourceGraph};
use resource_framework::operations::OperationsProcessor;
use resource_framework::options::ApiOptions;
use resource_framework::service::ResourceService;
use resource_framework::store::{StoreActor, StoreClient};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

/// Capacity of the store actor's request channel.
const STORE_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Invalid resource graph: {0}")]
    Graph(#[from] GraphError),

    #[error("Invalid resource definition: {0}")]
    Definition(#[from] ApiError),

    #[error("Store actor failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// The running sample API.
pub struct ApiSystem {
    pub graph: Arc<ResourceGraph>,
    pub options: Arc<ApiOptions>,
    pub service: ResourceService<StoreClient>,
    pub processor: OperationsProcessor<StoreClient>,
    /// Resource hook notifications recorded by the definitions.
    pub journal: Journal,
    store_handle: JoinHandle<()>,
}

impl ApiSystem {
    /// Builds the graph and definitions and spawns the store actor.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(options: ApiOptions) -> Result<Self, SystemError> {
        let graph = Arc::new(model::resource_graph()?);
        let options = Arc::new(options);
        let journal = Journal::new();
        let definitions = definitions::registry(&graph, &journal)?;

        let (actor, store) = StoreActor::new(graph.clone(), &options, STORE_BUFFER);
        let store_handle = tokio::spawn(actor.run());

        let service = ResourceService::new(
            graph.clone(),
            options.clone(),
            definitions.clone(),
            store.clone(),
        );
        let processor = OperationsProcessor::new(graph.clone(), options.clone(), definitions, store);

        info!(
            resource_types = graph.resource_contexts().count(),
            "API system started"
        );
        Ok(Self {
            graph,
            options,
            service,
            processor,
            journal,
            store_handle,
        })
    }

    /// Drops every store client and waits for the store actor to finish.
    pub async fn shutdown(self) -> Result<(), SystemError> {
        info!("Shutting down API system");
        drop(self.service);
        drop(self.processor);
        self.store_handle.await?;
        info!("API system stopped");
        Ok(())
    }
}
