//! # Sample Domain Model
//!
//! The resource graph of a small blog with a todo list attached to each
//! person. Registration is split by area:
//!
//! - [`blog`]: `people`, `articles`, `comments`, `tags`
//! - [`todo`]: `todoItems`
//!
//! Inverse relationships let reads include `people.articles` and
//! `articles.comments` without storing both directions, and let
//! `BeforeDelete` cascade from a person to the items and articles they own.

pub mod blog;
pub mod todo;

use resource_framework::graph::{GraphError, ResourceGraph};

/// Builds the validated graph for every sample resource type.
pub fn resource_graph() -> Result<ResourceGraph, GraphError> {
    let mut builder = ResourceGraph::builder();
    blog::register(&mut builder);
    todo::register(&mut builder);
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use resource_framework::graph::Cardinality;
    use resource_framework::hooks::ResourceHook;

    #[test]
    fn graph_builds_with_inverses() {
        let graph = resource_graph().unwrap();
        let owned = graph.relationship("people", "todoItems").unwrap();
        assert_eq!(owned.inverse.as_deref(), Some("owner"));
        assert!(owned.cascade_hooks.contains(&ResourceHook::BeforeDelete));

        let owner = graph.relationship("todoItems", "owner").unwrap();
        assert_eq!(owner.cardinality, Cardinality::ToOne);
        assert!(!graph
            .attribute("articles", "createdAt")
            .unwrap()
            .capabilities
            .allow_change);
    }
}
