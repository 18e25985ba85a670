//! # Sample Resource Definitions
//!
//! Per-type behavior layered on the framework's identity defaults:
//!
//! | Type        | Reads                                   | Writes                                   |
//! |-------------|-----------------------------------------|------------------------------------------|
//! | `articles`  | hide soft-deleted rows, newest first    | stamp `createdAt`, require a title       |
//! | `comments`  | none                                    | stamp `createdAt`                        |
//! | `people`    | never return `password`                 | journal `BeforeDelete`                   |
//! | `todoItems` | none                                    | priority 1..=5, assignee defaults to owner, journal `BeforeDelete` |

pub mod article;
pub mod comment;
pub mod journal;
pub mod person;
pub mod todo_item;

pub use article::ArticleDefinition;
pub use comment::CommentDefinition;
pub use journal::Journal;
pub use person::PersonDefinition;
pub use todo_item::TodoItemDefinition;

use chrono::{SecondsFormat, Utc};
use resource_framework::definition::DefinitionRegistry;
use resource_framework::error::ApiError;
use resource_framework::graph::ResourceGraph;
use resource_framework::resource::Resource;
use serde_json::Value;

/// Registers every sample definition. Cascading hook notifications are
/// appended to `journal`.
pub fn registry(graph: &ResourceGraph, journal: &Journal) -> Result<DefinitionRegistry, ApiError> {
    Ok(DefinitionRegistry::new()
        .register("articles", ArticleDefinition::new(graph)?)
        .register("comments", CommentDefinition)
        .register("people", PersonDefinition::new(graph, journal.clone())?)
        .register("todoItems", TodoItemDefinition::new(journal.clone())))
}

/// Sets `createdAt` to the current UTC time in RFC 3339 form.
pub(crate) fn stamp_created_at(resource: &mut Resource) {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    resource
        .attributes
        .insert("createdAt".to_string(), Value::String(now));
}
