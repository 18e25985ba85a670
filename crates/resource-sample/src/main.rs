//! # Resource Sample
//!
//! Demonstrates the request pipeline end to end:
//! 1. Starting the [`ApiSystem`] (graph, definitions, store actor).
//! 2. Submitting one atomic batch that links new resources by local id.
//! 3. Reading articles back with includes and sparse field sets.
//! 4. Deleting a person and printing the cascaded `BeforeDelete` journal.
//!
//! Run with `RUST_LOG=info` (or `debug`) to follow each step.

use resource_framework::cancel::CancellationToken;
use resource_framework::operations::{Operation, OperationRef, OperationsDocument};
use resource_framework::options::ApiOptions;
use resource_framework::query::split_query_string;
use resource_framework::resource::{Resource, ResourceIdentifier};
use resource_framework::tracing::setup_tracing;
use resource_sample::lifecycle::ApiSystem;
use tracing::{error, info, Instrument};

fn welcome_batch() -> OperationsDocument {
    let ann = ResourceIdentifier::local("people", "ann");
    OperationsDocument::new(vec![
        Operation::add(
            Resource::new("people")
                .with_lid("ann")
                .with_attribute("name", "Ann")
                .with_attribute("email", "ann@example.com")
                .with_attribute("password", "correct horse"),
        ),
        Operation::add(
            Resource::new("articles")
                .with_lid("hello")
                .with_attribute("title", "Hello, resources")
                .with_attribute("body", "One batch, one commit.")
                .with_to_one("author", Some(ann.clone())),
        ),
        Operation::add(
            Resource::new("comments")
                .with_attribute("text", "First!")
                .with_to_one("article", Some(ResourceIdentifier::local("articles", "hello")))
                .with_to_one("author", Some(ann.clone())),
        ),
        Operation::add(
            Resource::new("todoItems")
                .with_attribute("description", "Write a second article")
                .with_attribute("priority", 2)
                .with_to_one("owner", Some(ann)),
        ),
    ])
}

#[tokio::main]
async fn main() -> Result<(), String> {
    setup_tracing();
    info!("Starting resource sample");

    let system = ApiSystem::new(ApiOptions::load()).map_err(|e| e.to_string())?;
    let cancel = CancellationToken::new();

    let span = tracing::info_span!("welcome_batch");
    let results = async { system.processor.process(welcome_batch(), &cancel).await }
        .instrument(span)
        .await
        .map_err(|e| e.to_string())?;
    let person_id = results
        .first()
        .and_then(|result| result.resource())
        .and_then(|person| person.id.clone())
        .ok_or("batch returned no person")?;
    info!(person_id = %person_id, operations = results.len(), "Batch committed");

    let pairs = split_query_string("include=author,comments&fields[people]=name,password");
    match system.service.get_all("articles", &pairs, &cancel).await {
        Ok(document) => {
            let json = serde_json::to_string_pretty(&document).map_err(|e| e.to_string())?;
            println!("{json}");
        }
        Err(errors) => error!(error = %errors, "Read failed"),
    }

    let span = tracing::info_span!("remove_person");
    async {
        let remove = OperationsDocument::new(vec![Operation::remove(
            OperationRef::new("people").with_id(person_id.clone()),
        )]);
        if let Err(e) = system.processor.process(remove, &cancel).await {
            error!(error = %e, "Removal failed");
        }
    }
    .instrument(span)
    .await;

    for entry in system.journal.entries() {
        info!(entry = %entry, "Journal");
    }

    system.shutdown().await.map_err(|e| e.to_string())?;
    info!("Sample completed");
    Ok(())
}
