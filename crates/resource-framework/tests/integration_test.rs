use async_trait::async_trait;
use pretty_assertions::assert_eq;
use resource_framework::cancel::CancellationToken;
use resource_framework::definition::{DefinitionRegistry, ResourceDefinition, WriteOperationKind};
use resource_framework::error::{ApiError, BatchError, ErrorDocument, ExecutorError, HookError};
use resource_framework::executor::{QueryExecutor, ResourceStore, StoreTransaction};
use resource_framework::expression::{FilterExpression, QueryLayer};
use resource_framework::graph::{AttrKind, Cardinality, IdKind, RelationshipDescriptor, ResourceGraph};
use resource_framework::hooks::ResourceHook;
use resource_framework::operations::{Operation, OperationRef, OperationsDocument, OperationsProcessor};
use resource_framework::options::ApiOptions;
use resource_framework::query::split_query_string;
use resource_framework::resource::{RelationshipData, Resource, ResourceIdentifier, ResourceKey};
use resource_framework::service::ResourceService;
use resource_framework::store::{StoreActor, StoreClient};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};

// --- Test Graph ---

fn blog() -> Arc<ResourceGraph> {
    let mut builder = ResourceGraph::builder();
    builder
        .add_resource("people", "Person", IdKind::Integer)
        .attribute("name", AttrKind::String)
        .attribute("email", AttrKind::String)
        .relationship_with(
            RelationshipDescriptor::new("articles", "articles", Cardinality::ToMany)
                .inverse("author")
                .cascades(ResourceHook::BeforeDelete),
        );
    builder
        .add_resource("articles", "Article", IdKind::Integer)
        .attribute("title", AttrKind::String)
        .attribute("createdAt", AttrKind::String)
        .has_one("author", "people")
        .relationship_with(
            RelationshipDescriptor::new("comments", "comments", Cardinality::ToMany)
                .inverse("article"),
        )
        .has_many("tags", "tags");
    builder
        .add_resource("comments", "Comment", IdKind::Integer)
        .attribute("text", AttrKind::String)
        .has_one("article", "articles")
        .has_one("author", "people");
    builder
        .add_resource("tags", "Tag", IdKind::Integer)
        .attribute("name", AttrKind::String);
    Arc::new(builder.build().unwrap())
}

// --- Test Definitions ---

struct TitleRequired;

#[async_trait]
impl ResourceDefinition for TitleRequired {
    async fn on_prepare_write(
        &self,
        resource: &mut Resource,
        kind: WriteOperationKind,
        _cancel: &CancellationToken,
    ) -> Result<(), HookError> {
        let title = resource.attribute("title").and_then(|v| v.as_str());
        if kind == WriteOperationKind::CreateResource && title.map_or(true, str::is_empty) {
            return Err(HookError::validation("Title is required.")
                .with_pointer("/data/attributes/title"));
        }
        Ok(())
    }
}

/// Cancels the request from inside a hook.
struct CancelOnWrite;

#[async_trait]
impl ResourceDefinition for CancelOnWrite {
    async fn on_prepare_write(
        &self,
        _resource: &mut Resource,
        _kind: WriteOperationKind,
        cancel: &CancellationToken,
    ) -> Result<(), HookError> {
        cancel.cancel();
        Ok(())
    }
}

/// Assigns a fallback author when none is given.
struct DefaultAuthor(&'static str);

#[async_trait]
impl ResourceDefinition for DefaultAuthor {
    async fn on_set_to_one_relationship(
        &self,
        _left: &Resource,
        relationship: &RelationshipDescriptor,
        right: Option<ResourceIdentifier>,
        _kind: WriteOperationKind,
        _cancel: &CancellationToken,
    ) -> Result<Option<ResourceIdentifier>, HookError> {
        if relationship.name == "author" && right.is_none() {
            return Ok(Some(ResourceIdentifier::new("people", self.0)));
        }
        Ok(right)
    }
}

/// Records every resource reached by `BeforeDelete`.
#[derive(Clone, Default)]
struct DeleteJournal(Arc<Mutex<Vec<String>>>);

impl DeleteJournal {
    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResourceDefinition for DeleteJournal {
    fn declares_hook(&self, hook: ResourceHook) -> bool {
        hook == ResourceHook::BeforeDelete
    }

    async fn on_resource_hook(
        &self,
        _hook: ResourceHook,
        resources: &[Resource],
        _cancel: &CancellationToken,
    ) -> Result<(), HookError> {
        let mut entries = self.0.lock().unwrap();
        entries.extend(resources.iter().filter_map(Resource::key).map(|k| k.to_string()));
        Ok(())
    }
}

// --- Cancelling Store ---

#[derive(Clone, Copy, PartialEq)]
enum Stage {
    Begin,
    Commit,
}

/// Cancels the request right after the store finished `stage`.
struct CancellingStore {
    inner: StoreClient,
    cancel: CancellationToken,
    stage: Stage,
}

#[async_trait]
impl QueryExecutor for CancellingStore {
    async fn execute(
        &self,
        layer: &QueryLayer,
        cancel: &CancellationToken,
    ) -> Result<Vec<Resource>, ExecutorError> {
        self.inner.execute(layer, cancel).await
    }

    async fn count(
        &self,
        resource_type: &str,
        filter: Option<&FilterExpression>,
        cancel: &CancellationToken,
    ) -> Result<usize, ExecutorError> {
        self.inner.count(resource_type, filter, cancel).await
    }
}

#[async_trait]
impl ResourceStore for CancellingStore {
    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>, ExecutorError> {
        let inner = self.inner.begin_transaction().await?;
        if self.stage == Stage::Begin {
            self.cancel.cancel();
        }
        Ok(Box::new(CancellingTransaction {
            inner,
            cancel: self.cancel.clone(),
            stage: self.stage,
        }))
    }
}

struct CancellingTransaction {
    inner: Box<dyn StoreTransaction>,
    cancel: CancellationToken,
    stage: Stage,
}

#[async_trait]
impl QueryExecutor for CancellingTransaction {
    async fn execute(
        &self,
        layer: &QueryLayer,
        cancel: &CancellationToken,
    ) -> Result<Vec<Resource>, ExecutorError> {
        self.inner.execute(layer, cancel).await
    }

    async fn count(
        &self,
        resource_type: &str,
        filter: Option<&FilterExpression>,
        cancel: &CancellationToken,
    ) -> Result<usize, ExecutorError> {
        self.inner.count(resource_type, filter, cancel).await
    }
}

#[async_trait]
impl StoreTransaction for CancellingTransaction {
    async fn find(&self, key: &ResourceKey) -> Result<Option<Resource>, ExecutorError> {
        self.inner.find(key).await
    }

    async fn create(&self, resource: Resource) -> Result<Resource, ExecutorError> {
        self.inner.create(resource).await
    }

    async fn update(&self, resource: Resource) -> Result<Resource, ExecutorError> {
        self.inner.update(resource).await
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), ExecutorError> {
        self.inner.delete(key).await
    }

    async fn add_to_relationship(
        &self,
        left: &ResourceKey,
        relationship: &str,
        right: Vec<ResourceIdentifier>,
    ) -> Result<(), ExecutorError> {
        self.inner.add_to_relationship(left, relationship, right).await
    }

    async fn remove_from_relationship(
        &self,
        left: &ResourceKey,
        relationship: &str,
        right: Vec<ResourceIdentifier>,
    ) -> Result<(), ExecutorError> {
        self.inner
            .remove_from_relationship(left, relationship, right)
            .await
    }

    async fn commit(&self) -> Result<(), ExecutorError> {
        let result = self.inner.commit().await;
        if self.stage == Stage::Commit {
            self.cancel.cancel();
        }
        result
    }

    async fn rollback(&self) -> Result<(), ExecutorError> {
        self.inner.rollback().await
    }
}

// --- Harness ---

struct Harness {
    store: StoreClient,
    processor: OperationsProcessor<StoreClient>,
    service: ResourceService<StoreClient>,
}

fn start(definitions: DefinitionRegistry) -> Harness {
    start_with(definitions, ApiOptions::default())
}

fn start_with(definitions: DefinitionRegistry, options: ApiOptions) -> Harness {
    let graph = blog();
    let options = Arc::new(options);
    let (actor, store) = StoreActor::new(graph.clone(), &options, 64);
    tokio::spawn(actor.run());
    Harness {
        processor: OperationsProcessor::new(
            graph.clone(),
            options.clone(),
            definitions.clone(),
            store.clone(),
        ),
        service: ResourceService::new(graph, options, definitions, store.clone()),
        store,
    }
}

impl Harness {
    /// A processor over the same store that cancels after `stage`.
    fn cancelling(
        &self,
        cancel: &CancellationToken,
        stage: Stage,
    ) -> OperationsProcessor<CancellingStore> {
        OperationsProcessor::new(
            blog(),
            Arc::new(ApiOptions::default()),
            DefinitionRegistry::new(),
            CancellingStore {
                inner: self.store.clone(),
                cancel: cancel.clone(),
                stage,
            },
        )
    }

    async fn run(&self, operations: Vec<Operation>) -> Result<Vec<Resource>, BatchError> {
        let results = self
            .processor
            .process(OperationsDocument::new(operations), &CancellationToken::new())
            .await?;
        Ok(results
            .into_iter()
            .filter_map(|result| result.resource().cloned())
            .collect())
    }

    async fn all(&self, resource_type: &str, query: &str) -> Vec<Resource> {
        self.service
            .get_all(resource_type, &split_query_string(query), &CancellationToken::new())
            .await
            .unwrap()
            .resources()
            .to_vec()
    }

    /// Seeds committed data directly through a store transaction.
    async fn seed(&self, resources: Vec<Resource>) -> Vec<Resource> {
        let transaction = self.store.begin_transaction().await.unwrap();
        let mut created = Vec::new();
        for resource in resources {
            created.push(transaction.create(resource).await.unwrap());
        }
        transaction.commit().await.unwrap();
        created
    }
}

fn person(name: &str) -> Resource {
    Resource::new("people")
        .with_attribute("name", name)
        .with_attribute("email", format!("{}@example.com", name.to_lowercase()))
}

fn ids(resources: &[Resource]) -> Vec<&str> {
    resources.iter().filter_map(|r| r.id.as_deref()).collect()
}

// --- Atomic Operations ---

#[tokio::test]
async fn local_id_resolves_to_server_id() {
    let harness = start(DefinitionRegistry::new());
    harness
        .seed(vec![person("Ann"), Resource::new("tags").with_attribute("name", "rust")])
        .await;

    let created = harness
        .run(vec![
            Operation::add(
                Resource::new("articles")
                    .with_lid("lid-1")
                    .with_attribute("title", "Hello")
                    .with_to_one("author", Some(ResourceIdentifier::new("people", "1"))),
            ),
            Operation::add(
                Resource::new("comments")
                    .with_attribute("text", "First!")
                    .with_to_one("article", Some(ResourceIdentifier::local("articles", "lid-1"))),
            ),
            Operation::add_members(
                OperationRef::new("articles")
                    .with_lid("lid-1")
                    .with_relationship("tags"),
                vec![ResourceIdentifier::new("tags", "1")],
            ),
        ])
        .await
        .unwrap();

    let article_id = created[0].id.clone().unwrap();
    assert_eq!(
        created[1].relationship("article"),
        Some(&RelationshipData::ToOne(Some(ResourceIdentifier::new(
            "articles",
            article_id.as_str()
        ))))
    );

    let comments = harness
        .all("comments", &format!("filter[article.id]={article_id}"))
        .await;
    assert_eq!(ids(&comments), vec!["1"]);
}

#[tokio::test]
async fn failed_first_operation_skips_the_rest() {
    let harness = start(DefinitionRegistry::new().register("articles", TitleRequired));

    let error = harness
        .run(vec![
            Operation::add(Resource::new("articles").with_lid("lid-1")),
            Operation::add(
                Resource::new("comments")
                    .with_to_one("article", Some(ResourceIdentifier::local("articles", "lid-1"))),
            ),
        ])
        .await
        .unwrap_err();

    assert_eq!(error.index, Some(0));
    assert!(matches!(error.error, ApiError::Hook(_)));
    assert!(harness.all("comments", "").await.is_empty());

    let document = ErrorDocument::from(&error);
    assert_eq!(document.status(), 422);
    assert_eq!(
        document.errors[0]
            .source
            .as_ref()
            .and_then(|s| s.pointer.clone()),
        Some("/atomic:operations[0]/data/attributes/title".to_string())
    );
}

#[tokio::test]
async fn failure_at_index_k_rolls_back_everything() {
    let harness = start(DefinitionRegistry::new());

    let error = harness
        .run(vec![
            Operation::add(Resource::new("tags").with_attribute("name", "a")),
            Operation::add(Resource::new("tags").with_attribute("name", "b")),
            Operation::update(
                Resource::new("articles")
                    .with_id("99")
                    .with_attribute("title", "x"),
            ),
            Operation::add(Resource::new("tags").with_attribute("name", "c")),
        ])
        .await
        .unwrap_err();

    assert_eq!(
        error,
        BatchError::at(
            2,
            ApiError::ResourceNotFound {
                resource_type: "articles".into(),
                id: "99".into()
            }
        )
    );
    assert!(harness.all("tags", "").await.is_empty());
}

#[tokio::test]
async fn missing_related_resource_is_not_found() {
    let harness = start(DefinitionRegistry::new());
    let error = harness
        .run(vec![Operation::add(
            Resource::new("articles")
                .with_attribute("title", "Orphan")
                .with_to_one("author", Some(ResourceIdentifier::new("people", "5"))),
        )])
        .await
        .unwrap_err();
    assert_eq!(error.index, Some(0));
    assert_eq!(error.error.status(), 404);
}

#[tokio::test]
async fn cancellation_aborts_like_a_validation_failure() {
    let harness = start(DefinitionRegistry::new().register("comments", CancelOnWrite));

    let error = harness
        .run(vec![
            Operation::add(
                Resource::new("articles")
                    .with_lid("a1")
                    .with_attribute("title", "Kept?"),
            ),
            Operation::add(
                Resource::new("comments")
                    .with_to_one("article", Some(ResourceIdentifier::local("articles", "a1"))),
            ),
        ])
        .await
        .unwrap_err();

    assert_eq!(error, BatchError::at(1, ApiError::Cancelled));
    assert!(harness.all("articles", "").await.is_empty());
}

#[tokio::test]
async fn relationship_operations_change_membership() {
    let harness = start(DefinitionRegistry::new());
    harness
        .seed(vec![
            person("Ann"),
            Resource::new("tags").with_attribute("name", "rust"),
            Resource::new("tags").with_attribute("name", "async"),
            Resource::new("articles")
                .with_attribute("title", "Tagged")
                .with_to_one("author", Some(ResourceIdentifier::new("people", "1"))),
        ])
        .await;

    let article = OperationRef::new("articles").with_id("1");
    harness
        .run(vec![
            Operation::add_members(
                article.clone().with_relationship("tags"),
                vec![
                    ResourceIdentifier::new("tags", "1"),
                    ResourceIdentifier::new("tags", "2"),
                ],
            ),
            Operation::remove_members(
                article.clone().with_relationship("tags"),
                vec![ResourceIdentifier::new("tags", "1")],
            ),
            Operation::set_relationship(
                article.with_relationship("author"),
                RelationshipData::ToOne(None),
            ),
        ])
        .await
        .unwrap();

    let stored = harness
        .service
        .get_by_id("articles", "1", &[], &CancellationToken::new())
        .await
        .unwrap();
    let stored = &stored.resources()[0];
    assert_eq!(
        stored.relationship("tags"),
        Some(&RelationshipData::ToMany(vec![ResourceIdentifier::new("tags", "2")]))
    );
    assert_eq!(stored.relationship("author"), Some(&RelationshipData::ToOne(None)));
}

#[tokio::test]
async fn relationship_hook_substitutes_value() {
    let harness = start(DefinitionRegistry::new().register("comments", DefaultAuthor("2")));
    harness.seed(vec![person("Ann"), person("Bob")]).await;

    let created = harness
        .run(vec![Operation::add(
            Resource::new("comments")
                .with_attribute("text", "anonymous")
                .with_to_one("author", None),
        )])
        .await
        .unwrap();

    assert_eq!(
        created[0].relationship("author"),
        Some(&RelationshipData::ToOne(Some(ResourceIdentifier::new("people", "2"))))
    );
}

#[tokio::test]
async fn get_operation_sees_earlier_writes() {
    let harness = start(DefinitionRegistry::new());
    let results = harness
        .processor
        .process(
            OperationsDocument::new(vec![
                Operation::add(Resource::new("tags").with_attribute("name", "new")),
                Operation::get(OperationRef::new("tags")).with_params("filter[name]=new"),
            ]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(ids(results[1].resources()), vec!["1"]);
}

// --- Reads ---

#[tokio::test]
async fn filter_sort_and_page_through_relationship() {
    let harness = start(DefinitionRegistry::new());
    let mut seed = vec![person("Ann"), person("Bob")];
    for day in 1..=30 {
        let author = if day % 3 == 0 { "2" } else { "1" };
        seed.push(
            Resource::new("articles")
                .with_attribute("title", format!("Article {day}"))
                .with_attribute("createdAt", format!("2024-01-{day:02}"))
                .with_to_one("author", Some(ResourceIdentifier::new("people", author))),
        );
    }
    harness.seed(seed).await;

    let document = harness
        .service
        .get_all(
            "articles",
            &split_query_string("filter[author.name]=eq:Ann&sort=-createdAt&page[size]=10&page[number]=2"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        ids(document.resources()),
        vec!["14", "13", "11", "10", "8", "7", "5", "4", "2", "1"]
    );
    assert_eq!(document.total(), Some(20));
}

#[tokio::test]
async fn includes_follow_forward_and_inverse_relationships() {
    let harness = start(DefinitionRegistry::new());
    harness
        .seed(vec![
            person("Ann"),
            Resource::new("articles")
                .with_attribute("title", "Hello")
                .with_to_one("author", Some(ResourceIdentifier::new("people", "1"))),
            Resource::new("comments")
                .with_attribute("text", "one")
                .with_to_one("article", Some(ResourceIdentifier::new("articles", "1"))),
            Resource::new("comments")
                .with_attribute("text", "two")
                .with_to_one("article", Some(ResourceIdentifier::new("articles", "1"))),
        ])
        .await;

    let document = harness
        .service
        .get_by_id(
            "articles",
            "1",
            &split_query_string("include=author,comments&fields[people]=name"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let mut keys: Vec<String> = document
        .included
        .iter()
        .filter_map(Resource::key)
        .map(|key: ResourceKey| key.to_string())
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["comments/1", "comments/2", "people/1"]);

    let author = document
        .included
        .iter()
        .find(|r| r.resource_type == "people")
        .unwrap();
    assert_eq!(author.attributes.keys().collect::<Vec<_>>(), vec!["name"]);
}

#[tokio::test]
async fn query_errors_are_collected() {
    let harness = start(DefinitionRegistry::new());
    let errors = harness
        .service
        .get_all(
            "articles",
            &split_query_string("filter[title]=regex:x&sort=nope"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(errors.len(), 2);
    assert_eq!(ErrorDocument::from(&errors).status(), 400);
}

// --- Cancellation Around Store Boundaries ---

#[tokio::test]
async fn cancel_after_commit_reports_success() {
    let harness = start(DefinitionRegistry::new());
    let cancel = CancellationToken::new();

    let results = harness
        .cancelling(&cancel, Stage::Commit)
        .process(
            OperationsDocument::new(vec![Operation::add(
                Resource::new("tags").with_attribute("name", "rust"),
            )]),
            &cancel,
        )
        .await
        .unwrap();

    assert!(cancel.is_cancelled());
    assert_eq!(results.len(), 1);
    assert_eq!(ids(&harness.all("tags", "").await), vec!["1"]);
    assert_eq!(harness.store.open_transactions().await.unwrap(), 0);
}

#[tokio::test]
async fn cancel_during_begin_leaves_no_open_transaction() {
    let harness = start(DefinitionRegistry::new());
    let cancel = CancellationToken::new();

    let error = harness
        .cancelling(&cancel, Stage::Begin)
        .process(
            OperationsDocument::new(vec![Operation::add(
                Resource::new("tags").with_attribute("name", "rust"),
            )]),
            &cancel,
        )
        .await
        .unwrap_err();

    assert_eq!(error, BatchError::at(0, ApiError::Cancelled));
    assert_eq!(harness.store.open_transactions().await.unwrap(), 0);
    assert!(harness.all("tags", "").await.is_empty());
}

#[tokio::test]
async fn cancelled_request_opens_no_transaction() {
    let harness = start(DefinitionRegistry::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let error = harness
        .processor
        .process(
            OperationsDocument::new(vec![Operation::add(
                Resource::new("tags").with_attribute("name", "rust"),
            )]),
            &cancel,
        )
        .await
        .unwrap_err();

    assert_eq!(error, BatchError::whole(ApiError::Cancelled));
    assert_eq!(harness.store.open_transactions().await.unwrap(), 0);
}

// --- Maximum Page Size ---

fn capped() -> ApiOptions {
    ApiOptions {
        maximum_page_size: NonZeroU32::new(1),
        ..ApiOptions::default()
    }
}

fn authored(title: &str) -> Resource {
    Resource::new("articles")
        .with_attribute("title", title)
        .with_to_one("author", Some(ResourceIdentifier::new("people", "1")))
}

#[tokio::test]
async fn cascade_reaches_every_related_resource_when_pages_are_capped() {
    let journal = DeleteJournal::default();
    let harness = start_with(
        DefinitionRegistry::new()
            .register("people", journal.clone())
            .register("articles", journal.clone()),
        capped(),
    );
    harness
        .seed(vec![person("Ann"), authored("one"), authored("two")])
        .await;

    harness
        .run(vec![Operation::remove(OperationRef::new("people").with_id("1"))])
        .await
        .unwrap();

    assert_eq!(journal.entries(), vec!["people/1", "articles/1", "articles/2"]);
}

#[tokio::test]
async fn includes_are_complete_when_pages_are_capped() {
    let harness = start_with(DefinitionRegistry::new(), capped());
    harness
        .seed(vec![
            person("Ann"),
            authored("one"),
            authored("two"),
            Resource::new("comments")
                .with_attribute("text", "a")
                .with_to_one("article", Some(ResourceIdentifier::new("articles", "1"))),
            Resource::new("comments")
                .with_attribute("text", "b")
                .with_to_one("article", Some(ResourceIdentifier::new("articles", "1"))),
        ])
        .await;

    let document = harness
        .service
        .get_by_id(
            "people",
            "1",
            &split_query_string("include=articles.comments"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let mut keys: Vec<String> = document
        .included
        .iter()
        .filter_map(Resource::key)
        .map(|key| key.to_string())
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["articles/1", "articles/2", "comments/1", "comments/2"]);

    let page = harness.all("articles", "page[size]=5").await;
    assert_eq!(ids(&page), vec!["1"]);
}
