use resource_framework::graph::{
    AttrCapabilities, AttrKind, AttributeDescriptor, Cardinality, IdKind, RelationshipDescriptor,
    ResourceGraphBuilder,
};
use resource_framework::hooks::ResourceHook;

/// Server-assigned timestamp; clients may filter and sort on it.
pub(crate) fn timestamp(name: &str) -> AttributeDescriptor {
    AttributeDescriptor::new(name, AttrKind::String).capabilities(AttrCapabilities {
        allow_change: false,
        ..AttrCapabilities::default()
    })
}

pub fn register(builder: &mut ResourceGraphBuilder) {
    builder
        .add_resource("people", "Person", IdKind::Integer)
        .attribute("name", AttrKind::String)
        .attribute("email", AttrKind::String)
        .attribute_with(
            AttributeDescriptor::new("password", AttrKind::String).capabilities(
                AttrCapabilities {
                    allow_filter: false,
                    allow_sort: false,
                    allow_change: true,
                },
            ),
        )
        .relationship_with(
            RelationshipDescriptor::new("articles", "articles", Cardinality::ToMany)
                .inverse("author")
                .cascades(ResourceHook::BeforeDelete),
        )
        .relationship_with(
            RelationshipDescriptor::new("todoItems", "todoItems", Cardinality::ToMany)
                .inverse("owner")
                .cascades(ResourceHook::BeforeDelete),
        );

    builder
        .add_resource("articles", "Article", IdKind::Integer)
        .attribute("title", AttrKind::String)
        .attribute("body", AttrKind::String)
        .attribute_with(timestamp("createdAt"))
        .attribute("isDeleted", AttrKind::Boolean)
        .has_one("author", "people")
        .relationship_with(
            RelationshipDescriptor::new("comments", "comments", Cardinality::ToMany)
                .inverse("article")
                .cascades(ResourceHook::BeforeDelete),
        )
        .has_many("tags", "tags");

    builder
        .add_resource("comments", "Comment", IdKind::Integer)
        .attribute("text", AttrKind::String)
        .attribute_with(timestamp("createdAt"))
        .has_one("article", "articles")
        .has_one("author", "people");

    builder
        .add_resource("tags", "Tag", IdKind::Integer)
        .attribute("name", AttrKind::String);
}
