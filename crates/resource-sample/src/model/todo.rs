use super::blog::timestamp;
use resource_framework::graph::{AttrKind, IdKind, ResourceGraphBuilder};

pub fn register(builder: &mut ResourceGraphBuilder) {
    builder
        .add_resource("todoItems", "TodoItem", IdKind::Integer)
        .attribute("description", AttrKind::String)
        .attribute("priority", AttrKind::Integer)
        .attribute_with(timestamp("createdAt"))
        .has_one("owner", "people")
        .has_one("assignee", "people");
}
