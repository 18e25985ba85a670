//! # Resource Representation
//!
//! The in-flight shape of a resource as it moves between the operations
//! processor, the definitions and the store. A resource carries its public
//! type name, an optional server id or batch-local id, a loosely typed
//! attribute map and a map of relationship data.
//!
//! The single-vs-many shape of relationship data is resolved once, at the
//! boundary, into [`RelationshipData`]; nothing downstream inspects raw JSON
//! to find out which one it got.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{self, Display};

/// Identity of a stored resource: public type name plus server id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: String,
    pub id: String,
}

impl ResourceKey {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }
}

impl Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

/// A reference to another resource, by server id or by batch-local id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentifier {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
}

impl ResourceIdentifier {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: Some(id.into()),
            lid: None,
        }
    }

    pub fn local(resource_type: impl Into<String>, lid: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: None,
            lid: Some(lid.into()),
        }
    }

    /// The stored identity, once a server id is known.
    pub fn key(&self) -> Option<ResourceKey> {
        self.id
            .as_ref()
            .map(|id| ResourceKey::new(self.resource_type.clone(), id.clone()))
    }
}

/// Relationship payload: either a to-one slot or a to-many list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationshipData {
    ToOne(Option<ResourceIdentifier>),
    ToMany(Vec<ResourceIdentifier>),
}

impl RelationshipData {
    /// All identifiers referenced by this relationship, in order.
    pub fn identifiers(&self) -> Vec<&ResourceIdentifier> {
        match self {
            RelationshipData::ToOne(Some(identifier)) => vec![identifier],
            RelationshipData::ToOne(None) => Vec::new(),
            RelationshipData::ToMany(identifiers) => identifiers.iter().collect(),
        }
    }

    pub fn identifiers_mut(&mut self) -> Vec<&mut ResourceIdentifier> {
        match self {
            RelationshipData::ToOne(Some(identifier)) => vec![identifier],
            RelationshipData::ToOne(None) => Vec::new(),
            RelationshipData::ToMany(identifiers) => identifiers.iter_mut().collect(),
        }
    }
}

/// A resource object as submitted by a client or returned by the store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relationships: BTreeMap<String, RelationshipData>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, Value>,
}

impl Resource {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_lid(mut self, lid: impl Into<String>) -> Self {
        self.lid = Some(lid.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_to_one(
        mut self,
        name: impl Into<String>,
        identifier: Option<ResourceIdentifier>,
    ) -> Self {
        self.relationships
            .insert(name.into(), RelationshipData::ToOne(identifier));
        self
    }

    pub fn with_to_many(
        mut self,
        name: impl Into<String>,
        identifiers: Vec<ResourceIdentifier>,
    ) -> Self {
        self.relationships
            .insert(name.into(), RelationshipData::ToMany(identifiers));
        self
    }

    pub fn key(&self) -> Option<ResourceKey> {
        self.id
            .as_ref()
            .map(|id| ResourceKey::new(self.resource_type.clone(), id.clone()))
    }

    pub fn identifier(&self) -> ResourceIdentifier {
        ResourceIdentifier {
            resource_type: self.resource_type.clone(),
            id: self.id.clone(),
            lid: self.lid.clone(),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipData> {
        self.relationships.get(name)
    }

    /// Merge a partial update: attributes and relationships present in
    /// `patch` replace the ones stored here, everything else is kept.
    pub fn merge(&mut self, patch: Resource) {
        self.attributes.extend(patch.attributes);
        self.relationships.extend(patch.relationships);
    }
}

impl From<ResourceIdentifier> for Resource {
    fn from(identifier: ResourceIdentifier) -> Self {
        Self {
            resource_type: identifier.resource_type,
            id: identifier.id,
            lid: identifier.lid,
            ..Default::default()
        }
    }
}
