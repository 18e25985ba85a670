//! # Resource Graph
//!
//! Immutable metadata for every exposed resource type, built once at startup
//! by [`ResourceGraphBuilder`] and shared (behind an `Arc`) by all requests.
//!
//! Every component that needs to turn a client-supplied name into a field
//! goes through this module. Lookups are exact, case-sensitive matches on
//! public names; a miss is an [`ApiError`] the caller surfaces as a client
//! error.

use crate::error::ApiError;
use crate::hooks::ResourceHook;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::{self, Display};
use thiserror::Error;

/// Errors raised while registering resource types.
#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("Duplicate resource name: {0}")]
    DuplicateResource(String),

    #[error("Duplicate field '{field}' on resource '{resource_type}'")]
    DuplicateField {
        resource_type: String,
        field: String,
    },

    #[error("Field name 'id' is reserved on resource '{0}'")]
    ReservedField(String),

    #[error("Relationship '{relationship}' on '{resource_type}' targets unknown resource '{target}'")]
    UnknownTarget {
        resource_type: String,
        relationship: String,
        target: String,
    },

    #[error("Inverse '{inverse}' of '{resource_type}.{relationship}' does not point back")]
    InvalidInverse {
        resource_type: String,
        relationship: String,
        inverse: String,
    },
}

/// How a resource type's server ids are shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Integer,
    Text,
    Guid,
}

/// Value type of an attribute, used to type filter operands at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    String,
    Integer,
    Number,
    Boolean,
}

/// What clients may do with an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrCapabilities {
    pub allow_filter: bool,
    pub allow_sort: bool,
    pub allow_change: bool,
}

impl Default for AttrCapabilities {
    fn default() -> Self {
        Self {
            allow_filter: true,
            allow_sort: true,
            allow_change: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDescriptor {
    /// Public (exposed) name.
    pub name: String,
    /// Name of the underlying member.
    pub member: String,
    pub kind: AttrKind,
    pub capabilities: AttrCapabilities,
}

impl AttributeDescriptor {
    pub fn new(name: impl Into<String>, kind: AttrKind) -> Self {
        let name = name.into();
        Self {
            member: name.clone(),
            name,
            kind,
            capabilities: AttrCapabilities::default(),
        }
    }

    pub fn member(mut self, member: impl Into<String>) -> Self {
        self.member = member.into();
        self
    }

    pub fn capabilities(mut self, capabilities: AttrCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    ToOne,
    ToMany,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipDescriptor {
    pub name: String,
    pub member: String,
    /// Public name of the resource type on the right side.
    pub right_type: String,
    pub cardinality: Cardinality,
    /// Relationship on the right type that points back here.
    pub inverse: Option<String>,
    /// Resource hooks that cascade through this relationship.
    pub cascade_hooks: BTreeSet<ResourceHook>,
}

impl RelationshipDescriptor {
    pub fn new(
        name: impl Into<String>,
        right_type: impl Into<String>,
        cardinality: Cardinality,
    ) -> Self {
        let name = name.into();
        Self {
            member: name.clone(),
            name,
            right_type: right_type.into(),
            cardinality,
            inverse: None,
            cascade_hooks: BTreeSet::new(),
        }
    }

    pub fn inverse(mut self, inverse: impl Into<String>) -> Self {
        self.inverse = Some(inverse.into());
        self
    }

    pub fn member(mut self, member: impl Into<String>) -> Self {
        self.member = member.into();
        self
    }

    pub fn cascades(mut self, hook: ResourceHook) -> Self {
        self.cascade_hooks.insert(hook);
        self
    }

    pub fn is_to_many(&self) -> bool {
        self.cardinality == Cardinality::ToMany
    }
}

/// Metadata for one exposed resource type.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceContext {
    pub public_name: String,
    /// Identity of the underlying type.
    pub type_name: String,
    pub id_kind: IdKind,
    pub attributes: Vec<AttributeDescriptor>,
    pub relationships: Vec<RelationshipDescriptor>,
}

impl ResourceContext {
    pub fn attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.iter().find(|r| r.name == name)
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(|a| a.name.as_str())
    }
}

/// What a dotted field chain is being resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainUsage {
    /// Relationships of any cardinality, ending in an attribute or `id`.
    Filter,
    /// To-one relationships, ending in an attribute or `id`.
    Sort,
    /// Relationships only.
    Include,
}

/// One resolved segment of a dotted path.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldRef {
    Relationship {
        name: String,
        right_type: String,
        cardinality: Cardinality,
    },
    Attribute {
        name: String,
        kind: AttrKind,
    },
    Id {
        kind: IdKind,
    },
}

impl FieldRef {
    pub fn name(&self) -> &str {
        match self {
            FieldRef::Relationship { name, .. } | FieldRef::Attribute { name, .. } => name,
            FieldRef::Id { .. } => "id",
        }
    }
}

/// A dot-separated path resolved against the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChain {
    pub fields: Vec<FieldRef>,
}

impl FieldChain {
    pub fn id(kind: IdKind) -> Self {
        Self {
            fields: vec![FieldRef::Id { kind }],
        }
    }

    /// The trailing field.
    pub fn last(&self) -> Option<&FieldRef> {
        self.fields.last()
    }

    /// Relationship segments leading to the trailing field.
    pub fn relationships(&self) -> &[FieldRef] {
        match self.fields.split_last() {
            Some((_, init)) => init,
            None => &[],
        }
    }
}

impl Display for FieldChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.fields.iter().map(FieldRef::name).collect();
        write!(f, "{}", names.join("."))
    }
}

/// Registry of all resource contexts, looked up by public name.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    contexts: Vec<ResourceContext>,
    by_name: HashMap<String, usize>,
}

impl ResourceGraph {
    pub fn builder() -> ResourceGraphBuilder {
        ResourceGraphBuilder::new()
    }

    pub fn resource_context(&self, resource_type: &str) -> Result<&ResourceContext, ApiError> {
        self.by_name
            .get(resource_type)
            .map(|index| &self.contexts[*index])
            .ok_or_else(|| ApiError::UnknownResourceType(resource_type.to_string()))
    }

    pub fn contains(&self, resource_type: &str) -> bool {
        self.by_name.contains_key(resource_type)
    }

    pub fn attribute(
        &self,
        resource_type: &str,
        name: &str,
    ) -> Result<&AttributeDescriptor, ApiError> {
        self.resource_context(resource_type)?
            .attribute(name)
            .ok_or_else(|| ApiError::UnknownField {
                resource_type: resource_type.to_string(),
                field: name.to_string(),
            })
    }

    pub fn relationship(
        &self,
        resource_type: &str,
        name: &str,
    ) -> Result<&RelationshipDescriptor, ApiError> {
        self.resource_context(resource_type)?
            .relationship(name)
            .ok_or_else(|| ApiError::UnknownField {
                resource_type: resource_type.to_string(),
                field: name.to_string(),
            })
    }

    pub fn resource_contexts(&self) -> impl Iterator<Item = &ResourceContext> {
        self.contexts.iter()
    }

    /// Resolves a dotted path starting at `resource_type`.
    ///
    /// All segments but the last must be relationships. The last segment is
    /// an attribute (or `id`) for filters and sorts, and a relationship for
    /// includes.
    pub fn resolve_chain(
        &self,
        resource_type: &str,
        path: &str,
        usage: ChainUsage,
    ) -> Result<FieldChain, ApiError> {
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(ApiError::InvalidField {
                path: path.to_string(),
                reason: "empty path segment".to_string(),
            });
        }

        let segments: Vec<&str> = path.split('.').collect();
        let mut current = self.resource_context(resource_type)?;
        let mut fields = Vec::with_capacity(segments.len());

        for (position, segment) in segments.iter().enumerate() {
            let is_last = position + 1 == segments.len();

            if is_last && usage != ChainUsage::Include {
                if *segment == "id" {
                    fields.push(FieldRef::Id {
                        kind: current.id_kind,
                    });
                    break;
                }
                if let Some(attribute) = current.attribute(segment) {
                    fields.push(FieldRef::Attribute {
                        name: attribute.name.clone(),
                        kind: attribute.kind,
                    });
                    break;
                }
                return Err(ApiError::UnknownField {
                    resource_type: current.public_name.clone(),
                    field: segment.to_string(),
                });
            }

            let relationship =
                current
                    .relationship(segment)
                    .ok_or_else(|| ApiError::UnknownField {
                        resource_type: current.public_name.clone(),
                        field: segment.to_string(),
                    })?;

            if usage == ChainUsage::Sort && relationship.is_to_many() {
                return Err(ApiError::InvalidField {
                    path: path.to_string(),
                    reason: format!(
                        "cannot sort through to-many relationship '{}'",
                        relationship.name
                    ),
                });
            }

            fields.push(FieldRef::Relationship {
                name: relationship.name.clone(),
                right_type: relationship.right_type.clone(),
                cardinality: relationship.cardinality,
            });
            current = self.resource_context(&relationship.right_type)?;
        }

        Ok(FieldChain { fields })
    }

    /// The attribute descriptor a resolved chain ends in, if it ends in one.
    pub fn terminal_attribute(
        &self,
        resource_type: &str,
        chain: &FieldChain,
    ) -> Option<&AttributeDescriptor> {
        let owner = chain
            .relationships()
            .iter()
            .rev()
            .find_map(|field| match field {
                FieldRef::Relationship { right_type, .. } => Some(right_type.as_str()),
                _ => None,
            })
            .unwrap_or(resource_type);
        match chain.last()? {
            FieldRef::Attribute { name, .. } => self.attribute(owner, name).ok(),
            _ => None,
        }
    }
}

/// Builder for an immutable [`ResourceGraph`].
#[derive(Debug, Default)]
pub struct ResourceGraphBuilder {
    contexts: Vec<ResourceContext>,
    errors: Vec<GraphError>,
}

impl ResourceGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts registering a resource type.
    pub fn add_resource(
        &mut self,
        public_name: impl Into<String>,
        type_name: impl Into<String>,
        id_kind: IdKind,
    ) -> ResourceBuilder<'_> {
        let public_name = public_name.into();
        if self.contexts.iter().any(|c| c.public_name == public_name) {
            self.errors
                .push(GraphError::DuplicateResource(public_name.clone()));
        }
        self.contexts.push(ResourceContext {
            public_name,
            type_name: type_name.into(),
            id_kind,
            attributes: Vec::new(),
            relationships: Vec::new(),
        });
        ResourceBuilder { builder: self }
    }

    pub fn build(self) -> Result<ResourceGraph, GraphError> {
        if let Some(error) = self.errors.into_iter().next() {
            return Err(error);
        }

        let mut by_name = HashMap::with_capacity(self.contexts.len());
        for (index, context) in self.contexts.iter().enumerate() {
            by_name.insert(context.public_name.clone(), index);
        }

        for context in &self.contexts {
            let mut seen = HashSet::new();
            let names = context
                .attributes
                .iter()
                .map(|a| &a.name)
                .chain(context.relationships.iter().map(|r| &r.name));
            for name in names {
                if name == "id" {
                    return Err(GraphError::ReservedField(context.public_name.clone()));
                }
                if !seen.insert(name) {
                    return Err(GraphError::DuplicateField {
                        resource_type: context.public_name.clone(),
                        field: name.clone(),
                    });
                }
            }
            for relationship in &context.relationships {
                let Some(target) = by_name.get(&relationship.right_type) else {
                    return Err(GraphError::UnknownTarget {
                        resource_type: context.public_name.clone(),
                        relationship: relationship.name.clone(),
                        target: relationship.right_type.clone(),
                    });
                };
                if let Some(inverse) = &relationship.inverse {
                    let points_back = self.contexts[*target]
                        .relationship(inverse)
                        .is_some_and(|back| back.right_type == context.public_name);
                    if !points_back {
                        return Err(GraphError::InvalidInverse {
                            resource_type: context.public_name.clone(),
                            relationship: relationship.name.clone(),
                            inverse: inverse.clone(),
                        });
                    }
                }
            }
        }

        Ok(ResourceGraph {
            contexts: self.contexts,
            by_name,
        })
    }
}

/// Adds fields to the resource most recently started on a [`ResourceGraphBuilder`].
pub struct ResourceBuilder<'a> {
    builder: &'a mut ResourceGraphBuilder,
}

impl ResourceBuilder<'_> {
    fn context(&mut self) -> &mut ResourceContext {
        let last = self.builder.contexts.len() - 1;
        &mut self.builder.contexts[last]
    }

    pub fn attribute(mut self, name: impl Into<String>, kind: AttrKind) -> Self {
        self.context()
            .attributes
            .push(AttributeDescriptor::new(name, kind));
        self
    }

    pub fn attribute_with(mut self, descriptor: AttributeDescriptor) -> Self {
        self.context().attributes.push(descriptor);
        self
    }

    pub fn has_one(mut self, name: impl Into<String>, right_type: impl Into<String>) -> Self {
        self.context().relationships.push(RelationshipDescriptor::new(
            name,
            right_type,
            Cardinality::ToOne,
        ));
        self
    }

    pub fn has_many(mut self, name: impl Into<String>, right_type: impl Into<String>) -> Self {
        self.context().relationships.push(RelationshipDescriptor::new(
            name,
            right_type,
            Cardinality::ToMany,
        ));
        self
    }

    pub fn relationship_with(mut self, descriptor: RelationshipDescriptor) -> Self {
        self.context().relationships.push(descriptor);
        self
    }
}
