//! # Query Expressions
//!
//! Immutable expression trees describing one read query: filter, sort,
//! include, pagination and sparse field sets, bundled per resource type into
//! a [`QueryLayer`].
//!
//! Every field reference is a [`FieldChain`] already resolved against the
//! resource graph, so executors never see unvalidated names. The `Display`
//! forms reproduce the query-string syntax the expressions were read from.

use crate::graph::{AttrKind, FieldChain, FieldRef, IdKind};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};
use std::num::NonZeroU32;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    Eq,
    Lt,
    Gt,
    Le,
    Ge,
    Like,
    Ne,
    In,
    Nin,
    IsNull,
    IsNotNull,
}

/// How many operands an operator takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    None,
    One,
    Many,
}

impl FilterOperator {
    pub const ALL: [FilterOperator; 11] = [
        FilterOperator::Eq,
        FilterOperator::Lt,
        FilterOperator::Gt,
        FilterOperator::Le,
        FilterOperator::Ge,
        FilterOperator::Like,
        FilterOperator::Ne,
        FilterOperator::In,
        FilterOperator::Nin,
        FilterOperator::IsNull,
        FilterOperator::IsNotNull,
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            FilterOperator::Eq => "eq",
            FilterOperator::Lt => "lt",
            FilterOperator::Gt => "gt",
            FilterOperator::Le => "le",
            FilterOperator::Ge => "ge",
            FilterOperator::Like => "like",
            FilterOperator::Ne => "ne",
            FilterOperator::In => "in",
            FilterOperator::Nin => "nin",
            FilterOperator::IsNull => "isnull",
            FilterOperator::IsNotNull => "isnotnull",
        }
    }

    pub fn arity(self) -> Arity {
        match self {
            FilterOperator::IsNull | FilterOperator::IsNotNull => Arity::None,
            FilterOperator::In | FilterOperator::Nin => Arity::Many,
            _ => Arity::One,
        }
    }
}

impl FromStr for FilterOperator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FilterOperator::ALL
            .into_iter()
            .find(|op| op.keyword() == s)
            .ok_or_else(|| s.to_string())
    }
}

impl Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// A typed filter operand.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    String(String),
    Integer(i64),
    Number(f64),
    Boolean(bool),
}

impl FilterValue {
    /// Converts a raw operand for an attribute of `kind`.
    pub fn parse_attribute(raw: &str, kind: AttrKind) -> Result<Self, String> {
        match kind {
            AttrKind::String => Ok(FilterValue::String(raw.to_string())),
            AttrKind::Integer => raw
                .parse()
                .map(FilterValue::Integer)
                .map_err(|_| format!("'{raw}' is not a valid integer")),
            AttrKind::Number => raw
                .parse()
                .map(FilterValue::Number)
                .map_err(|_| format!("'{raw}' is not a valid number")),
            AttrKind::Boolean => raw
                .parse()
                .map(FilterValue::Boolean)
                .map_err(|_| format!("'{raw}' is not a valid boolean")),
        }
    }

    /// Converts a raw operand compared against a resource id.
    pub fn parse_id(raw: &str, kind: IdKind) -> Result<Self, String> {
        match kind {
            IdKind::Integer => raw
                .parse()
                .map(FilterValue::Integer)
                .map_err(|_| format!("'{raw}' is not a valid integer id")),
            IdKind::Guid => uuid::Uuid::parse_str(raw)
                .map(|_| FilterValue::String(raw.to_string()))
                .map_err(|_| format!("'{raw}' is not a valid guid")),
            IdKind::Text => Ok(FilterValue::String(raw.to_string())),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FilterValue::String(value) => Value::from(value.as_str()),
            FilterValue::Integer(value) => Value::from(*value),
            FilterValue::Number(value) => Value::from(*value),
            FilterValue::Boolean(value) => Value::from(*value),
        }
    }
}

impl Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterValue::String(value) => f.write_str(value),
            FilterValue::Integer(value) => write!(f, "{value}"),
            FilterValue::Number(value) => write!(f, "{value}"),
            FilterValue::Boolean(value) => write!(f, "{value}"),
        }
    }
}

/// `field op operands`, where `field` may reach through relationships.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonExpression {
    pub field: FieldChain,
    pub operator: FilterOperator,
    pub operands: Vec<FilterValue>,
}

impl ComparisonExpression {
    /// Query-string value part, e.g. `eq:Ann` or `in:1,2`.
    pub fn value_text(&self) -> String {
        let operands: Vec<String> = self.operands.iter().map(ToString::to_string).collect();
        format!("{}:{}", self.operator, operands.join(","))
    }

    pub fn query_pair(&self) -> (String, String) {
        (format!("filter[{}]", self.field), self.value_text())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpression {
    Comparison(ComparisonExpression),
    And(Vec<FilterExpression>),
    Or(Vec<FilterExpression>),
}

impl FilterExpression {
    pub fn compare(field: FieldChain, operator: FilterOperator, operands: Vec<FilterValue>) -> Self {
        FilterExpression::Comparison(ComparisonExpression {
            field,
            operator,
            operands,
        })
    }

    /// `id in [ids]` for a resource type with the given id kind.
    pub fn id_in<I, S>(kind: IdKind, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let operands = ids
            .into_iter()
            .map(|id| {
                FilterValue::parse_id(id.as_ref(), kind)
                    .unwrap_or_else(|_| FilterValue::String(id.as_ref().to_string()))
            })
            .collect();
        Self::compare(FieldChain::id(kind), FilterOperator::In, operands)
    }

    /// Conjunction that flattens nested `and`s.
    pub fn and(self, other: FilterExpression) -> Self {
        let mut terms = match self {
            FilterExpression::And(terms) => terms,
            single => vec![single],
        };
        match other {
            FilterExpression::And(more) => terms.extend(more),
            single => terms.push(single),
        }
        FilterExpression::And(terms)
    }

    /// Adds `extra` to an optional existing filter.
    pub fn and_optional(existing: Option<FilterExpression>, extra: FilterExpression) -> Self {
        match existing {
            Some(existing) => existing.and(extra),
            None => extra,
        }
    }

    /// Top-level terms: the members of an `and`, or the expression itself.
    pub fn terms(&self) -> Vec<&FilterExpression> {
        match self {
            FilterExpression::And(terms) => terms.iter().collect(),
            other => vec![other],
        }
    }
}

impl Display for FilterExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterExpression::Comparison(comparison) => {
                let (key, value) = comparison.query_pair();
                write!(f, "{key}={value}")
            }
            FilterExpression::And(terms) => {
                let parts: Vec<String> = terms.iter().map(ToString::to_string).collect();
                f.write_str(&parts.join("&"))
            }
            FilterExpression::Or(terms) => {
                let parts: Vec<String> = terms.iter().map(ToString::to_string).collect();
                write!(f, "or({})", parts.join(","))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortElement {
    pub field: FieldChain,
    pub ascending: bool,
}

impl Display for SortElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.ascending {
            f.write_str("-")?;
        }
        write!(f, "{}", self.field)
    }
}

/// Ordered sort keys; earlier keys take precedence, later keys break ties.
#[derive(Debug, Clone, PartialEq)]
pub struct SortExpression {
    pub elements: Vec<SortElement>,
}

impl SortExpression {
    pub fn new(elements: Vec<SortElement>) -> Self {
        Self { elements }
    }
}

impl Display for SortExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.elements.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(","))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncludeElement {
    pub relationship: String,
    pub right_type: String,
    pub children: Vec<IncludeElement>,
}

impl IncludeElement {
    fn leaf_paths(&self, prefix: &str, paths: &mut Vec<String>) {
        let path = if prefix.is_empty() {
            self.relationship.clone()
        } else {
            format!("{prefix}.{}", self.relationship)
        };
        if self.children.is_empty() {
            paths.push(path);
        } else {
            for child in &self.children {
                child.leaf_paths(&path, paths);
            }
        }
    }

    fn depth(&self) -> usize {
        1 + self.children.iter().map(IncludeElement::depth).max().unwrap_or(0)
    }
}

/// Tree of relationships to eager-load. Paths sharing a prefix share nodes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IncludeExpression {
    pub elements: Vec<IncludeElement>,
}

impl IncludeExpression {
    /// Merges resolved include chains into one tree, keeping first-seen order.
    pub fn from_chains(chains: &[FieldChain]) -> Self {
        let mut expression = IncludeExpression::default();
        for chain in chains {
            expression.add_chain(chain);
        }
        expression
    }

    pub fn add_chain(&mut self, chain: &FieldChain) {
        let mut level = &mut self.elements;
        for field in &chain.fields {
            let FieldRef::Relationship {
                name, right_type, ..
            } = field
            else {
                return;
            };
            let position = match level.iter().position(|e| &e.relationship == name) {
                Some(position) => position,
                None => {
                    level.push(IncludeElement {
                        relationship: name.clone(),
                        right_type: right_type.clone(),
                        children: Vec::new(),
                    });
                    level.len() - 1
                }
            };
            level = &mut level[position].children;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Dotted paths of every leaf.
    pub fn paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for element in &self.elements {
            element.leaf_paths("", &mut paths);
        }
        paths
    }

    pub fn depth(&self) -> usize {
        self.elements.iter().map(IncludeElement::depth).max().unwrap_or(0)
    }

    /// Every resource type reachable through the tree.
    pub fn reachable_types(&self) -> BTreeSet<String> {
        let mut types = BTreeSet::new();
        let mut pending: Vec<&IncludeElement> = self.elements.iter().collect();
        while let Some(element) = pending.pop() {
            types.insert(element.right_type.clone());
            pending.extend(element.children.iter());
        }
        types
    }
}

impl Display for IncludeExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.paths().join(","))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationExpression {
    pub page_number: NonZeroU32,
    /// `None` disables paging.
    pub page_size: Option<NonZeroU32>,
}

impl PaginationExpression {
    pub fn new(page_number: NonZeroU32, page_size: Option<NonZeroU32>) -> Self {
        Self {
            page_number,
            page_size,
        }
    }

    /// Number of matching resources skipped before the page starts.
    pub fn offset(&self) -> usize {
        match self.page_size {
            Some(size) => (self.page_number.get() as usize - 1) * size.get() as usize,
            None => 0,
        }
    }
}

impl Display for PaginationExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page[number]={}", self.page_number)?;
        if let Some(size) = self.page_size {
            write!(f, "&page[size]={size}")?;
        }
        Ok(())
    }
}

/// Attributes to return for one resource type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SparseFieldSetExpression {
    pub attributes: BTreeSet<String>,
}

impl SparseFieldSetExpression {
    pub fn new<I, S>(attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            attributes: attributes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, attribute: &str) -> bool {
        self.attributes.contains(attribute)
    }
}

impl Display for SparseFieldSetExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.attributes.iter().map(String::as_str).collect();
        f.write_str(&names.join(","))
    }
}

/// Everything needed to execute one read query against one resource type.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryLayer {
    pub resource_type: String,
    pub filter: Option<FilterExpression>,
    pub sort: Option<SortExpression>,
    pub pagination: Option<PaginationExpression>,
    pub include: Option<IncludeExpression>,
    /// Keyed by public resource type name.
    pub sparse_fieldsets: BTreeMap<String, SparseFieldSetExpression>,
}

impl QueryLayer {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            filter: None,
            sort: None,
            pagination: None,
            include: None,
            sparse_fieldsets: BTreeMap::new(),
        }
    }

    pub fn with_filter(mut self, filter: FilterExpression) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn sparse_fieldset(&self, resource_type: &str) -> Option<&SparseFieldSetExpression> {
        self.sparse_fieldsets.get(resource_type)
    }

    /// Query-string parameters that read back into an equal layer.
    ///
    /// `or` filters have no query-string form and are left out.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(filter) = &self.filter {
            for term in filter.terms() {
                if let FilterExpression::Comparison(comparison) = term {
                    pairs.push(comparison.query_pair());
                }
            }
        }
        if let Some(sort) = &self.sort {
            pairs.push(("sort".to_string(), sort.to_string()));
        }
        if let Some(include) = self.include.as_ref().filter(|i| !i.is_empty()) {
            pairs.push(("include".to_string(), include.to_string()));
        }
        if let Some(pagination) = &self.pagination {
            pairs.push((
                "page[number]".to_string(),
                pagination.page_number.to_string(),
            ));
            if let Some(size) = pagination.page_size {
                pairs.push(("page[size]".to_string(), size.to_string()));
            }
        }
        for (resource_type, fieldset) in &self.sparse_fieldsets {
            pairs.push((format!("fields[{resource_type}]"), fieldset.to_string()));
        }
        pairs
    }
}
