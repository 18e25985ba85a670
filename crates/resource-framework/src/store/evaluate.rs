//! In-memory evaluation of query layers over a table snapshot.

use crate::error::ExecutorError;
use crate::expression::{ComparisonExpression, FilterExpression, FilterOperator, QueryLayer};
use crate::graph::{Cardinality, FieldChain, FieldRef, IdKind};
use crate::resource::{RelationshipData, Resource, ResourceKey};
use regex_lite::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::num::NonZeroU32;

/// Resources per public type name, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tables {
    rows: BTreeMap<String, Vec<Resource>>,
}

impl Tables {
    pub fn rows(&self, resource_type: &str) -> &[Resource] {
        self.rows
            .get(resource_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn find(&self, key: &ResourceKey) -> Option<&Resource> {
        self.rows(&key.resource_type)
            .iter()
            .find(|row| row.id.as_deref() == Some(key.id.as_str()))
    }

    pub fn find_mut(&mut self, key: &ResourceKey) -> Option<&mut Resource> {
        self.rows
            .get_mut(&key.resource_type)?
            .iter_mut()
            .find(|row| row.id.as_deref() == Some(key.id.as_str()))
    }

    pub fn insert(&mut self, resource: Resource) {
        self.rows
            .entry(resource.resource_type.clone())
            .or_default()
            .push(resource);
    }

    pub fn remove(&mut self, key: &ResourceKey) -> Option<Resource> {
        let rows = self.rows.get_mut(&key.resource_type)?;
        let position = rows
            .iter()
            .position(|row| row.id.as_deref() == Some(key.id.as_str()))?;
        Some(rows.remove(position))
    }

    /// Drops every relationship reference to `key`.
    pub fn detach(&mut self, key: &ResourceKey) {
        for row in self.rows.values_mut().flatten() {
            for data in row.relationships.values_mut() {
                match data {
                    RelationshipData::ToOne(slot) => {
                        if slot.as_ref().and_then(|i| i.key()).as_ref() == Some(key) {
                            *slot = None;
                        }
                    }
                    RelationshipData::ToMany(list) => {
                        list.retain(|i| i.key().as_ref() != Some(key));
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Values a field chain reaches from `resource`.
///
/// A missing to-one target yields `null`; an empty to-many yields nothing.
fn reach(tables: &Tables, resource: &Resource, fields: &[FieldRef]) -> Vec<Value> {
    let Some((field, rest)) = fields.split_first() else {
        return Vec::new();
    };
    match field {
        FieldRef::Attribute { name, .. } => {
            vec![resource.attributes.get(name).cloned().unwrap_or(Value::Null)]
        }
        FieldRef::Id { kind } => vec![id_value(resource.id.as_deref(), *kind)],
        FieldRef::Relationship {
            name,
            right_type,
            cardinality,
        } => {
            let identifiers = resource
                .relationships
                .get(name)
                .map(|data| data.identifiers())
                .unwrap_or_default();
            let related: Vec<&Resource> = identifiers
                .iter()
                .filter_map(|identifier| identifier.id.as_ref())
                .filter_map(|id| tables.find(&ResourceKey::new(right_type.clone(), id.clone())))
                .collect();
            if related.is_empty() && *cardinality == Cardinality::ToOne {
                return vec![Value::Null];
            }
            related
                .into_iter()
                .flat_map(|target| reach(tables, target, rest))
                .collect()
        }
    }
}

fn id_value(id: Option<&str>, kind: IdKind) -> Value {
    match (id, kind) {
        (None, _) => Value::Null,
        (Some(id), IdKind::Integer) => id
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(id)),
        (Some(id), _) => Value::from(id),
    }
}

fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn equals(left: &Value, right: &Value) -> bool {
    compare_values(left, right) == Some(Ordering::Equal)
}

fn like_pattern(pattern: &str) -> Result<Regex, ExecutorError> {
    let mut expression = String::from("(?s)^");
    for c in pattern.chars() {
        match c {
            '%' => expression.push_str(".*"),
            '_' => expression.push('.'),
            other => expression.push_str(&regex_lite::escape(&other.to_string())),
        }
    }
    expression.push('$');
    Regex::new(&expression).map_err(|e| ExecutorError::Storage(e.to_string()))
}

fn holds(value: &Value, comparison: &ComparisonExpression) -> Result<bool, ExecutorError> {
    let operands: Vec<Value> = comparison.operands.iter().map(|o| o.to_json()).collect();
    let null = Value::Null;
    let first = operands.first().unwrap_or(&null);
    let ordered = |accept: fn(Ordering) -> bool| {
        compare_values(value, first).map(accept).unwrap_or(false)
    };
    Ok(match comparison.operator {
        FilterOperator::Eq => equals(value, first),
        FilterOperator::Ne => !equals(value, first),
        FilterOperator::Lt => ordered(Ordering::is_lt),
        FilterOperator::Gt => ordered(Ordering::is_gt),
        FilterOperator::Le => ordered(Ordering::is_le),
        FilterOperator::Ge => ordered(Ordering::is_ge),
        FilterOperator::Like => match (value, first) {
            (Value::String(text), Value::String(pattern)) => like_pattern(pattern)?.is_match(text),
            _ => false,
        },
        FilterOperator::In => operands.iter().any(|o| equals(value, o)),
        FilterOperator::Nin => !operands.iter().any(|o| equals(value, o)),
        FilterOperator::IsNull => value.is_null(),
        FilterOperator::IsNotNull => !value.is_null(),
    })
}

/// Whether `resource` satisfies `filter`. Chains through to-many
/// relationships match when any reached value matches.
pub fn matches(
    tables: &Tables,
    resource: &Resource,
    filter: &FilterExpression,
) -> Result<bool, ExecutorError> {
    match filter {
        FilterExpression::Comparison(comparison) => {
            for value in reach(tables, resource, &comparison.field.fields) {
                if holds(&value, comparison)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        FilterExpression::And(terms) => {
            for term in terms {
                if !matches(tables, resource, term)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        FilterExpression::Or(terms) => {
            for term in terms {
                if matches(tables, resource, term)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

fn sort_value(tables: &Tables, resource: &Resource, field: &FieldChain) -> Value {
    reach(tables, resource, &field.fields)
        .into_iter()
        .next()
        .unwrap_or(Value::Null)
}

/// Nulls sort first in ascending order.
fn sort_order(left: &Value, right: &Value) -> Ordering {
    match (left.is_null(), right.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => compare_values(left, right).unwrap_or(Ordering::Equal),
    }
}

pub fn count(
    tables: &Tables,
    resource_type: &str,
    filter: Option<&FilterExpression>,
) -> Result<usize, ExecutorError> {
    let mut total = 0;
    for row in tables.rows(resource_type) {
        if filter.map_or(Ok(true), |f| matches(tables, row, f))? {
            total += 1;
        }
    }
    Ok(total)
}

pub fn execute(
    tables: &Tables,
    layer: &QueryLayer,
    maximum_page_size: Option<NonZeroU32>,
) -> Result<Vec<Resource>, ExecutorError> {
    let mut selected = Vec::new();
    for row in tables.rows(&layer.resource_type) {
        if layer
            .filter
            .as_ref()
            .map_or(Ok(true), |f| matches(tables, row, f))?
        {
            selected.push(row);
        }
    }

    if let Some(sort) = &layer.sort {
        let mut keyed: Vec<(Vec<Value>, &Resource)> = selected
            .into_iter()
            .map(|row| {
                let keys = sort
                    .elements
                    .iter()
                    .map(|element| sort_value(tables, row, &element.field))
                    .collect();
                (keys, row)
            })
            .collect();
        // `sort_by` is stable, so equal keys keep insertion order.
        keyed.sort_by(|(left, _), (right, _)| {
            for (index, element) in sort.elements.iter().enumerate() {
                let order = sort_order(&left[index], &right[index]);
                let order = if element.ascending { order } else { order.reverse() };
                if order != Ordering::Equal {
                    return order;
                }
            }
            Ordering::Equal
        });
        selected = keyed.into_iter().map(|(_, row)| row).collect();
    }

    // Only paged layers are bounded; internal loads without pagination see
    // every matching row.
    let page_size = layer.pagination.and_then(|p| match (p.page_size, maximum_page_size) {
        (Some(size), Some(maximum)) => Some(size.min(maximum)),
        (requested, maximum) => requested.or(maximum),
    });
    let page_number = layer
        .pagination
        .map(|p| p.page_number.get() as usize)
        .unwrap_or(1);

    let page: Vec<&Resource> = match page_size {
        Some(size) => {
            let size = size.get() as usize;
            selected
                .into_iter()
                .skip((page_number - 1) * size)
                .take(size)
                .collect()
        }
        None => selected,
    };

    let fieldset = layer.sparse_fieldset(&layer.resource_type);
    Ok(page
        .into_iter()
        .map(|row| {
            let mut row = row.clone();
            if let Some(fieldset) = fieldset {
                row.attributes.retain(|name, _| fieldset.contains(name));
            }
            row
        })
        .collect())
}
