//! # Query String Reader
//!
//! Turns raw (already percent-decoded) query-string pairs into a
//! [`QueryLayer`] for one primary resource type.
//!
//! ```text
//! filter[author.name]=eq:Ann     comparison through a relationship
//! filter[priority]=in:1,2        multi-operand operators take comma lists
//! sort=-createdAt,title          leading '-' sorts descending
//! include=author.articles,tags   merged into one include tree
//! page[number]=2&page[size]=10   absent values take configured defaults
//! fields[people]=name,email      sparse attributes per resource type
//! ```
//!
//! Every parameter is checked and all failures are reported together.
//! Parameter families can be switched off per endpoint with
//! [`QueryStringReader::with_disabled`].

use crate::error::{ApiError, ApiErrors};
use crate::expression::{
    Arity, FilterExpression, FilterOperator, FilterValue, IncludeExpression,
    PaginationExpression, QueryLayer, SortElement, SortExpression, SparseFieldSetExpression,
};
use crate::graph::{ChainUsage, FieldChain, FieldRef, ResourceGraph};
use crate::options::ApiOptions;
use std::collections::BTreeSet;
use std::num::NonZeroU32;
use tracing::{debug, warn};

/// Splits `a=b&c=d` into pairs. Does not percent-decode.
pub fn split_query_string(query: &str) -> Vec<(String, String)> {
    query
        .trim_start_matches('?')
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (part.to_string(), String::new()),
        })
        .collect()
}

/// `name` or `name[argument]`.
fn parse_key(key: &str) -> Option<(&str, Option<&str>)> {
    let is_name = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    match key.find('[') {
        None => is_name(key).then_some((key, None)),
        Some(open) => {
            let name = &key[..open];
            let argument = key[open + 1..].strip_suffix(']')?;
            if !is_name(name) || argument.contains(['[', ']']) {
                return None;
            }
            Some((name, Some(argument)))
        }
    }
}

/// Splits `op:operands`. A purely alphabetic prefix must be a known operator.
fn split_operator(value: &str) -> Result<(FilterOperator, &str), String> {
    match value.split_once(':') {
        Some((prefix, rest)) => match prefix.parse::<FilterOperator>() {
            Ok(operator) => Ok((operator, rest)),
            Err(token)
                if !token.is_empty() && token.chars().all(|c| c.is_ascii_alphabetic()) =>
            {
                Err(token)
            }
            Err(_) => Ok((FilterOperator::Eq, value)),
        },
        None => Ok((FilterOperator::Eq, value)),
    }
}

/// The standard parameter families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueryParameterKind {
    Filter,
    Sort,
    Include,
    Page,
    Fields,
}

impl QueryParameterKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "filter" => Some(QueryParameterKind::Filter),
            "sort" => Some(QueryParameterKind::Sort),
            "include" => Some(QueryParameterKind::Include),
            "page" => Some(QueryParameterKind::Page),
            "fields" => Some(QueryParameterKind::Fields),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Collected {
    filters: Vec<FilterExpression>,
    sort: Option<SortExpression>,
    include: Option<IncludeExpression>,
    page_number: Option<NonZeroU32>,
    page_size: Option<NonZeroU32>,
    fields: Vec<(String, SparseFieldSetExpression)>,
    seen: BTreeSet<String>,
}

pub struct QueryStringReader<'a> {
    graph: &'a ResourceGraph,
    options: &'a ApiOptions,
    disabled: BTreeSet<QueryParameterKind>,
}

impl<'a> QueryStringReader<'a> {
    pub fn new(graph: &'a ResourceGraph, options: &'a ApiOptions) -> Self {
        Self {
            graph,
            options,
            disabled: BTreeSet::new(),
        }
    }

    /// Rejects every parameter of the given families.
    pub fn with_disabled(mut self, kinds: impl IntoIterator<Item = QueryParameterKind>) -> Self {
        self.disabled.extend(kinds);
        self
    }

    pub fn read(
        &self,
        resource_type: &str,
        pairs: &[(String, String)],
    ) -> Result<QueryLayer, ApiErrors> {
        self.graph.resource_context(resource_type)?;
        debug!(resource_type, parameters = pairs.len(), "Reading query string");

        let mut collected = Collected::default();
        let mut errors = Vec::new();

        for (key, value) in pairs {
            if let Err(error) = self.read_pair(resource_type, key, value, &mut collected) {
                errors.push(error);
            }
        }

        if !errors.is_empty() {
            warn!(resource_type, errors = errors.len(), "Rejected query string");
            return Err(ApiErrors(errors));
        }

        let mut layer = QueryLayer::new(resource_type);
        layer.filter = collected
            .filters
            .into_iter()
            .reduce(FilterExpression::and);
        layer.sort = collected.sort;
        layer.include = collected.include;
        layer.pagination = Some(PaginationExpression::new(
            collected.page_number.unwrap_or(NonZeroU32::MIN),
            Some(collected.page_size.unwrap_or(self.options.default_page_size)),
        ));
        layer.sparse_fieldsets = collected.fields.into_iter().collect();
        Ok(layer)
    }

    fn read_pair(
        &self,
        resource_type: &str,
        key: &str,
        value: &str,
        collected: &mut Collected,
    ) -> Result<(), ApiError> {
        let Some((name, argument)) = parse_key(key) else {
            return Err(ApiError::invalid_parameter(key, "malformed parameter name"));
        };

        if QueryParameterKind::from_name(name).is_some_and(|kind| self.disabled.contains(&kind)) {
            return Err(ApiError::invalid_parameter(
                key,
                "parameter is not available on this endpoint",
            ));
        }

        // Filters may repeat; every other parameter appears once.
        if name != "filter" && !collected.seen.insert(key.to_string()) {
            return Err(ApiError::invalid_parameter(key, "specified more than once"));
        }

        match (name, argument) {
            ("filter", Some(path)) => {
                let filter = self.read_filter(resource_type, key, path, value)?;
                collected.filters.push(filter);
            }
            ("sort", None) => collected.sort = Some(self.read_sort(resource_type, key, value)?),
            ("include", None) => {
                collected.include = Some(self.read_include(resource_type, key, value)?)
            }
            ("page", Some("number")) => collected.page_number = Some(read_page_value(key, value)?),
            ("page", Some("size")) => collected.page_size = Some(read_page_value(key, value)?),
            ("fields", Some(target)) => {
                let fieldset = self.read_fields(key, target, value)?;
                collected.fields.push((target.to_string(), fieldset));
            }
            ("filter" | "sort" | "include" | "page" | "fields", _) => {
                return Err(ApiError::invalid_parameter(key, "malformed parameter name"));
            }
            _ if self.options.allow_unknown_query_string_parameters => {
                debug!(parameter = key, "Ignoring unknown query parameter");
            }
            _ => return Err(ApiError::UnknownQueryParameter(key.to_string())),
        }
        Ok(())
    }

    fn resolve(
        &self,
        resource_type: &str,
        parameter: &str,
        path: &str,
        usage: ChainUsage,
    ) -> Result<FieldChain, ApiError> {
        self.graph
            .resolve_chain(resource_type, path, usage)
            .map_err(|error| ApiError::invalid_parameter(parameter, error.to_string()))
    }

    fn read_filter(
        &self,
        resource_type: &str,
        parameter: &str,
        path: &str,
        value: &str,
    ) -> Result<FilterExpression, ApiError> {
        let field = self.resolve(resource_type, parameter, path, ChainUsage::Filter)?;
        let (operator, rest) = split_operator(value).map_err(|operator| {
            ApiError::UnknownOperator {
                parameter: parameter.to_string(),
                operator,
            }
        })?;

        if let Some(attribute) = self.graph.terminal_attribute(resource_type, &field) {
            if !attribute.capabilities.allow_filter {
                return Err(ApiError::invalid_parameter(
                    parameter,
                    format!("filtering on '{}' is not allowed", attribute.name),
                ));
            }
        }

        let parse = |raw: &str| -> Result<FilterValue, ApiError> {
            let parsed = match field.last() {
                Some(FieldRef::Attribute { kind, .. }) => FilterValue::parse_attribute(raw, *kind),
                Some(FieldRef::Id { kind }) => FilterValue::parse_id(raw, *kind),
                _ => Err(format!("'{path}' does not end in an attribute")),
            };
            parsed.map_err(|reason| ApiError::invalid_parameter(parameter, reason))
        };

        if operator == FilterOperator::Like
            && !matches!(
                field.last(),
                Some(FieldRef::Attribute {
                    kind: crate::graph::AttrKind::String,
                    ..
                })
            )
        {
            return Err(ApiError::invalid_parameter(
                parameter,
                "'like' is only supported on text attributes",
            ));
        }

        let operands = match operator.arity() {
            Arity::None if rest.is_empty() => Vec::new(),
            Arity::None => {
                return Err(ApiError::invalid_parameter(
                    parameter,
                    format!("'{operator}' does not take a value"),
                ))
            }
            Arity::One => vec![parse(rest)?],
            Arity::Many if rest.is_empty() => {
                return Err(ApiError::invalid_parameter(
                    parameter,
                    format!("'{operator}' requires at least one value"),
                ))
            }
            Arity::Many => rest.split(',').map(parse).collect::<Result<_, _>>()?,
        };

        Ok(FilterExpression::compare(field, operator, operands))
    }

    fn read_sort(
        &self,
        resource_type: &str,
        parameter: &str,
        value: &str,
    ) -> Result<SortExpression, ApiError> {
        let mut elements = Vec::new();
        for token in value.split(',') {
            let (ascending, path) = match token.strip_prefix('-') {
                Some(path) => (false, path),
                None => (true, token),
            };
            let field = self.resolve(resource_type, parameter, path, ChainUsage::Sort)?;
            if let Some(attribute) = self.graph.terminal_attribute(resource_type, &field) {
                if !attribute.capabilities.allow_sort {
                    return Err(ApiError::invalid_parameter(
                        parameter,
                        format!("sorting on '{}' is not allowed", attribute.name),
                    ));
                }
            }
            elements.push(SortElement { field, ascending });
        }
        Ok(SortExpression::new(elements))
    }

    fn read_include(
        &self,
        resource_type: &str,
        parameter: &str,
        value: &str,
    ) -> Result<IncludeExpression, ApiError> {
        let mut include = IncludeExpression::default();
        for path in value.split(',') {
            let chain = self.resolve(resource_type, parameter, path, ChainUsage::Include)?;
            if let Some(maximum) = self.options.maximum_include_depth {
                if chain.fields.len() > maximum {
                    return Err(ApiError::invalid_parameter(
                        parameter,
                        format!("'{path}' exceeds the maximum include depth of {maximum}"),
                    ));
                }
            }
            include.add_chain(&chain);
        }
        Ok(include)
    }

    fn read_fields(
        &self,
        parameter: &str,
        target: &str,
        value: &str,
    ) -> Result<SparseFieldSetExpression, ApiError> {
        let context = self
            .graph
            .resource_context(target)
            .map_err(|error| ApiError::invalid_parameter(parameter, error.to_string()))?;
        let mut attributes = BTreeSet::new();
        for name in value.split(',').filter(|name| !name.is_empty()) {
            if context.attribute(name).is_none() {
                return Err(ApiError::invalid_parameter(
                    parameter,
                    format!("attribute '{name}' does not exist on '{target}'"),
                ));
            }
            attributes.insert(name.to_string());
        }
        Ok(SparseFieldSetExpression { attributes })
    }
}

fn read_page_value(parameter: &str, value: &str) -> Result<NonZeroU32, ApiError> {
    value
        .parse::<NonZeroU32>()
        .map_err(|_| ApiError::invalid_parameter(parameter, "value must be a positive integer"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AttrCapabilities, AttrKind, AttributeDescriptor, IdKind};
    use pretty_assertions::assert_eq;

    fn graph() -> ResourceGraph {
        let mut builder = ResourceGraph::builder();
        builder
            .add_resource("people", "Person", IdKind::Integer)
            .attribute("name", AttrKind::String)
            .attribute_with(
                AttributeDescriptor::new("password", AttrKind::String).capabilities(
                    AttrCapabilities {
                        allow_filter: false,
                        allow_sort: false,
                        allow_change: true,
                    },
                ),
            )
            .has_many("articles", "articles");
        builder
            .add_resource("articles", "Article", IdKind::Integer)
            .attribute("title", AttrKind::String)
            .attribute("createdAt", AttrKind::String)
            .attribute("views", AttrKind::Integer)
            .has_one("author", "people")
            .has_many("tags", "tags");
        builder
            .add_resource("tags", "Tag", IdKind::Integer)
            .attribute("name", AttrKind::String);
        builder.build().unwrap()
    }

    fn pairs(query: &str) -> Vec<(String, String)> {
        split_query_string(query)
    }

    fn read(query: &str) -> Result<QueryLayer, ApiErrors> {
        let graph = graph();
        let options = ApiOptions::default();
        QueryStringReader::new(&graph, &options).read("articles", &pairs(query))
    }

    #[test]
    fn reads_concrete_scenario() {
        let layer =
            read("filter[author.name]=eq:Ann&sort=-createdAt&page[size]=10&page[number]=2")
                .unwrap();

        let filter = layer.filter.clone().unwrap();
        assert_eq!(filter.to_string(), "filter[author.name]=eq:Ann");
        assert_eq!(layer.sort.as_ref().unwrap().to_string(), "-createdAt");
        let page = layer.pagination.unwrap();
        assert_eq!(page.offset(), 10);
        assert_eq!(page.page_size.map(NonZeroU32::get), Some(10));
    }

    #[test]
    fn absent_pagination_uses_defaults() {
        let layer = read("").unwrap();
        let page = layer.pagination.unwrap();
        assert_eq!(page.page_number.get(), 1);
        assert_eq!(page.page_size.map(NonZeroU32::get), Some(10));
        assert_eq!(layer.filter, None);
    }

    #[test]
    fn unknown_operator_names_token() {
        let errors = read("filter[title]=between:a").unwrap_err();
        assert_eq!(
            errors.0,
            vec![ApiError::UnknownOperator {
                parameter: "filter[title]".into(),
                operator: "between".into()
            }]
        );
    }

    #[test]
    fn value_without_operator_is_equality() {
        let layer = read("filter[title]=12:30").unwrap();
        assert_eq!(
            layer.filter.unwrap().to_string(),
            "filter[title]=eq:12:30"
        );
        let layer = read("filter[title]=Hello").unwrap();
        assert_eq!(layer.filter.unwrap().to_string(), "filter[title]=eq:Hello");
    }

    #[test]
    fn operands_are_typed_by_attribute_kind() {
        let layer = read("filter[views]=in:1,2,3").unwrap();
        let FilterExpression::Comparison(comparison) = layer.filter.unwrap() else {
            panic!("expected comparison");
        };
        assert_eq!(
            comparison.operands,
            vec![
                FilterValue::Integer(1),
                FilterValue::Integer(2),
                FilterValue::Integer(3)
            ]
        );

        let errors = read("filter[views]=gt:lots").unwrap_err();
        assert!(matches!(
            &errors.0[0],
            ApiError::InvalidQueryParameter { parameter, .. } if parameter == "filter[views]"
        ));
    }

    #[test]
    fn multiple_filters_are_combined_with_and() {
        let layer = read("filter[title]=like:%rust%&filter[author.name]=isnotnull:").unwrap();
        let filter = layer.filter.unwrap();
        assert_eq!(filter.terms().len(), 2);
    }

    #[test]
    fn like_requires_text_attribute() {
        let errors = read("filter[views]=like:1%").unwrap_err();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn rejects_non_positive_page_values() {
        for query in ["page[size]=0", "page[number]=-1", "page[size]=ten"] {
            let errors = read(query).unwrap_err();
            assert_eq!(errors.len(), 1, "{query}");
        }
    }

    #[test]
    fn collects_every_error() {
        let errors = read("filter[nope]=eq:1&sort=missing&foo=bar&page[number]=0").unwrap_err();
        assert_eq!(errors.len(), 4);
        assert_eq!(errors.0[2], ApiError::UnknownQueryParameter("foo".into()));
    }

    #[test]
    fn unknown_parameters_can_be_allowed() {
        let graph = graph();
        let options = ApiOptions {
            allow_unknown_query_string_parameters: true,
            ..ApiOptions::default()
        };
        let layer = QueryStringReader::new(&graph, &options)
            .read("articles", &pairs("foo=bar"))
            .unwrap();
        assert_eq!(layer.filter, None);
    }

    #[test]
    fn disabled_families_are_rejected() {
        let graph = graph();
        let options = ApiOptions::default();
        let reader = QueryStringReader::new(&graph, &options)
            .with_disabled([QueryParameterKind::Sort, QueryParameterKind::Page]);

        let errors = reader
            .read("articles", &pairs("sort=title&page[size]=5&filter[title]=x"))
            .unwrap_err();
        let parameters: Vec<_> = errors.0.iter().filter_map(ApiError::parameter).collect();
        assert_eq!(parameters, vec!["sort", "page[size]"]);

        let layer = reader.read("articles", &pairs("include=author")).unwrap();
        assert!(layer.include.is_some());
    }

    #[test]
    fn malformed_keys_are_rejected() {
        for query in ["filter=eq:1", "filter[title=eq:1", "page[offset]=1", "sort[x]=title"] {
            assert!(read(query).is_err(), "{query}");
        }
    }

    #[test]
    fn capabilities_restrict_filter_and_sort() {
        let graph = graph();
        let options = ApiOptions::default();
        let reader = QueryStringReader::new(&graph, &options);
        assert!(reader
            .read("people", &pairs("filter[password]=eq:x"))
            .is_err());
        assert!(reader.read("people", &pairs("sort=password")).is_err());
        assert!(reader.read("people", &pairs("fields[people]=password")).is_ok());
    }

    #[test]
    fn include_depth_is_enforced() {
        let graph = graph();
        let options = ApiOptions {
            maximum_include_depth: Some(1),
            ..ApiOptions::default()
        };
        let reader = QueryStringReader::new(&graph, &options);
        assert!(reader.read("articles", &pairs("include=author")).is_ok());
        assert!(reader
            .read("articles", &pairs("include=author.articles"))
            .is_err());
    }

    #[test]
    fn sparse_fields_validate_type_and_attributes() {
        let layer = read("fields[people]=name&fields[articles]=title,views").unwrap();
        assert_eq!(layer.sparse_fieldsets.len(), 2);
        assert!(layer.sparse_fieldset("articles").unwrap().contains("views"));
        assert!(read("fields[robots]=name").is_err());
        assert!(read("fields[people]=age").is_err());
    }

    #[test]
    fn layer_round_trips_through_query_pairs() {
        let queries = [
            "filter[author.name]=eq:Ann&sort=-createdAt&page[size]=10&page[number]=2",
            "filter[views]=nin:1,2&filter[title]=isnull:&include=author.articles,tags&fields[people]=name",
            "sort=author.name,-views,id&filter[id]=in:1,2",
        ];
        for query in queries {
            let layer = read(query).unwrap();
            let reread = read_pairs(&layer.to_query_pairs());
            assert_eq!(reread, layer, "{query}");
        }
    }

    fn read_pairs(pairs: &[(String, String)]) -> QueryLayer {
        let graph = graph();
        let options = ApiOptions::default();
        QueryStringReader::new(&graph, &options)
            .read("articles", pairs)
            .unwrap()
    }
}
