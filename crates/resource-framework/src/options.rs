//! Server-wide options consulted by the query builder, the service and the
//! operations processor.

use serde::{Deserialize, Serialize};
use std::env;
use std::num::NonZeroU32;
use std::str::FromStr;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiOptions {
    /// Page size used when the client does not send `page[size]`.
    #[serde(default = "default_page_size")]
    pub default_page_size: NonZeroU32,

    /// Upper bound applied by the executor. The builder never rejects a
    /// large page size.
    #[serde(default)]
    pub maximum_page_size: Option<NonZeroU32>,

    #[serde(default = "default_true")]
    pub include_total_resource_count: bool,

    #[serde(default)]
    pub allow_client_generated_ids: bool,

    #[serde(default = "default_maximum_operations")]
    pub maximum_operations_per_request: usize,

    /// Maximum number of segments in one include path.
    #[serde(default)]
    pub maximum_include_depth: Option<usize>,

    #[serde(default)]
    pub allow_unknown_query_string_parameters: bool,
}

fn default_page_size() -> NonZeroU32 {
    NonZeroU32::MIN.saturating_add(9)
}

fn default_true() -> bool {
    true
}

fn default_maximum_operations() -> usize {
    10
}

impl Default for ApiOptions {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
            maximum_page_size: None,
            include_total_resource_count: default_true(),
            allow_client_generated_ids: false,
            maximum_operations_per_request: default_maximum_operations(),
            maximum_include_depth: None,
            allow_unknown_query_string_parameters: false,
        }
    }
}

impl ApiOptions {
    /// Defaults overridden by `RESOURCE_API_*` environment variables.
    pub fn load() -> Self {
        let mut options = Self::default();
        options.apply_overrides(|name| env::var(name).ok());
        info!(
            default_page_size = options.default_page_size.get(),
            maximum_operations = options.maximum_operations_per_request,
            "Loaded API options"
        );
        options
    }

    /// Reads a JSON document, then applies environment overrides.
    pub fn from_json(document: &str) -> Result<Self, serde_json::Error> {
        let mut options: Self = serde_json::from_str(document)?;
        options.apply_overrides(|name| env::var(name).ok());
        Ok(options)
    }

    /// Applies overrides from `lookup`. Unparsable values are logged and
    /// ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        override_value(
            &lookup,
            "RESOURCE_API_DEFAULT_PAGE_SIZE",
            &mut self.default_page_size,
        );
        if let Some(raw) = lookup("RESOURCE_API_MAXIMUM_PAGE_SIZE") {
            match raw.parse::<NonZeroU32>() {
                Ok(size) => self.maximum_page_size = Some(size),
                Err(_) => warn!(value = %raw, "Invalid RESOURCE_API_MAXIMUM_PAGE_SIZE value"),
            }
        }
        override_value(
            &lookup,
            "RESOURCE_API_INCLUDE_TOTAL_RESOURCE_COUNT",
            &mut self.include_total_resource_count,
        );
        override_value(
            &lookup,
            "RESOURCE_API_ALLOW_CLIENT_GENERATED_IDS",
            &mut self.allow_client_generated_ids,
        );
        override_value(
            &lookup,
            "RESOURCE_API_MAXIMUM_OPERATIONS_PER_REQUEST",
            &mut self.maximum_operations_per_request,
        );
        if let Some(raw) = lookup("RESOURCE_API_MAXIMUM_INCLUDE_DEPTH") {
            match raw.parse::<usize>() {
                Ok(depth) => self.maximum_include_depth = Some(depth),
                Err(_) => warn!(value = %raw, "Invalid RESOURCE_API_MAXIMUM_INCLUDE_DEPTH value"),
            }
        }
        override_value(
            &lookup,
            "RESOURCE_API_ALLOW_UNKNOWN_QUERY_STRING_PARAMETERS",
            &mut self.allow_unknown_query_string_parameters,
        );
    }
}

fn override_value<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
) {
    if let Some(raw) = lookup(name) {
        match raw.parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!(variable = name, value = %raw, "Invalid option value, keeping default"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let options = ApiOptions::default();
        assert_eq!(options.default_page_size.get(), 10);
        assert_eq!(options.maximum_page_size, None);
        assert!(options.include_total_resource_count);
        assert!(!options.allow_client_generated_ids);
        assert_eq!(options.maximum_operations_per_request, 10);
        assert_eq!(options.maximum_include_depth, None);
        assert!(!options.allow_unknown_query_string_parameters);
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let options: ApiOptions =
            serde_json::from_str(r#"{"default_page_size": 25, "allow_client_generated_ids": true}"#)
                .unwrap();
        assert_eq!(options.default_page_size.get(), 25);
        assert!(options.allow_client_generated_ids);
        assert_eq!(options.maximum_operations_per_request, 10);
    }

    #[test]
    fn overrides_skip_invalid_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("RESOURCE_API_DEFAULT_PAGE_SIZE", "0"),
            ("RESOURCE_API_MAXIMUM_PAGE_SIZE", "100"),
            ("RESOURCE_API_MAXIMUM_OPERATIONS_PER_REQUEST", "many"),
            ("RESOURCE_API_MAXIMUM_INCLUDE_DEPTH", "3"),
            ("RESOURCE_API_INCLUDE_TOTAL_RESOURCE_COUNT", "false"),
        ]);
        let mut options = ApiOptions::default();
        options.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(options.default_page_size.get(), 10);
        assert_eq!(options.maximum_page_size.map(NonZeroU32::get), Some(100));
        assert_eq!(options.maximum_operations_per_request, 10);
        assert_eq!(options.maximum_include_depth, Some(3));
        assert!(!options.include_total_resource_count);
    }
}
