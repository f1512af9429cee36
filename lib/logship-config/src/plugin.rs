use std::collections::HashSet;

use regex::Regex;
use serde::{de::Error, Deserialize, Deserializer};
use serde_with::{serde_as, DeserializeAs};

use crate::de::{CommaSeparatedSet, JsonString, RegexString};

fn default_dynamic_host_regex() -> Regex {
    // Matches everything, so it always compiles.
    Regex::new(".*").expect("default dynamic host regex must be valid")
}

/// Routing and label handling configuration.
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct PluginConfiguration {
    /// Label keys kept as native labels when packing.
    ///
    /// When empty, entries are forwarded without packing.
    #[serde(rename = "PreservedLabels", default)]
    #[serde_as(as = "CommaSeparatedSet")]
    pub preserved_labels: HashSet<String>,

    /// Where the dynamic destination of an entry is read from.
    ///
    /// When unset, every entry goes to the main destination.
    #[serde(rename = "DynamicHostPath")]
    #[serde_as(as = "Option<DynamicHostPathString>")]
    pub dynamic_host_path: Option<DynamicHostPath>,

    /// Prepended to the dynamic destination name to build its push URL.
    #[serde(rename = "DynamicHostPrefix", default)]
    pub dynamic_host_prefix: String,

    /// Appended to the dynamic destination name to build its push URL.
    #[serde(rename = "DynamicHostSuffix", default)]
    pub dynamic_host_suffix: String,

    /// Dynamic destination names must match this expression to be routed dynamically.
    ///
    /// Defaults to `.*`.
    #[serde(rename = "DynamicHostRegex", default = "default_dynamic_host_regex")]
    #[serde_as(as = "RegexString")]
    pub dynamic_host_regex: Regex,

    /// Assigns a tenant to entries based on one of their labels.
    #[serde(rename = "DynamicTenant")]
    #[serde_as(as = "Option<DynamicTenantString>")]
    pub dynamic_tenant: Option<DynamicTenant>,
}

impl Default for PluginConfiguration {
    fn default() -> Self {
        Self {
            preserved_labels: HashSet::new(),
            dynamic_host_path: None,
            dynamic_host_prefix: String::new(),
            dynamic_host_suffix: String::new(),
            dynamic_host_regex: default_dynamic_host_regex(),
            dynamic_tenant: None,
        }
    }
}

/// Location of the dynamic destination name within an entry.
///
/// Configured as a JSON object forming a single chain of nested keys, such as
/// `{"kubernetes": {"namespace_name": "namespace"}}`. The chain documents where the collector nests the field in the
/// original record; the string at its end is the label key the destination name is read from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DynamicHostPath {
    /// Nested keys leading to the leaf.
    pub path: Vec<String>,

    /// Label key holding the destination name.
    pub label: String,
}

impl DynamicHostPath {
    /// Builds a path from its JSON form.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, String> {
        let mut path = Vec::new();
        let mut current = value;
        loop {
            match current {
                serde_json::Value::String(label) if !path.is_empty() => {
                    return Ok(Self {
                        path,
                        label: label.clone(),
                    })
                }
                serde_json::Value::Object(map) if map.len() == 1 => {
                    // Length was checked above.
                    let (key, next) = map.iter().next().expect("map has exactly one entry");
                    path.push(key.clone());
                    current = next;
                }
                _ => {
                    return Err(format!(
                        "dynamic host path must be a chain of single-key objects ending in a label key, got '{}'",
                        value
                    ))
                }
            }
        }
    }
}

struct DynamicHostPathString;

impl<'de> DeserializeAs<'de, DynamicHostPath> for DynamicHostPathString {
    fn deserialize_as<D>(deserializer: D) -> Result<DynamicHostPath, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = JsonString::deserialize_as(deserializer)?;
        DynamicHostPath::from_json(&value).map_err(Error::custom)
    }
}

/// Assigns a tenant to entries whose label matches an expression.
///
/// Configured as `<tenant> <label> <regex>`. Everything after the label key is the expression, so it may contain
/// spaces.
#[derive(Clone, Debug)]
pub struct DynamicTenant {
    /// Tenant assigned to matching entries.
    pub tenant: String,

    /// Label key the expression is matched against.
    pub field: String,

    /// Expression the label value has to match.
    pub regex: Regex,

    /// Whether the tenant is dropped again when a matching entry falls back to the main destination.
    ///
    /// Set through `RemoveTenantIdWhenSendingToDefaultURL`. Defaults to `true`.
    pub remove_tenant_id_when_sending_to_default_url: bool,
}

impl DynamicTenant {
    /// Parses the `<tenant> <label> <regex>` form.
    pub fn parse(value: &str) -> Result<Self, String> {
        let malformed = || format!("expected '<tenant> <label> <regex>', got '{}'", value.trim());

        let (tenant, rest) = value.trim().split_once(char::is_whitespace).ok_or_else(malformed)?;
        let (field, pattern) = rest.trim_start().split_once(char::is_whitespace).ok_or_else(malformed)?;

        // The expression is taken verbatim, whitespace included.
        let pattern = pattern.trim_start();
        if pattern.is_empty() {
            return Err(malformed());
        }

        let regex = Regex::new(pattern).map_err(|e| format!("invalid regular expression '{}': {}", pattern, e))?;

        Ok(Self {
            tenant: tenant.to_string(),
            field: field.to_string(),
            regex,
            remove_tenant_id_when_sending_to_default_url: true,
        })
    }
}

struct DynamicTenantString;

impl<'de> DeserializeAs<'de, DynamicTenant> for DynamicTenantString {
    fn deserialize_as<D>(deserializer: D) -> Result<DynamicTenant, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        DynamicTenant::parse(&value).map_err(Error::custom)
    }
}
