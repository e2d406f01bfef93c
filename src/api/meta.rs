//! Shared metadata types for manifest objects

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Object metadata: name, namespace, and labels.
///
/// A trimmed-down analog of Kubernetes object metadata; the controller only
/// relies on identity and labels.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    /// Object name, unique within its namespace
    pub name: String,

    /// Namespace; empty means "default"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    /// Free-form labels (group index, role, owning run)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Meta {
    /// Construct metadata with a name in the default namespace.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// The `namespace/name` key used for indexing.
    pub fn key(&self) -> String {
        namespaced_key(&self.namespace, &self.name)
    }
}

/// Reference to a Run by name and namespace.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunReference {
    /// Referenced run name
    pub name: String,
    /// Referenced run namespace
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

impl RunReference {
    /// The `namespace/name` key of the referenced run.
    pub fn key(&self) -> String {
        namespaced_key(&self.namespace, &self.name)
    }
}

/// Builds the `namespace/name` index key; an empty namespace maps to
/// `default` so keys from manifests and in-process objects agree.
pub fn namespaced_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        return format!("default/{name}");
    }
    format!("{namespace}/{name}")
}
