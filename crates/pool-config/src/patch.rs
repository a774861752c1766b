//! JSON patch construction
//!
//! Builds the RFC6902 operations that bring a node in line with a matched
//! pool. Operations are keyed by their JSON pointer so a patch set never
//! touches the same path twice; later insertions win.

use crate::template::{ConfigSource, PoolTemplate, ValueMap};
use k8s_openapi::api::core::v1::Node;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, btree_map};

/// Label prefix under which pool roles are materialized.
pub const ROLE_LABEL_PREFIX: &str = "node-role.kubernetes.io/";

/// JSON pointer of the node labels map.
pub const LABELS_PATH: &str = "/metadata/labels";

/// JSON pointer of the node annotations map.
pub const ANNOTATIONS_PATH: &str = "/metadata/annotations";

/// JSON pointer of the kubelet configuration source.
pub const CONFIG_SOURCE_PATH: &str = "/spec/configSource";

/// Escapes a raw key for use as a JSON pointer segment (`~` → `~0`, `/` → `~1`).
#[must_use]
pub fn escape_path_segment(raw: &str) -> String {
    raw.replace('~', "~0").replace('/', "~1")
}

/// Single JSON patch operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    /// Set `path` to `value`
    Replace { path: String, value: Value },
    /// Delete `path`
    Remove { path: String },
}

impl PatchOperation {
    /// Sets `path` to `value`.
    #[must_use]
    pub fn replace(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Replace {
            path: path.into(),
            value: value.into(),
        }
    }

    /// Removes `path`.
    #[must_use]
    pub fn remove(path: impl Into<String>) -> Self {
        Self::Remove { path: path.into() }
    }

    /// Target JSON pointer.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Replace { path, .. } | Self::Remove { path } => path,
        }
    }
}

/// Patch operations keyed by JSON pointer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSet {
    operations: BTreeMap<String, PatchOperation>,
}

impl PatchSet {
    /// Empty patch set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an operation, replacing any earlier one for the same path.
    pub fn insert(&mut self, operation: PatchOperation) {
        self.operations.insert(operation.path().to_string(), operation);
    }

    /// Merges `other` into this set; operations of `other` win.
    pub fn merge(&mut self, other: Self) {
        self.operations.extend(other.operations);
    }

    /// True when nothing would be patched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Operation for the JSON pointer `path`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&PatchOperation> {
        self.operations.get(path)
    }

    /// Operations ordered by path.
    pub fn operations(&self) -> btree_map::Values<'_, String, PatchOperation> {
        self.operations.values()
    }

    /// Wire form: a JSON array of operations.
    ///
    /// # Errors
    ///
    /// Returns an error if an operation cannot be serialized.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self.operations().collect::<Vec<_>>())
    }

    /// Typed RFC6902 patch, as submitted to the API server.
    ///
    /// # Errors
    ///
    /// Returns an error if the wire form is not a valid JSON patch document.
    pub fn to_json_patch(&self) -> Result<json_patch::Patch, serde_json::Error> {
        serde_json::from_value(self.to_json()?)
    }
}

impl FromIterator<PatchOperation> for PatchSet {
    fn from_iter<T: IntoIterator<Item = PatchOperation>>(iter: T) -> Self {
        let mut set = Self::new();
        for operation in iter {
            set.insert(operation);
        }
        set
    }
}

impl PoolTemplate {
    /// Computes the operations this pool requires on `node`.
    ///
    /// Entries with a value are always written; entries without a value are
    /// removed only if the node currently carries them. The config source,
    /// when configured, is always written.
    #[must_use]
    pub fn patch_set(&self, node: &Node) -> PatchSet {
        let mut patch_set = PatchSet::new();
        let labels = node.metadata.labels.as_ref();
        let annotations = node.metadata.annotations.as_ref();

        let roles = self
            .node
            .roles
            .iter()
            .map(|(role, value)| (format!("{ROLE_LABEL_PREFIX}{role}"), value));
        for (label, value) in roles {
            add_entry(
                &mut patch_set,
                LABELS_PATH,
                &label,
                value,
                labels.is_some_and(|l| l.contains_key(&label)),
            );
        }

        if let Some(config_source) = &self.node.config_source {
            patch_set.insert(PatchOperation::replace(
                CONFIG_SOURCE_PATH,
                config_source_value(config_source),
            ));
        }

        add_entries(&mut patch_set, LABELS_PATH, &self.node.labels, |key| {
            labels.is_some_and(|l| l.contains_key(key))
        });
        add_entries(&mut patch_set, ANNOTATIONS_PATH, &self.node.annotations, |key| {
            annotations.is_some_and(|a| a.contains_key(key))
        });

        patch_set
    }
}

fn add_entries(
    patch_set: &mut PatchSet,
    base: &str,
    entries: &ValueMap,
    exists: impl Fn(&str) -> bool,
) {
    for (key, value) in entries.iter() {
        add_entry(patch_set, base, key, value, exists(key));
    }
}

fn add_entry(patch_set: &mut PatchSet, base: &str, key: &str, value: Option<&str>, exists: bool) {
    let path = format!("{base}/{}", escape_path_segment(key));
    match value {
        Some(value) => patch_set.insert(PatchOperation::replace(path, value)),
        None if exists => patch_set.insert(PatchOperation::remove(path)),
        None => {}
    }
}

fn config_source_value(source: &ConfigSource) -> Value {
    json!({
        "configMap": {
            "name": source.config_map.name,
            "namespace": source.config_map.namespace,
            "kubeletConfigKey": source.config_map.kubelet_config_key,
        }
    })
}
