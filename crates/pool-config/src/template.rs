//! Pool templates
//!
//! Defines the YAML configuration document and its compiled, immutable form.
//!
//! ```yaml
//! pools:
//!   - pool: workers
//!     continue: true
//!     selector:
//!       - path: "{.metadata.labels.kubernetes\\.io/role}"
//!         match: worker
//!     node:
//!       roles: [worker]
//!       labels:
//!         env: prod
//!         legacy: ~
//! ```

use crate::error::TemplateError;
use crate::jsonpath::JsonPath;
use crate::selector::{Predicate, Selector};
use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Raw pool configuration document.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    /// Pool templates, evaluated in order
    #[serde(default)]
    pub pools: Vec<PoolTemplateSpec>,
}

/// Raw pool template as written in the configuration file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct PoolTemplateSpec {
    /// Pool name, used in logs and metrics
    #[serde(rename = "pool")]
    pub name: String,

    /// Keep evaluating later pools after this one matched
    #[serde(rename = "continue", default)]
    pub continue_on_match: bool,

    /// Selectors, all of which must match
    #[serde(rename = "selector", default)]
    pub selectors: Vec<SelectorSpec>,

    /// Configuration enforced on matching nodes
    #[serde(default)]
    pub node: NodeSpec,
}

/// Raw selector: attribute path plus literal and/or regex predicate.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct SelectorSpec {
    /// JSONPath-like attribute path, e.g. `{.spec.providerID}`
    pub path: String,

    /// Exact value to compare against
    #[serde(rename = "match", default, deserialize_with = "optional_scalar")]
    pub literal: Option<String>,

    /// Regular expression searched in the value
    #[serde(rename = "regexp", default, deserialize_with = "optional_scalar")]
    pub regex: Option<String>,
}

/// Node configuration enforced by a pool.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Role names, materialized as `node-role.kubernetes.io/<role>` labels
    #[serde(default)]
    pub roles: ValueMap,

    /// Dynamic kubelet configuration source
    #[serde(default)]
    pub config_source: Option<ConfigSource>,

    /// Node labels
    #[serde(default)]
    pub labels: ValueMap,

    /// Node annotations
    #[serde(default)]
    pub annotations: ValueMap,
}

/// Kubelet configuration source, patched verbatim into `spec.configSource`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSource {
    /// ConfigMap holding the kubelet configuration
    pub config_map: ConfigMapReference,
}

/// Reference to the kubelet configuration ConfigMap.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapReference {
    /// ConfigMap name
    pub name: String,
    /// ConfigMap namespace
    pub namespace: String,
    /// Key of the kubelet configuration inside the ConfigMap
    pub kubelet_config_key: String,
}

/// Key to optional value mapping.
///
/// `Some(value)` sets the key (an empty string is a valid value), `None`
/// removes the key from the node if it is present. The YAML form may be a
/// mapping, or a plain list of keys in which case every key maps to `""`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueMap(BTreeMap<String, Option<String>>);

impl ValueMap {
    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// True when the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Looks up `key`; `Some(None)` means the key is to be removed.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        self.0.get(key).map(Option::as_deref)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, Option<V>)> for ValueMap {
    fn from_iter<T: IntoIterator<Item = (K, Option<V>)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.map(Into::into)))
                .collect(),
        )
    }
}

impl<'de> Deserialize<'de> for ValueMap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match serde_yaml::Value::deserialize(deserializer)? {
            serde_yaml::Value::Null => Ok(Self::default()),
            serde_yaml::Value::Mapping(map) => map
                .into_iter()
                .map(|(key, value)| {
                    let key = scalar_to_string(key)?
                        .ok_or_else(|| "map keys must not be null".to_string())?;
                    Ok((key, scalar_to_string(value)?))
                })
                .collect::<Result<_, String>>()
                .map(Self)
                .map_err(D::Error::custom),
            serde_yaml::Value::Sequence(keys) => keys
                .into_iter()
                .map(|key| {
                    scalar_to_string(key)?
                        .map(|key| (key, Some(String::new())))
                        .ok_or_else(|| "list entries must not be null".to_string())
                })
                .collect::<Result<_, String>>()
                .map(Self)
                .map_err(D::Error::custom),
            other => Err(D::Error::custom(format!(
                "expected a mapping or a list of keys, found {}",
                yaml_kind(&other)
            ))),
        }
    }
}

/// Reads an optional YAML scalar as text, the way untyped string fields load.
fn optional_scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    scalar_to_string(serde_yaml::Value::deserialize(deserializer)?).map_err(D::Error::custom)
}

/// Renders a YAML scalar as text: strings verbatim, booleans and numbers in
/// their YAML spelling, null as `None`. Collections are rejected.
fn scalar_to_string(value: serde_yaml::Value) -> Result<Option<String>, String> {
    match value {
        serde_yaml::Value::Null => Ok(None),
        serde_yaml::Value::Bool(b) => Ok(Some(b.to_string())),
        serde_yaml::Value::Number(n) => Ok(Some(n.to_string())),
        serde_yaml::Value::String(s) => Ok(Some(s)),
        serde_yaml::Value::Tagged(tagged) => scalar_to_string(tagged.value),
        other => Err(format!("expected a scalar value, found {}", yaml_kind(&other))),
    }
}

fn yaml_kind(value: &serde_yaml::Value) -> &'static str {
    match value {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "a boolean",
        serde_yaml::Value::Number(_) => "a number",
        serde_yaml::Value::String(_) => "a string",
        serde_yaml::Value::Sequence(_) => "a sequence",
        serde_yaml::Value::Mapping(_) => "a mapping",
        serde_yaml::Value::Tagged(_) => "a tagged value",
    }
}

/// Compiled pool template.
///
/// Selectors are compiled when the template is built and never change
/// afterwards, so a template can be evaluated from several tasks at once.
#[derive(Debug, Clone)]
pub struct PoolTemplate {
    /// Pool name
    pub name: String,
    /// Keep evaluating later pools after this one matched
    pub continue_on_match: bool,
    /// Compiled selectors, all of which must match
    pub selectors: Vec<Selector>,
    /// Configuration enforced on matching nodes
    pub node: NodeSpec,
}

impl PoolConfig {
    /// Parses a YAML configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Parse`] if the document does not match the schema.
    pub fn from_yaml(document: &str) -> Result<Self, TemplateError> {
        Ok(serde_yaml::from_str(document)?)
    }

    /// Reads and parses a YAML configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Io`] if the file cannot be read and
    /// [`TemplateError::Parse`] if it is not a valid document.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TemplateError> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&document)
    }

    /// Compiles every pool into its immutable form, preserving order.
    ///
    /// # Errors
    ///
    /// Fails on the first malformed selector path or regex, on an empty
    /// pool name, or on a duplicate pool name.
    pub fn compile(self) -> Result<Arc<[PoolTemplate]>, TemplateError> {
        let mut seen = HashSet::new();
        let mut pools = Vec::with_capacity(self.pools.len());

        for (index, spec) in self.pools.into_iter().enumerate() {
            if spec.name.trim().is_empty() {
                return Err(TemplateError::MissingName(index));
            }
            if !seen.insert(spec.name.clone()) {
                return Err(TemplateError::DuplicatePool(spec.name));
            }
            pools.push(PoolTemplate::compile(spec)?);
        }

        Ok(pools.into())
    }
}

impl PoolTemplate {
    /// Compiles a raw template.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::PathSyntax`] or [`TemplateError::RegexCompile`]
    /// for the first selector that does not compile.
    pub fn compile(spec: PoolTemplateSpec) -> Result<Self, TemplateError> {
        let selectors = spec
            .selectors
            .into_iter()
            .map(|selector| compile_selector(&spec.name, selector))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(pool = %spec.name, selectors = selectors.len(), "Compiled pool template");

        Ok(Self {
            name: spec.name,
            continue_on_match: spec.continue_on_match,
            selectors,
            node: spec.node,
        })
    }
}

fn compile_selector(pool: &str, spec: SelectorSpec) -> Result<Selector, TemplateError> {
    let path = JsonPath::parse(&spec.path).map_err(|source| TemplateError::PathSyntax {
        pool: pool.to_string(),
        source,
    })?;

    let regex = spec
        .regex
        .map(|pattern| {
            Regex::new(&pattern).map_err(|source| TemplateError::RegexCompile {
                pool: pool.to_string(),
                pattern: pattern.clone(),
                source,
            })
        })
        .transpose()?;

    let predicate = match (spec.literal, regex) {
        (Some(literal), Some(regex)) => Predicate::Either { literal, regex },
        (Some(literal), None) => Predicate::Literal(literal),
        (None, Some(regex)) => Predicate::Regex(regex),
        (None, None) => Predicate::Never,
    };

    Ok(Selector::new(path, predicate))
}
