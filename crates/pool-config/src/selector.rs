//! Selector matching
//!
//! A pool matches a node when every one of its selectors matches. A selector
//! matches when its path resolves to exactly one value and that value
//! satisfies the literal or the regex predicate.

use crate::error::SelectorError;
use crate::jsonpath::JsonPath;
use crate::template::PoolTemplate;
use k8s_openapi::api::core::v1::Node;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

/// Predicate applied to the single value a selector path resolves to.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// Exact string equality
    Literal(String),
    /// Unanchored regex search
    Regex(Regex),
    /// Literal equality or regex search, either is sufficient
    Either { literal: String, regex: Regex },
    /// Neither predicate configured; the selector never matches
    Never,
}

impl Predicate {
    /// Evaluates the predicate against a rendered value.
    #[must_use]
    pub fn is_satisfied_by(&self, value: &str) -> bool {
        match self {
            Self::Literal(literal) => value == literal,
            Self::Regex(regex) => regex.is_match(value),
            Self::Either { literal, regex } => value == literal || regex.is_match(value),
            Self::Never => false,
        }
    }
}

/// Compiled selector.
#[derive(Debug, Clone)]
pub struct Selector {
    path: JsonPath,
    predicate: Predicate,
}

impl Selector {
    /// Pairs a compiled path with its predicate.
    #[must_use]
    pub fn new(path: JsonPath, predicate: Predicate) -> Self {
        Self { path, predicate }
    }

    /// Attribute path.
    #[must_use]
    pub fn path(&self) -> &JsonPath {
        &self.path
    }

    /// Value predicate.
    #[must_use]
    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    /// Evaluates the selector against a node view.
    ///
    /// Zero or several extracted values never match.
    #[must_use]
    pub fn matches(&self, node: &NodeView) -> bool {
        let values = self.path.extract(node.json());
        let [value] = values.as_slice() else {
            debug!(
                node = %node.name(),
                path = %self.path,
                found = values.len(),
                "Selector path did not resolve to exactly one value"
            );
            return false;
        };

        let rendered = render_value(value);
        let matched = self.predicate.is_satisfied_by(&rendered);
        if !matched {
            debug!(
                node = %node.name(),
                path = %self.path,
                value = %rendered,
                predicate = ?self.predicate,
                "Selector value did not match"
            );
        }
        matched
    }
}

/// JSON form of a node, built once and shared by every selector evaluated
/// against it.
#[derive(Debug, Clone)]
pub struct NodeView {
    name: String,
    json: Value,
}

impl NodeView {
    /// Renders `node` into its Kubernetes JSON representation.
    ///
    /// # Errors
    ///
    /// Returns [`SelectorError::NodeSerialization`] if the node cannot be serialized.
    pub fn new(node: &Node) -> Result<Self, SelectorError> {
        Ok(Self {
            name: node.metadata.name.clone().unwrap_or_default(),
            json: serde_json::to_value(node)?,
        })
    }

    /// Wraps an already rendered node object.
    #[must_use]
    pub fn from_json(json: Value) -> Self {
        let name = json
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self { name, json }
    }

    /// Node name, empty when unset.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node in its JSON form.
    #[must_use]
    pub fn json(&self) -> &Value {
        &self.json
    }
}

impl PoolTemplate {
    /// Returns whether every selector of the pool matches `node`.
    ///
    /// # Errors
    ///
    /// Returns [`SelectorError`] if the node cannot be rendered for
    /// evaluation. A path that finds no value is a non-match, not an error.
    pub fn matches(&self, node: &Node) -> Result<bool, SelectorError> {
        Ok(self.matches_view(&NodeView::new(node)?))
    }

    /// Same as [`PoolTemplate::matches`] against a prepared view.
    #[must_use]
    pub fn matches_view(&self, node: &NodeView) -> bool {
        self.selectors.iter().all(|selector| selector.matches(node))
    }
}

/// Renders an extracted value the way it is compared: strings verbatim,
/// everything else as compact JSON text.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
