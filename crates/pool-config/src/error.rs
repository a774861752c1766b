//! Pool configuration errors

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading and compiling pool templates.
///
/// All of these are detected once at startup; a running controller never
/// sees them.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Configuration file could not be read
    #[error("failed to read pool configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration document is not valid YAML for the pool schema
    #[error("failed to parse pool configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Selector path expression is malformed
    #[error("pool \"{pool}\": {source}")]
    PathSyntax {
        pool: String,
        #[source]
        source: PathSyntaxError,
    },

    /// Selector regular expression does not compile
    #[error("pool \"{pool}\": invalid selector regexp {pattern:?}: {source}")]
    RegexCompile {
        pool: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Two pools share the same name
    #[error("duplicate pool name \"{0}\"")]
    DuplicatePool(String),

    /// Pool has an empty name
    #[error("pool at index {0} has no name")]
    MissingName(usize),
}

/// Malformed attribute path expression.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid selector path {path:?}: {reason}")]
pub struct PathSyntaxError {
    /// Path expression as written in the configuration
    pub path: String,
    /// What is wrong with it
    pub reason: String,
}

impl PathSyntaxError {
    pub(crate) fn new(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while evaluating selectors against a node.
#[derive(Debug, Error)]
pub enum SelectorError {
    /// Node could not be rendered into its JSON form for path extraction
    #[error("failed to serialize node for selector evaluation: {0}")]
    NodeSerialization(#[from] serde_json::Error),
}
