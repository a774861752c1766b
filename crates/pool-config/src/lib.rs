//! Pool Configuration
//!
//! Declarative node pool templates for kube-pool-manager:
//! - `template`: YAML data model and compilation into immutable pools
//! - `jsonpath`: attribute path extraction against node objects
//! - `selector`: literal/regex predicates evaluated per node
//! - `patch`: JSON patch (RFC6902) construction for matched pools

/// Error types
pub mod error;
/// Attribute path extraction
pub mod jsonpath;
/// JSON patch construction
pub mod patch;
/// Selector evaluation
pub mod selector;
/// Pool template model
pub mod template;

pub use error::*;
pub use jsonpath::JsonPath;
pub use patch::*;
pub use selector::*;
pub use template::*;
