//! Rule loading errors.

use std::path::PathBuf;

use thiserror::Error;

/// A rule directory or file that cannot be loaded. Loading is all-or-nothing.
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to walk rule directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("{origin}: invalid YAML: {source}")]
    Yaml {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{origin}: bad pattern '{pattern}': {source}")]
    Pattern {
        origin: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("{origin}: {reason}")]
    Invalid { origin: String, reason: String },
}

pub type Result<T> = std::result::Result<T, RuleError>;
