//! Errors raised while loading, resolving or instantiating a run config.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid YAML in {origin}: {source}")]
    Yaml {
        origin: String,
        source: serde_yaml::Error,
    },

    #[error("interpolation ${{{key}}} refers to a missing key")]
    MissingKey { key: String },

    #[error("interpolation cycle through ${{{key}}}")]
    Cycle { key: String },

    #[error("${{{key}}} is not a scalar and cannot be embedded in \"{text}\"")]
    NonScalarEmbed { key: String, text: String },

    #[error("unterminated interpolation in \"{0}\"")]
    Unterminated(String),

    #[error("bad override '{0}': expected key=value, +key=value or ~key")]
    BadOverride(String),

    #[error("cannot override '{0}': key does not exist (use +{0}=...)")]
    OverrideMissing(String),

    #[error("cannot add '{0}': key already exists")]
    OverrideExists(String),

    #[error("{path}: {source}")]
    Schema {
        path: String,
        source: serde_yaml::Error,
    },

    #[error("{path}: missing _target_")]
    MissingTarget { path: String },

    #[error("{path}: unknown {kind} target '{target}'")]
    UnknownTarget {
        path: String,
        kind: String,
        target: String,
    },

    #[error("{path}: {message}")]
    InvalidValue { path: String, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            path: path.into(),
            message: message.into(),
        }
    }
}
