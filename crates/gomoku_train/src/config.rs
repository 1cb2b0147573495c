//! Run configuration - YAML document, overrides and interpolation
//!
//! Loading goes: read YAML -> apply overrides -> resolve `${...}` ->
//! deserialize `RunConfig` -> resolve every `_target_` into a `RunSpec`.
//! Any failure along the way surfaces as a `ConfigError` before a single
//! component is constructed.

pub mod error;
pub mod interpolate;
pub mod overrides;
pub mod schema;

use std::path::Path;

use serde_yaml::Value;

pub use error::ConfigError;
pub use overrides::Override;
pub use schema::{LitModelConfig, RunConfig, TargetConfig};

use crate::registry::{self, RunSpec};

pub const DEFAULT_CONFIG_PATH: &str = "conf/config.yaml";

/// A fully resolved run configuration.
#[derive(Clone, Debug)]
pub struct LoadedConfig {
    /// The document after overrides and interpolation, as logged and dumped.
    pub tree: Value,
    pub run: RunConfig,
    pub spec: RunSpec,
}

impl LoadedConfig {
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.tree).map_err(|source| ConfigError::Yaml {
            origin: "resolved config".to_string(),
            source,
        })
    }
}

pub fn load<S: AsRef<str>>(path: &Path, overrides: &[S]) -> Result<LoadedConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!("Loading run config from {}", path.display());
    from_str(&text, &path.display().to_string(), overrides)
}

pub fn from_str<S: AsRef<str>>(
    text: &str,
    origin: &str,
    overrides: &[S],
) -> Result<LoadedConfig, ConfigError> {
    let mut raw: Value = serde_yaml::from_str(text).map_err(|source| ConfigError::Yaml {
        origin: origin.to_string(),
        source,
    })?;
    overrides::apply_all(&mut raw, overrides)?;

    let tree = interpolate::resolve(&raw)?;
    let run = RunConfig::from_tree(&tree)?;
    let spec = registry::build(&run)?;
    Ok(LoadedConfig { tree, run, spec })
}
