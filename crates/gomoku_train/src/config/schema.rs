//! Typed view of the run document.
//!
//! Component sections stay loose (`TargetConfig`) at this level; the registry
//! turns each one into the parameter struct of the component it names.

use std::path::PathBuf;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use super::ConfigError;

/// A `_target_` plus the sibling keys that parameterize it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(rename = "_target_", default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(flatten)]
    pub params: Mapping,
}

impl TargetConfig {
    pub fn target(&self, path: &str) -> Result<&str, ConfigError> {
        self.target
            .as_deref()
            .ok_or_else(|| ConfigError::MissingTarget {
                path: path.to_string(),
            })
    }

    /// Deserializes the sibling keys into a component's parameter struct.
    pub fn params<T: DeserializeOwned>(&self, path: &str) -> Result<T, ConfigError> {
        serde_yaml::from_value(Value::Mapping(self.params.clone())).map_err(|source| {
            ConfigError::Schema {
                path: path.to_string(),
                source,
            }
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LitModelConfig {
    #[serde(rename = "_target_", default)]
    pub target: Option<String>,
    pub board_size: usize,
    pub models_config: IndexMap<String, TargetConfig>,
    pub optimizer_config: TargetConfig,
    #[serde(default)]
    pub scheduler_config: Option<TargetConfig>,
    #[serde(default)]
    pub use_weights_path: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub lit_model: LitModelConfig,
    #[serde(default)]
    pub callbacks: Option<IndexMap<String, TargetConfig>>,
    pub logger: TargetConfig,
    pub datamodule: TargetConfig,
    pub trainer: TargetConfig,
    #[serde(default)]
    pub ckpt_path: Option<PathBuf>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub instantiate_only: bool,
}

impl RunConfig {
    pub fn from_tree(tree: &Value) -> Result<Self, ConfigError> {
        serde_yaml::from_value(tree.clone()).map_err(|source| ConfigError::Schema {
            path: "config".to_string(),
            source,
        })
    }
}
