//! Training Arguments - Config file plus command-line overrides

use std::path::PathBuf;

use clap::Args;

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    /// Run configuration (YAML).
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Overrides: `key.path=value`, `+new.key=value`, `~key.to.delete`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub overrides: Vec<String>,
}
