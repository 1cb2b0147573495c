//! Train Module - Config-driven training for the policy/value network
//!
//! - TrainArgs: config path plus `key=value` overrides
//! - checkpoint: weights and training-state sidecars
//! - trainer: epoch loop, validation, callbacks, resume
//! - pipeline: builds every component from a `LoadedConfig` and runs `fit`

pub mod args;
pub mod checkpoint;
pub mod pipeline;
pub mod trainer;

pub use args::TrainArgs;
pub use pipeline::{instantiate, print_config, run, train, Components};
pub use trainer::{FitSummary, Trainer, TrainerSpec};
