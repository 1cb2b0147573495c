//! Registry - `_target_` resolution
//!
//! A target is matched on its last path segment, so `src.utils.models.FlatModel`,
//! `gomoku_engine::models::FlatModel` and `FlatModel` name the same component.
//! `build` checks every section of a `RunConfig` and produces the typed
//! `RunSpec` the pipeline instantiates from.

use std::fmt;
use std::path::PathBuf;

use gomoku_engine::models::ConvModel;
use gomoku_engine::{ModelKind, ModelSpec};
use indexmap::IndexMap;
use serde::Deserialize;

use crate::callbacks::{CallbackSpec, CheckpointParams, LrMonitorParams};
use crate::config::{ConfigError, RunConfig, TargetConfig};
use crate::data::DataParams;
use crate::lit_model::{LitModelSpec, PRIMARY_MODEL};
use crate::logger::{LoggerParams, LoggerSpec};
use crate::optim::{AdamParams, CosineParams, OptimizerSpec, SchedulerSpec, SgdParams, StepParams};
use crate::train::trainer::{TrainerParams, TrainerSpec};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    LitModel,
    Model,
    Optimizer,
    Scheduler,
    Callback,
    Logger,
    DataModule,
    Trainer,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::LitModel => "lit model",
            Kind::Model => "model",
            Kind::Optimizer => "optimizer",
            Kind::Scheduler => "scheduler",
            Kind::Callback => "callback",
            Kind::Logger => "logger",
            Kind::DataModule => "data module",
            Kind::Trainer => "trainer",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    LitModel,
    FlatModel,
    ConvModel,
    Adam,
    AdamW,
    Sgd,
    CosineAnnealingLR,
    StepLR,
    ModelCheckpoint,
    LearningRateMonitor,
    MetricsLogger,
    DataModule,
    Trainer,
}

const TARGETS: &[(&str, Kind, Target)] = &[
    ("LitModel", Kind::LitModel, Target::LitModel),
    ("FlatModel", Kind::Model, Target::FlatModel),
    ("ConvModel", Kind::Model, Target::ConvModel),
    ("Adam", Kind::Optimizer, Target::Adam),
    ("AdamW", Kind::Optimizer, Target::AdamW),
    ("SGD", Kind::Optimizer, Target::Sgd),
    ("CosineAnnealingLR", Kind::Scheduler, Target::CosineAnnealingLR),
    ("StepLR", Kind::Scheduler, Target::StepLR),
    ("ModelCheckpoint", Kind::Callback, Target::ModelCheckpoint),
    ("LearningRateMonitor", Kind::Callback, Target::LearningRateMonitor),
    ("MetricsLogger", Kind::Logger, Target::MetricsLogger),
    ("WandbLogger", Kind::Logger, Target::MetricsLogger),
    ("CSVLogger", Kind::Logger, Target::MetricsLogger),
    ("DataModule", Kind::DataModule, Target::DataModule),
    ("Trainer", Kind::Trainer, Target::Trainer),
];

/// `a.b.C` / `a::b::C` -> `C`.
pub fn short_name(target: &str) -> &str {
    target
        .rsplit(['.', ':'])
        .next()
        .unwrap_or(target)
        .trim()
}

pub fn resolve(kind: Kind, target: &str, path: &str) -> Result<Target, ConfigError> {
    let name = short_name(target);
    TARGETS
        .iter()
        .find(|(n, k, _)| *n == name && *k == kind)
        .map(|(_, _, t)| *t)
        .ok_or_else(|| ConfigError::UnknownTarget {
            path: path.to_string(),
            kind: kind.to_string(),
            target: target.to_string(),
        })
}

/// Everything a run needs, checked and typed; no tensors or files yet.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSpec {
    pub lit_model: LitModelSpec,
    pub callbacks: Vec<(String, CallbackSpec)>,
    pub logger: LoggerSpec,
    pub datamodule: DataParams,
    pub trainer: TrainerSpec,
    pub ckpt_path: Option<PathBuf>,
    pub seed: Option<u64>,
    pub instantiate_only: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelParams {
    size: usize,
}

fn model_spec(cfg: &TargetConfig, path: &str, board_size: usize) -> Result<ModelSpec, ConfigError> {
    let kind = match resolve(Kind::Model, cfg.target(path)?, path)? {
        Target::ConvModel => ModelKind::ConvModel,
        _ => ModelKind::FlatModel,
    };
    let ModelParams { size } = cfg.params(path)?;
    if size != board_size {
        return Err(ConfigError::invalid(
            path,
            format!("size {size} does not match lit_model.board_size {board_size}"),
        ));
    }
    if kind == ModelKind::ConvModel && size < ConvModel::min_size() {
        return Err(ConfigError::invalid(
            path,
            format!("ConvModel needs a board of at least {}, got {size}", ConvModel::min_size()),
        ));
    }
    Ok(ModelSpec { kind, size })
}

fn optimizer_spec(cfg: &TargetConfig, path: &str) -> Result<OptimizerSpec, ConfigError> {
    let spec = match resolve(Kind::Optimizer, cfg.target(path)?, path)? {
        Target::AdamW => OptimizerSpec::AdamW(cfg.params::<AdamParams>(path)?),
        Target::Sgd => OptimizerSpec::Sgd(cfg.params::<SgdParams>(path)?),
        _ => OptimizerSpec::Adam(cfg.params::<AdamParams>(path)?),
    };
    spec.validate(path)?;
    Ok(spec)
}

fn scheduler_spec(cfg: &TargetConfig, path: &str) -> Result<SchedulerSpec, ConfigError> {
    let spec = match resolve(Kind::Scheduler, cfg.target(path)?, path)? {
        Target::StepLR => SchedulerSpec::Step(cfg.params::<StepParams>(path)?),
        _ => SchedulerSpec::CosineAnnealing(cfg.params::<CosineParams>(path)?),
    };
    spec.validate(path)?;
    Ok(spec)
}

fn callback_spec(cfg: &TargetConfig, path: &str) -> Result<CallbackSpec, ConfigError> {
    match resolve(Kind::Callback, cfg.target(path)?, path)? {
        Target::LearningRateMonitor => Ok(CallbackSpec::LearningRateMonitor(
            cfg.params::<LrMonitorParams>(path)?,
        )),
        _ => {
            let params: CheckpointParams = cfg.params(path)?;
            params.validate(path)?;
            Ok(CallbackSpec::ModelCheckpoint(params))
        }
    }
}

fn lit_model_spec(run: &RunConfig) -> Result<LitModelSpec, ConfigError> {
    let cfg = &run.lit_model;
    if let Some(target) = &cfg.target {
        resolve(Kind::LitModel, target, "lit_model")?;
    }
    if cfg.board_size == 0 || cfg.board_size > gomoku_engine::board::MAX_BOARD_SIZE {
        return Err(ConfigError::invalid(
            "lit_model.board_size",
            format!(
                "must be between 1 and {}, got {}",
                gomoku_engine::board::MAX_BOARD_SIZE,
                cfg.board_size
            ),
        ));
    }
    if !cfg.models_config.contains_key(PRIMARY_MODEL) {
        return Err(ConfigError::invalid(
            "lit_model.models_config",
            format!("a '{PRIMARY_MODEL}' entry is required"),
        ));
    }

    let mut models = IndexMap::new();
    for (name, model_cfg) in &cfg.models_config {
        let path = format!("lit_model.models_config.{name}");
        models.insert(name.clone(), model_spec(model_cfg, &path, cfg.board_size)?);
    }
    let scheduler = cfg
        .scheduler_config
        .as_ref()
        .map(|s| scheduler_spec(s, "lit_model.scheduler_config"))
        .transpose()?;

    Ok(LitModelSpec {
        board_size: cfg.board_size,
        models,
        optimizer: optimizer_spec(&cfg.optimizer_config, "lit_model.optimizer_config")?,
        scheduler,
        use_weights_path: cfg.use_weights_path.clone(),
    })
}

/// Resolves and checks every component of `run`.
pub fn build(run: &RunConfig) -> Result<RunSpec, ConfigError> {
    let lit_model = lit_model_spec(run)?;

    let mut callbacks = Vec::new();
    for (name, cb) in run.callbacks.iter().flatten() {
        let path = format!("callbacks.{name}");
        callbacks.push((name.clone(), callback_spec(cb, &path)?));
    }

    let target = run.logger.target("logger")?;
    resolve(Kind::Logger, target, "logger")?;
    let logger = LoggerSpec {
        requested: short_name(target).to_string(),
        params: run.logger.params::<LoggerParams>("logger")?,
    };

    resolve(Kind::DataModule, run.datamodule.target("datamodule")?, "datamodule")?;
    let datamodule: DataParams = run.datamodule.params("datamodule")?;
    datamodule.validate("datamodule")?;

    resolve(Kind::Trainer, run.trainer.target("trainer")?, "trainer")?;
    let trainer = run
        .trainer
        .params::<TrainerParams>("trainer")?
        .resolve("trainer")?;

    Ok(RunSpec {
        lit_model,
        callbacks,
        logger,
        datamodule,
        trainer,
        ckpt_path: run.ckpt_path.clone(),
        seed: run.seed,
        instantiate_only: run.instantiate_only,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{self, tests::MINIMAL};

    fn load(overrides: &[&str]) -> Result<config::LoadedConfig, ConfigError> {
        config::from_str(MINIMAL, "inline", overrides)
    }

    #[test]
    fn targets_match_on_last_segment() {
        for t in ["src.utils.models.FlatModel", "gomoku_engine::models::FlatModel", "FlatModel"] {
            assert_eq!(resolve(Kind::Model, t, "m").unwrap(), Target::FlatModel);
        }
        assert_eq!(
            resolve(Kind::Logger, "pytorch_lightning.loggers.WandbLogger", "l").unwrap(),
            Target::MetricsLogger
        );
        assert_eq!(resolve(Kind::Optimizer, "torch.optim.SGD", "o").unwrap(), Target::Sgd);
    }

    #[test]
    fn kind_must_match() {
        let err = resolve(Kind::Optimizer, "torch.optim.lr_scheduler.CosineAnnealingLR", "o")
            .unwrap_err();
        assert!(
            matches!(&err, ConfigError::UnknownTarget { kind, .. } if kind == "optimizer"),
            "{err}"
        );
    }

    #[test]
    fn every_default_target_resolves() {
        let cfg = load(&[]).unwrap();
        let spec = cfg.spec;
        assert_eq!(spec.lit_model.board_size, 8);
        assert!(matches!(spec.lit_model.optimizer, OptimizerSpec::Adam(ref p) if p.lr == 1e-3));
        assert!(spec.lit_model.scheduler.is_none());
        assert_eq!(spec.callbacks.len(), 1);
        assert_eq!(spec.callbacks[0].0, "model_checkpoint");
        assert_eq!(spec.logger.requested, "WandbLogger");
        assert_eq!(spec.datamodule.batch_size, 512);
        assert_eq!(spec.datamodule.num_workers, 8);
        assert_eq!(spec.trainer.max_epochs, 50);
        assert_eq!(spec.seed, Some(123));
        assert!(!spec.instantiate_only);
    }

    #[test]
    fn scheduler_can_be_enabled_by_override() {
        let cfg = load(&[
            "lit_model.scheduler_config={_target_: torch.optim.lr_scheduler.CosineAnnealingLR, T_max: '${trainer.max_epochs}'}",
        ])
        .unwrap();
        assert_eq!(
            cfg.spec.lit_model.scheduler,
            Some(SchedulerSpec::CosineAnnealing(CosineParams {
                t_max: 50,
                eta_min: 0.0
            }))
        );
    }

    #[test]
    fn unknown_target_is_rejected() {
        let err = load(&["lit_model.models_config.model._target_=src.utils.models.ResNet"])
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTarget { .. }), "{err}");
    }

    #[test]
    fn callbacks_require_a_target() {
        let err = load(&["+callbacks.extra.monitor=val_loss"]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingTarget { path } if path == "callbacks.extra"));
    }

    #[test]
    fn type_mismatches_are_schema_errors() {
        let err = load(&["datamodule.batch_size=many"]).unwrap_err();
        assert!(matches!(err, ConfigError::Schema { .. }), "{err}");
        let err = load(&["+datamodule.pin_memory=true"]).unwrap_err();
        assert!(matches!(err, ConfigError::Schema { .. }), "{err}");
    }

    #[test]
    fn invalid_values_are_rejected() {
        for o in [
            "lit_model.board_size=0",
            "+datamodule.val_ratio=1.5",
            "trainer.precision=8",
            "lit_model.optimizer_config.lr=0",
        ] {
            let err = load(&[o]).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { .. }), "{o}: {err}");
        }
    }

    #[test]
    fn conv_model_needs_seven_squares() {
        let err = load(&[
            "lit_model.board_size=6",
            "lit_model.models_config.model._target_=ConvModel",
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }), "{err}");
    }

    #[test]
    fn null_callbacks_are_allowed() {
        let cfg = load(&["callbacks=null"]).unwrap();
        assert!(cfg.spec.callbacks.is_empty());
    }
}
