//! Callbacks - Hooks the trainer runs around each epoch
//!
//! - ModelCheckpoint: top-k checkpoints of a monitored metric, plus `last`
//! - LearningRateMonitor: logs the optimizer's learning rate every epoch

use std::path::{Path, PathBuf};

use anyhow::Result;
use indexmap::IndexMap;
use serde::Deserialize;

use crate::config::ConfigError;
use crate::lit_model::LitModel;
use crate::logger::MetricsLogger;
use crate::train::checkpoint::{self, CheckpointState};

pub const LAST_CHECKPOINT: &str = "last.safetensors";

/// What a callback can see and touch at a hook.
pub struct CallbackContext<'a> {
    pub epoch: usize,
    pub global_step: usize,
    /// Epoch-level metrics logged so far (`train_loss`, `val_loss`, ...).
    pub metrics: &'a IndexMap<String, f64>,
    pub lit_model: &'a LitModel,
    pub logger: &'a mut MetricsLogger,
}

pub trait Callback {
    fn name(&self) -> &'static str;

    /// Called once before the first epoch, with the sidecar of the resumed checkpoint.
    fn on_fit_start(&mut self, _resumed: Option<&CheckpointState>) -> Result<()> {
        Ok(())
    }

    fn on_train_epoch_start(&mut self, _ctx: &mut CallbackContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_validation_end(&mut self, _ctx: &mut CallbackContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Where this callback writes checkpoints, if it does.
    fn checkpoint_dir(&self) -> Option<&Path> {
        None
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Min,
    Max,
}

fn default_top_k() -> i64 {
    1
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointParams {
    #[serde(default)]
    pub monitor: Option<String>,
    #[serde(default)]
    pub save_last: bool,
    /// `-1` keeps every checkpoint, `0` keeps none.
    #[serde(default = "default_top_k")]
    pub save_top_k: i64,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub dirpath: Option<PathBuf>,
}

impl CheckpointParams {
    pub fn validate(&self, path: &str) -> Result<(), ConfigError> {
        if self.save_top_k < -1 {
            return Err(ConfigError::invalid(
                path,
                format!("save_top_k must be >= -1, got {}", self.save_top_k),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LrMonitorParams {}

#[derive(Clone, Debug, PartialEq)]
pub enum CallbackSpec {
    ModelCheckpoint(CheckpointParams),
    LearningRateMonitor(LrMonitorParams),
}

impl CallbackSpec {
    pub fn instantiate(&self, root_dir: &Path) -> Box<dyn Callback> {
        match self {
            CallbackSpec::ModelCheckpoint(p) => Box::new(ModelCheckpoint::new(p.clone(), root_dir)),
            CallbackSpec::LearningRateMonitor(_) => Box::new(LearningRateMonitor),
        }
    }
}

pub struct ModelCheckpoint {
    params: CheckpointParams,
    dirpath: PathBuf,
    /// Best first.
    best_k: Vec<(f64, PathBuf)>,
    /// Newest first; used when there is no monitor.
    recent: Vec<PathBuf>,
    warned_missing: bool,
}

impl ModelCheckpoint {
    pub fn new(params: CheckpointParams, root_dir: &Path) -> Self {
        let dirpath = params
            .dirpath
            .clone()
            .unwrap_or_else(|| root_dir.join("checkpoints"));
        Self {
            params,
            dirpath,
            best_k: Vec::new(),
            recent: Vec::new(),
            warned_missing: false,
        }
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best_k.first().map(|(s, _)| *s)
    }

    pub fn last_model_path(&self) -> PathBuf {
        self.dirpath.join(LAST_CHECKPOINT)
    }

    fn is_better(&self, a: f64, b: f64) -> bool {
        match self.params.mode {
            Mode::Min => a < b,
            Mode::Max => a > b,
        }
    }

    fn sort(&mut self) {
        let mode = self.params.mode;
        self.best_k.sort_by(|a, b| match mode {
            Mode::Min => a.0.total_cmp(&b.0),
            Mode::Max => b.0.total_cmp(&a.0),
        });
    }

    fn state(&self, ctx: &CallbackContext<'_>, path: &Path, score: Option<f64>) -> CheckpointState {
        let mut state = CheckpointState::new(ctx.epoch, ctx.global_step, path);
        state.monitor = self.params.monitor.clone();
        state.score = score;
        state.best_score = self.best_score();
        state
    }

    fn update_top_k(&mut self, ctx: &CallbackContext<'_>, monitor: &str, score: f64) -> Result<()> {
        let k = self.params.save_top_k;
        if k == 0 {
            return Ok(());
        }
        let qualifies = !score.is_nan()
            && (k < 0
                || self.best_k.len() < k as usize
                || self
                    .best_k
                    .last()
                    .is_some_and(|(worst, _)| self.is_better(score, *worst)));
        if !qualifies {
            if self.params.verbose {
                tracing::info!(
                    "Epoch {}, global step {}: '{}' was not in top {}",
                    ctx.epoch,
                    ctx.global_step,
                    monitor,
                    k
                );
            }
            return Ok(());
        }

        let path = self
            .dirpath
            .join(format!("epoch={}-{}={:.4}.safetensors", ctx.epoch, monitor, score));
        self.best_k.push((score, path.clone()));
        self.sort();
        if k > 0 && self.best_k.len() > k as usize {
            if let Some((_, worst)) = self.best_k.pop() {
                checkpoint::remove_checkpoint(&worst);
            }
        }

        checkpoint::save_checkpoint(
            ctx.lit_model.varmap(),
            &path,
            &self.state(ctx, &path, Some(score)),
        )?;
        if self.params.verbose {
            tracing::info!(
                "Epoch {}, global step {}: '{}' reached {:.5} (best {:.5}), saving model to '{}' as top {}",
                ctx.epoch,
                ctx.global_step,
                monitor,
                score,
                self.best_score().unwrap_or(score),
                path.display(),
                k
            );
        }
        Ok(())
    }

    fn save_latest(&mut self, ctx: &CallbackContext<'_>) -> Result<()> {
        let path = self.dirpath.join(format!("epoch={}.safetensors", ctx.epoch));
        checkpoint::save_checkpoint(ctx.lit_model.varmap(), &path, &self.state(ctx, &path, None))?;
        // Without a monitor only the most recent epochs are kept.
        self.recent.insert(0, path);
        let k = self.params.save_top_k;
        if k > 0 {
            for old in self.recent.split_off((k as usize).min(self.recent.len())) {
                checkpoint::remove_checkpoint(&old);
            }
        }
        Ok(())
    }

    /// Rebuilds the top-k list from sidecars left in `dirpath` by an earlier run.
    fn rescan(&mut self) -> Result<()> {
        let Some(monitor) = self.params.monitor.clone() else {
            return Ok(());
        };
        let pattern = format!("{}/epoch=*.json", self.dirpath.display());
        for sidecar in glob::glob(&pattern)?.filter_map(Result::ok) {
            let weights = sidecar.with_extension("safetensors");
            match checkpoint::read_state(&weights) {
                Ok(Some(state)) if state.monitor.as_deref() == Some(monitor.as_str()) => {
                    if let Some(score) = state.score.filter(|s| !s.is_nan()) {
                        if weights.exists() {
                            self.best_k.push((score, weights));
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("⚠️ Ignoring {}: {}", sidecar.display(), e),
            }
        }
        self.sort();
        Ok(())
    }
}

impl Callback for ModelCheckpoint {
    fn name(&self) -> &'static str {
        "ModelCheckpoint"
    }

    fn on_fit_start(&mut self, resumed: Option<&CheckpointState>) -> Result<()> {
        if resumed.is_some() {
            self.rescan()?;
            if let Some(best) = self.best_score() {
                tracing::info!("Resumed ModelCheckpoint with best score {:.5}", best);
            }
        }
        Ok(())
    }

    fn on_validation_end(&mut self, ctx: &mut CallbackContext<'_>) -> Result<()> {
        match self.params.monitor.clone() {
            Some(monitor) => match ctx.metrics.get(&monitor).copied() {
                Some(score) => self.update_top_k(ctx, &monitor, score)?,
                None => {
                    if !self.warned_missing {
                        let known: Vec<&str> = ctx.metrics.keys().map(String::as_str).collect();
                        tracing::warn!(
                            "⚠️ ModelCheckpoint(monitor='{}') could not find the monitored key in the logged metrics: {:?}",
                            monitor,
                            known
                        );
                        self.warned_missing = true;
                    }
                }
            },
            None if self.params.save_top_k != 0 => self.save_latest(ctx)?,
            None => {}
        }

        if self.params.save_last {
            let last = self.last_model_path();
            checkpoint::save_checkpoint(ctx.lit_model.varmap(), &last, &self.state(ctx, &last, None))?;
            if self.params.verbose {
                tracing::info!("Saved last checkpoint to '{}'", last.display());
            }
        }
        Ok(())
    }

    fn checkpoint_dir(&self) -> Option<&Path> {
        Some(&self.dirpath)
    }
}

/// Logs `lr-{optimizer}` at the start of every epoch.
pub struct LearningRateMonitor;

impl Callback for LearningRateMonitor {
    fn name(&self) -> &'static str {
        "LearningRateMonitor"
    }

    fn on_train_epoch_start(&mut self, ctx: &mut CallbackContext<'_>) -> Result<()> {
        let optimizer = ctx.lit_model.optimizer();
        let key = format!("lr-{}", optimizer.name());
        ctx.logger
            .log_metrics(ctx.global_step, ctx.epoch, &[(key.as_str(), optimizer.learning_rate())])
    }
}
