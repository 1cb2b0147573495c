//! Trainer - Epoch loop with validation, callbacks, resume and graceful shutdown

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use candle_core::Device;
use gomoku_engine::device_utils::{select_device, Accelerator, Precision};
use indexmap::IndexMap;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use tracing::{error, info, warn};

use super::checkpoint::{self, CheckpointState};
use crate::callbacks::{Callback, CallbackContext, LAST_CHECKPOINT};
use crate::config::ConfigError;
use crate::data::DataModule;
use crate::lit_model::{LitModel, StepMetrics};
use crate::logger::MetricsLogger;

/// `devices: [0, 1]` or `devices: 2` (the first N indices).
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DevicesField {
    List(Vec<usize>),
    Count(usize),
}

/// `precision: 16` or `precision: bf16-mixed`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PrecisionField {
    Bits(u32),
    Name(String),
}

fn default_devices() -> DevicesField {
    DevicesField::List(vec![0])
}

fn default_precision() -> PrecisionField {
    PrecisionField::Bits(32)
}

fn default_log_every() -> usize {
    50
}

fn default_true() -> bool {
    true
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainerParams {
    #[serde(default)]
    pub deterministic: bool,
    #[serde(default)]
    pub accelerator: Accelerator,
    #[serde(default = "default_devices")]
    pub devices: DevicesField,
    pub max_epochs: usize,
    #[serde(default = "default_precision")]
    pub precision: PrecisionField,
    #[serde(default = "default_log_every")]
    pub log_every_n_steps: usize,
    #[serde(default = "default_true")]
    pub enable_progress_bar: bool,
    #[serde(default = "default_root")]
    pub default_root_dir: PathBuf,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrainerSpec {
    pub deterministic: bool,
    pub accelerator: Accelerator,
    pub devices: Vec<usize>,
    pub max_epochs: usize,
    pub precision: Precision,
    pub log_every_n_steps: usize,
    pub enable_progress_bar: bool,
    pub default_root_dir: PathBuf,
}

impl TrainerParams {
    pub fn resolve(self, path: &str) -> Result<TrainerSpec, ConfigError> {
        let devices = match self.devices {
            DevicesField::List(list) if list.is_empty() => {
                return Err(ConfigError::invalid(path, "devices must not be empty"))
            }
            DevicesField::List(list) => list,
            DevicesField::Count(0) => {
                return Err(ConfigError::invalid(path, "devices must be at least 1"))
            }
            DevicesField::Count(n) => (0..n).collect(),
        };
        let raw = match self.precision {
            PrecisionField::Bits(bits) => bits.to_string(),
            PrecisionField::Name(name) => name,
        };
        let precision =
            Precision::parse(&raw).map_err(|e| ConfigError::invalid(path, e.to_string()))?;
        if self.log_every_n_steps == 0 {
            return Err(ConfigError::invalid(path, "log_every_n_steps must be at least 1"));
        }
        Ok(TrainerSpec {
            deterministic: self.deterministic,
            accelerator: self.accelerator,
            devices,
            max_epochs: self.max_epochs,
            precision,
            log_every_n_steps: self.log_every_n_steps,
            enable_progress_bar: self.enable_progress_bar,
            default_root_dir: self.default_root_dir,
        })
    }
}

/// Sample-weighted running mean of step losses.
#[derive(Default)]
struct MeanMeter {
    sums: StepMetrics,
    count: usize,
}

impl MeanMeter {
    fn add(&mut self, m: StepMetrics, n: usize) {
        let w = n as f64;
        self.sums.policy_loss += m.policy_loss * w;
        self.sums.value_loss += m.value_loss * w;
        self.sums.loss += m.loss * w;
        self.count += n;
    }

    fn mean(&self) -> Option<StepMetrics> {
        (self.count > 0).then(|| {
            let n = self.count as f64;
            StepMetrics {
                policy_loss: self.sums.policy_loss / n,
                value_loss: self.sums.value_loss / n,
                loss: self.sums.loss / n,
            }
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct FitSummary {
    pub start_epoch: usize,
    pub epochs_run: usize,
    pub global_step: usize,
    pub interrupted: bool,
    /// Epoch metrics of the last finished epoch.
    pub metrics: IndexMap<String, f64>,
    pub exported: Option<PathBuf>,
}

pub struct Trainer {
    pub spec: TrainerSpec,
    device: Device,
    callbacks: Vec<Box<dyn Callback>>,
    logger: MetricsLogger,
    running: Arc<AtomicBool>,
}

impl Trainer {
    /// Picks the device the run's components are built on.
    pub fn select_device(spec: &TrainerSpec) -> Result<Device> {
        select_device(spec.accelerator, &spec.devices)
    }

    pub fn new(
        spec: TrainerSpec,
        device: Device,
        callbacks: Vec<Box<dyn Callback>>,
        logger: MetricsLogger,
    ) -> Result<Self> {
        let dtype = spec.precision.effective_dtype(&device);
        if spec.deterministic && !device.is_cpu() {
            warn!("deterministic=true: GPU kernels may still be non-deterministic");
        }
        info!(
            "Trainer: max_epochs={}, precision={:?} ({:?}), callbacks=[{}]",
            spec.max_epochs,
            spec.precision,
            dtype,
            callbacks
                .iter()
                .map(|c| c.name())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(Self {
            spec,
            device,
            callbacks,
            logger,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn callback_names(&self) -> Vec<&'static str> {
        self.callbacks.iter().map(|c| c.name()).collect()
    }

    /// Cleared to stop training after the current batch.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// First Ctrl+C finishes the batch and saves `last`; a second one exits at once.
    pub fn install_ctrlc_handler(&self) {
        let r = self.running.clone();
        let ctrl_c_count = Arc::new(AtomicUsize::new(0));
        let result = ctrlc::set_handler(move || {
            let count = ctrl_c_count.fetch_add(1, Ordering::SeqCst) + 1;
            if count == 1 {
                info!("\n\n🛑 Ctrl+C detected! Finishing current batch and saving...");
                info!("   (Press Ctrl+C again to force quit WITHOUT saving)");
                r.store(false, Ordering::SeqCst);
            } else {
                error!("\n⚠️  Force quit! Exiting immediately without saving.");
                std::process::exit(1);
            }
        });
        if let Err(e) = result {
            warn!("⚠️ Ctrl+C handler not installed: {}", e);
        }
    }

    fn checkpoint_dir(&self) -> PathBuf {
        self.callbacks
            .iter()
            .find_map(|c| c.checkpoint_dir().map(Path::to_path_buf))
            .unwrap_or_else(|| self.spec.default_root_dir.join("checkpoints"))
    }

    fn progress_bar(&self, len: usize, epoch: usize) -> Result<ProgressBar> {
        if !self.spec.enable_progress_bar {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(ProgressStyle::default_bar().template(
            "{spinner:.green} [{elapsed_precise}] {prefix} {bar:40.cyan/blue} {pos}/{len} ({msg})",
        )?);
        pb.set_prefix(format!("Epoch {epoch}"));
        Ok(pb)
    }

    /// Restores weights and counters from `ckpt_path`; returns the sidecar when present.
    fn restore(&mut self, lit: &mut LitModel, ckpt_path: &Path) -> Result<Option<CheckpointState>> {
        info!("Resuming from checkpoint: {}", ckpt_path.display());
        let state = checkpoint::load_checkpoint(lit.varmap_mut(), ckpt_path)?;
        match &state {
            Some(s) => info!(
                "✅ Checkpoint loaded: epoch {}, global step {}, best {:?}",
                s.epoch, s.global_step, s.best_score
            ),
            None => warn!(
                "⚠️ No training state next to {}; weights restored, counters start at 0",
                ckpt_path.display()
            ),
        }
        Ok(state)
    }

    pub fn fit(
        &mut self,
        lit: &mut LitModel,
        datamodule: &mut DataModule,
        ckpt_path: Option<&Path>,
    ) -> Result<FitSummary> {
        datamodule.setup()?;
        std::fs::create_dir_all(&self.spec.default_root_dir)?;

        let resumed = match ckpt_path {
            Some(path) => self.restore(lit, path)?,
            None => None,
        };
        let start_epoch = resumed.as_ref().map_or(0, CheckpointState::resume_epoch);
        if resumed.as_ref().is_some_and(|s| !s.epoch_finished) {
            warn!(
                "⚠️ Checkpoint was saved mid-epoch; epoch {} runs again from its start",
                start_epoch
            );
        }
        let mut global_step = resumed.as_ref().map_or(0, |s| s.global_step);
        for cb in &mut self.callbacks {
            cb.on_fit_start(resumed.as_ref())?;
        }

        info!(
            "📊 Model: {:?}, {:.2}K params | {} train / {} val positions | device {:?}",
            lit.model().spec().kind,
            lit.num_parameters() as f64 / 1000.0,
            datamodule.num_train(),
            datamodule.num_val(),
            self.device
        );

        let mut summary = FitSummary {
            start_epoch,
            ..FitSummary::default()
        };
        let start_time = Instant::now();

        for epoch in start_epoch..self.spec.max_epochs {
            let lr = lit.set_epoch_lr(epoch);
            let mut metrics: IndexMap<String, f64> = IndexMap::new();
            {
                let mut ctx = CallbackContext {
                    epoch,
                    global_step,
                    metrics: &metrics,
                    lit_model: lit,
                    logger: &mut self.logger,
                };
                for cb in &mut self.callbacks {
                    cb.on_train_epoch_start(&mut ctx)?;
                }
            }

            // Training
            let pb = self.progress_bar(datamodule.num_train_batches(), epoch)?;
            let mut train_meter = MeanMeter::default();
            for batch in datamodule.train_batches(epoch, &self.device)? {
                let batch = batch?;
                let step = lit.training_step(&batch)?;
                train_meter.add(step, batch.len());
                global_step += 1;

                if global_step % self.spec.log_every_n_steps == 0 {
                    let named = step.named("train");
                    let rows: Vec<(&str, f64)> = named.iter().map(|(k, v)| (k.as_str(), *v)).collect();
                    self.logger.log_metrics(global_step, epoch, &rows)?;
                }
                pb.set_message(format!("loss {:.4}", step.loss));
                pb.inc(1);

                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
            }
            pb.finish_and_clear();

            if !self.running.load(Ordering::SeqCst) {
                let last = self.checkpoint_dir().join(LAST_CHECKPOINT);
                info!("[Shutdown] Saving checkpoint at epoch {}, step {}...", epoch, global_step);
                checkpoint::save_checkpoint(
                    lit.varmap(),
                    &last,
                    &CheckpointState::interrupted(epoch, global_step, &last),
                )?;
                self.logger.flush()?;
                info!("Exiting gracefully.");
                summary.interrupted = true;
                summary.global_step = global_step;
                return Ok(summary);
            }

            if let Some(m) = train_meter.mean() {
                metrics.extend(m.named("train"));
            }

            // Validation
            if datamodule.num_val() > 0 {
                let mut val_meter = MeanMeter::default();
                for batch in datamodule.val_batches(&self.device)? {
                    let batch = batch?;
                    val_meter.add(lit.validation_step(&batch)?, batch.len());
                }
                if let Some(m) = val_meter.mean() {
                    metrics.extend(m.named("val"));
                }
            }

            let rows: Vec<(&str, f64)> = metrics.iter().map(|(k, v)| (k.as_str(), *v)).collect();
            self.logger.log_metrics(global_step, epoch, &rows)?;
            info!(
                "Epoch {:3} | step {:6} | train_loss {:.4} | val_loss {} | lr {:.2e} | {:.1}s",
                epoch,
                global_step,
                metrics.get("train_loss").copied().unwrap_or(f64::NAN),
                metrics
                    .get("val_loss")
                    .map_or_else(|| "-".to_string(), |v| format!("{v:.4}")),
                lr,
                start_time.elapsed().as_secs_f64()
            );

            {
                let mut ctx = CallbackContext {
                    epoch,
                    global_step,
                    metrics: &metrics,
                    lit_model: lit,
                    logger: &mut self.logger,
                };
                for cb in &mut self.callbacks {
                    cb.on_validation_end(&mut ctx)?;
                }
            }

            summary.epochs_run += 1;
            summary.metrics = metrics;
        }

        summary.global_step = global_step;
        self.logger.flush()?;
        info!("Training complete. Exporting final model...");
        summary.exported = Some(lit.export(&self.spec.default_root_dir)?);
        Ok(summary)
    }
}
