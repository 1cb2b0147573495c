//! Pipeline - Instantiates every component of a run and hands them to the trainer

use anyhow::{Context, Result};
use gomoku_engine::device_utils::seed_device;
use rand::Rng;
use tracing::info;

use super::args::TrainArgs;
use super::trainer::{FitSummary, Trainer};
use crate::callbacks::{Callback, CallbackSpec, LrMonitorParams};
use crate::config::{self, LoadedConfig};
use crate::data::DataModule;
use crate::lit_model::LitModel;
use crate::logger::MetricsLogger;

/// Everything `fit` needs, built but not yet run.
pub struct Components {
    pub seed: u64,
    pub lit_model: LitModel,
    pub datamodule: DataModule,
    pub trainer: Trainer,
}

/// Builds the components of `cfg` in order: LitModel, callbacks, logger, data module, trainer.
pub fn instantiate(cfg: &LoadedConfig) -> Result<Components> {
    let spec = &cfg.spec;

    let seed = match spec.seed {
        Some(seed) => seed,
        None => {
            let seed = rand::thread_rng().gen();
            info!("No seed configured; drew {seed}");
            seed
        }
    };
    info!("🌱 Global seed: {seed}");

    let device = Trainer::select_device(&spec.trainer)?;
    seed_device(&device, seed).context("seeding device")?;
    let dtype = spec.trainer.precision.effective_dtype(&device);

    let lit_model = LitModel::with_seed(spec.lit_model.clone(), &device, dtype, seed)
        .context("instantiating lit_model")?;
    info!(
        "Instantiated lit_model: {} model(s), optimizer {}, scheduler {}",
        spec.lit_model.models.len(),
        spec.lit_model.optimizer.name(),
        spec.lit_model
            .scheduler
            .as_ref()
            .map_or("none", |s| s.name())
    );

    let root_dir = &spec.trainer.default_root_dir;
    let mut callbacks: Vec<Box<dyn Callback>> = Vec::new();
    for (name, cb) in &spec.callbacks {
        let callback = cb.instantiate(root_dir);
        info!("Instantiated callback {name}: {}", callback.name());
        callbacks.push(callback);
    }
    let has_lr_monitor = spec
        .callbacks
        .iter()
        .any(|(_, cb)| matches!(cb, CallbackSpec::LearningRateMonitor(_)));
    if spec.lit_model.scheduler.is_some() && !has_lr_monitor {
        let callback = CallbackSpec::LearningRateMonitor(LrMonitorParams {}).instantiate(root_dir);
        info!("Instantiated callback lr_monitor: {}", callback.name());
        callbacks.push(callback);
    }

    let logger = MetricsLogger::create(&spec.logger, &cfg.tree).context("instantiating logger")?;
    info!("Instantiated logger: {}", spec.logger.requested);

    let datamodule = DataModule::new(spec.datamodule.clone(), spec.lit_model.board_size)
        .with_seed(seed, spec.trainer.deterministic);
    info!(
        "Instantiated datamodule: batch_size {}, data_dir {}",
        spec.datamodule.batch_size,
        spec.datamodule.data_dir.display()
    );

    let trainer = Trainer::new(spec.trainer.clone(), device, callbacks, logger)?;
    info!("Instantiated trainer");

    Ok(Components {
        seed,
        lit_model,
        datamodule,
        trainer,
    })
}

/// Runs a loaded configuration. Returns `None` when `instantiate_only` is set.
pub fn train(cfg: &LoadedConfig) -> Result<Option<FitSummary>> {
    let mut components = instantiate(cfg)?;
    if cfg.spec.instantiate_only {
        info!("instantiate_only=true: all components built, skipping training");
        return Ok(None);
    }

    components.trainer.install_ctrlc_handler();
    let summary = components.trainer.fit(
        &mut components.lit_model,
        &mut components.datamodule,
        cfg.spec.ckpt_path.as_deref(),
    )?;
    Ok(Some(summary))
}

/// Prints the configuration after overrides and interpolation, without building anything.
pub fn print_config(args: TrainArgs) -> Result<()> {
    let cfg = config::load(&args.config, &args.overrides)?;
    print!("{}", cfg.to_yaml()?);
    Ok(())
}

pub fn run(args: TrainArgs) -> Result<()> {
    let cfg = config::load(&args.config, &args.overrides)?;
    info!("Resolved config:\n{}", cfg.to_yaml()?);

    match train(&cfg)? {
        Some(summary) if summary.interrupted => {
            info!("Training interrupted at step {}", summary.global_step);
        }
        Some(summary) => {
            info!(
                "✅ Finished {} epoch(s), {} steps",
                summary.epochs_run, summary.global_step
            );
            if let Some(path) = summary.exported {
                info!("   Final weights: {}", path.display());
            }
        }
        None => {}
    }
    Ok(())
}
