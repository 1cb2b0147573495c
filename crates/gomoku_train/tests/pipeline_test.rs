use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use gomoku_train::config::{self, ConfigError, LoadedConfig};
use gomoku_train::data::GameRecord;
use gomoku_train::train::{self, checkpoint};

const BOARD: usize = 3;

fn shipped_config() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../conf/config.yaml")
}

/// Writes `games` files of synthetic positions into `dir`.
fn write_games(dir: &Path, games: usize, positions: usize) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let cells = BOARD * BOARD;
    for g in 0..games {
        let records: Vec<GameRecord> = (0..positions)
            .map(|i| {
                let mut state = vec![0.0; cells + 1];
                state[(g + i) % cells] = 1.0;
                state[cells] = if i % 2 == 0 { 1.0 } else { -1.0 };
                let mut policy = vec![0.0; cells];
                policy[(g + i + 1) % cells] = 1.0;
                GameRecord {
                    state,
                    policy,
                    value: if (g + i) % 3 == 0 { 1.0 } else { -1.0 },
                }
            })
            .collect();
        let file = std::fs::File::create(dir.join(format!("game_{g:03}.json")))?;
        serde_json::to_writer(file, &records)?;
    }
    Ok(())
}

/// The shipped config, shrunk to a CPU run inside `root`.
fn load(root: &Path, extra: &[String]) -> Result<LoadedConfig, ConfigError> {
    let mut overrides = vec![
        format!("lit_model.board_size={BOARD}"),
        "trainer.accelerator=cpu".to_string(),
        "trainer.precision=32".to_string(),
        "trainer.max_epochs=2".to_string(),
        format!("+trainer.default_root_dir={}", root.join("run").display()),
        "+trainer.enable_progress_bar=false".to_string(),
        "+trainer.log_every_n_steps=1".to_string(),
        format!("+logger.save_dir={}", root.join("logs").display()),
        "+logger.name=test".to_string(),
        "datamodule.batch_size=8".to_string(),
        "datamodule.num_workers=2".to_string(),
        format!("+datamodule.data_dir={}", root.join("games").display()),
        format!("+datamodule.cache_path={}", root.join("cache.safetensors").display()),
    ];
    overrides.extend_from_slice(extra);
    config::load(&shipped_config(), &overrides)
}

fn metrics(root: &Path) -> Result<Vec<serde_json::Value>> {
    let text = std::fs::read_to_string(root.join("logs/gomoku-8x8/test/metrics.jsonl"))?;
    text.lines()
        .map(|l| Ok(serde_json::from_str(l)?))
        .collect()
}

#[test]
fn shipped_config_matches_the_documented_run() -> Result<()> {
    let none: [&str; 0] = [];
    let cfg = config::load(&shipped_config(), &none)?;
    let spec = &cfg.spec;
    assert_eq!(spec.lit_model.board_size, 8);
    assert_eq!(spec.lit_model.models["model"].size, 8);
    assert_eq!(spec.lit_model.optimizer.lr(), 1e-3);
    assert!(spec.lit_model.scheduler.is_none());
    assert!(spec.lit_model.use_weights_path.is_none());
    assert_eq!(spec.datamodule.batch_size, 512);
    assert!(spec.datamodule.shuffle);
    assert_eq!(spec.datamodule.num_workers, 8);
    assert!(spec.trainer.deterministic);
    assert_eq!(spec.trainer.devices, vec![0]);
    assert_eq!(spec.trainer.max_epochs, 50);
    assert!(spec.ckpt_path.is_none());
    assert_eq!(spec.seed, Some(123));
    assert!(!spec.instantiate_only);
    Ok(())
}

#[test]
fn instantiate_only_builds_without_training() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = load(dir.path(), &["instantiate_only=true".to_string()])?;

    assert!(train::train(&cfg)?.is_none());
    // no data was read and nothing was checkpointed
    assert!(!dir.path().join("cache.safetensors").exists());
    assert!(!dir.path().join("run/checkpoints").exists());
    assert!(dir.path().join("logs/gomoku-8x8/test/config.yaml").exists());
    Ok(())
}

#[test]
fn null_scheduler_attaches_no_lr_monitor() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = load(dir.path(), &[])?;
    let c = train::instantiate(&cfg)?;
    assert_eq!(c.trainer.callback_names(), ["ModelCheckpoint"]);
    assert_eq!(c.seed, 123);

    let cfg = load(
        dir.path(),
        &["lit_model.scheduler_config={_target_: torch.optim.lr_scheduler.StepLR, step_size: 1}"
            .to_string()],
    )?;
    let c = train::instantiate(&cfg)?;
    assert_eq!(
        c.trainer.callback_names(),
        ["ModelCheckpoint", "LearningRateMonitor"]
    );
    Ok(())
}

#[test]
fn unknown_target_fails_before_instantiation() {
    let dir = tempfile::tempdir().unwrap();
    let err = load(
        dir.path(),
        &["trainer._target_=lightning.Fabric".to_string()],
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::UnknownTarget { .. }), "{err}");
    assert!(!dir.path().join("logs").exists());
}

#[test]
fn fit_checkpoints_exports_and_resumes() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_games(&dir.path().join("games"), 5, 8)?;

    let cfg = load(dir.path(), &[])?;
    let first = train::train(&cfg)?.expect("training ran");
    assert!(!first.interrupted);
    assert_eq!(first.start_epoch, 0);
    assert_eq!(first.epochs_run, 2);
    assert!(first.metrics.contains_key("val_loss"));
    assert!(dir.path().join("cache.safetensors").exists());

    let ckpts = dir.path().join("run/checkpoints");
    let last = ckpts.join("last.safetensors");
    assert!(last.exists());
    assert!(ckpts.join("last.json").exists());
    let top: Vec<_> = glob::glob(&format!("{}/epoch=*-val_loss=*.safetensors", ckpts.display()))?
        .filter_map(Result::ok)
        .collect();
    assert_eq!(top.len(), 1);

    let exported = first.exported.expect("model exported");
    assert_eq!(exported, dir.path().join("run/model.safetensors"));
    assert!(dir.path().join("run/model.json").exists());

    let rows = metrics(dir.path())?;
    assert!(rows.iter().any(|r| r.get("train_loss").is_some()));
    assert!(rows.iter().any(|r| r.get("val_loss").is_some()));
    assert!(rows.iter().all(|r| r.get("step").is_some()));

    // Resume from `last` for one more epoch.
    let cfg = load(
        dir.path(),
        &[
            format!("ckpt_path={}", last.display()),
            "trainer.max_epochs=3".to_string(),
        ],
    )?;
    let second = train::train(&cfg)?.expect("training ran");
    assert_eq!(second.start_epoch, 2);
    assert_eq!(second.epochs_run, 1);
    assert!(second.global_step > first.global_step);
    Ok(())
}

#[test]
fn same_seed_instantiates_identical_models() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = load(dir.path(), &[])?;
    let x = Tensor::ones((1, BOARD * BOARD + 1), DType::F32, &Device::Cpu)?;
    let out = |cfg: &LoadedConfig| -> Result<Vec<f32>> {
        let c = train::instantiate(cfg)?;
        Ok(c.lit_model.forward(&x)?.flatten_all()?.to_vec1::<f32>()?)
    };
    assert_eq!(out(&cfg)?, out(&cfg)?);

    let other = load(dir.path(), &["seed=7".to_string()])?;
    assert_ne!(out(&cfg)?, out(&other)?);
    Ok(())
}

#[test]
fn stop_request_saves_last_and_reruns_the_epoch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_games(&dir.path().join("games"), 5, 8)?;

    let cfg = load(dir.path(), &[])?;
    let mut c = train::instantiate(&cfg)?;
    c.trainer.running_flag().store(false, Ordering::SeqCst);
    let stopped = c.trainer.fit(&mut c.lit_model, &mut c.datamodule, None)?;
    assert!(stopped.interrupted);
    assert_eq!(stopped.global_step, 1);
    assert_eq!(stopped.epochs_run, 0);
    assert!(stopped.exported.is_none());

    let last = dir.path().join("run/checkpoints/last.safetensors");
    assert!(last.exists());
    let state = checkpoint::read_state(&last)?.expect("sidecar");
    assert_eq!(state.epoch, 0);
    assert_eq!(state.global_step, 1);
    assert!(!state.epoch_finished);
    assert_eq!(state.resume_epoch(), 0);

    let cfg = load(
        dir.path(),
        &[
            format!("ckpt_path={}", last.display()),
            "trainer.max_epochs=1".to_string(),
        ],
    )?;
    let resumed = train::train(&cfg)?.expect("training ran");
    assert_eq!(resumed.start_epoch, 0);
    assert_eq!(resumed.epochs_run, 1);
    assert!(resumed.global_step > 1);
    Ok(())
}

#[test]
fn missing_checkpoint_is_an_error() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_games(&dir.path().join("games"), 2, 4)?;
    let cfg = load(
        dir.path(),
        &[format!("ckpt_path={}", dir.path().join("nope.safetensors").display())],
    )?;
    assert!(train::train(&cfg).is_err());
    Ok(())
}
