//! Checkpoint Management - Weights plus a JSON sidecar with the training state

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_nn::VarMap;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Sidecar stored next to every `.safetensors` checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Epoch the weights were saved in.
    pub epoch: usize,
    /// False when the save interrupted `epoch` before its last batch.
    #[serde(default = "default_true")]
    pub epoch_finished: bool,
    pub global_step: usize,
    #[serde(default)]
    pub monitor: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub best_score: Option<f64>,
    pub date: String,
    pub checkpoint: String,
}

impl CheckpointState {
    pub fn new(epoch: usize, global_step: usize, checkpoint: &Path) -> Self {
        Self {
            epoch,
            epoch_finished: true,
            global_step,
            monitor: None,
            score: None,
            best_score: None,
            date: chrono::Local::now().to_rfc3339(),
            checkpoint: checkpoint
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }

    /// State of a save taken partway through `epoch`.
    pub fn interrupted(epoch: usize, global_step: usize, checkpoint: &Path) -> Self {
        Self {
            epoch_finished: false,
            ..Self::new(epoch, global_step, checkpoint)
        }
    }

    /// First epoch to run when resuming from this state; an unfinished epoch is run again.
    pub fn resume_epoch(&self) -> usize {
        if self.epoch_finished {
            self.epoch + 1
        } else {
            self.epoch
        }
    }
}

pub fn sidecar_path(weights: &Path) -> PathBuf {
    weights.with_extension("json")
}

/// Saves under an exclusive lock so readers never see a half-written file.
pub fn save_securely(varmap: &VarMap, path: &Path) -> Result<()> {
    let lock_path = PathBuf::from(format!("{}.lock", path.display()));
    let lock_file = File::create(&lock_path)?;
    lock_file.lock_exclusive()?;
    let saved = varmap.save(path);
    lock_file.unlock()?;
    let _ = std::fs::remove_file(&lock_path);
    saved.with_context(|| format!("saving {}", path.display()))
}

pub fn save_checkpoint(varmap: &VarMap, path: &Path, state: &CheckpointState) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    save_securely(varmap, path)?;
    let file = File::create(sidecar_path(path))?;
    serde_json::to_writer_pretty(file, state)?;
    Ok(())
}

pub fn read_state(weights: &Path) -> Result<Option<CheckpointState>> {
    let path = sidecar_path(weights);
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(&path)?;
    let state = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(state))
}

/// Loads weights into `varmap` and returns the sidecar, if any.
pub fn load_checkpoint(varmap: &mut VarMap, path: &Path) -> Result<Option<CheckpointState>> {
    if !path.exists() {
        anyhow::bail!("checkpoint {} does not exist", path.display());
    }
    varmap
        .load(path)
        .with_context(|| format!("loading weights from {}", path.display()))?;
    read_state(path)
}

pub fn remove_checkpoint(path: &Path) {
    for p in [path.to_path_buf(), sidecar_path(path)] {
        if p.exists() {
            if let Err(e) = std::fs::remove_file(&p) {
                tracing::warn!("⚠️ Failed to remove {}: {}", p.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    fn varmap_with(value: f64) -> Result<VarMap> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints((2, 2), "w", Init::Const(value))?;
        Ok(varmap)
    }

    #[test]
    fn checkpoint_round_trip_restores_weights_and_state() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ckpt/epoch=3.safetensors");
        let mut state = CheckpointState::new(3, 120, &path);
        state.monitor = Some("val_loss".into());
        state.best_score = Some(0.5);
        save_checkpoint(&varmap_with(1.5)?, &path, &state)?;
        assert!(!PathBuf::from(format!("{}.lock", path.display())).exists());

        let mut target = varmap_with(0.0)?;
        let restored = load_checkpoint(&mut target, &path)?.expect("sidecar");
        assert_eq!(restored, state);
        assert_eq!(restored.checkpoint, "epoch=3.safetensors");
        let w = target.all_vars()[0].as_tensor().flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(w, vec![1.5; 4]);

        remove_checkpoint(&path);
        assert!(!path.exists() && !sidecar_path(&path).exists());
        Ok(())
    }

    #[test]
    fn unfinished_epoch_is_resumed_again() -> Result<()> {
        let path = Path::new("last.safetensors");
        assert_eq!(CheckpointState::new(2, 30, path).resume_epoch(), 3);
        assert_eq!(CheckpointState::interrupted(2, 25, path).resume_epoch(), 2);

        // sidecars written before the flag existed count as finished epochs
        let old = r#"{"epoch":4,"global_step":9,"date":"","checkpoint":"x"}"#;
        let state: CheckpointState = serde_json::from_str(old)?;
        assert_eq!(state.resume_epoch(), 5);
        Ok(())
    }

    #[test]
    fn missing_checkpoint_is_an_error() -> Result<()> {
        let mut varmap = varmap_with(0.0)?;
        assert!(load_checkpoint(&mut varmap, Path::new("nope.safetensors")).is_err());
        Ok(())
    }
}
