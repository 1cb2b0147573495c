//! LitModel - Policy/value network bundled with its optimizer, schedule and losses

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use gomoku_engine::layers::reseed_parameters;
use gomoku_engine::models::ExportedModel;
use gomoku_engine::{Model, ModelSpec};
use indexmap::IndexMap;

use crate::data::Batch;
use crate::optim::{Optimizer, OptimizerSpec, SchedulerSpec};
use crate::train::checkpoint::save_securely;

/// The entry of `models_config` that is trained and exported.
pub const PRIMARY_MODEL: &str = "model";

#[derive(Clone, Debug, PartialEq)]
pub struct LitModelSpec {
    pub board_size: usize,
    pub models: IndexMap<String, ModelSpec>,
    pub optimizer: OptimizerSpec,
    pub scheduler: Option<SchedulerSpec>,
    pub use_weights_path: Option<PathBuf>,
}

/// Losses for one batch, as plain numbers.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StepMetrics {
    pub policy_loss: f64,
    pub value_loss: f64,
    pub loss: f64,
}

impl StepMetrics {
    /// `{stage}_policy_loss`, `{stage}_value_loss`, `{stage}_loss`.
    pub fn named(&self, stage: &str) -> [(String, f64); 3] {
        [
            (format!("{stage}_policy_loss"), self.policy_loss),
            (format!("{stage}_value_loss"), self.value_loss),
            (format!("{stage}_loss"), self.loss),
        ]
    }
}

struct Losses {
    policy: Tensor,
    value: Tensor,
    total: Tensor,
}

impl Losses {
    fn metrics(&self) -> Result<StepMetrics> {
        let scalar = |t: &Tensor| -> Result<f64> { Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?) };
        Ok(StepMetrics {
            policy_loss: scalar(&self.policy)?,
            value_loss: scalar(&self.value)?,
            loss: scalar(&self.total)?,
        })
    }
}

/// Soft-target cross-entropy: `mean(-Σ target · log_softmax(logits))`.
pub fn soft_cross_entropy(logits: &Tensor, target: &Tensor) -> candle_core::Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    (target * log_probs)?.sum(D::Minus1)?.neg()?.mean_all()
}

pub struct LitModel {
    pub spec: LitModelSpec,
    varmap: VarMap,
    models: IndexMap<String, Model>,
    optimizer: Optimizer,
    device: Device,
    /// Compute dtype; weights stay F32.
    dtype: DType,
}

impl LitModel {
    pub fn new(spec: LitModelSpec, device: &Device, dtype: DType) -> Result<Self> {
        Self::build(spec, device, dtype, None)
    }

    /// Like `new`, but parameters are drawn from `seed` so runs reproduce.
    pub fn with_seed(spec: LitModelSpec, device: &Device, dtype: DType, seed: u64) -> Result<Self> {
        Self::build(spec, device, dtype, Some(seed))
    }

    fn build(spec: LitModelSpec, device: &Device, dtype: DType, seed: Option<u64>) -> Result<Self> {
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let mut models = IndexMap::new();
        for (name, model_spec) in &spec.models {
            let model = Model::load(*model_spec, vb.pp(name.as_str()))
                .with_context(|| format!("building {name} ({:?})", model_spec.kind))?;
            models.insert(name.clone(), model);
        }
        if !models.contains_key(PRIMARY_MODEL) {
            anyhow::bail!("models_config has no '{PRIMARY_MODEL}' entry");
        }
        if let Some(seed) = seed {
            reseed_parameters(&varmap, seed)?;
        }

        if let Some(path) = &spec.use_weights_path {
            if !path.exists() {
                anyhow::bail!("use_weights_path {} does not exist", path.display());
            }
            varmap
                .load(path)
                .with_context(|| format!("loading weights from {}", path.display()))?;
            tracing::info!("✅ Loaded pre-trained weights from {}", path.display());
        }

        let optimizer = spec.optimizer.build(varmap.all_vars())?;
        Ok(Self {
            spec,
            varmap,
            models,
            optimizer,
            device: device.clone(),
            dtype,
        })
    }

    pub fn model(&self) -> &Model {
        &self.models[PRIMARY_MODEL]
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn varmap_mut(&mut self) -> &mut VarMap {
        &mut self.varmap
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn num_parameters(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Applies the schedule for `epoch` and returns the learning rate in effect.
    pub fn set_epoch_lr(&mut self, epoch: usize) -> f64 {
        if let Some(scheduler) = &self.spec.scheduler {
            let lr = scheduler.lr_at(self.spec.optimizer.lr(), epoch);
            self.optimizer.set_learning_rate(lr);
        }
        self.optimizer.learning_rate()
    }

    /// Runs the primary model in the compute dtype and returns F32 output.
    pub fn forward(&self, states: &Tensor) -> Result<Tensor> {
        let x = states.to_dtype(self.dtype)?;
        Ok(self.model().forward(&x)?.to_dtype(DType::F32)?)
    }

    fn losses(&self, batch: &Batch) -> Result<Losses> {
        let preds = self.forward(&batch.states)?;
        let n_moves = preds.dim(1)? - 1;
        let policy_logits = preds.narrow(1, 0, n_moves)?;
        let value_pred = preds.narrow(1, n_moves, 1)?;

        let policy = soft_cross_entropy(&policy_logits, &batch.policies)?;
        let value = candle_nn::loss::mse(&value_pred, &batch.values)?;
        let total = (&policy + &value)?;
        Ok(Losses {
            policy,
            value,
            total,
        })
    }

    pub fn training_step(&mut self, batch: &Batch) -> Result<StepMetrics> {
        let losses = self.losses(batch)?;
        self.optimizer.backward_step(&losses.total)?;
        losses.metrics()
    }

    pub fn validation_step(&self, batch: &Batch) -> Result<StepMetrics> {
        self.losses(batch)?.metrics()
    }

    /// Writes `model.safetensors` and `model.json` so the weights can be reloaded for play.
    pub fn export(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let weights = dir.join("model.safetensors");
        save_securely(&self.varmap, &weights)?;

        let example = self.model().example_input(&Device::Cpu)?;
        let meta = ExportedModel {
            spec: self.model().spec(),
            example_input_shape: example.dims().to_vec(),
            weights: "model.safetensors".to_string(),
        };
        let file = std::fs::File::create(dir.join("model.json"))?;
        serde_json::to_writer_pretty(file, &meta)?;
        tracing::info!("📦 Exported {:?} to {}", meta.spec.kind, dir.display());
        Ok(weights)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::data::{DataModule, DataParams, Dataset, GameRecord};
    use crate::optim::{AdamParams, CosineParams};
    use gomoku_engine::ModelKind;

    pub(crate) fn spec(size: usize) -> LitModelSpec {
        let mut models = IndexMap::new();
        models.insert(
            PRIMARY_MODEL.to_string(),
            ModelSpec {
                kind: ModelKind::FlatModel,
                size,
            },
        );
        LitModelSpec {
            board_size: size,
            models,
            optimizer: OptimizerSpec::Adam(AdamParams {
                lr: 1e-3,
                betas: (0.9, 0.999),
                eps: 1e-8,
                weight_decay: None,
            }),
            scheduler: None,
            use_weights_path: None,
        }
    }

    fn batch(size: usize, n: usize) -> Result<Batch> {
        let records: Vec<GameRecord> = (0..n)
            .map(|i| {
                let mut policy = vec![0.0; size * size];
                policy[i % (size * size)] = 1.0;
                GameRecord {
                    state: vec![0.0; size * size + 1],
                    policy,
                    value: if i % 2 == 0 { 1.0 } else { -1.0 },
                }
            })
            .collect();
        let params: DataParams =
            serde_yaml::from_str(&format!("batch_size: {n}\nshuffle: false\nval_ratio: 0.0"))?;
        let mut dm = DataModule::new(params, size);
        dm.set_dataset(Dataset::from_records(&records, size)?);
        let mut batches = dm.train_batches(0, &Device::Cpu)?;
        batches.next().expect("one batch")
    }

    #[test]
    fn soft_cross_entropy_matches_hand_computation() -> Result<()> {
        let logits = Tensor::new(&[[0f32, 0.0], [0.0, 0.0]], &Device::Cpu)?;
        let target = Tensor::new(&[[1f32, 0.0], [0.5, 0.5]], &Device::Cpu)?;
        let loss = soft_cross_entropy(&logits, &target)?.to_scalar::<f32>()?;
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn loss_is_sum_of_parts_and_training_reduces_it() -> Result<()> {
        let mut lit = LitModel::new(spec(3), &Device::Cpu, DType::F32)?;
        let b = batch(3, 8)?;
        let before = lit.validation_step(&b)?;
        assert!((before.loss - before.policy_loss - before.value_loss).abs() < 1e-5);

        for _ in 0..30 {
            lit.training_step(&b)?;
        }
        let after = lit.validation_step(&b)?;
        assert!(after.loss < before.loss, "{} !< {}", after.loss, before.loss);
        Ok(())
    }

    #[test]
    fn metric_names_carry_the_stage() {
        let m = StepMetrics {
            policy_loss: 1.0,
            value_loss: 2.0,
            loss: 3.0,
        };
        let names: Vec<String> = m.named("val").into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["val_policy_loss", "val_value_loss", "val_loss"]);
    }

    #[test]
    fn no_scheduler_keeps_lr_constant() -> Result<()> {
        let mut lit = LitModel::new(spec(3), &Device::Cpu, DType::F32)?;
        assert_eq!(lit.set_epoch_lr(0), 1e-3);
        assert_eq!(lit.set_epoch_lr(7), 1e-3);

        let mut s = spec(3);
        s.scheduler = Some(SchedulerSpec::CosineAnnealing(CosineParams {
            t_max: 2,
            eta_min: 0.0,
        }));
        let mut lit = LitModel::new(s, &Device::Cpu, DType::F32)?;
        assert!((lit.set_epoch_lr(1) - 5e-4).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn seeded_models_are_identical() -> Result<()> {
        let x = Tensor::ones((1, 10), DType::F32, &Device::Cpu)?;
        let out = |seed: u64| -> Result<Vec<f32>> {
            let lit = LitModel::with_seed(spec(3), &Device::Cpu, DType::F32, seed)?;
            Ok(lit.forward(&x)?.flatten_all()?.to_vec1::<f32>()?)
        };
        assert_eq!(out(123)?, out(123)?);
        assert_ne!(out(123)?, out(7)?);
        Ok(())
    }

    #[test]
    fn export_then_reload_and_use_weights_path() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let lit = LitModel::new(spec(4), &Device::Cpu, DType::F32)?;
        let weights = lit.export(dir.path())?;

        let (model, _) = Model::load_exported(dir.path(), &Device::Cpu)?;
        let x = Tensor::ones((1, 17), DType::F32, &Device::Cpu)?;
        let a = lit.forward(&x)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, model.forward(&x)?.flatten_all()?.to_vec1::<f32>()?);

        let mut s = spec(4);
        s.use_weights_path = Some(weights);
        let warm = LitModel::new(s, &Device::Cpu, DType::F32)?;
        assert_eq!(a, warm.forward(&x)?.flatten_all()?.to_vec1::<f32>()?);

        let mut s = spec(4);
        s.use_weights_path = Some(dir.path().join("missing.safetensors"));
        assert!(LitModel::new(s, &Device::Cpu, DType::F32).is_err());
        Ok(())
    }
}
