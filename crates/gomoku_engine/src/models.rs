//! Models Module - Policy/value networks over a flattened board
//!
//! - FlatModel: MLP on the raw `size² + 1` input
//! - ConvModel: depthwise-separable conv tower with separate policy and value heads
//!
//! Both produce `[batch, size² + 1]`: policy logits followed by a tanh value.

use std::path::Path;

use anyhow::{bail, Context};
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

pub mod conv;
pub mod flat;

pub use conv::ConvModel;
pub use flat::FlatModel;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    FlatModel,
    ConvModel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub kind: ModelKind,
    pub size: usize,
}

/// Sidecar written next to exported weights so they can be rebuilt for play.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportedModel {
    pub spec: ModelSpec,
    pub example_input_shape: Vec<usize>,
    pub weights: String,
}

pub enum Model {
    Flat(FlatModel),
    Conv(ConvModel),
}

impl Model {
    pub fn load(spec: ModelSpec, vb: VarBuilder) -> Result<Self> {
        match spec.kind {
            ModelKind::FlatModel => Ok(Model::Flat(FlatModel::load(spec.size, vb)?)),
            ModelKind::ConvModel => Ok(Model::Conv(ConvModel::load(spec.size, vb)?)),
        }
    }

    /// Rebuilds a model from an export directory (`model.json` + weights).
    pub fn load_exported<P: AsRef<Path>>(dir: P, device: &Device) -> anyhow::Result<(Self, VarMap)> {
        let dir = dir.as_ref();
        let meta_path = dir.join("model.json");
        let meta: ExportedModel = serde_json::from_reader(
            std::fs::File::open(&meta_path)
                .with_context(|| format!("opening {}", meta_path.display()))?,
        )
        .with_context(|| format!("parsing {}", meta_path.display()))?;

        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Model::load(meta.spec, vb.pp("model"))?;

        let weights = dir.join(&meta.weights);
        if !weights.exists() {
            bail!("weights file {} does not exist", weights.display());
        }
        varmap.load(&weights)?;
        tracing::info!(
            "Loaded {:?} (size {}) from {}",
            meta.spec.kind,
            meta.spec.size,
            weights.display()
        );
        Ok((model, varmap))
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Model::Flat(m) => m.forward(x),
            Model::Conv(m) => m.forward(x),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Model::Flat(m) => m.size,
            Model::Conv(m) => m.size,
        }
    }

    pub fn spec(&self) -> ModelSpec {
        let kind = match self {
            Model::Flat(_) => ModelKind::FlatModel,
            Model::Conv(_) => ModelKind::ConvModel,
        };
        ModelSpec {
            kind,
            size: self.size(),
        }
    }

    pub fn example_input(&self, device: &Device) -> Result<Tensor> {
        let n = self.size();
        Tensor::zeros((1, n * n + 1), DType::F32, device)
    }
}

/// Applies tanh to the last column, leaving the policy logits untouched.
pub(crate) fn squash_value_column(out: &Tensor, n_moves: usize) -> Result<Tensor> {
    let policy = out.narrow(1, 0, n_moves)?;
    let value = out.narrow(1, n_moves, 1)?.tanh()?;
    Tensor::cat(&[&policy, &value], 1)
}
