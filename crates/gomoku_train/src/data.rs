//! DataModule - Training and validation batches from self-play records
//!
//! `setup()` loads the tensor cache when present, otherwise parses the game
//! directory and writes the cache. The positions are then split once into
//! train/validation index sets.

pub mod records;

use std::path::PathBuf;

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;

use crate::config::ConfigError;
pub use records::{Dataset, GameRecord};

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    1
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("games")
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("flat_data.safetensors")
}

fn default_val_ratio() -> f64 {
    0.1
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataParams {
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    #[serde(default = "default_workers")]
    pub num_workers: usize,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
    #[serde(default = "default_val_ratio")]
    pub val_ratio: f64,
}

impl DataParams {
    pub fn validate(&self, path: &str) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid(path, "batch_size must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.val_ratio) {
            return Err(ConfigError::invalid(
                path,
                format!("val_ratio must lie in [0, 1), got {}", self.val_ratio),
            ));
        }
        Ok(())
    }
}

pub struct Batch {
    pub states: Tensor,
    pub policies: Tensor,
    pub values: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.values.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Split {
    dataset: Dataset,
    train: Vec<u32>,
    val: Vec<u32>,
}

pub struct DataModule {
    pub params: DataParams,
    board_size: usize,
    seed: u64,
    deterministic: bool,
    split: Option<Split>,
}

/// Validation size: `round(n * ratio)`, at least one sample when the ratio is
/// positive and at most `n - 1` so training keeps a sample.
pub fn val_count(n: usize, ratio: f64) -> usize {
    if n < 2 || ratio <= 0.0 {
        return 0;
    }
    ((n as f64 * ratio).round() as usize).clamp(1, n - 1)
}

impl DataModule {
    pub fn new(params: DataParams, board_size: usize) -> Self {
        Self {
            params,
            board_size,
            seed: 0,
            deterministic: false,
            split: None,
        }
    }

    /// Seeds the train/val split and, when `deterministic`, the per-epoch shuffles.
    pub fn with_seed(mut self, seed: u64, deterministic: bool) -> Self {
        self.seed = seed;
        self.deterministic = deterministic;
        self
    }

    pub fn setup(&mut self) -> Result<()> {
        if self.split.is_some() {
            return Ok(());
        }
        let cache = &self.params.cache_path;
        let dataset = if cache.exists() {
            tracing::info!("Loading cached dataset from {}", cache.display());
            Dataset::load(cache, self.board_size)?
        } else {
            let records = records::parse_dir(&self.params.data_dir, self.params.num_workers)?;
            let dataset = Dataset::from_records(&records, self.board_size)?;
            dataset.save(cache)?;
            tracing::info!("Cached {} positions to {}", dataset.len(), cache.display());
            dataset
        };
        self.set_dataset(dataset);
        Ok(())
    }

    /// Installs an already built dataset and splits it.
    pub fn set_dataset(&mut self, dataset: Dataset) {
        let n = dataset.len();
        let mut order: Vec<u32> = (0..n as u32).collect();
        order.shuffle(&mut StdRng::seed_from_u64(self.seed));
        let n_val = val_count(n, self.params.val_ratio);
        let val = order.split_off(n - n_val);
        tracing::info!(
            "Dataset: {} positions ({} train / {} val), states {:?}",
            n,
            order.len(),
            val.len(),
            dataset.states.dims()
        );
        self.split = Some(Split {
            dataset,
            train: order,
            val,
        });
    }

    fn split(&self) -> Result<&Split> {
        self.split
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("DataModule::setup() has not been called"))
    }

    pub fn num_train(&self) -> usize {
        self.split.as_ref().map_or(0, |s| s.train.len())
    }

    pub fn num_val(&self) -> usize {
        self.split.as_ref().map_or(0, |s| s.val.len())
    }

    pub fn num_train_batches(&self) -> usize {
        self.num_train().div_ceil(self.params.batch_size)
    }

    pub fn train_batches(&self, epoch: usize, device: &Device) -> Result<Batches<'_>> {
        let split = self.split()?;
        let mut order = split.train.clone();
        if self.params.shuffle {
            let mut rng = if self.deterministic {
                StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64 + 1))
            } else {
                StdRng::from_entropy()
            };
            order.shuffle(&mut rng);
        }
        Ok(Batches::new(&split.dataset, order, self.params.batch_size, device))
    }

    pub fn val_batches(&self, device: &Device) -> Result<Batches<'_>> {
        let split = self.split()?;
        Ok(Batches::new(
            &split.dataset,
            split.val.clone(),
            self.params.batch_size,
            device,
        ))
    }
}

/// Mini-batches over a fixed index order; the last one may be short.
pub struct Batches<'a> {
    dataset: &'a Dataset,
    order: Vec<u32>,
    batch_size: usize,
    cursor: usize,
    device: Device,
}

impl<'a> Batches<'a> {
    fn new(dataset: &'a Dataset, order: Vec<u32>, batch_size: usize, device: &Device) -> Self {
        Self {
            dataset,
            order,
            batch_size,
            cursor: 0,
            device: device.clone(),
        }
    }

    fn gather(&self, ids: &[u32]) -> Result<Batch> {
        let ids = Tensor::from_slice(ids, ids.len(), &Device::Cpu)?;
        let pick = |t: &Tensor| -> Result<Tensor> { Ok(t.index_select(&ids, 0)?.to_device(&self.device)?) };
        Ok(Batch {
            states: pick(&self.dataset.states)?,
            policies: pick(&self.dataset.policies)?,
            values: pick(&self.dataset.values)?,
        })
    }
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let batch = self.gather(&self.order[self.cursor..end]);
        self.cursor = end;
        Some(batch)
    }
}
