//! Game records on disk: JSON files from self-play and the tensor cache built from them.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use glob::glob;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// One training position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GameRecord {
    /// `Board::to_repr()` of the position.
    pub state: Vec<f32>,
    /// Visit distribution over every square.
    pub policy: Vec<f32>,
    /// Final result from the perspective of the player to move.
    pub value: f32,
}

/// All positions as dense CPU tensors.
#[derive(Clone, Debug)]
pub struct Dataset {
    /// [n, size² + 1]
    pub states: Tensor,
    /// [n, size²]
    pub policies: Tensor,
    /// [n, 1]
    pub values: Tensor,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.values.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn from_records(records: &[GameRecord], size: usize) -> Result<Self> {
        if records.is_empty() {
            bail!("dataset is empty");
        }
        let n_squares = size * size;
        let n = records.len();
        let mut states = Vec::with_capacity(n * (n_squares + 1));
        let mut policies = Vec::with_capacity(n * n_squares);
        let mut values = Vec::with_capacity(n);
        for (i, r) in records.iter().enumerate() {
            if r.state.len() != n_squares + 1 {
                bail!(
                    "record {i}: state has {} entries, expected {} for a {size}x{size} board",
                    r.state.len(),
                    n_squares + 1
                );
            }
            if r.policy.len() != n_squares {
                bail!(
                    "record {i}: policy has {} entries, expected {n_squares}",
                    r.policy.len()
                );
            }
            states.extend_from_slice(&r.state);
            policies.extend_from_slice(&r.policy);
            values.push(r.value);
        }
        Ok(Self {
            states: Tensor::from_vec(states, (n, n_squares + 1), &Device::Cpu)?,
            policies: Tensor::from_vec(policies, (n, n_squares), &Device::Cpu)?,
            values: Tensor::from_vec(values, (n, 1), &Device::Cpu)?,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tensors: HashMap<String, Tensor> = [
            ("states".to_string(), self.states.clone()),
            ("policies".to_string(), self.policies.clone()),
            ("values".to_string(), self.values.clone()),
        ]
        .into_iter()
        .collect();
        candle_core::safetensors::save(&tensors, path)
            .with_context(|| format!("writing cache {}", path.display()))?;
        Ok(())
    }

    /// Loads a cache and checks it against the expected board size.
    pub fn load(path: &Path, size: usize) -> Result<Self> {
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("reading cache {}", path.display()))?;
        let mut take = |name: &str| {
            tensors
                .remove(name)
                .with_context(|| format!("cache {} has no '{name}' tensor", path.display()))
        };
        let dataset = Self {
            states: take("states")?,
            policies: take("policies")?,
            values: take("values")?,
        };

        let n = dataset.len();
        let n_squares = size * size;
        if dataset.states.dims() != [n, n_squares + 1] || dataset.policies.dims() != [n, n_squares]
        {
            bail!(
                "cache {} holds states {:?} / policies {:?}, which do not fit a {size}x{size} board",
                path.display(),
                dataset.states.dims(),
                dataset.policies.dims()
            );
        }
        if n == 0 {
            bail!("cache {} is empty", path.display());
        }
        Ok(dataset)
    }
}

pub fn read_game_file(path: &Path) -> Result<Vec<GameRecord>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing {}", path.display()))
}

/// Every `*.json` file in `dir`, sorted by name.
pub fn game_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = glob(&format!("{}/*.json", dir.display()))?
        .filter_map(Result::ok)
        .collect();
    paths.sort();
    Ok(paths)
}

/// Parses all game files in `dir` on a pool of `workers` threads; records keep file order.
pub fn parse_dir(dir: &Path, workers: usize) -> Result<Vec<GameRecord>> {
    let paths = game_files(dir)?;
    if paths.is_empty() {
        bail!("no game files (*.json) found in {}", dir.display());
    }
    tracing::info!(
        "Parsing {} game files from {} with {} workers",
        paths.len(),
        dir.display(),
        workers
    );

    let pb = ProgressBar::new(paths.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} files")?,
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()?;
    let per_file: Vec<Vec<GameRecord>> = pool.install(|| {
        paths
            .par_iter()
            .map(|p| {
                let records = read_game_file(p);
                pb.inc(1);
                records
            })
            .collect::<Result<_>>()
    })?;
    pb.finish_and_clear();

    Ok(per_file.into_iter().flatten().collect())
}
