//! Optimizers and epoch-level learning-rate schedules.

use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer as _, ParamsAdamW, SGD};
use serde::Deserialize;

use crate::config::ConfigError;

fn default_betas() -> (f64, f64) {
    (0.9, 0.999)
}

fn default_eps() -> f64 {
    1e-8
}

fn default_gamma() -> f64 {
    0.1
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdamParams {
    pub lr: f64,
    #[serde(default = "default_betas")]
    pub betas: (f64, f64),
    #[serde(default = "default_eps")]
    pub eps: f64,
    /// Decoupled decay. Defaults to 0 for `Adam` and 0.01 for `AdamW`.
    #[serde(default)]
    pub weight_decay: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SgdParams {
    pub lr: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OptimizerSpec {
    Adam(AdamParams),
    AdamW(AdamParams),
    Sgd(SgdParams),
}

impl OptimizerSpec {
    pub fn name(&self) -> &'static str {
        match self {
            OptimizerSpec::Adam(_) => "Adam",
            OptimizerSpec::AdamW(_) => "AdamW",
            OptimizerSpec::Sgd(_) => "SGD",
        }
    }

    pub fn lr(&self) -> f64 {
        match self {
            OptimizerSpec::Adam(p) | OptimizerSpec::AdamW(p) => p.lr,
            OptimizerSpec::Sgd(p) => p.lr,
        }
    }

    pub fn validate(&self, path: &str) -> Result<(), ConfigError> {
        let lr = self.lr();
        if !(lr.is_finite() && lr > 0.0) {
            return Err(ConfigError::invalid(path, format!("lr must be positive, got {lr}")));
        }
        if let OptimizerSpec::Adam(p) | OptimizerSpec::AdamW(p) = self {
            let (b1, b2) = p.betas;
            if !(0.0..1.0).contains(&b1) || !(0.0..1.0).contains(&b2) {
                return Err(ConfigError::invalid(
                    path,
                    format!("betas must lie in [0, 1), got ({b1}, {b2})"),
                ));
            }
            if p.eps <= 0.0 {
                return Err(ConfigError::invalid(path, "eps must be positive"));
            }
            if p.weight_decay.is_some_and(|wd| wd < 0.0) {
                return Err(ConfigError::invalid(path, "weight_decay must be >= 0"));
            }
        }
        Ok(())
    }

    pub fn build(&self, vars: Vec<Var>) -> candle_core::Result<Optimizer> {
        let adamw = |p: &AdamParams, default_decay: f64| {
            AdamW::new(
                vars.clone(),
                ParamsAdamW {
                    lr: p.lr,
                    beta1: p.betas.0,
                    beta2: p.betas.1,
                    eps: p.eps,
                    weight_decay: p.weight_decay.unwrap_or(default_decay),
                },
            )
        };
        let inner = match self {
            OptimizerSpec::Adam(p) => Inner::AdamW(adamw(p, 0.0)?),
            OptimizerSpec::AdamW(p) => Inner::AdamW(adamw(p, 0.01)?),
            OptimizerSpec::Sgd(p) => Inner::Sgd(SGD::new(vars, p.lr)?),
        };
        Ok(Optimizer {
            name: self.name(),
            inner,
        })
    }
}

enum Inner {
    AdamW(AdamW),
    Sgd(SGD),
}

/// A candle optimizer chosen at runtime.
pub struct Optimizer {
    name: &'static str,
    inner: Inner,
}

impl Optimizer {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> candle_core::Result<()> {
        match &mut self.inner {
            Inner::AdamW(o) => o.backward_step(loss),
            Inner::Sgd(o) => o.backward_step(loss),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match &self.inner {
            Inner::AdamW(o) => o.learning_rate(),
            Inner::Sgd(o) => o.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.inner {
            Inner::AdamW(o) => o.set_learning_rate(lr),
            Inner::Sgd(o) => o.set_learning_rate(lr),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CosineParams {
    #[serde(rename = "T_max")]
    pub t_max: usize,
    #[serde(default)]
    pub eta_min: f64,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepParams {
    pub step_size: usize,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
}

/// Learning-rate schedule, stepped once per epoch.
#[derive(Clone, Debug, PartialEq)]
pub enum SchedulerSpec {
    CosineAnnealing(CosineParams),
    Step(StepParams),
}

impl SchedulerSpec {
    pub fn name(&self) -> &'static str {
        match self {
            SchedulerSpec::CosineAnnealing(_) => "CosineAnnealingLR",
            SchedulerSpec::Step(_) => "StepLR",
        }
    }

    pub fn validate(&self, path: &str) -> Result<(), ConfigError> {
        match self {
            SchedulerSpec::CosineAnnealing(p) if p.t_max == 0 => {
                Err(ConfigError::invalid(path, "T_max must be at least 1"))
            }
            SchedulerSpec::CosineAnnealing(p) if p.eta_min < 0.0 => {
                Err(ConfigError::invalid(path, "eta_min must be >= 0"))
            }
            SchedulerSpec::Step(p) if p.step_size == 0 => {
                Err(ConfigError::invalid(path, "step_size must be at least 1"))
            }
            _ => Ok(()),
        }
    }

    /// Learning rate for `epoch` (0-based), given the optimizer's initial rate.
    pub fn lr_at(&self, base_lr: f64, epoch: usize) -> f64 {
        match self {
            SchedulerSpec::CosineAnnealing(p) => {
                let phase = std::f64::consts::PI * epoch as f64 / p.t_max as f64;
                p.eta_min + (base_lr - p.eta_min) * (1.0 + phase.cos()) / 2.0
            }
            SchedulerSpec::Step(p) => base_lr * p.gamma.powi((epoch / p.step_size) as i32),
        }
    }
}
