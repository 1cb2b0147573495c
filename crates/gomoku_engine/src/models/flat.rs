//! FlatModel - MLP policy/value network

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::squash_value_column;
use crate::layers::Linear;

const HIDDEN_DIM: usize = 512;

pub struct FlatModel {
    pub size: usize,
    backbone: [Linear; 2],
    policy_value: [Linear; 2],
}

impl FlatModel {
    pub fn load(size: usize, vb: VarBuilder) -> Result<Self> {
        let io_dim = size * size + 1;
        let bb = vb.pp("backbone");
        let pv = vb.pp("policy_value");
        Ok(Self {
            size,
            backbone: [
                Linear::load(io_dim, HIDDEN_DIM, bb.pp("0"))?,
                Linear::load(HIDDEN_DIM, HIDDEN_DIM, bb.pp("2"))?,
            ],
            policy_value: [
                Linear::load(HIDDEN_DIM, HIDDEN_DIM, pv.pp("0"))?,
                Linear::load(HIDDEN_DIM, io_dim, pv.pp("2"))?,
            ],
        })
    }

    /// x: [batch, size² + 1] -> [batch, size² + 1]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = candle_nn::ops::silu(&self.backbone[0].forward(x)?)?;
        let x = candle_nn::ops::silu(&self.backbone[1].forward(&x)?)?;
        let x = candle_nn::ops::silu(&self.policy_value[0].forward(&x)?)?;
        let x = self.policy_value[1].forward(&x)?;
        squash_value_column(&x, self.size * self.size)
    }
}
