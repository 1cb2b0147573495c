//! ConvModel - depthwise-separable conv tower with policy and value heads

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use crate::layers::{DepthwiseSeparableConv, Linear};

const CHANNELS: [usize; 4] = [2, 64, 128, 256];
const KERNEL: usize = 3;
const POLICY_HIDDEN: usize = 256;
const VALUE_HIDDEN: usize = 128;

pub struct ConvModel {
    pub size: usize,
    flat_dim: usize,
    backbone: Vec<DepthwiseSeparableConv>,
    policy: [Linear; 2],
    value: [Linear; 2],
}

impl ConvModel {
    /// Each unpadded 3×3 stage trims two cells per side, so boards below 7 have no features left.
    pub fn min_size() -> usize {
        (CHANNELS.len() - 1) * (KERNEL - 1) + 1
    }

    pub fn load(size: usize, vb: VarBuilder) -> Result<Self> {
        if size < Self::min_size() {
            candle_core::bail!(
                "ConvModel needs a board of at least {} cells per side, got {size}",
                Self::min_size()
            );
        }
        let spatial = size - (CHANNELS.len() - 1) * (KERNEL - 1);
        let flat_dim = CHANNELS[CHANNELS.len() - 1] * spatial * spatial;

        let bb = vb.pp("backbone");
        let backbone = CHANNELS
            .windows(2)
            .enumerate()
            .map(|(i, w)| DepthwiseSeparableConv::load(w[0], w[1], KERNEL, 0, bb.pp(i.to_string())))
            .collect::<Result<Vec<_>>>()?;

        let p = vb.pp("policy");
        let v = vb.pp("value");
        Ok(Self {
            size,
            flat_dim,
            backbone,
            policy: [
                Linear::load(flat_dim, POLICY_HIDDEN, p.pp("0"))?,
                Linear::load(POLICY_HIDDEN, size * size, p.pp("2"))?,
            ],
            value: [
                Linear::load(flat_dim, VALUE_HIDDEN, v.pp("0"))?,
                Linear::load(VALUE_HIDDEN, 1, v.pp("2"))?,
            ],
        })
    }

    pub fn flat_dim(&self) -> usize {
        self.flat_dim
    }

    /// x: [batch, size² + 1] -> [batch, size² + 1]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let n = self.size;
        let batch = x.dim(0)?;

        // [batch, 1, n, n] stone plane plus the side-to-move broadcast over the board
        let stones = x.narrow(1, 0, n * n)?.contiguous()?.reshape((batch, 1, n, n))?;
        let turns = x
            .narrow(1, n * n, 1)?
            .contiguous()?
            .reshape((batch, 1, 1, 1))?
            .broadcast_as((batch, 1, n, n))?
            .contiguous()?;
        let mut h = Tensor::cat(&[&stones, &turns], 1)?;

        for stage in &self.backbone {
            h = candle_nn::ops::silu(&stage.forward(&h)?)?;
        }
        let h = h.reshape((batch, self.flat_dim))?;

        let policy = self.policy[1].forward(&candle_nn::ops::silu(&self.policy[0].forward(&h)?)?)?;
        let value = self.value[1]
            .forward(&candle_nn::ops::silu(&self.value[0].forward(&h)?)?)?
            .tanh()?;
        Tensor::cat(&[&policy, &value], 1)
    }
}
