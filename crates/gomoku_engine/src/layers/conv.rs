//! Conv2d and depthwise-separable convolution

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::TensorExt;

pub struct Conv2d {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub padding: usize,
    pub groups: usize,
}

impl Conv2d {
    pub fn load(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        padding: usize,
        groups: usize,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_channels, in_channels / groups, kernel_size, kernel_size),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = if bias {
            let fan_in = (in_channels / groups) * kernel_size * kernel_size;
            let bound = 1.0 / (fan_in as f64).sqrt();
            Some(vb.get_with_hints(
                out_channels,
                "bias",
                candle_nn::Init::Uniform {
                    lo: -bound,
                    up: bound,
                },
            )?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            padding,
            groups,
        })
    }

    /// x: [batch, in, h, w]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = self.weight.cast_like(x)?;
        let y = x.conv2d(&w, self.padding, 1, 1, self.groups)?;
        match &self.bias {
            Some(b) => {
                let channels = b.dims1()?;
                let b = b.cast_like(x)?.reshape((1, channels, 1, 1))?;
                y.broadcast_add(&b)
            }
            None => Ok(y),
        }
    }
}

/// Depthwise k×k convolution followed by a pointwise 1×1 projection.
pub struct DepthwiseSeparableConv {
    pub depthwise: Conv2d,
    pub pointwise: Conv2d,
}

impl DepthwiseSeparableConv {
    pub fn load(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        padding: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let depthwise = Conv2d::load(
            in_channels,
            in_channels,
            kernel_size,
            padding,
            in_channels,
            false,
            vb.pp("depthwise"),
        )?;
        let pointwise = Conv2d::load(
            in_channels,
            out_channels,
            1,
            0,
            1,
            false,
            vb.pp("pointwise"),
        )?;
        Ok(Self {
            depthwise,
            pointwise,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.pointwise.forward(&self.depthwise.forward(x)?)
    }
}
