//! Linear - Fully connected layer with dtype-following weights

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::TensorExt;

pub struct Linear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub in_features: usize,
    pub out_features: usize,
}

impl Linear {
    pub fn load(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_dim, in_dim),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bound = 1.0 / (in_dim as f64).sqrt();
        let bias = vb.get_with_hints(
            out_dim,
            "bias",
            candle_nn::Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?;
        Ok(Self {
            weight,
            bias: Some(bias),
            in_features: in_dim,
            out_features: out_dim,
        })
    }

    /// x: [batch, in] -> [batch, out]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = self.weight.cast_like(x)?;
        let y = x.matmul(&w.t()?)?;
        match &self.bias {
            Some(b) => y.broadcast_add(&b.cast_like(x)?),
            None => Ok(y),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn output_shape_and_registered_vars() -> anyhow::Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = Linear::load(4, 3, vb.pp("fc"))?;

        let x = Tensor::ones((2, 4), DType::F32, &Device::Cpu)?;
        let y = layer.forward(&x)?;
        assert_eq!(y.dims(), &[2, 3]);
        assert_eq!(varmap.all_vars().len(), 2);
        Ok(())
    }
}
