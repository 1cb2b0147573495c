//! Init - Reproducible parameter initialization
//!
//! candle's CPU backend draws initial weights from an unseeded generator, so a
//! run seed alone cannot reproduce them. `reseed_parameters` redraws every
//! variable from a seeded `StdRng`, with the distributions the layers use:
//! Kaiming-normal weights and `U(-1/√fan_in, 1/√fan_in)` biases.

use candle_core::{Device, Error, Result, Tensor};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Uniform};

/// `in_channels · kernel area` for conv weights, `in_features` for linear ones.
fn fan_in(dims: &[usize]) -> usize {
    dims.iter().skip(1).product::<usize>().max(1)
}

/// Overwrites every variable of `varmap`, visiting them in name order.
pub fn reseed_parameters(varmap: &VarMap, seed: u64) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| Error::Msg(format!("varmap lock poisoned: {e}")))?;
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    let mut rng = StdRng::seed_from_u64(seed);
    for name in names {
        let var = &data[name];
        let n = var.elem_count();
        let values: Vec<f32> = if var.rank() >= 2 {
            let std = (2.0 / fan_in(var.dims()) as f64).sqrt();
            let normal = Normal::new(0.0, std).map_err(|e| Error::Msg(e.to_string()))?;
            (0..n).map(|_| normal.sample(&mut rng) as f32).collect()
        } else {
            let fan = name
                .strip_suffix("bias")
                .and_then(|prefix| data.get(&format!("{prefix}weight")))
                .map_or(n, |w| fan_in(w.dims()));
            let bound = 1.0 / (fan as f64).sqrt();
            let uniform = Uniform::new_inclusive(-bound, bound);
            (0..n).map(|_| uniform.sample(&mut rng) as f32).collect()
        };
        let init = Tensor::from_vec(values, var.shape().clone(), &Device::Cpu)?
            .to_dtype(var.dtype())?
            .to_device(var.device())?;
        var.set(&init)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Linear;
    use candle_core::DType;
    use candle_nn::VarBuilder;

    fn linear_vars(seed: u64) -> anyhow::Result<(Vec<f32>, Vec<f32>)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = Linear::load(16, 4, vb.pp("fc"))?;
        reseed_parameters(&varmap, seed)?;
        Ok((
            layer.weight.flatten_all()?.to_vec1::<f32>()?,
            layer.bias.as_ref().map_or(Ok(vec![]), |b| b.to_vec1::<f32>())?,
        ))
    }

    #[test]
    fn same_seed_same_parameters() -> anyhow::Result<()> {
        let (w1, b1) = linear_vars(123)?;
        let (w2, b2) = linear_vars(123)?;
        assert_eq!(w1, w2);
        assert_eq!(b1, b2);

        let (w3, _) = linear_vars(124)?;
        assert_ne!(w1, w3);
        Ok(())
    }

    #[test]
    fn bias_stays_within_the_fan_in_bound() -> anyhow::Result<()> {
        let (_, bias) = linear_vars(5)?;
        assert_eq!(bias.len(), 4);
        assert!(bias.iter().all(|b| b.abs() <= 0.25 + 1e-6));
        Ok(())
    }
}
