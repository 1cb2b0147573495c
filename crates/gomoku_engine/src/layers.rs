//! Layers Module - Building blocks shared by the policy/value models
//!
//! Every layer keeps F32 master weights in the `VarMap` and casts them to the
//! dtype of its input, so the same parameters serve F32, F16 and BF16 compute.

use candle_core::{Result, Tensor};

pub mod conv;
pub mod init;
pub mod linear;

pub use conv::{Conv2d, DepthwiseSeparableConv};
pub use init::reseed_parameters;
pub use linear::Linear;

pub(crate) trait TensorExt {
    /// Returns `self` converted to the dtype of `like` (no-op when they match).
    fn cast_like(&self, like: &Tensor) -> Result<Tensor>;
}

impl TensorExt for Tensor {
    fn cast_like(&self, like: &Tensor) -> Result<Tensor> {
        if self.dtype() == like.dtype() {
            Ok(self.clone())
        } else {
            self.to_dtype(like.dtype())
        }
    }
}
