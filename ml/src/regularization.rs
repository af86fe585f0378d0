//! Regularization: dropout and the L2 weight penalty.
//!
//! Both only matter while training. At inference dropout is the identity and the
//! penalty is never looked at, they are provided so that a training harness sees the
//! same semantics as the corresponding keras layers.
use ndarray::*;
use rand::Rng;

use crate::{ImagePrecision, WeightPrecision};

/// Inverted dropout: in training mode every activation is zeroed with probability `rate`
/// and the survivors are scaled by `1 / (1 - rate)`, so inference needs no rescaling.
pub struct DropoutLayer {
    rate: f32,
}

impl DropoutLayer {
    pub fn new(rate: f32) -> Self {
        debug_assert!((0.0..1.0).contains(&rate), "Dropout rate outside of [0, 1)");
        Self { rate }
    }

    /// Dropout at inference time
    pub fn forward<D: Dimension>(&self, x: Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
        x
    }

    pub fn forward_training<D, R>(
        &self,
        mut x: Array<ImagePrecision, D>,
        rng: &mut R,
    ) -> Array<ImagePrecision, D>
    where
        D: Dimension,
        R: Rng + ?Sized,
    {
        if self.rate == 0. {
            return x;
        }
        let scale = 1. / (1. - self.rate);
        let keep = 1. - self.rate as f64;
        x.mapv_inplace(|a| if rng.gen_bool(keep) { a * scale } else { 0. });
        x
    }
}

/// L2 penalty `coefficient * sum(w^2)` of a weight tensor.
pub fn l2_penalty<S, D>(weights: &ArrayBase<S, D>, coefficient: f32) -> f32
where
    S: Data<Elem = WeightPrecision>,
    D: Dimension,
{
    coefficient * weights.fold(0., |acc, w| acc + w * w)
}
