//! This module provides the activation functions used by the nowcasting networks,
//! namely Relu, Leaky Relu, Sigmoid (plus its piecewise linear approximation) and Tanh.
//!
//! All activation functions are exposed as free functions and, through the [`Activation`]
//! enum, as a graph operation.
use ndarray::*;
use serde_derive::{Deserialize, Serialize};

use crate::ImagePrecision;

/// Relu implementation
pub fn relu<D: Dimension>(data: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    data.mapv(|x| if x > 0. { x } else { 0. })
}

/// Leaky relu implementation, `alpha` is the slope for negative inputs.
pub fn leaky_relu<D: Dimension>(
    data: &Array<ImagePrecision, D>,
    alpha: ImagePrecision,
) -> Array<ImagePrecision, D> {
    data.mapv(|x| if x > 0. { x } else { alpha * x })
}

pub fn sigmoid<D: Dimension>(data: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    data.mapv(|x| 1. / (1. + (-x).exp()))
}

/// Piecewise linear approximation of the sigmoid, `clip(0.2 * x + 0.5, 0, 1)`.
/// This is the gate activation of the recurrent layers.
pub fn hard_sigmoid<D: Dimension>(data: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    data.mapv(|x| (0.2 * x + 0.5).max(0.).min(1.))
}

pub fn tanh<D: Dimension>(data: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    data.mapv(|x| x.tanh())
}

/// Element-wise activation, usable as a standalone graph node or fused into a layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Linear,
    Relu,
    LeakyRelu { alpha: ImagePrecision },
    Sigmoid,
    HardSigmoid,
    Tanh,
}

impl Activation {
    pub fn activate<D: Dimension>(
        &self,
        x: &Array<ImagePrecision, D>,
    ) -> Array<ImagePrecision, D> {
        match *self {
            Activation::Linear => x.clone(),
            Activation::Relu => relu(x),
            Activation::LeakyRelu { alpha } => leaky_relu(x, alpha),
            Activation::Sigmoid => sigmoid(x),
            Activation::HardSigmoid => hard_sigmoid(x),
            Activation::Tanh => tanh(x),
        }
    }

    /// Same as [`Activation::activate`], but reuses the buffer of `x`.
    pub fn activate_inplace<D: Dimension>(
        &self,
        mut x: Array<ImagePrecision, D>,
    ) -> Array<ImagePrecision, D> {
        match *self {
            Activation::Linear => {}
            Activation::Relu => x.mapv_inplace(|a| a.max(0.)),
            Activation::LeakyRelu { alpha } => {
                x.mapv_inplace(|a| if a > 0. { a } else { alpha * a })
            }
            Activation::Sigmoid => x.mapv_inplace(|a| 1. / (1. + (-a).exp())),
            Activation::HardSigmoid => x.mapv_inplace(|a| (0.2 * a + 0.5).max(0.).min(1.)),
            Activation::Tanh => x.mapv_inplace(|a| a.tanh()),
        }
        x
    }
}
