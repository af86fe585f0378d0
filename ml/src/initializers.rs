//! Weight initializers, following the keras defaults the networks were designed with.
//!
//! All initializers draw from a caller supplied random number generator, so a fixed seed
//! always reproduces the same weights.
use ndarray::*;
use rand::Rng;
use rand_distr::StandardNormal;
use serde_derive::{Deserialize, Serialize};

use crate::WeightPrecision;

/// Standard deviation of a standard normal truncated to [-2, 2].
const TRUNCATED_NORMAL_STDDEV: f32 = 0.879_625_66;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initializer {
    /// Variance scaling with scale 2 over the fan-in, drawn from a truncated normal.
    /// He et al., 2015, <https://arxiv.org/abs/1502.01852>
    HeNormal,
    /// Uniform in [-l, l] with l = sqrt(6 / (fan_in + fan_out)).
    GlorotUniform,
    /// Random orthogonal matrix (over the last axis versus all others).
    Orthogonal,
    Zeros,
    /// LSTM bias: zero, except for the forget gate (second quarter) which starts at one.
    UnitForgetBias,
}

/// Fan-in and fan-out of a kernel whose last two axes are input and output channels.
fn fans(shape: &[usize]) -> (usize, usize) {
    match shape.len() {
        0 => (1, 1),
        1 => (shape[0], shape[0]),
        n => {
            let receptive_field: usize = shape[..n - 2].iter().product();
            (receptive_field * shape[n - 2], receptive_field * shape[n - 1])
        }
    }
}

impl Initializer {
    pub fn initialize<R: Rng + ?Sized>(
        &self,
        shape: &[usize],
        rng: &mut R,
    ) -> Result<ArrayD<WeightPrecision>, ShapeError> {
        Ok(match self {
            Initializer::HeNormal => he_normal(shape, rng),
            Initializer::GlorotUniform => glorot_uniform(shape, rng),
            Initializer::Orthogonal => orthogonal(shape, rng)?,
            Initializer::Zeros => ArrayD::zeros(IxDyn(shape)),
            Initializer::UnitForgetBias => unit_forget_bias(shape),
        })
    }
}

/// Samples a standard normal, rejecting everything outside of two standard deviations.
fn truncated_standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f32 {
    loop {
        let z: f32 = rng.sample(StandardNormal);
        if z.abs() <= 2. {
            return z;
        }
    }
}

pub fn he_normal<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> ArrayD<WeightPrecision> {
    let (fan_in, _) = fans(shape);
    let stddev = (2. / fan_in.max(1) as f32).sqrt() / TRUNCATED_NORMAL_STDDEV;
    ArrayD::from_shape_simple_fn(IxDyn(shape), || truncated_standard_normal(rng) * stddev)
}

pub fn glorot_uniform<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> ArrayD<WeightPrecision> {
    let (fan_in, fan_out) = fans(shape);
    let limit = (6. / (fan_in + fan_out).max(1) as f32).sqrt();
    ArrayD::from_shape_simple_fn(IxDyn(shape), || rng.gen_range(-limit..limit))
}

/// Orthogonal initializer. The tensor is viewed as a matrix of
/// (product of all but the last axis) x (last axis); the result has orthonormal rows or
/// columns, whichever are fewer.
pub fn orthogonal<R: Rng + ?Sized>(
    shape: &[usize],
    rng: &mut R,
) -> Result<ArrayD<WeightPrecision>, ShapeError> {
    let cols = shape.last().copied().unwrap_or(1);
    let rows: usize = shape.iter().product::<usize>() / cols.max(1);
    let (tall, short) = (rows.max(cols), rows.min(cols));

    let mut matrix: Array2<WeightPrecision> =
        Array2::from_shape_simple_fn((tall, short), || rng.sample(StandardNormal));
    gram_schmidt(&mut matrix, rng);

    let matrix = if rows < cols {
        matrix.reversed_axes().as_standard_layout().into_owned()
    } else {
        matrix
    };
    ArrayD::from_shape_vec(IxDyn(shape), matrix.into_raw_vec())
}

/// Orthonormalizes the columns of a tall matrix in place (modified Gram-Schmidt).
/// Columns that collapse numerically are redrawn.
fn gram_schmidt<R: Rng + ?Sized>(matrix: &mut Array2<WeightPrecision>, rng: &mut R) {
    let ncols = matrix.len_of(Axis(1));
    let mut j = 0;
    while j < ncols {
        for k in 0..j {
            let projection = matrix.column(k).dot(&matrix.column(j));
            let basis = matrix.column(k).to_owned();
            matrix.column_mut(j).scaled_add(-projection, &basis);
        }
        let norm = matrix.column(j).dot(&matrix.column(j)).sqrt();
        if norm < 1e-6 {
            matrix
                .column_mut(j)
                .mapv_inplace(|_| rng.sample(StandardNormal));
            continue;
        }
        matrix.column_mut(j).mapv_inplace(|a| a / norm);
        j += 1;
    }
}

fn unit_forget_bias(shape: &[usize]) -> ArrayD<WeightPrecision> {
    let mut bias = ArrayD::zeros(IxDyn(shape));
    let units = bias.len() / 4;
    bias.iter_mut()
        .skip(units)
        .take(units)
        .for_each(|b| *b = 1.);
    bias
}
