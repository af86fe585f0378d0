use ndarray::*;

use crate::{
    activation_functions::Activation,
    convolutions::{ConvolutionLayer, Padding},
    ImagePrecision, WeightPrecision,
};

/// Convolutional LSTM layer, as introduced by X. Shi, Z. Chen, H. Wang, D. Yeung, W. Wong, W. Woo
/// in "Convolutional LSTM Network: A Machine Learning Approach for Precipitation Nowcasting"
/// <https://arxiv.org/abs/1506.04214>.
///
/// Input and output are channels-last sequences of shape (batch, time, height, width, channels).
/// The four gates are stacked along the last axis of the kernels in the order
/// input, forget, cell, output (as keras saves them):
/// - kernel: kernel height x kernel width x input channels x 4 * filters
/// - recurrent kernel: kernel height x kernel width x filters x 4 * filters
/// - bias: 4 * filters
///
/// The recurrent convolution always uses "same" padding, so the state keeps the spatial
/// size of the convolved input.
pub struct ConvLstmLayer {
    input_convolution: ConvolutionLayer,
    recurrent_convolution: ConvolutionLayer,
    filters: usize,
    activation: Activation,
    recurrent_activation: Activation,
    return_sequences: bool,
}

impl ConvLstmLayer {
    pub fn new(
        kernel: Array4<WeightPrecision>,
        recurrent_kernel: Array4<WeightPrecision>,
        bias: Array1<WeightPrecision>,
        padding: Padding,
        activation: Activation,
        recurrent_activation: Activation,
        return_sequences: bool,
    ) -> Result<ConvLstmLayer, ShapeError> {
        let filters = recurrent_kernel.len_of(Axis(2));
        if recurrent_kernel.len_of(Axis(3)) != 4 * filters || kernel.len_of(Axis(3)) != 4 * filters
        {
            return Err(ShapeError::from_kind(ErrorKind::IncompatibleShape));
        }
        let recurrent_bias = Array1::zeros(4 * filters);

        Ok(ConvLstmLayer {
            input_convolution: ConvolutionLayer::new(kernel, bias, 1, padding)?,
            recurrent_convolution: ConvolutionLayer::new(
                recurrent_kernel,
                recurrent_bias,
                1,
                Padding::Same,
            )?,
            filters,
            activation,
            recurrent_activation,
            return_sequences,
        })
    }

    /// Runs the layer over whole sequences. Returns all hidden states
    /// (batch, time, height, width, filters) if the layer returns sequences,
    /// else only the last one (batch, height, width, filters).
    pub fn forward(
        &self,
        sequences: ArrayView5<ImagePrecision>,
    ) -> Result<ArrayD<ImagePrecision>, ShapeError> {
        let outputs = sequences
            .outer_iter()
            .map(|sequence| self.run_sequence(sequence))
            .collect::<Result<Vec<_>, _>>()?;
        let views: Vec<_> = outputs.iter().map(|a| a.view()).collect();
        Ok(stack(Axis(0), &views)?.into_dyn())
    }

    fn run_sequence(
        &self,
        sequence: ArrayView4<ImagePrecision>,
    ) -> Result<ArrayD<ImagePrecision>, ShapeError> {
        let f = self.filters;
        let mut state: Option<(Array3<ImagePrecision>, Array3<ImagePrecision>)> = None;
        let mut hidden_states = Vec::with_capacity(sequence.len_of(Axis(0)));

        for frame in sequence.outer_iter() {
            let mut z = self.input_convolution.convolve_image(frame)?;
            let (hidden, cell) = match state.take() {
                Some(s) => s,
                None => {
                    let dim = (z.len_of(Axis(0)), z.len_of(Axis(1)), f);
                    (Array3::zeros(dim), Array3::zeros(dim))
                }
            };
            z += &self
                .recurrent_convolution
                .convolve_image(hidden.view())?;

            let gate = |k: usize, activation: Activation| {
                activation.activate_inplace(z.slice(s![.., .., k * f..(k + 1) * f]).to_owned())
            };
            let input_gate = gate(0, self.recurrent_activation);
            let forget_gate = gate(1, self.recurrent_activation);
            let candidate = gate(2, self.activation);
            let output_gate = gate(3, self.recurrent_activation);

            let cell = forget_gate * &cell + &(input_gate * &candidate);
            let hidden = output_gate * &self.activation.activate(&cell);

            if self.return_sequences {
                hidden_states.push(hidden.clone());
            }
            state = Some((hidden, cell));
        }

        if self.return_sequences {
            let views: Vec<_> = hidden_states.iter().map(|a| a.view()).collect();
            Ok(stack(Axis(0), &views)?.into_dyn())
        } else {
            let (hidden, _) = state.ok_or_else(|| ShapeError::from_kind(ErrorKind::OutOfBounds))?;
            Ok(hidden.into_dyn())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant_layer(
        input_weight: f32,
        recurrent_weight: f32,
        return_sequences: bool,
    ) -> ConvLstmLayer {
        ConvLstmLayer::new(
            Array4::from_elem((1, 1, 1, 4), input_weight),
            Array4::from_elem((1, 1, 1, 4), recurrent_weight),
            Array1::zeros(4),
            Padding::Same,
            Activation::Tanh,
            Activation::HardSigmoid,
            return_sequences,
        )
        .unwrap()
    }

    #[test]
    fn test_output_shapes() {
        let layer = ConvLstmLayer::new(
            Array4::from_elem((3, 3, 1, 8), 0.1),
            Array4::from_elem((3, 3, 2, 8), 0.1),
            Array1::zeros(8),
            Padding::Same,
            Activation::Tanh,
            Activation::HardSigmoid,
            true,
        )
        .unwrap();
        let sequences = Array5::from_elem((2, 3, 5, 5, 1), 1.);
        assert_eq!(layer.forward(sequences.view()).unwrap().shape(), &[2, 3, 5, 5, 2]);

        let last_only = ConvLstmLayer::new(
            Array4::from_elem((3, 3, 1, 8), 0.1),
            Array4::from_elem((3, 3, 2, 8), 0.1),
            Array1::zeros(8),
            Padding::Same,
            Activation::Tanh,
            Activation::HardSigmoid,
            false,
        )
        .unwrap();
        assert_eq!(last_only.forward(sequences.view()).unwrap().shape(), &[2, 5, 5, 2]);
    }

    #[test]
    fn test_rejects_inconsistent_kernels() {
        let layer = ConvLstmLayer::new(
            Array4::from_elem((3, 3, 1, 8), 0.1),
            Array4::from_elem((3, 3, 3, 8), 0.1),
            Array1::zeros(8),
            Padding::Same,
            Activation::Tanh,
            Activation::HardSigmoid,
            true,
        );
        assert!(layer.is_err());
    }

    #[test]
    fn test_two_steps_by_hand() {
        let layer = constant_layer(1., 0., true);
        let sequences = Array5::ones((1, 2, 1, 1, 1));

        let out = layer.forward(sequences.view()).unwrap();

        // every gate sees z = 1
        let gate = 0.2f32 * 1. + 0.5;
        let candidate = 1f32.tanh();
        let c1 = gate * candidate;
        let h1 = gate * c1.tanh();
        let c2 = gate * c1 + gate * candidate;
        let h2 = gate * c2.tanh();
        assert!((out[[0, 0, 0, 0, 0]] - h1).abs() < 1e-6);
        assert!((out[[0, 1, 0, 0, 0]] - h2).abs() < 1e-6);
    }

    #[test]
    fn test_recurrent_kernel_feeds_back() {
        let sequences = Array5::ones((1, 2, 1, 1, 1));
        let without = constant_layer(1., 0., false).forward(sequences.view()).unwrap();
        let with = constant_layer(1., 1., false).forward(sequences.view()).unwrap();

        // the first hidden state is positive, so feeding it back opens all gates further
        assert!(with[[0, 0, 0, 0]] > without[[0, 0, 0, 0]]);
    }

    #[test]
    fn test_samples_are_independent() {
        let layer = constant_layer(0.5, 0.5, true);
        let batch = Array::from_shape_fn((2, 3, 2, 2, 1), |(n, t, i, j, _)| {
            (n as f32 + 1.) * (t + i + j) as f32 * 0.1
        });
        let single = batch.slice(s![1..2, .., .., .., ..]);

        let out_batch = layer.forward(batch.view()).unwrap();
        let out_single = layer.forward(single).unwrap();

        assert_eq!(
            out_batch.slice(s![1..2, .., .., .., ..]).to_owned().into_dyn(),
            out_single
        );
    }
}
