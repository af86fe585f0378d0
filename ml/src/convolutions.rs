use ndarray::*;
use serde_derive::{Deserialize, Serialize};

use crate::{ImagePrecision, WeightPrecision};

/// Padding scheme of a sliding window.
///
/// Same pads with zeros so that the output has extent `ceil(input / stride)`, with the larger
/// half of the padding at the end (bottom / right). Valid doesn't pad at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    Same,
    Valid,
}

/// Position of the channel axis in a tensor, directly after the batch axis
/// (channels first) or at the very end (channels last).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    ChannelsLast,
    ChannelsFirst,
}

/// Returns (output extent, padding before, padding after) of a window of the given size
/// sliding over an axis of length `extent`. None if the window doesn't fit, the stride is
/// zero or the padded extent overflows.
pub fn window_geometry(
    extent: usize,
    window: usize,
    stride: usize,
    padding: Padding,
) -> Option<(usize, usize, usize)> {
    if extent == 0 || stride == 0 {
        return None;
    }
    match padding {
        Padding::Same => {
            let out = (extent - 1) / stride + 1;
            let needed = ((out - 1) * stride).checked_add(window)?.saturating_sub(extent);
            Some((out, needed / 2, needed - needed / 2))
        }
        Padding::Valid => {
            if extent < window {
                None
            } else {
                Some(((extent - window) / stride + 1, 0, 0))
            }
        }
    }
}

fn incompatible() -> ShapeError {
    ShapeError::from_kind(ErrorKind::IncompatibleShape)
}

/// Rust implementation of a 2D convolutional layer working on channels-last data.
/// The weight matrix shall have dimension (in that order)
/// kernel height x kernel width x input channels x filters
/// (to comply with the order in which keras weights are saved).
///
/// The convolution itself is computed as a single matrix product of the im2col
/// representation of the image with the flattened kernel, read more here:
/// https://leonardoaraujosantos.gitbook.io/artificial-inteligence/machine_learning/deep_learning/convolution_layer/making_faster
pub struct ConvolutionLayer {
    /// Kernel flattened to (kernel height * kernel width * input channels) x filters
    kernel: Array2<WeightPrecision>,
    bias: Array1<WeightPrecision>,
    kernel_height: usize,
    kernel_width: usize,
    stride: usize,
    padding: Padding,
    num_input_channels: usize,
    num_filters: usize,
}

impl ConvolutionLayer {
    pub fn new(
        weights: Array4<WeightPrecision>,
        bias: Array1<WeightPrecision>,
        stride: usize,
        padding: Padding,
    ) -> Result<ConvolutionLayer, ShapeError> {
        let (kernel_height, kernel_width, num_input_channels, num_filters) = weights.dim();

        debug_assert!(stride > 0, "Stride of 0 passed");
        if bias.len() != num_filters {
            return Err(incompatible());
        }

        let kernel = weights
            .as_standard_layout()
            .into_owned()
            .into_shape((kernel_height * kernel_width * num_input_channels, num_filters))?;

        Ok(ConvolutionLayer {
            kernel,
            bias,
            kernel_height,
            kernel_width,
            stride,
            padding,
            num_input_channels,
            num_filters,
        })
    }

    /// Convolves a batch of images of shape (batch, height, width, channels).
    pub fn convolve(
        &self,
        images: ArrayView4<ImagePrecision>,
    ) -> Result<Array4<ImagePrecision>, ShapeError> {
        let convolved = images
            .outer_iter()
            .map(|image| self.convolve_image(image))
            .collect::<Result<Vec<_>, _>>()?;
        let views: Vec<_> = convolved.iter().map(|a| a.view()).collect();
        stack(Axis(0), &views)
    }

    /// Convolves a single image of shape (height, width, channels).
    pub fn convolve_image(
        &self,
        image: ArrayView3<ImagePrecision>,
    ) -> Result<Array3<ImagePrecision>, ShapeError> {
        let (im_height, im_width, im_channels) = image.dim();
        if im_channels != self.num_input_channels {
            return Err(incompatible());
        }

        let (new_im_height, pad_top, pad_bottom) =
            window_geometry(im_height, self.kernel_height, self.stride, self.padding)
                .ok_or_else(incompatible)?;
        let (new_im_width, pad_left, pad_right) =
            window_geometry(im_width, self.kernel_width, self.stride, self.padding)
                .ok_or_else(incompatible)?;

        let padded = pad_3d(image, (pad_top, pad_bottom), (pad_left, pad_right));
        let im_col = self.im2col(padded.view(), new_im_height, new_im_width);

        let activations = im_col.dot(&self.kernel) + &self.bias;
        activations.into_shape((new_im_height, new_im_width, self.num_filters))
    }

    /// Every row of the returned matrix holds one (flattened) receptive field of the output,
    /// in the same order as the flattened kernel.
    fn im2col(
        &self,
        padded: ArrayView3<ImagePrecision>,
        new_im_height: usize,
        new_im_width: usize,
    ) -> Array2<ImagePrecision> {
        let row_length = self.kernel_height * self.kernel_width * self.num_input_channels;
        let mut img_matrix = Array2::zeros((new_im_height * new_im_width, row_length));

        let mut row = 0;
        for i in 0..new_im_height {
            let i_with_stride = i * self.stride;
            for j in 0..new_im_width {
                let j_with_stride = j * self.stride;
                let patch = padded.slice(s![
                    i_with_stride..(i_with_stride + self.kernel_height),
                    j_with_stride..(j_with_stride + self.kernel_width),
                    ..
                ]);
                img_matrix
                    .row_mut(row)
                    .iter_mut()
                    .zip(patch.iter())
                    .for_each(|(dst, src)| *dst = *src);
                row += 1;
            }
        }
        img_matrix
    }
}

/// Zero-pads the first two axes of a channels-last image.
fn pad_3d(
    image: ArrayView3<ImagePrecision>,
    (top, bottom): (usize, usize),
    (left, right): (usize, usize),
) -> Array3<ImagePrecision> {
    let (height, width, channels) = image.dim();
    let mut padded = Array3::zeros((height + top + bottom, width + left + right, channels));
    // https://github.com/rust-ndarray/ndarray/issues/823
    padded
        .slice_mut(s![top..top + height, left..left + width, ..])
        .assign(&image);
    padded
}

/// Zero-pads the first three axes of a channels-last volume.
fn pad_4d(volume: ArrayView4<ImagePrecision>, pads: [(usize, usize); 3]) -> Array4<ImagePrecision> {
    let (depth, height, width, channels) = volume.dim();
    let [(front, back), (top, bottom), (left, right)] = pads;
    let mut padded = Array4::zeros((
        depth + front + back,
        height + top + bottom,
        width + left + right,
        channels,
    ));
    padded
        .slice_mut(s![
            front..front + depth,
            top..top + height,
            left..left + width,
            ..
        ])
        .assign(&volume);
    padded
}

/// 3D convolution over volumes (depth, height, width) with channels.
/// The weight matrix shall have dimension
/// kernel depth x kernel height x kernel width x input channels x filters.
///
/// The layer reads and writes tensors in the layout given by its [`DataFormat`]:
/// (batch, depth, height, width, channels) or (batch, channels, depth, height, width).
pub struct Convolution3dLayer {
    /// Kernel flattened to (kernel volume * input channels) x filters
    kernel: Array2<WeightPrecision>,
    bias: Array1<WeightPrecision>,
    kernel_size: [usize; 3],
    stride: usize,
    padding: Padding,
    data_format: DataFormat,
    num_input_channels: usize,
    num_filters: usize,
}

impl Convolution3dLayer {
    pub fn new(
        weights: Array5<WeightPrecision>,
        bias: Array1<WeightPrecision>,
        stride: usize,
        padding: Padding,
        data_format: DataFormat,
    ) -> Result<Convolution3dLayer, ShapeError> {
        let (kd, kh, kw, num_input_channels, num_filters) = weights.dim();

        debug_assert!(stride > 0, "Stride of 0 passed");
        if bias.len() != num_filters {
            return Err(incompatible());
        }

        let kernel = weights
            .as_standard_layout()
            .into_owned()
            .into_shape((kd * kh * kw * num_input_channels, num_filters))?;

        Ok(Convolution3dLayer {
            kernel,
            bias,
            kernel_size: [kd, kh, kw],
            stride,
            padding,
            data_format,
            num_input_channels,
            num_filters,
        })
    }

    pub fn convolve(
        &self,
        volumes: ArrayView5<ImagePrecision>,
    ) -> Result<Array5<ImagePrecision>, ShapeError> {
        let convolved = volumes
            .outer_iter()
            .map(|volume| match self.data_format {
                DataFormat::ChannelsLast => self.convolve_volume(volume),
                DataFormat::ChannelsFirst => {
                    let out = self.convolve_volume(volume.permuted_axes([1, 2, 3, 0]))?;
                    Ok(out
                        .permuted_axes([3, 0, 1, 2])
                        .as_standard_layout()
                        .into_owned())
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        let views: Vec<_> = convolved.iter().map(|a| a.view()).collect();
        stack(Axis(0), &views)
    }

    /// Convolves a single channels-last volume of shape (depth, height, width, channels).
    fn convolve_volume(
        &self,
        volume: ArrayView4<ImagePrecision>,
    ) -> Result<Array4<ImagePrecision>, ShapeError> {
        let (depth, height, width, channels) = volume.dim();
        if channels != self.num_input_channels {
            return Err(incompatible());
        }

        let mut out_extent = [0; 3];
        let mut pads = [(0, 0); 3];
        for (axis, extent) in [depth, height, width].iter().enumerate() {
            let (out, before, after) =
                window_geometry(*extent, self.kernel_size[axis], self.stride, self.padding)
                    .ok_or_else(incompatible)?;
            out_extent[axis] = out;
            pads[axis] = (before, after);
        }

        let padded = pad_4d(volume, pads);
        let [kd, kh, kw] = self.kernel_size;
        let [new_depth, new_height, new_width] = out_extent;

        let mut vol_matrix = Array2::zeros((
            new_depth * new_height * new_width,
            kd * kh * kw * self.num_input_channels,
        ));
        let mut row = 0;
        for d in 0..new_depth {
            let d0 = d * self.stride;
            for i in 0..new_height {
                let i0 = i * self.stride;
                for j in 0..new_width {
                    let j0 = j * self.stride;
                    let patch = padded.slice(s![d0..d0 + kd, i0..i0 + kh, j0..j0 + kw, ..]);
                    vol_matrix
                        .row_mut(row)
                        .iter_mut()
                        .zip(patch.iter())
                        .for_each(|(dst, src)| *dst = *src);
                    row += 1;
                }
            }
        }

        let activations = vol_matrix.dot(&self.kernel) + &self.bias;
        activations.into_shape((new_depth, new_height, new_width, self.num_filters))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Naive implementation of 2d convolution for reference
    fn conv_2d_naive(
        image: &Array3<ImagePrecision>,
        kernel: &Array4<WeightPrecision>,
        padding: Padding,
    ) -> Array3<ImagePrecision> {
        let (h, w, _) = image.dim();
        let (kh, kw, cin, cout) = kernel.dim();
        let (out_h, top, _) = window_geometry(h, kh, 1, padding).unwrap();
        let (out_w, left, _) = window_geometry(w, kw, 1, padding).unwrap();
        let mut ret = Array3::zeros((out_h, out_w, cout));
        for i in 0..out_h {
            for j in 0..out_w {
                for f in 0..cout {
                    let mut acc = 0.;
                    for di in 0..kh {
                        for dj in 0..kw {
                            let y = (i + di) as isize - top as isize;
                            let x = (j + dj) as isize - left as isize;
                            if y < 0 || x < 0 || y >= h as isize || x >= w as isize {
                                continue;
                            }
                            for c in 0..cin {
                                acc += image[[y as usize, x as usize, c]] * kernel[[di, dj, c, f]];
                            }
                        }
                    }
                    ret[[i, j, f]] = acc;
                }
            }
        }
        ret
    }

    #[test]
    fn test_window_geometry() {
        assert_eq!(window_geometry(5, 3, 1, Padding::Same), Some((5, 1, 1)));
        assert_eq!(window_geometry(5, 2, 1, Padding::Same), Some((5, 0, 1)));
        assert_eq!(window_geometry(5, 1, 1, Padding::Same), Some((5, 0, 0)));
        assert_eq!(window_geometry(5, 3, 2, Padding::Same), Some((3, 1, 1)));
        assert_eq!(window_geometry(5, 3, 1, Padding::Valid), Some((3, 0, 0)));
        assert_eq!(window_geometry(2, 3, 1, Padding::Valid), None);
        assert_eq!(window_geometry(5, 3, 0, Padding::Same), None);
        assert_eq!(window_geometry(usize::MAX, 3, 1, Padding::Same), None);
        assert_eq!(
            window_geometry(usize::MAX, 1, 2, Padding::Same),
            Some((usize::MAX / 2 + 1, 0, 0))
        );
    }

    #[test]
    fn test_2d_conv_valid() {
        let test_img = array![[0., 1., 0.], [0., 0., 0.], [-1., 0., 0.]].insert_axis(Axis(2));
        let kernel = Array::from_shape_vec((2, 2, 1, 1), vec![0., 1., -1., 0.]).unwrap();
        let conv_layer = ConvolutionLayer::new(kernel, array![0.], 1, Padding::Valid).unwrap();

        let convolved_image = conv_layer.convolve_image(test_img.view()).unwrap();

        assert_eq!(
            convolved_image,
            array![[1., 0.], [1., 0.]].insert_axis(Axis(2))
        );
    }

    #[test]
    fn test_2d_conv_with_stride() {
        let test_img = array![[0., 1., 0.], [0., 0., 0.], [-1., 0., 0.]].insert_axis(Axis(2));
        let kernel = Array::from_shape_vec((1, 1, 1, 1), vec![1.]).unwrap();
        let conv_layer = ConvolutionLayer::new(kernel, array![0.], 2, Padding::Valid).unwrap();

        let convolved_image = conv_layer.convolve_image(test_img.view()).unwrap();

        assert_eq!(
            convolved_image,
            array![[0., 0.], [-1., 0.]].insert_axis(Axis(2))
        );
    }

    #[test]
    fn test_2d_conv_same_with_bias() {
        let test_img = Array3::ones((3, 3, 1));
        let kernel = Array4::ones((3, 3, 1, 1));
        let conv_layer = ConvolutionLayer::new(kernel, array![1.], 1, Padding::Same).unwrap();

        let convolved_image = conv_layer.convolve_image(test_img.view()).unwrap();

        // number of in-bounds neighbours plus the bias
        let expected = array![[5., 7., 5.], [7., 10., 7.], [5., 7., 5.]].insert_axis(Axis(2));
        assert_eq!(convolved_image, expected);
    }

    #[test]
    fn test_2d_conv_matches_naive() {
        let test_img = Array::from_shape_fn((5, 4, 3), |(i, j, c)| {
            (i as f32 - 2.) * 0.5 + j as f32 * 0.25 - c as f32
        });
        let kernel = Array::from_shape_fn((3, 3, 3, 2), |(a, b, c, d)| {
            ((a * 7 + b * 5 + c * 3 + d) % 5) as f32 - 2.
        });
        for &padding in [Padding::Same, Padding::Valid].iter() {
            let conv_layer =
                ConvolutionLayer::new(kernel.clone(), Array1::zeros(2), 1, padding).unwrap();
            let fast = conv_layer.convolve_image(test_img.view()).unwrap();
            let naive = conv_2d_naive(&test_img, &kernel, padding);
            assert_eq!(fast.dim(), naive.dim());
            for (a, b) in fast.iter().zip(naive.iter()) {
                assert!((a - b).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_2d_conv_batch() {
        let images = Array::from_shape_fn((2, 4, 4, 1), |(n, i, j, _)| (n * 16 + i * 4 + j) as f32);
        let kernel = Array4::ones((1, 1, 1, 3));
        let conv_layer =
            ConvolutionLayer::new(kernel, array![0., 1., 2.], 1, Padding::Same).unwrap();

        let out = conv_layer.convolve(images.view()).unwrap();

        assert_eq!(out.dim(), (2, 4, 4, 3));
        assert_eq!(out[[1, 2, 3, 0]], 27.);
        assert_eq!(out[[1, 2, 3, 2]], 29.);
    }

    #[test]
    fn test_2d_conv_rejects_wrong_channels() {
        let conv_layer =
            ConvolutionLayer::new(Array4::ones((3, 3, 2, 1)), array![0.], 1, Padding::Same)
                .unwrap();
        assert!(conv_layer
            .convolve_image(Array3::zeros((4, 4, 3)).view())
            .is_err());
    }

    #[test]
    fn test_3d_conv_channels_last() {
        // a 1x1x1 kernel only mixes channels
        let volumes = Array::from_shape_fn((1, 2, 3, 3, 2), |(_, d, _, _, c)| (d + c) as f32);
        let kernel = Array::from_shape_vec((1, 1, 1, 2, 1), vec![1., 10.]).unwrap();
        let layer = Convolution3dLayer::new(
            kernel,
            array![0.],
            1,
            Padding::Same,
            DataFormat::ChannelsLast,
        )
        .unwrap();

        let out = layer.convolve(volumes.view()).unwrap();

        assert_eq!(out.shape(), &[1, 2, 3, 3, 1]);
        assert_eq!(out[[0, 0, 1, 1, 0]], 10.);
        assert_eq!(out[[0, 1, 1, 1, 0]], 21.);
    }

    #[test]
    fn test_3d_conv_channels_first() {
        // Six channels (time steps) on a 4x4x1 volume, three filters
        let volumes = Array::from_shape_fn((2, 6, 4, 4, 1), |(n, t, i, j, _)| {
            (n + t) as f32 * 0.1 + (i * 4 + j) as f32 * 0.01
        });
        let kernel = Array5::from_elem((3, 3, 3, 6, 3), 0.5);
        let layer = Convolution3dLayer::new(
            kernel,
            array![0., 0., 1.],
            1,
            Padding::Same,
            DataFormat::ChannelsFirst,
        )
        .unwrap();

        let out = layer.convolve(volumes.view()).unwrap();

        assert_eq!(out.shape(), &[2, 3, 4, 4, 1]);
        // filters only differ by their bias
        assert!((out[[0, 2, 1, 1, 0]] - out[[0, 0, 1, 1, 0]] - 1.).abs() < 1e-5);

        // in channels first layout the last axis is spatial, depth 1 survives "same" padding
        let layout_swapped = Convolution3dLayer::new(
            Array5::from_elem((3, 3, 3, 6, 3), 0.5),
            array![0., 0., 1.],
            1,
            Padding::Same,
            DataFormat::ChannelsLast,
        )
        .unwrap();
        assert!(layout_swapped.convolve(volumes.view()).is_err());
    }
}
