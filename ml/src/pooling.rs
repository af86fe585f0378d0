//! Resolution changing layers of the encoder-decoder network.
//! Both work on channels-last batches of shape (batch, height, width, channels).
use ndarray::*;

use crate::ImagePrecision;

/// Max pooling with a square window and a stride equal to the window size.
/// Trailing rows and columns that don't fill a whole window are dropped.
pub struct MaxPoolingLayer {
    pool_size: usize,
}

impl MaxPoolingLayer {
    pub fn new(pool_size: usize) -> Self {
        debug_assert!(pool_size > 0, "Pool size of 0 passed");
        Self { pool_size }
    }

    pub fn pool(&self, images: ArrayView4<ImagePrecision>) -> Array4<ImagePrecision> {
        let (batch, height, width, channels) = images.dim();
        let p = self.pool_size;
        let (new_height, new_width) = (height / p, width / p);

        Array4::from_shape_fn((batch, new_height, new_width, channels), |(n, i, j, c)| {
            images
                .slice(s![n, i * p..(i + 1) * p, j * p..(j + 1) * p, c])
                .fold(ImagePrecision::NEG_INFINITY, |acc, &x| acc.max(x))
        })
    }
}

/// Nearest neighbour upsampling, every pixel is repeated `size` times along height and width.
pub struct UpSamplingLayer {
    size: usize,
}

impl UpSamplingLayer {
    pub fn new(size: usize) -> Self {
        debug_assert!(size > 0, "Upsampling factor of 0 passed");
        Self { size }
    }

    pub fn upsample(&self, images: ArrayView4<ImagePrecision>) -> Array4<ImagePrecision> {
        let (batch, height, width, channels) = images.dim();
        let s = self.size;
        Array4::from_shape_fn((batch, height * s, width * s, channels), |(n, i, j, c)| {
            images[[n, i / s, j / s, c]]
        })
    }
}
