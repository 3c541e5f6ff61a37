use ndarray::{Array4, Axis};

use crate::{errors::InvalidRange, layers::check_channels, Error};

/// The number of channels of every image tensor
pub const IMAGE_CHANNELS: usize = 3;

/// Per-channel mean of the ImageNet training set, which VGG networks expect
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// Per-channel standard deviation of the ImageNet training set
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Standardizes every channel of an image tensor, `(x - mean) / std`, so
/// raw pixels match the distribution a network was trained on.
#[derive(Clone, Debug)]
pub struct Normalizer {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl Normalizer {
    pub fn new(mean: &[f32], std: &[f32]) -> Result<Self, Error> {
        if mean.len() != IMAGE_CHANNELS {
            return Err(Error::ChannelMismatch(IMAGE_CHANNELS, mean.len()));
        }

        if std.len() != IMAGE_CHANNELS {
            return Err(Error::ChannelMismatch(IMAGE_CHANNELS, std.len()));
        }

        if let Some(bad) = std.iter().find(|s| !s.is_finite() || **s <= 0.0) {
            return Err(Error::InvalidRange(InvalidRange {
                min: f32::MIN_POSITIVE,
                max: f32::MAX,
                value: *bad,
                name: "normalization-std",
            }));
        }

        Ok(Self {
            mean: mean.to_vec(),
            std: std.to_vec(),
        })
    }

    /// The statistics VGG networks from torchvision were trained with
    pub fn imagenet() -> Self {
        Self {
            mean: IMAGENET_MEAN.to_vec(),
            std: IMAGENET_STD.to_vec(),
        }
    }

    pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, Error> {
        check_channels("normalizer input", x, self.mean.len())?;

        let mut out = x.to_owned();
        for ((mut plane, mean), std) in out
            .axis_iter_mut(Axis(1))
            .zip(self.mean.iter())
            .zip(self.std.iter())
        {
            plane.mapv_inplace(|v| (v - mean) / std);
        }

        Ok(out)
    }

    /// The normalization is affine, so the gradient is just scaled by `1/std`
    pub fn backward(&self, grad: &Array4<f32>) -> Array4<f32> {
        let mut out = grad.to_owned();
        for (mut plane, std) in out.axis_iter_mut(Axis(1)).zip(self.std.iter()) {
            plane.mapv_inplace(|v| v / std);
        }

        out
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::imagenet()
    }
}
