//! Frozen, pretrained feature networks.
//!
//! A [`FeatureNetwork`] is nothing more than its ordered children. Every
//! child reports an explicit [`LayerKind`], and none of them mutate their
//! input, which is what lets a loss observer be inserted after any of them.

use std::path::Path;

use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use safetensors::{tensor::Dtype, SafeTensors};

use crate::{
    layers::{BatchNorm2d, Conv2d, Layer, LayerKind, MaxPool2d},
    normalize::IMAGE_CHANNELS,
    Error,
};

/// Output channels of each convolution of VGG19 ("configuration E"), with
/// `None` marking a 2x2 max pool.
const VGG19_FEATURES: &[Option<usize>] = &[
    Some(64),
    Some(64),
    None,
    Some(128),
    Some(128),
    None,
    Some(256),
    Some(256),
    Some(256),
    Some(256),
    None,
    Some(512),
    Some(512),
    Some(512),
    Some(512),
    None,
    Some(512),
    Some(512),
    Some(512),
    Some(512),
    None,
];

/// An ordered stack of frozen layers.
#[derive(Clone, Debug)]
pub struct FeatureNetwork {
    layers: Vec<Layer>,
}

impl FeatureNetwork {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self { layers }
    }

    /// Starts a network with randomly initialized layers, the same seed will
    /// always produce the same weights.
    pub fn builder(seed: u64) -> NetworkBuilder {
        NetworkBuilder::new(seed)
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Iterates the children in order, each paired with its kind
    pub fn classified(&self) -> impl Iterator<Item = (LayerKind, &Layer)> + '_ {
        self.layers.iter().map(|layer| (layer.kind(), layer))
    }

    /// Loads the VGG19 feature stack from a safetensors file.
    ///
    /// See [`FeatureNetwork::vgg19_from_safetensors`]
    pub fn vgg19_from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let bytes = std::fs::read(path)?;
        Self::vgg19_from_safetensors(&bytes)
    }

    /// Builds the 37 children of torchvision's `vgg19().features` from the
    /// tensors of a safetensors buffer.
    ///
    /// Each convolution is looked up by its child index, either as
    /// `features.{i}.weight`/`features.{i}.bias` (a full model state dict) or
    /// as `{i}.weight`/`{i}.bias` (a state dict of `features` alone). Only
    /// `F32` tensors are accepted.
    pub fn vgg19_from_safetensors(bytes: &[u8]) -> Result<Self, Error> {
        let tensors = SafeTensors::deserialize(bytes)?;

        vgg19_with(|index, in_channels, out_channels| {
            let weight = read_f32(&tensors, index, "weight", &[out_channels, in_channels, 3, 3])?;
            let bias = read_f32(&tensors, index, "bias", &[out_channels])?;

            let weights = Array2::from_shape_vec((out_channels, in_channels * 9), weight)
                .map_err(|e| Error::Weights(e.to_string()))?;

            Ok(Conv2d::from_matrix(weights, Array1::from(bias), 3, 1))
        })
    }

    /// A VGG19 shaped network with random weights.
    ///
    /// Random convolutional features still capture texture statistics well
    /// enough to transfer some style, and are handy when pretrained weights
    /// aren't available.
    pub fn vgg19_random(seed: u64) -> Self {
        let mut builder = NetworkBuilder::new(seed);

        for entry in VGG19_FEATURES {
            builder = match entry {
                Some(out) => builder.conv(*out, 3).relu(),
                None => builder.max_pool(2, 2),
            };
        }

        builder.build()
    }
}

fn vgg19_with<F>(mut make_conv: F) -> Result<FeatureNetwork, Error>
where
    F: FnMut(usize, usize, usize) -> Result<Conv2d, Error>,
{
    let mut layers = Vec::with_capacity(37);
    let mut in_channels = IMAGE_CHANNELS;

    for entry in VGG19_FEATURES {
        match entry {
            Some(out_channels) => {
                let conv = make_conv(layers.len(), in_channels, *out_channels)?;
                layers.push(Layer::Conv2d(conv));
                layers.push(Layer::Relu);
                in_channels = *out_channels;
            }
            None => layers.push(Layer::MaxPool2d(MaxPool2d::new(2, 2))),
        }
    }

    Ok(FeatureNetwork::new(layers))
}

fn read_f32(
    tensors: &SafeTensors<'_>,
    index: usize,
    param: &str,
    shape: &[usize],
) -> Result<Vec<f32>, Error> {
    let names = [
        format!("features.{}.{}", index, param),
        format!("{}.{}", index, param),
    ];

    let (name, view) = names
        .iter()
        .find_map(|name| tensors.tensor(name).ok().map(|view| (name, view)))
        .ok_or_else(|| Error::Weights(format!("no tensor named '{}' or '{}'", names[0], names[1])))?;

    if view.dtype() != Dtype::F32 {
        return Err(Error::Weights(format!(
            "tensor '{}' is {:?}, only F32 is supported",
            name,
            view.dtype()
        )));
    }

    if view.shape() != shape {
        return Err(Error::Weights(format!(
            "tensor '{}' has shape {:?}, expected {:?}",
            name,
            view.shape(),
            shape
        )));
    }

    Ok(view
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Builds a [`FeatureNetwork`] layer by layer, drawing convolution weights
/// from a seeded generator (He uniform, zero bias).
pub struct NetworkBuilder {
    rng: Pcg32,
    channels: usize,
    layers: Vec<Layer>,
}

impl NetworkBuilder {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Pcg32::seed_from_u64(seed),
            channels: IMAGE_CHANNELS,
            layers: Vec::new(),
        }
    }

    /// Appends a stride 1 convolution padded to keep the spatial size
    pub fn conv(mut self, out_channels: usize, kernel_size: usize) -> Self {
        let kernel_size = kernel_size.max(1);
        let fan_in = self.channels * kernel_size * kernel_size;
        let bound = (6.0 / fan_in as f32).sqrt();

        let rng = &mut self.rng;
        let weights = Array2::from_shape_simple_fn((out_channels, fan_in), || {
            rng.gen_range(-bound..bound)
        });

        self.layers.push(Layer::Conv2d(Conv2d::from_matrix(
            weights,
            Array1::zeros(out_channels),
            kernel_size,
            kernel_size / 2,
        )));
        self.channels = out_channels;
        self
    }

    pub fn relu(mut self) -> Self {
        self.layers.push(Layer::Relu);
        self
    }

    pub fn max_pool(mut self, kernel_size: usize, stride: usize) -> Self {
        self.layers
            .push(Layer::MaxPool2d(MaxPool2d::new(kernel_size, stride)));
        self
    }

    /// Appends an inference mode batch norm with random running statistics
    pub fn batch_norm(mut self) -> Self {
        let channels = self.channels;
        let rng = &mut self.rng;

        let mean = Array1::from_shape_simple_fn(channels, || rng.gen_range(-0.1..0.1));
        let var = Array1::from_shape_simple_fn(channels, || rng.gen_range(0.5..1.5));
        let gamma = Array1::from_shape_simple_fn(channels, || rng.gen_range(0.5..1.5));
        let beta = Array1::from_shape_simple_fn(channels, || rng.gen_range(-0.1..0.1));

        // every statistic has `channels` entries, so this can't be rejected
        if let Ok(bn) = BatchNorm2d::new(mean, var, gamma, beta, 1e-5) {
            self.layers.push(Layer::BatchNorm2d(bn));
        }
        self
    }

    /// Appends an already constructed layer
    pub fn layer(mut self, layer: Layer) -> Self {
        if let Layer::Conv2d(conv) = &layer {
            self.channels = conv.out_channels();
        }
        self.layers.push(layer);
        self
    }

    pub fn build(self) -> FeatureNetwork {
        FeatureNetwork::new(self.layers)
    }
}
