// BEGIN - Embark standard lints v0.4
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v0.4

//! `neural-style` is a light API for neural style transfer, which repaints the
//! layout of a content image with the textures and colors of a style image.
//!
//! The image is optimized pixel by pixel. A pretrained convolutional network
//! (VGG19) is cut off after the deepest layer that matters, and loss
//! observers spliced in after the chosen layers compare the image's
//! activations against the content image's activations and its Gram
//! matrices against the style image's Gram matrices.
//!
//! First, you build a `Session` via a `SessionBuilder`, which follows the builder pattern. Calling
//! `build` on the `SessionBuilder` loads the input images and captures the content and style
//! targets.
//!
//! `Session` has a `run()` method that optimizes the target image, which is returned as a
//! `GeneratedImage`.
//!
//! You can save, stream, or inspect the image from `GeneratedImage`.
//!
//! ## Usage
//! Session follows a "builder pattern" for defining parameters, meaning you chain functions together.
//!
//! ```no_run
//! use neural_style::{FeatureNetwork, LayerName, Session};
//!
//! // Load the pretrained network once, it can be shared by many sessions
//! let network = FeatureNetwork::vgg19_from_file("vgg19.safetensors")
//!     .expect("failed to load network weights");
//!
//! let session = Session::builder()
//!     // Specify the images
//!     .content(&"imgs/content.jpg")
//!     .style(&"imgs/style.jpg")
//!     .network(network)
//!     // Set some parameters
//!     .iterations(500)
//!     .style_layers((1..=5).map(LayerName::conv))
//!     // Build the session
//!     .build().expect("failed to build session");
//!
//! // Optimize the image
//! let generated_img = session.run(None).expect("failed to transfer style");
//!
//! // Save the generated image to disk
//! generated_img.save("my_generated_img.jpg").expect("failed to save generated image");
//! ```
mod adam;
mod errors;
mod gram;
mod layers;
mod loss;
pub mod model;
pub mod network;
mod normalize;
pub mod optimize;
mod parallel;
pub mod session;
mod utils;
use utils::*;

pub use image;
pub use ndarray;
use ndarray::Array4;
use std::path::Path;
use std::time::Duration;

pub use adam::Adam;
pub use errors::Error;
pub use gram::gram;
pub use layers::{BatchNorm2d, Conv2d, Layer, LayerKind, MaxPool2d};
pub use loss::{ContentLoss, LossRecord, LossTerm, LossWeights, StyleLoss};
pub use model::{LayerName, LayerRole, ModelAssembler, Stage, TruncatedModel};
pub use network::{FeatureNetwork, NetworkBuilder};
pub use normalize::{Normalizer, IMAGENET_MEAN, IMAGENET_STD};
pub use optimize::{
    clamp, optimize, GeneratorProgress, OptimizeParams, Outcome, ProgressStat, ProgressUpdate,
    StopReason,
};
pub use session::{InitialTarget, Session, SessionBuilder};
pub use utils::{image_to_tensor, load_dynamic_image, shorter_edge_dims, tensor_to_image, ImageSource};

/// Simple dimensions struct
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Dims {
    pub width: u32,
    pub height: u32,
}

impl Dims {
    pub fn square(size: u32) -> Self {
        Self {
            width: size,
            height: size,
        }
    }
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

struct Parameters {
    iterations: u32,
    style_weight: f32,
    content_weight: f32,
    content_layers: Vec<LayerName>,
    style_layers: Vec<LayerName>,
    image_size: u32,
    learning_rate: f32,
    max_thread_count: Option<usize>,
    log_interval: u32,
    time_limit: Option<Duration>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            iterations: 50000,
            style_weight: 1e6,
            content_weight: 100.0,
            content_layers: model::default_content_layers(),
            style_layers: model::default_style_layers(),
            image_size: 512,
            learning_rate: 1e-4,
            max_thread_count: None,
            log_interval: 10000,
            time_limit: None,
        }
    }
}

impl Parameters {
    fn thread_count(&self) -> usize {
        self.max_thread_count.unwrap_or_else(num_cpus::get)
    }

    fn to_optimize_params(&self) -> OptimizeParams {
        OptimizeParams {
            iterations: self.iterations,
            weights: LossWeights {
                content: self.content_weight,
                style: self.style_weight,
            },
            learning_rate: self.learning_rate,
            log_interval: self.log_interval,
            time_limit: self.time_limit,
        }
    }
}

/// An image generated by a `Session::run()`
pub struct GeneratedImage {
    tensor: Array4<f32>,
    image: image::RgbImage,
    outcome: Outcome,
}

impl GeneratedImage {
    fn new(tensor: Array4<f32>, outcome: Outcome) -> Result<Self, Error> {
        let image = tensor_to_image(&tensor)?;
        Ok(Self {
            tensor,
            image,
            outcome,
        })
    }

    /// Saves the generated image to the specified path
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        if let Some(parent_path) = path.parent() {
            std::fs::create_dir_all(&parent_path)?;
        }

        self.image.save(&path)?;
        Ok(())
    }

    /// Writes the generated image to the specified stream
    pub fn write<W: std::io::Write>(
        self,
        writer: &mut W,
        fmt: image::ImageOutputFormat,
    ) -> Result<(), Error> {
        let dyn_img = self.into_image();
        Ok(dyn_img.write_to(writer, fmt)?)
    }

    /// The optimized `[1, 3, height, width]` tensor, every value is in `[0, 1]`
    pub fn tensor(&self) -> &Array4<f32> {
        &self.tensor
    }

    /// Whether the whole iteration budget was spent
    pub fn stop_reason(&self) -> StopReason {
        self.outcome.stop_reason
    }

    /// The number of optimizer steps that were applied
    pub fn iterations(&self) -> u32 {
        self.outcome.iterations
    }

    /// The losses of the last optimizer step
    pub fn final_losses(&self) -> &LossRecord {
        &self.outcome.final_losses
    }

    /// Returns the generated output image
    pub fn into_image(self) -> image::DynamicImage {
        image::DynamicImage::ImageRgb8(self.image)
    }
}

impl AsRef<image::RgbImage> for GeneratedImage {
    fn as_ref(&self) -> &image::RgbImage {
        &self.image
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn optimize_params_follow_parameters() {
        let params = Parameters {
            iterations: 12,
            content_weight: 3.0,
            style_weight: 4.0,
            time_limit: Some(Duration::from_secs(2)),
            ..Parameters::default()
        };

        let opt = params.to_optimize_params();
        assert_eq!(opt.iterations, 12);
        assert_eq!(
            opt.weights,
            LossWeights {
                content: 3.0,
                style: 4.0
            }
        );
        assert_eq!(opt.time_limit, Some(Duration::from_secs(2)));
        assert_eq!(opt.log_interval, 10000);
    }

    #[test]
    fn generated_image_matches_tensor() {
        let tensor = Array4::from_shape_fn((1, 3, 2, 4), |(_, c, y, x)| (c + y + x) as f32 / 7.0);
        let outcome = Outcome {
            stop_reason: StopReason::Completed,
            iterations: 3,
            final_losses: LossRecord::default(),
        };

        let generated = GeneratedImage::new(tensor.clone(), outcome).unwrap();
        assert_eq!(generated.as_ref().dimensions(), (4, 2));
        assert_eq!(generated.tensor(), &tensor);
        assert_eq!(generated.iterations(), 3);

        let mut png = Vec::new();
        generated
            .write(&mut png, image::ImageOutputFormat::Png)
            .unwrap();
        let decoded = image::load_from_memory(&png).unwrap().to_rgb();
        assert_eq!(decoded, tensor_to_image(&tensor).unwrap());
    }
}
