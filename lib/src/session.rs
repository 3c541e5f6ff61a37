use crate::*;
use log::info;
use std::{
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};

/// Where the optimized image starts from
#[derive(Clone)]
pub enum InitialTarget<'a> {
    /// A copy of the content image
    Content,
    /// Another image, scaled to exactly the content image's dimensions
    Image(ImageSource<'a>),
    /// Uniform noise in `[0, 1]`
    Noise { seed: u64 },
}

impl<'a> Default for InitialTarget<'a> {
    fn default() -> Self {
        Self::Content
    }
}

/// Style transfer session.
///
/// Calling `run()` will optimize the target image and return it, consuming
/// the session in the process. You can provide a `GeneratorProgress`
/// implementation to get an update with the current image and losses after
/// every optimizer step.
///
/// # Example
/// ```no_run
/// let network = neural_style::FeatureNetwork::vgg19_from_file("vgg19.safetensors")
///     .expect("failed to load weights");
///
/// let session = neural_style::Session::builder()
///     .content(&"imgs/content.jpg")
///     .style(&"imgs/style.jpg")
///     .network(network)
///     .iterations(300)
///     .build().expect("failed to build session");
///
/// let generated_img = session.run(None).expect("failed to transfer style");
/// generated_img.save("my_generated_img.jpg").expect("failed to save image");
/// ```
pub struct Session {
    model: TruncatedModel,
    target: Array4<f32>,
    params: Parameters,
    cancel: Option<Arc<AtomicBool>>,
}

impl Session {
    /// Creates a new session with default parameters.
    pub fn builder<'a>() -> SessionBuilder<'a> {
        SessionBuilder::default()
    }

    /// The truncated model the target image will be optimized against
    pub fn model(&self) -> &TruncatedModel {
        &self.model
    }

    /// The image the optimization starts from
    pub fn initial_target(&self) -> &Array4<f32> {
        &self.target
    }

    /// Runs the optimizer and outputs the generated image.
    pub fn run(
        self,
        mut progress: Option<Box<dyn GeneratorProgress>>,
    ) -> Result<GeneratedImage, Error> {
        let Self {
            model,
            mut target,
            params,
            cancel,
        } = self;

        let outcome = optimize(
            &model,
            &mut target,
            &params.to_optimize_params(),
            progress
                .as_mut()
                .map(|p| p.as_mut() as &mut dyn GeneratorProgress),
            cancel.as_deref(),
        )?;

        info!(
            "finished after {} iteration(s) ({:?})",
            outcome.iterations, outcome.stop_reason
        );

        GeneratedImage::new(target, outcome)
    }
}

/// Builds a session by setting parameters and adding input images, calling
/// `build` will check all of the provided inputs and capture the content and
/// style targets
#[derive(Default)]
pub struct SessionBuilder<'a> {
    content: Option<ImageSource<'a>>,
    style: Option<ImageSource<'a>>,
    initial_target: InitialTarget<'a>,
    network: Option<Arc<FeatureNetwork>>,
    normalizer: Normalizer,
    params: Parameters,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> SessionBuilder<'a> {
    /// Creates a new `SessionBuilder`, can also be created via
    /// `Session::builder()`
    pub fn new() -> Self {
        Self::default()
    }

    /// The image whose layout the output keeps
    pub fn content<I: Into<ImageSource<'a>>>(mut self, content: I) -> Self {
        self.content = Some(content.into());
        self
    }

    /// The image whose textures and colors the output takes on
    pub fn style<I: Into<ImageSource<'a>>>(mut self, style: I) -> Self {
        self.style = Some(style.into());
        self
    }

    /// Where the optimization starts from.
    ///
    /// Default: `InitialTarget::Content`
    pub fn initial_target(mut self, target: InitialTarget<'a>) -> Self {
        self.initial_target = target;
        self
    }

    /// The pretrained feature network, it is only ever read so the same
    /// network can back any number of sessions.
    pub fn network<N: Into<Arc<FeatureNetwork>>>(mut self, network: N) -> Self {
        self.network = Some(network.into());
        self
    }

    /// The statistics images are standardized with before entering the
    /// network.
    ///
    /// Default: ImageNet mean and standard deviation
    pub fn normalization(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// The layers whose activations are compared against the content image.
    ///
    /// Default: `conv_4`, `conv_5`
    pub fn content_layers<I: IntoIterator<Item = LayerName>>(mut self, layers: I) -> Self {
        self.params.content_layers = layers.into_iter().collect();
        self
    }

    /// The layers whose Gram matrices are compared against the style image.
    ///
    /// Default: `conv_1` through `conv_5`
    pub fn style_layers<I: IntoIterator<Item = LayerName>>(mut self, layers: I) -> Self {
        self.params.style_layers = layers.into_iter().collect();
        self
    }

    /// The number of optimizer steps.
    ///
    /// Default: 50000
    pub fn iterations(mut self, count: u32) -> Self {
        self.params.iterations = count;
        self
    }

    /// How strongly the style losses pull on the image.
    ///
    /// Default: 1e6
    pub fn style_weight(mut self, weight: f32) -> Self {
        self.params.style_weight = weight;
        self
    }

    /// How strongly the content losses pull on the image.
    ///
    /// Default: 100
    pub fn content_weight(mut self, weight: f32) -> Self {
        self.params.content_weight = weight;
        self
    }

    /// Input images are scaled so their shorter edge has this many pixels.
    ///
    /// Default: 512
    pub fn image_size(mut self, size: u32) -> Self {
        self.params.image_size = size;
        self
    }

    /// The learning rate of the pixel optimizer.
    ///
    /// Default: 1e-4
    pub fn learning_rate(mut self, rate: f32) -> Self {
        self.params.learning_rate = rate;
        self
    }

    /// Controls the maximum number of threads that will be spawned at any one
    /// time in parallel.
    ///
    /// This number is allowed to exceed the number of logical cores on the
    /// system, but it should generally be kept at or below that number.
    ///
    /// Default: The number of logical cores on this system.
    pub fn max_thread_count(mut self, count: usize) -> Self {
        self.params.max_thread_count = Some(count);
        self
    }

    /// Losses are logged every this many iterations.
    ///
    /// Default: 10000
    pub fn log_interval(mut self, interval: u32) -> Self {
        self.params.log_interval = interval;
        self
    }

    /// Stops the optimization early once this much time has passed, the
    /// image optimized so far is still returned.
    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.params.time_limit = Some(limit);
        self
    }

    /// Stops the optimization early once the flag is raised, from any
    /// thread. The image optimized so far is still returned.
    pub fn cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Creates a `Session`, or returns an error if invalid parameters or
    /// input images were specified.
    pub fn build(self) -> Result<Session, Error> {
        self.check_parameters_validity()?;

        let content = self.content.ok_or(Error::MissingInput("content image"))?;
        let style = self.style.ok_or(Error::MissingInput("style image"))?;
        let network = self.network.ok_or(Error::MissingInput("feature network"))?;

        let size = self.params.image_size;
        let content = image_to_tensor(&load_image(content, size)?);
        let style = image_to_tensor(&load_image(style, size)?);

        let (_, _, height, width) = content.dim();
        let dims = Dims::new(width as u32, height as u32);

        let target = match self.initial_target {
            InitialTarget::Content => content.clone(),
            InitialTarget::Image(src) => image_to_tensor(&load_image_exact(src, dims)?),
            InitialTarget::Noise { seed } => noise_tensor(dims, seed),
        };

        info!(
            "content {}x{}, style {}x{}",
            dims.width,
            dims.height,
            style.shape()[3],
            style.shape()[2]
        );

        let model = ModelAssembler::new(network, self.normalizer)
            .content_layers(self.params.content_layers.iter().copied())
            .style_layers(self.params.style_layers.iter().copied())
            .max_thread_count(self.params.thread_count())
            .assemble(&content, &style)?;

        Ok(Session {
            model,
            target,
            params: self.params,
            cancel: self.cancel,
        })
    }

    fn check_parameters_validity(&self) -> Result<(), Error> {
        for &(weight, name) in &[
            (self.params.style_weight, "style-weight"),
            (self.params.content_weight, "content-weight"),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(Error::InvalidRange(errors::InvalidRange {
                    min: 0.0,
                    max: f32::MAX,
                    value: weight,
                    name,
                }));
            }
        }

        if self.params.style_weight == 0.0 && self.params.content_weight == 0.0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: f32::MIN_POSITIVE,
                max: f32::MAX,
                value: 0.0,
                name: "style-weight + content-weight",
            }));
        }

        if !self.params.learning_rate.is_finite() || self.params.learning_rate <= 0.0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: f32::MIN_POSITIVE,
                max: f32::MAX,
                value: self.params.learning_rate,
                name: "learning-rate",
            }));
        }

        if self.params.image_size == 0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: u32::MAX as f32,
                value: 0.0,
                name: "image-size",
            }));
        }

        if let Some(max_count) = self.params.max_thread_count {
            if max_count == 0 {
                return Err(Error::InvalidRange(errors::InvalidRange {
                    min: 1.0,
                    max: 1024.0,
                    value: max_count as f32,
                    name: "max-thread-count",
                }));
            }
        }

        if self.params.log_interval == 0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: u32::MAX as f32,
                value: 0.0,
                name: "log-interval",
            }));
        }

        Ok(())
    }
}
