//! Assembly of the truncated model the optimizer pushes images through.
//!
//! Assembly happens in two phases. First every child of the network gets a
//! semantic [`LayerName`]: the index advances on each convolution and is
//! shared by the activation, pooling and normalization layers that follow it.
//! Then the named children are walked once, in order, building the list of
//! stages and capturing a frozen loss target right after every requested
//! layer. The walk stops as soon as the last requested observer is placed,
//! everything after it would never influence a loss.

use std::{fmt, str::FromStr, sync::Arc};

use log::{debug, info};
use ndarray::Array4;

use crate::{
    layers::{Layer, LayerKind},
    loss::{ContentLoss, LossRecord, LossTerm, LossWeights, StyleLoss},
    network::FeatureNetwork,
    normalize::Normalizer,
    Error,
};

/// The role tag of a [`LayerName`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LayerRole {
    Conv,
    Relu,
    Pool,
    Bn,
}

impl LayerRole {
    fn tag(self) -> &'static str {
        match self {
            Self::Conv => "conv",
            Self::Relu => "relu",
            Self::Pool => "pool",
            Self::Bn => "bn",
        }
    }
}

impl From<LayerKind> for LayerRole {
    fn from(kind: LayerKind) -> Self {
        match kind {
            LayerKind::Convolution => Self::Conv,
            LayerKind::Activation => Self::Relu,
            LayerKind::Pooling => Self::Pool,
            LayerKind::Normalization => Self::Bn,
        }
    }
}

/// A semantic layer name such as `conv_4` or `relu_1`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct LayerName {
    pub role: LayerRole,
    pub index: u32,
}

impl LayerName {
    pub fn new(role: LayerRole, index: u32) -> Self {
        Self { role, index }
    }

    pub fn conv(index: u32) -> Self {
        Self::new(LayerRole::Conv, index)
    }
}

impl fmt::Display for LayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.role.tag(), self.index)
    }
}

impl FromStr for LayerName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidLayerName(s.to_owned());

        let mut parts = s.trim().splitn(2, '_');
        let role = match parts.next() {
            Some("conv") => LayerRole::Conv,
            Some("relu") => LayerRole::Relu,
            Some("pool") => LayerRole::Pool,
            Some("bn") => LayerRole::Bn,
            _ => return Err(invalid()),
        };
        let index = parts
            .next()
            .and_then(|i| i.parse().ok())
            .ok_or_else(invalid)?;

        Ok(Self { role, index })
    }
}

/// Names every child of `network`, in order.
pub fn name_layers(network: &FeatureNetwork) -> Vec<LayerName> {
    let mut index = 0;

    network
        .classified()
        .map(|(kind, _)| {
            if kind == LayerKind::Convolution {
                index += 1;
            }
            LayerName::new(kind.into(), index)
        })
        .collect()
}

/// One step of a [`TruncatedModel`]
#[derive(Clone, Debug)]
pub enum Stage {
    Normalize(Normalizer),
    /// A child of the shared network, referenced by its position
    Layer { name: LayerName, index: usize },
    /// An identity step that observes the activation flowing through it
    Loss { layer: LayerName, term: LossTerm },
}

impl Stage {
    pub fn name(&self) -> String {
        match self {
            Self::Normalize(_) => "normalization".to_owned(),
            Self::Layer { name, .. } => name.to_string(),
            Self::Loss {
                layer,
                term: LossTerm::Content(_),
            } => format!("content_loss_{}", layer.index),
            Self::Loss {
                layer,
                term: LossTerm::Style(_),
            } => format!("style_loss_{}", layer.index),
        }
    }
}

/// Builds [`TruncatedModel`]s for a network.
pub struct ModelAssembler {
    network: Arc<FeatureNetwork>,
    normalizer: Normalizer,
    content_layers: Vec<LayerName>,
    style_layers: Vec<LayerName>,
    max_thread_count: usize,
}

impl ModelAssembler {
    /// Starts with the default layers, `conv_4` and `conv_5` for content and
    /// `conv_1` through `conv_5` for style.
    pub fn new(network: Arc<FeatureNetwork>, normalizer: Normalizer) -> Self {
        Self {
            network,
            normalizer,
            content_layers: default_content_layers(),
            style_layers: default_style_layers(),
            max_thread_count: 1,
        }
    }

    pub fn content_layers<I: IntoIterator<Item = LayerName>>(mut self, layers: I) -> Self {
        self.content_layers = dedup(layers);
        self
    }

    pub fn style_layers<I: IntoIterator<Item = LayerName>>(mut self, layers: I) -> Self {
        self.style_layers = dedup(layers);
        self
    }

    pub fn max_thread_count(mut self, count: usize) -> Self {
        self.max_thread_count = count.max(1);
        self
    }

    /// Walks the network once, capturing the content and style targets of
    /// every requested layer, and returns the model truncated right after
    /// the last loss observer.
    pub fn assemble(
        &self,
        content_image: &Array4<f32>,
        style_image: &Array4<f32>,
    ) -> Result<TruncatedModel, Error> {
        if self.content_layers.is_empty() && self.style_layers.is_empty() {
            return Err(Error::NoLossLayers);
        }

        let threads = self.max_thread_count;
        let mut pending_content = self.content_layers.clone();
        let mut pending_style = self.style_layers.clone();

        let mut content_act = Some(self.normalizer.forward(content_image)?);
        let mut style_act = Some(self.normalizer.forward(style_image)?);

        let mut stages = vec![Stage::Normalize(self.normalizer.clone())];

        let names = name_layers(&self.network);
        for (index, (layer, name)) in self.network.layers().iter().zip(names).enumerate() {
            if pending_content.is_empty() && pending_style.is_empty() {
                break;
            }

            content_act = advance(layer, content_act, !pending_content.is_empty(), threads)?;
            style_act = advance(layer, style_act, !pending_style.is_empty(), threads)?;

            debug!("stage {}: {}", stages.len(), name);
            stages.push(Stage::Layer { name, index });

            if let (Some(pos), Some(act)) = (find(&pending_content, name), &content_act) {
                pending_content.remove(pos);
                let term = LossTerm::Content(ContentLoss::new(act));
                stages.push(Stage::Loss { layer: name, term });
                debug!("stage {}: content loss after {}", stages.len() - 1, name);
            }

            if let (Some(pos), Some(act)) = (find(&pending_style, name), &style_act) {
                pending_style.remove(pos);
                let term = LossTerm::Style(StyleLoss::with_threads(act, threads));
                stages.push(Stage::Loss { layer: name, term });
                debug!("stage {}: style loss after {}", stages.len() - 1, name);
            }
        }

        if !pending_content.is_empty() || !pending_style.is_empty() {
            let mut missing: Vec<String> = Vec::new();
            for name in pending_content.iter().chain(pending_style.iter()) {
                let name = name.to_string();
                if !missing.contains(&name) {
                    missing.push(name);
                }
            }
            return Err(Error::MissingLayers(missing));
        }

        let model = TruncatedModel {
            network: Arc::clone(&self.network),
            stages,
            max_thread_count: threads,
        };

        info!(
            "assembled a model of {} stages with {} content and {} style loss(es)",
            model.len(),
            model.content_losses().count(),
            model.style_losses().count()
        );

        Ok(model)
    }
}

/// Pushes `act` through `layer` while some observer still needs it, and
/// drops it once nothing does.
fn advance(
    layer: &Layer,
    act: Option<Array4<f32>>,
    needed: bool,
    max_threads: usize,
) -> Result<Option<Array4<f32>>, Error> {
    match act {
        Some(act) if needed => Ok(Some(layer.forward(&act, max_threads)?)),
        _ => Ok(None),
    }
}

fn find(pending: &[LayerName], name: LayerName) -> Option<usize> {
    pending.iter().position(|p| *p == name)
}

fn dedup<I: IntoIterator<Item = LayerName>>(layers: I) -> Vec<LayerName> {
    let mut out = Vec::new();
    for layer in layers {
        if !out.contains(&layer) {
            out.push(layer);
        }
    }
    out
}

pub fn default_content_layers() -> Vec<LayerName> {
    vec![LayerName::conv(4), LayerName::conv(5)]
}

pub fn default_style_layers() -> Vec<LayerName> {
    (1..=5).map(LayerName::conv).collect()
}

/// What the backward pass needs from each stage of a forward pass
enum Tape<'a> {
    Normalize(&'a Normalizer),
    Layer(&'a Layer, Array4<f32>),
    /// The already weighted gradient of a loss, `None` if it doesn't count
    Loss(Option<Array4<f32>>),
}

/// The normalization stage, a prefix of the network and the loss observers
/// spliced into it. Built once and only read afterwards.
#[derive(Clone, Debug)]
pub struct TruncatedModel {
    network: Arc<FeatureNetwork>,
    stages: Vec<Stage>,
    max_thread_count: usize,
}

impl TruncatedModel {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Number of stages, counting the normalization and every loss observer
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn content_losses(&self) -> impl Iterator<Item = &ContentLoss> + '_ {
        self.stages.iter().filter_map(|stage| match stage {
            Stage::Loss {
                term: LossTerm::Content(loss),
                ..
            } => Some(loss),
            _ => None,
        })
    }

    pub fn style_losses(&self) -> impl Iterator<Item = &StyleLoss> + '_ {
        self.stages.iter().filter_map(|stage| match stage {
            Stage::Loss {
                term: LossTerm::Style(loss),
                ..
            } => Some(loss),
            _ => None,
        })
    }

    /// Runs `image` through every stage and reports each observer's loss.
    pub fn forward(&self, image: &Array4<f32>) -> Result<LossRecord, Error> {
        let threads = self.max_thread_count;
        let layers = self.network.layers();
        let mut record = LossRecord::default();
        let mut act = image.to_owned();

        for stage in &self.stages {
            match stage {
                Stage::Normalize(norm) => act = norm.forward(&act)?,
                Stage::Layer { index, .. } => act = layers[*index].forward(&act, threads)?,
                Stage::Loss {
                    term: LossTerm::Content(loss),
                    ..
                } => record.content.push(loss.evaluate(&act)?),
                Stage::Loss {
                    term: LossTerm::Style(loss),
                    ..
                } => record.style.push(loss.evaluate_threaded(&act, threads)?),
            }
        }

        Ok(record)
    }

    /// Runs a forward pass and backpropagates
    /// `weights.style * style_total + weights.content * content_total` to the
    /// pixels of `image`.
    ///
    /// A category weighted with exactly 0 is left out of the backward pass
    /// entirely, its losses are still reported.
    pub fn gradient(
        &self,
        image: &Array4<f32>,
        weights: LossWeights,
    ) -> Result<(LossRecord, Array4<f32>), Error> {
        let threads = self.max_thread_count;
        let layers = self.network.layers();
        let mut record = LossRecord::default();
        let mut tape = Vec::with_capacity(self.stages.len());
        let mut act = image.to_owned();

        for stage in &self.stages {
            match stage {
                Stage::Normalize(norm) => {
                    act = norm.forward(&act)?;
                    tape.push(Tape::Normalize(norm));
                }
                Stage::Layer { index, .. } => {
                    let layer = &layers[*index];
                    let out = layer.forward(&act, threads)?;
                    tape.push(Tape::Layer(layer, std::mem::replace(&mut act, out)));
                }
                Stage::Loss {
                    term: LossTerm::Content(loss),
                    ..
                } => {
                    let grad = if weights.content == 0.0 {
                        record.content.push(loss.evaluate(&act)?);
                        None
                    } else {
                        let (value, grad) = loss.loss_and_gradient(&act)?;
                        record.content.push(value);
                        Some(grad * weights.content)
                    };
                    tape.push(Tape::Loss(grad));
                }
                Stage::Loss {
                    term: LossTerm::Style(loss),
                    ..
                } => {
                    let grad = if weights.style == 0.0 {
                        record.style.push(loss.evaluate_threaded(&act, threads)?);
                        None
                    } else {
                        let (value, grad) = loss.loss_and_gradient(&act, threads)?;
                        record.style.push(value);
                        Some(grad * weights.style)
                    };
                    tape.push(Tape::Loss(grad));
                }
            }
        }

        // `None` stands for an all zero gradient, nothing has to be
        // propagated until the first contributing observer is reached
        let mut grad: Option<Array4<f32>> = None;
        for entry in tape.into_iter().rev() {
            grad = match (entry, grad) {
                (Tape::Loss(Some(g)), Some(acc)) => Some(acc + &g),
                (Tape::Loss(g), acc) => g.or(acc),
                (Tape::Layer(layer, input), Some(acc)) => {
                    Some(layer.backward(&input, &acc, threads))
                }
                (Tape::Normalize(norm), Some(acc)) => Some(norm.backward(&acc)),
                (_, None) => None,
            };
        }

        let grad = grad.unwrap_or_else(|| Array4::zeros(image.raw_dim()));
        Ok((record, grad))
    }
}
