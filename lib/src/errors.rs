use std::fmt;

#[derive(Debug)]
pub struct InvalidRange {
    pub(crate) min: f32,
    pub(crate) max: f32,
    pub(crate) value: f32,
    pub(crate) name: &'static str,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parameter '{}' - value '{}' is outside the range of {}-{}",
            self.name, self.value, self.min, self.max
        )
    }
}

#[derive(Debug)]
pub struct ShapeMismatch {
    pub(crate) what: &'static str,
    pub(crate) expected: Vec<usize>,
    pub(crate) actual: Vec<usize>,
}

impl fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} has shape {:?}, but {:?} was expected",
            self.what, self.actual, self.expected
        )
    }
}

#[derive(Debug)]
pub enum Error {
    /// An error in the image library occurred, eg failed to load/save
    Image(image::ImageError),
    /// Io is notoriously error free with no problems, but we cover it just in case!
    Io(std::io::Error),
    /// An input parameter had an invalid range specified
    InvalidRange(InvalidRange),
    /// The normalization statistics don't have one entry per image channel,
    /// (expected, actual)
    ChannelMismatch(usize, usize),
    /// A tensor did not have the shape an operation required
    ShapeMismatch(ShapeMismatch),
    /// A layer name that isn't of the form `<conv|relu|pool|bn>_<index>`
    InvalidLayerName(String),
    /// Requested content/style layers that never occur in the network
    MissingLayers(Vec<String>),
    /// Neither content nor style layers were requested, so there is nothing
    /// to optimize
    NoLossLayers,
    /// The weighted loss stopped being a finite number at the given iteration
    NonFiniteLoss { iteration: u32 },
    /// A required session input was never provided
    MissingInput(&'static str),
    /// The pretrained weights could not be read
    Weights(String),
    /// The user specified an image format we don't support as the output
    UnsupportedOutputFormat(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Image(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(ie) => write!(f, "{}", ie),
            Self::Io(io) => write!(f, "{}", io),
            Self::InvalidRange(ir) => write!(f, "{}", ir),
            Self::ChannelMismatch(expected, actual) => write!(
                f,
                "normalization statistics have {} channel(s), but images have {}",
                actual, expected
            ),
            Self::ShapeMismatch(sm) => write!(f, "{}", sm),
            Self::InvalidLayerName(name) => write!(
                f,
                "'{}' is not a layer name, expected one of conv_N, relu_N, pool_N or bn_N",
                name
            ),
            Self::MissingLayers(names) => write!(
                f,
                "the requested layer(s) {} do not exist in the network",
                names.join(", ")
            ),
            Self::NoLossLayers => write!(
                f,
                "at least 1 content or style layer must be requested"
            ),
            Self::NonFiniteLoss { iteration } => write!(
                f,
                "the loss diverged to a non-finite value at iteration {}",
                iteration
            ),
            Self::MissingInput(what) => write!(f, "no {} was provided", what),
            Self::Weights(msg) => write!(f, "failed to load network weights: {}", msg),
            Self::UnsupportedOutputFormat(fmt) => {
                write!(f, "the output format '{}' is not supported", fmt)
            }
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(ie: image::ImageError) -> Self {
        Self::Image(ie)
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::Io(io)
    }
}

impl From<safetensors::SafeTensorError> for Error {
    fn from(se: safetensors::SafeTensorError) -> Self {
        Self::Weights(se.to_string())
    }
}
