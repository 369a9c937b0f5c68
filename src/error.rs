use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Broad class of an [`Error`].
///
/// Input validation distinguishes malformed data (wrong element type or
/// shape) from well-formed data carrying invalid values, so callers can
/// react to the two differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Input has the wrong element type or layout.
    Type,
    /// Input is well-formed but its values are invalid.
    Value,
    /// No usable tensor backend. The library cannot work at all.
    Fatal,
    /// Failure inside the runtime, the file system or image decoding.
    Runtime,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(
        "either TensorFlow or PyTorch is required: ensure one of them is installed and that \
         either USE_TF or USE_TORCH is enabled"
    )]
    NoBackend,

    #[error("unknown detection architecture `{0}`")]
    UnknownArchitecture(String),

    #[error("expected float32 target boxes, found {found}")]
    TargetDtype { found: &'static str },

    #[error("expected target boxes with 4 or 5 columns, found {found}")]
    TargetShape { found: String },

    #[error("target boxes are expected to take values between 0 and 1")]
    TargetRange,

    #[error("target box {index} of image {image} has xmin >= xmax or ymin >= ymax")]
    TargetGeometry { image: usize, index: usize },

    #[error("got {targets} targets for a batch of {batch} images")]
    TargetCount { targets: usize, batch: usize },

    #[error("incorrect input shape: {0}")]
    InputShape(String),

    #[error("model output: {0}")]
    ModelOutput(String),

    #[error("model weights not found at {}", .0.display())]
    MissingWeights(PathBuf),

    #[error(transparent)]
    Session(#[from] ort::Error),

    #[error("tensor shape")]
    Shape(#[from] ndarray::ShapeError),

    #[error("image")]
    Image(#[from] image::ImageError),

    #[error("io")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoBackend => ErrorKind::Fatal,
            Error::TargetDtype { .. } | Error::TargetShape { .. } => ErrorKind::Type,
            Error::UnknownArchitecture(_)
            | Error::TargetRange
            | Error::TargetGeometry { .. }
            | Error::TargetCount { .. }
            | Error::InputShape(_) => ErrorKind::Value,
            Error::ModelOutput(_)
            | Error::MissingWeights(_)
            | Error::Session(_)
            | Error::Shape(_)
            | Error::Image(_)
            | Error::Io(_) => ErrorKind::Runtime,
        }
    }
}
