//! Error types shared by the reader, materializer, quantizer and decode engine.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad magic/version, malformed field, unsupported type or dimension.
    #[error("invalid model file: {0}")]
    Format(String),

    #[error("tensor '{name}' has wrong shape; expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("tensor '{0}' is missing from model")]
    MissingTensor(String),

    #[error("file contained {} more tensors than expected: {names:?}", names.len())]
    ExtraTensor { names: Vec<String> },

    #[error(
        "context overflow: n_past ({n_past}) + n_tokens ({n_tokens}) \
         exceeds n_positions ({n_positions})"
    )]
    ContextOverflow {
        n_past: usize,
        n_tokens: usize,
        n_positions: usize,
    },

    #[error("failed to allocate {bytes} bytes for {what}")]
    Resource { what: &'static str, bytes: usize },

    #[error(
        "unexpected end of file at offset {offset}: \
         needed {needed} bytes, {available} available"
    )]
    Truncated {
        offset: u64,
        needed: u64,
        available: u64,
    },

    #[error("failed to open '{}': {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Engine(#[from] candle_core::Error),

    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Builds an [`Error::Format`] from `format!` arguments.
macro_rules! format_err {
    ($($arg:tt)*) => {
        $crate::error::Error::Format(format!($($arg)*))
    };
}

pub(crate) use format_err;
