use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the fused MoE pipeline.
///
/// Precondition and quantization-combination errors are raised before any
/// tile is launched. Missing tuned configurations are not errors; they fall
/// back to heuristic defaults with a warning.
#[derive(Error, Debug)]
pub enum MoeError {
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("unsupported quantization combination: {0}")]
    UnsupportedQuantization(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("malformed kernel config file {path}: {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, MoeError>;

/// Return early with [`MoeError::PreconditionViolation`].
macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::MoeError::PreconditionViolation(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure;
