//! Error types for stain normalization.
//!
//! Every failure in the pipeline is deterministic: the same image and
//! parameters always fail the same way, so callers never need to retry.
//!
//! # Usage
//!
//! ```rust
//! use macenko_core::{Error, Result};
//!
//! fn check_len(len: usize, width: u32, height: u32) -> Result<()> {
//!     let expected = width as usize * height as usize * 3;
//!     if len != expected {
//!         return Err(Error::shape_mismatch(expected, len));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Result type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while estimating stains or normalizing an image.
#[derive(Debug, Error)]
pub enum Error {
    /// The image carries no usable tissue signal.
    ///
    /// Raised when the optical-density threshold removes every pixel, when
    /// the tissue covariance has no variance, or when the recovered stain
    /// concentrations cannot be rescaled.
    #[error("degenerate input: {0}")]
    DegenerateInput(String),

    /// A pixel buffer does not have `height * width * 3` samples.
    #[error("shape mismatch: expected {expected} samples, got {actual}")]
    ShapeMismatch {
        /// Expected sample count
        expected: usize,
        /// Actual sample count
        actual: usize,
    },

    /// A normalization parameter is outside its valid range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A YAML document could not be parsed or serialized.
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Creates an [`Error::DegenerateInput`] error.
    #[inline]
    pub fn degenerate(reason: impl Into<String>) -> Self {
        Self::DegenerateInput(reason.into())
    }

    /// Creates an [`Error::ShapeMismatch`] error.
    #[inline]
    pub fn shape_mismatch(expected: usize, actual: usize) -> Self {
        Self::ShapeMismatch { expected, actual }
    }

    /// Creates an [`Error::InvalidParameter`] error.
    #[inline]
    pub fn invalid_parameter(reason: impl Into<String>) -> Self {
        Self::InvalidParameter(reason.into())
    }

    /// Returns `true` if the input image lacked a usable tissue signal.
    #[inline]
    pub fn is_degenerate(&self) -> bool {
        matches!(self, Self::DegenerateInput(_))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(err.to_string())
    }
}
