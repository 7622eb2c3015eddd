//! Macenko stain normalization on CPU and GPU backends.
//!
//! Estimates the hematoxylin and eosin stain vectors of an H&E image and
//! re-renders it with a reference stain appearance. The same pipeline runs
//! on the CPU (rayon) or, with the `wgpu` feature, as compute shaders.
//!
//! # Architecture
//!
//! ```text
//! MacenkoNormalizer<P> (fit / transform)
//!     └── estimate_stains (shared pipeline)
//!             └── StainPrimitives trait
//!                     ├── CpuPrimitives  (rayon, f64)
//!                     └── WgpuPrimitives (compute shaders, f32)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use macenko_compute::{Normalizer, NormalizeParams, RgbImage};
//!
//! let normalizer = Normalizer::new();
//! normalizer.fit(&target, &NormalizeParams::default())?;
//!
//! let normalized = normalizer.transform(&source, &NormalizeParams::default())?;
//! let stains = normalizer.transform_with_channels(&source, &NormalizeParams::default())?;
//! ```

pub mod backend;
pub mod estimator;
pub mod normalizer;
#[cfg(feature = "wgpu")]
mod shaders;

pub use backend::{
    detect_backends, describe_backends, select_best_backend, ArrayHandle, Backend, BackendInfo,
    CpuArray, CpuPrimitives, ReconstructParams, StainPrimitives, StainSelection, TissueStats,
};
#[cfg(feature = "wgpu")]
pub use backend::{WgpuArray, WgpuPrimitives};
pub use estimator::estimate_stains;
pub use normalizer::{create_normalizer, AnyNormalizer, MacenkoNormalizer, Normalizer};
#[cfg(feature = "wgpu")]
pub use normalizer::NormalizerDevice;

pub use macenko_core::{
    MaxConcentration, NormalizeParams, ReferenceStains, RgbImage, StainBasis, StainImages,
};

use thiserror::Error;

/// Compute pipeline errors.
#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("No suitable GPU adapter found")]
    NoAdapter,

    #[error("Backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("Failed to create device: {0}")]
    DeviceCreation(String),

    #[error("Buffer size mismatch: expected {expected}, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("Image too large: {bytes} bytes exceeds device limit {limit}")]
    ImageTooLarge { bytes: u64, limit: u64 },

    #[error("GPU operation failed: {0}")]
    OperationFailed(String),

    #[error(transparent)]
    Stain(#[from] macenko_core::Error),
}

impl ComputeError {
    /// `true` for input that cannot yield a stain estimate.
    pub fn is_degenerate(&self) -> bool {
        matches!(self, Self::Stain(e) if e.is_degenerate())
    }
}

pub type ComputeResult<T> = Result<T, ComputeError>;
