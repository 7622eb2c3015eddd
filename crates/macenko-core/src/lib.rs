//! # macenko-core
//!
//! Core types for Macenko H&E stain normalization.
//!
//! - [`RgbImage`] - 8-bit interleaved RGB buffer, shape `(height, width, 3)`
//! - [`StainBasis`], [`MaxConcentration`], [`ReferenceStains`] - stain statistics
//! - [`NormalizeParams`] - `io`, `alpha`, `beta` shared by fit and transform
//! - [`StainImages`] - normalized image plus isolated stain channels
//! - [`Error`] - failure modes of the pipeline
//!
//! ## Crate Structure
//!
//! ```text
//! macenko-core (this crate)
//!    ^
//!    +-- macenko-math (eigen, percentile, pseudo-inverse)
//!    +-- macenko-compute (CPU / wgpu backends, normalizer)
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod image;
pub mod params;
pub mod stain;

pub use error::*;
pub use image::{sample_count, RgbImage, CHANNELS};
pub use params::{NormalizeParams, DEFAULT_ALPHA, DEFAULT_BETA, DEFAULT_IO};
pub use stain::{MaxConcentration, ReferenceStains, StainBasis};

/// Output of a normalization that also unmixes the stains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StainImages {
    /// Image reconstructed with the reference stains.
    pub normalized: RgbImage,
    /// Hematoxylin contribution alone.
    pub hematoxylin: RgbImage,
    /// Eosin contribution alone.
    pub eosin: RgbImage,
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::image::RgbImage;
    pub use crate::params::NormalizeParams;
    pub use crate::stain::{MaxConcentration, ReferenceStains, StainBasis};
    pub use crate::StainImages;
}
