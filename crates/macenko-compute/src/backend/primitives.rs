//! Backend primitives abstraction for the stain normalization pipeline.
//!
//! The estimator and normalizer are written once against [`StainPrimitives`].
//! Each backend supplies the per-pixel kernels over arrays that live in its
//! own memory (host RAM for the CPU, device buffers for wgpu); only small
//! reductions and explicitly downloaded arrays cross back to the host.

use macenko_core::StainBasis;
use macenko_math::{CrossProducts, DMat3, DVec3};

use crate::ComputeResult;

/// Handle to a 2D array resident in backend memory.
pub trait ArrayHandle: Send + Sync {
    /// Shape as `(rows, components)`; rows are pixels.
    fn shape(&self) -> (usize, usize);

    /// Row count.
    fn rows(&self) -> usize { self.shape().0 }

    /// Components per row.
    fn components(&self) -> usize { self.shape().1 }

    /// Total element count.
    fn len(&self) -> usize {
        let (r, c) = self.shape();
        r * c
    }

    /// `true` if the array holds no elements.
    fn is_empty(&self) -> bool { self.len() == 0 }
}

/// Tissue-pixel statistics reduced from an optical-density array.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TissueStats {
    /// Number of tissue pixels.
    pub count: usize,
    /// Mean optical density of the tissue pixels.
    pub mean: DVec3,
    /// Sums of mean-centered products.
    pub products: CrossProducts,
}

impl TissueStats {
    /// Sample covariance of the tissue optical densities.
    pub fn covariance(&self) -> Option<DMat3> {
        self.products.covariance(self.count)
    }
}

/// Which stains a reconstruction combines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum StainSelection {
    /// Both stains: the normalized image.
    #[default]
    Combined = 0,
    /// Hematoxylin alone.
    Hematoxylin = 1,
    /// Eosin alone.
    Eosin = 2,
}

/// Parameters of the reconstruction kernel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconstructParams {
    /// Basis the concentrations are re-projected with.
    pub basis: StainBasis,
    /// Per-stain divisor applied to the concentrations.
    pub ratio: [f64; 2],
    /// Transmitted light intensity.
    pub io: f64,
    /// Stains to include.
    pub selection: StainSelection,
}

/// Core operations every backend implements.
pub trait StainPrimitives: Send + Sync {
    /// Backend-specific array handle type.
    type Handle: ArrayHandle;

    /// Upload interleaved RGB samples; the handle has shape `(pixels, 3)`.
    fn upload_samples(&self, samples: &[u8]) -> ComputeResult<Self::Handle>;

    /// Download a reconstructed array as 8-bit samples (truncating cast).
    fn download_samples(&self, handle: &Self::Handle) -> ComputeResult<Vec<u8>>;

    /// Optical density `-ln((s + 1) / io)` of every sample.
    fn exec_optical_density(&self, samples: &Self::Handle, io: f64) -> ComputeResult<Self::Handle>;

    /// Count, mean and centered products of the pixels whose optical
    /// density is `>= beta` in every channel.
    fn exec_tissue_stats(&self, od: &Self::Handle, beta: f64) -> ComputeResult<TissueStats>;

    /// Angles of the tissue pixels projected onto the plane `(e0, e1)`;
    /// the handle has shape `(tissue_pixels, 1)`, in no particular order.
    fn exec_tissue_angles(&self, od: &Self::Handle, beta: f64, e0: DVec3, e1: DVec3) -> ComputeResult<Self::Handle>;

    /// Least-squares stain concentrations of every pixel given the rows of
    /// the basis pseudo-inverse; the handle has shape `(pixels, 2)`.
    fn exec_unmix(&self, od: &Self::Handle, pinv: &[DVec3; 2]) -> ComputeResult<Self::Handle>;

    /// `io * exp(-basis · (c / ratio))` per pixel, values above 255 set
    /// to 254; the handle has shape `(pixels, 3)`.
    fn exec_reconstruct(&self, concentrations: &Self::Handle, params: &ReconstructParams) -> ComputeResult<Self::Handle>;

    /// Percentiles of one component of an array.
    fn percentiles(&self, handle: &Self::Handle, component: usize, qs: &[f64]) -> ComputeResult<Vec<f64>>;

    /// Backend name.
    fn name(&self) -> &'static str;
}
