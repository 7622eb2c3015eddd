//! Stateful stain normalizer.
//!
//! A [`MacenkoNormalizer`] holds the reference stain appearance every
//! transformed image is mapped onto. It starts from the built-in H&E
//! reference and is re-targeted with [`fit`](MacenkoNormalizer::fit).
//!
//! The reference is a small `Copy` value behind an `RwLock`: `transform`
//! copies it out under a short read guard, and `fit` estimates without the
//! lock and swaps the result in under the write guard. A normalizer can be
//! shared between threads.

use std::sync::{PoisonError, RwLock};

use tracing::{info, warn};

use macenko_core::{NormalizeParams, ReferenceStains, RgbImage, StainImages};

use crate::backend::{
    select_best_backend, Backend, CpuPrimitives, ReconstructParams, StainPrimitives, StainSelection,
};
#[cfg(feature = "wgpu")]
use crate::backend::WgpuPrimitives;
use crate::estimator::{unmix_image, Unmixing};
use crate::ComputeResult;
#[cfg(not(feature = "wgpu"))]
use crate::ComputeError;

/// Normalizer on the CPU backend.
pub type Normalizer = MacenkoNormalizer<CpuPrimitives>;

/// Normalizer on the wgpu backend.
#[cfg(feature = "wgpu")]
pub type NormalizerDevice = MacenkoNormalizer<WgpuPrimitives>;

/// Macenko stain normalizer over any backend.
pub struct MacenkoNormalizer<P: StainPrimitives> {
    primitives: P,
    reference: RwLock<ReferenceStains>,
}

impl MacenkoNormalizer<CpuPrimitives> {
    /// CPU normalizer with the built-in reference.
    pub fn new() -> Self {
        Self::with_primitives(CpuPrimitives::new())
    }
}

impl Default for MacenkoNormalizer<CpuPrimitives> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "wgpu")]
impl MacenkoNormalizer<WgpuPrimitives> {
    /// wgpu normalizer with the built-in reference.
    pub fn new() -> ComputeResult<Self> {
        Ok(Self::with_primitives(WgpuPrimitives::new()?))
    }
}

impl<P: StainPrimitives> MacenkoNormalizer<P> {
    /// Normalizer on `primitives` with the built-in reference.
    pub fn with_primitives(primitives: P) -> Self {
        Self::with_reference(primitives, ReferenceStains::default())
    }

    /// Normalizer on `primitives` with a given reference.
    pub fn with_reference(primitives: P, reference: ReferenceStains) -> Self {
        info!(backend = primitives.name(), "Stain normalizer created");
        Self {
            primitives,
            reference: RwLock::new(reference),
        }
    }

    /// Backend primitives.
    pub fn primitives(&self) -> &P {
        &self.primitives
    }

    /// Backend name.
    pub fn backend_name(&self) -> &'static str {
        self.primitives.name()
    }

    /// Current reference stains.
    pub fn reference(&self) -> ReferenceStains {
        // the guarded value is replaced whole, so a poisoned lock still holds a valid reference
        *self.reference.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the reference stains.
    pub fn set_reference(&self, reference: ReferenceStains) {
        *self.reference.write().unwrap_or_else(PoisonError::into_inner) = reference;
    }

    /// Restores the built-in reference.
    pub fn reset(&self) {
        self.set_reference(ReferenceStains::default());
    }

    /// Estimates the stains of `target` and makes them the reference.
    ///
    /// On error the previous reference is kept.
    pub fn fit(&self, target: &RgbImage, params: &NormalizeParams) -> ComputeResult<ReferenceStains> {
        let Unmixing { stains, .. } = unmix_image(&self.primitives, target, params)?;
        self.set_reference(stains);
        info!(
            backend = self.primitives.name(),
            hematoxylin = ?stains.basis.hematoxylin,
            eosin = ?stains.basis.eosin,
            max_concentration = ?stains.max_concentration.to_array(),
            "Normalizer fitted"
        );
        Ok(stains)
    }

    /// Re-renders `image` with the reference stains.
    pub fn transform(&self, image: &RgbImage, params: &NormalizeParams) -> ComputeResult<RgbImage> {
        let reference = self.reference();
        let unmixing = unmix_image(&self.primitives, image, params)?;
        self.reconstruct(image, &unmixing, &reference, params, StainSelection::Combined)
    }

    /// Re-renders `image` with the reference stains and also returns each
    /// stain on its own.
    pub fn transform_with_channels(&self, image: &RgbImage, params: &NormalizeParams) -> ComputeResult<StainImages> {
        let reference = self.reference();
        let unmixing = unmix_image(&self.primitives, image, params)?;
        Ok(StainImages {
            normalized: self.reconstruct(image, &unmixing, &reference, params, StainSelection::Combined)?,
            hematoxylin: self.reconstruct(image, &unmixing, &reference, params, StainSelection::Hematoxylin)?,
            eosin: self.reconstruct(image, &unmixing, &reference, params, StainSelection::Eosin)?,
        })
    }

    fn reconstruct(
        &self,
        image: &RgbImage,
        unmixing: &Unmixing<P::Handle>,
        reference: &ReferenceStains,
        params: &NormalizeParams,
        selection: StainSelection,
    ) -> ComputeResult<RgbImage> {
        let recon = ReconstructParams {
            basis: reference.basis,
            ratio: unmixing.stains.max_concentration.ratio_to(&reference.max_concentration),
            io: params.io_f64(),
            selection,
        };
        let out = self.primitives.exec_reconstruct(&unmixing.concentrations, &recon)?;
        let data = self.primitives.download_samples(&out)?;
        Ok(RgbImage::from_raw(image.width(), image.height(), data)?)
    }
}

impl<P: StainPrimitives> std::fmt::Debug for MacenkoNormalizer<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacenkoNormalizer")
            .field("backend", &self.primitives.name())
            .field("reference", &self.reference())
            .finish()
    }
}

/// Normalizer over a backend chosen at runtime.
pub enum AnyNormalizer {
    Cpu(Normalizer),
    #[cfg(feature = "wgpu")]
    Wgpu(NormalizerDevice),
}

/// Creates a normalizer on `backend`; `Auto` picks the best available.
pub fn create_normalizer(backend: Backend) -> ComputeResult<AnyNormalizer> {
    AnyNormalizer::new(backend)
}

macro_rules! dispatch {
    ($self:expr, $n:ident => $body:expr) => {
        match $self {
            AnyNormalizer::Cpu($n) => $body,
            #[cfg(feature = "wgpu")]
            AnyNormalizer::Wgpu($n) => $body,
        }
    };
}

impl AnyNormalizer {
    /// Creates a normalizer on `backend`; `Auto` picks the best available.
    pub fn new(backend: Backend) -> ComputeResult<Self> {
        match backend {
            Backend::Cpu => Ok(Self::Cpu(Normalizer::new())),
            #[cfg(feature = "wgpu")]
            Backend::Wgpu => Ok(Self::Wgpu(NormalizerDevice::new()?)),
            #[cfg(not(feature = "wgpu"))]
            Backend::Wgpu => Err(ComputeError::BackendNotAvailable(
                "wgpu (crate built without the `wgpu` feature)".into(),
            )),
            Backend::Auto => {
                let resolved = select_best_backend();
                match Self::new(resolved) {
                    Err(e) if resolved != Backend::Cpu => {
                        warn!(backend = resolved.name(), error = %e, "Falling back to CPU");
                        Self::new(Backend::Cpu)
                    }
                    result => result,
                }
            }
        }
    }

    /// Backend name.
    pub fn backend_name(&self) -> &'static str {
        dispatch!(self, n => n.backend_name())
    }

    /// Current reference stains.
    pub fn reference(&self) -> ReferenceStains {
        dispatch!(self, n => n.reference())
    }

    /// Replaces the reference stains.
    pub fn set_reference(&self, reference: ReferenceStains) {
        dispatch!(self, n => n.set_reference(reference))
    }

    /// See [`MacenkoNormalizer::fit`].
    pub fn fit(&self, target: &RgbImage, params: &NormalizeParams) -> ComputeResult<ReferenceStains> {
        dispatch!(self, n => n.fit(target, params))
    }

    /// See [`MacenkoNormalizer::transform`].
    pub fn transform(&self, image: &RgbImage, params: &NormalizeParams) -> ComputeResult<RgbImage> {
        dispatch!(self, n => n.transform(image, params))
    }

    /// See [`MacenkoNormalizer::transform_with_channels`].
    pub fn transform_with_channels(&self, image: &RgbImage, params: &NormalizeParams) -> ComputeResult<StainImages> {
        dispatch!(self, n => n.transform_with_channels(image, params))
    }
}

impl std::fmt::Debug for AnyNormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        dispatch!(self, n => std::fmt::Debug::fmt(n, f))
    }
}
