//! # macenko-math
//!
//! Small dense numerics behind stain estimation:
//!
//! - [`SymmetricEigen3`] - Jacobi eigen-decomposition of 3x3 covariance
//! - [`CrossProducts`] - mergeable centered products, finished into a covariance
//! - [`percentile`], [`percentiles`] - linear-interpolation percentiles by selection
//! - [`pseudo_inverse_3x2`], [`unmix`] - minimum-norm least squares
//! - [`plane_angle`], [`plane_vector`] - polar coordinates in an eigen-plane
//!
//! All routines work in `f64` on [`glam`] vectors. Backends that compute in
//! lower precision still finish their reductions here.

mod eigen;
mod lstsq;
mod stats;

pub use eigen::SymmetricEigen3;
pub use lstsq::{pseudo_inverse_3x2, unmix};
pub use stats::{percentile, percentiles, CrossProducts};

pub use glam::{DMat3, DVec2, DVec3};

/// Angle of `v` projected onto the plane spanned by `(e0, e1)`,
/// measured from `e0` towards `e1`, in `(-π, π]`.
#[inline]
pub fn plane_angle(v: DVec3, e0: DVec3, e1: DVec3) -> f64 {
    v.dot(e1).atan2(v.dot(e0))
}

/// Unit direction at angle `phi` in the plane spanned by `(e0, e1)`.
#[inline]
pub fn plane_vector(phi: f64, e0: DVec3, e1: DVec3) -> DVec3 {
    e0 * phi.cos() + e1 * phi.sin()
}
