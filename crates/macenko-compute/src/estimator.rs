//! Stain vector and concentration estimation.
//!
//! Runs the Macenko estimate on any [`StainPrimitives`] backend:
//!
//! 1. optical density of every sample
//! 2. tissue mask: pixels with density `>= beta` in all three channels
//! 3. covariance of the tissue densities and its two dominant eigenvectors
//! 4. polar angle of every tissue pixel in that eigen-plane
//! 5. robust extreme angles at the `alpha` and `100 - alpha` percentiles,
//!    mapped back to density space as the two stain vectors
//! 6. least-squares concentrations of every pixel (tissue and background)
//! 7. 99th percentile of each concentration row
//!
//! Of the two extreme directions, the one with the larger first (red)
//! component becomes hematoxylin.

use tracing::{debug, warn};

use macenko_core::{Error, MaxConcentration, NormalizeParams, ReferenceStains, RgbImage, StainBasis};
use macenko_math::{plane_vector, pseudo_inverse_3x2, SymmetricEigen3, DVec3};

use crate::backend::StainPrimitives;
use crate::ComputeResult;

/// Percentile of each concentration row used as the stain maximum.
pub const MAX_CONCENTRATION_PERCENTILE: f64 = 99.0;

/// Tissue fractions below this are logged as suspicious.
const LOW_TISSUE_FRACTION: f64 = 0.01;

/// Largest eigenvalues at or below this fraction of the squared mean
/// tissue density are summation rounding, not variance.
const VARIANCE_FLOOR: f64 = 1e-12;

/// Stain estimate of one image plus its concentrations in backend memory.
pub(crate) struct Unmixing<H> {
    pub stains: ReferenceStains,
    pub concentrations: H,
}

/// Estimates the stain basis and maximum concentrations of `image`.
///
/// # Errors
///
/// - [`Error::InvalidParameter`] if `params` fails validation.
/// - [`Error::DegenerateInput`] if the image has fewer than two tissue
///   pixels or the tissue density has no variance.
///
/// Concentration maxima are returned as estimated, even when background
/// pixels drag one to zero or below.
pub fn estimate_stains<P: StainPrimitives>(
    primitives: &P,
    image: &RgbImage,
    params: &NormalizeParams,
) -> ComputeResult<ReferenceStains> {
    Ok(unmix_image(primitives, image, params)?.stains)
}

pub(crate) fn unmix_image<P: StainPrimitives>(
    primitives: &P,
    image: &RgbImage,
    params: &NormalizeParams,
) -> ComputeResult<Unmixing<P::Handle>> {
    params.validate()?;
    let pixels = image.pixel_count();
    if pixels == 0 {
        return Err(Error::degenerate("image has no pixels").into());
    }

    let samples = primitives.upload_samples(image.as_raw())?;
    let od = primitives.exec_optical_density(&samples, params.io_f64())?;
    drop(samples);

    let stats = primitives.exec_tissue_stats(&od, params.beta)?;
    if stats.count < 2 {
        return Err(Error::degenerate(format!(
            "{} of {} pixels reach optical density {} in every channel, need at least 2",
            stats.count, pixels, params.beta
        ))
        .into());
    }
    let fraction = stats.count as f64 / pixels as f64;
    if fraction < LOW_TISSUE_FRACTION {
        warn!(tissue = stats.count, pixels, fraction, "Very little tissue above the density threshold");
    }

    let cov = stats
        .covariance()
        .filter(|c| c.is_finite())
        .ok_or_else(|| Error::degenerate("tissue covariance is not finite"))?;
    let eigen = SymmetricEigen3::new(&cov)
        .ok_or_else(|| Error::degenerate("eigen-decomposition of tissue covariance did not converge"))?;
    if !(eigen.largest() > VARIANCE_FLOOR * stats.mean.length_squared()) {
        return Err(Error::degenerate("tissue optical density has no variance").into());
    }
    let (e_mid, e_max) = eigen.dominant_plane();

    let angles = primitives.exec_tissue_angles(&od, params.beta, e_mid, e_max)?;
    let extremes = primitives.percentiles(&angles, 0, &[params.alpha, 100.0 - params.alpha])?;
    let (min_phi, max_phi) = match extremes.as_slice() {
        [lo, hi] => (*lo, *hi),
        _ => return Err(Error::degenerate("no tissue angles").into()),
    };
    drop(angles);

    let basis = order_stains(plane_vector(min_phi, e_mid, e_max), plane_vector(max_phi, e_mid, e_max));
    let pinv = pseudo_inverse_3x2(DVec3::from_array(basis.hematoxylin), DVec3::from_array(basis.eosin));
    let concentrations = primitives.exec_unmix(&od, &pinv)?;

    let max_h = primitives.percentiles(&concentrations, 0, &[MAX_CONCENTRATION_PERCENTILE])?;
    let max_e = primitives.percentiles(&concentrations, 1, &[MAX_CONCENTRATION_PERCENTILE])?;
    let max_concentration = MaxConcentration::new(
        max_h.first().copied().unwrap_or(f64::NAN),
        max_e.first().copied().unwrap_or(f64::NAN),
    );
    if !max_concentration.is_usable() {
        warn!(
            max_concentration = ?max_concentration.to_array(),
            "Maximum stain concentration is not positive, rescaled concentrations flip or saturate"
        );
    }

    debug!(
        backend = primitives.name(),
        pixels,
        tissue = stats.count,
        eigenvalues = ?eigen.values,
        min_phi,
        max_phi,
        hematoxylin = ?basis.hematoxylin,
        eosin = ?basis.eosin,
        max_concentration = ?max_concentration.to_array(),
        "Estimated stains"
    );

    Ok(Unmixing {
        stains: ReferenceStains::new(basis, max_concentration),
        concentrations,
    })
}

/// Hematoxylin is the extreme direction with the larger red density.
fn order_stains(v_min: DVec3, v_max: DVec3) -> StainBasis {
    if v_min.x > v_max.x {
        StainBasis::new(v_min.to_array(), v_max.to_array())
    } else {
        StainBasis::new(v_max.to_array(), v_min.to_array())
    }
}
