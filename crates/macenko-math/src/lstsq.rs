//! Least squares against a two-column basis.
//!
//! Unmixing solves `A c ≈ y` for every pixel with the same 3x2 matrix `A`,
//! so the minimum-norm solution reduces to one 2x3 pseudo-inverse applied
//! pixel by pixel. The pseudo-inverse is built from the eigen-decomposition
//! of the 2x2 Gram matrix `AᵀA`, whose eigenvalues are the squared singular
//! values of `A`. Singular values at or below `ε · 3 · σ_max` are treated as
//! zero, so a rank-deficient basis yields the minimum-norm solution instead
//! of an error.

use glam::{DVec2, DVec3};

/// Rows of the 2x3 pseudo-inverse of the 3x2 matrix `[a0 a1]`.
///
/// Applying it with [`unmix`] gives the least-squares coefficients.
pub fn pseudo_inverse_3x2(a0: DVec3, a1: DVec3) -> [DVec3; 2] {
    let (p, q, r) = (a0.dot(a0), a1.dot(a1), a0.dot(a1));
    let (lambdas, axes) = gram_eigen(p, q, r);

    let sigma_max = lambdas[0].max(lambdas[1]).max(0.0).sqrt();
    let cutoff = f64::EPSILON * 3.0 * sigma_max;

    // G⁺ = Σ (1/λ) v vᵀ over the retained singular values
    let mut g_pinv = [[0.0f64; 2]; 2];
    for (lambda, v) in lambdas.iter().zip(axes.iter()) {
        if lambda.max(0.0).sqrt() <= cutoff {
            continue;
        }
        let inv = 1.0 / lambda;
        g_pinv[0][0] += inv * v.x * v.x;
        g_pinv[0][1] += inv * v.x * v.y;
        g_pinv[1][0] += inv * v.y * v.x;
        g_pinv[1][1] += inv * v.y * v.y;
    }

    // A⁺ = G⁺ Aᵀ
    [
        a0 * g_pinv[0][0] + a1 * g_pinv[0][1],
        a0 * g_pinv[1][0] + a1 * g_pinv[1][1],
    ]
}

/// Least-squares coefficients of `y` against the basis behind `pinv`.
#[inline]
pub fn unmix(pinv: &[DVec3; 2], y: DVec3) -> [f64; 2] {
    [pinv[0].dot(y), pinv[1].dot(y)]
}

/// Eigenpairs of the symmetric matrix `[[p, r], [r, q]]` by one exact
/// Jacobi rotation.
fn gram_eigen(p: f64, q: f64, r: f64) -> ([f64; 2], [DVec2; 2]) {
    if r == 0.0 {
        return ([p, q], [DVec2::X, DVec2::Y]);
    }
    let theta = (q - p) / (2.0 * r);
    let t = if theta == 0.0 {
        1.0
    } else {
        theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt())
    };
    let c = 1.0 / (t * t + 1.0).sqrt();
    let s = t * c;
    ([p - t * r, q + t * r], [DVec2::new(c, -s), DVec2::new(s, c)])
}
