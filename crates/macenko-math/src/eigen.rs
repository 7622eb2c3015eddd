//! Symmetric 3x3 eigen-decomposition.
//!
//! Uses the cyclic Jacobi method: each rotation zeroes one off-diagonal
//! element, and a handful of sweeps drive a 3x3 matrix to diagonal at full
//! double precision.
//!
//! # Conventions
//!
//! - Eigenvalues are returned in **ascending** order, so index 2 is the
//!   largest and indices 1 and 2 span the dominant plane.
//! - Each eigenvector is unit length and its components sum to a
//!   non-negative value (ties broken by the first non-zero component being
//!   positive). Eigenvectors are only defined up to sign; pinning the sign
//!   makes downstream angle computations reproducible.
//!
//! # Example
//!
//! ```rust
//! use glam::DMat3;
//! use macenko_math::SymmetricEigen3;
//!
//! let m = DMat3::from_cols_array(&[2.0, 0.0, 0.0, 0.0, 5.0, 0.0, 0.0, 0.0, 1.0]);
//! let eig = SymmetricEigen3::new(&m).unwrap();
//! assert_eq!(eig.values, [1.0, 2.0, 5.0]);
//! ```

use glam::{DMat3, DVec3};

/// Sweep limit; 3x3 matrices converge in well under ten.
const MAX_SWEEPS: usize = 64;

/// Off-diagonal pairs visited by one Jacobi sweep.
const PAIRS: [(usize, usize); 3] = [(0, 1), (0, 2), (1, 2)];

/// Eigenvalues and eigenvectors of a real symmetric 3x3 matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymmetricEigen3 {
    /// Eigenvalues, ascending.
    pub values: [f64; 3],
    /// Unit eigenvectors, `vectors[i]` belongs to `values[i]`.
    pub vectors: [DVec3; 3],
}

impl SymmetricEigen3 {
    /// Decomposes `m`, reading only its symmetric part.
    ///
    /// Returns `None` for non-finite input or if the iteration fails to
    /// converge.
    pub fn new(m: &DMat3) -> Option<Self> {
        let mut a = [[0.0f64; 3]; 3];
        for (i, row) in a.iter_mut().enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                *v = 0.5 * (m.col(j)[i] + m.col(i)[j]);
            }
        }
        if a.iter().flatten().any(|v| !v.is_finite()) {
            return None;
        }

        let mut v = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let scale: f64 = a.iter().flatten().map(|x| x * x).sum();
        let tol = (f64::EPSILON * f64::EPSILON) * scale;

        let mut converged = false;
        for _ in 0..MAX_SWEEPS {
            let off = a[0][1] * a[0][1] + a[0][2] * a[0][2] + a[1][2] * a[1][2];
            if off <= tol {
                converged = true;
                break;
            }
            for (p, q) in PAIRS {
                rotate(&mut a, &mut v, p, q);
            }
        }
        if !converged {
            return None;
        }

        let mut order = [0usize, 1, 2];
        order.sort_by(|&i, &j| a[i][i].total_cmp(&a[j][j]));

        let mut values = [0.0; 3];
        let mut vectors = [DVec3::ZERO; 3];
        for (slot, &k) in order.iter().enumerate() {
            values[slot] = a[k][k];
            vectors[slot] = pin_sign(DVec3::new(v[0][k], v[1][k], v[2][k]).normalize());
        }
        Some(Self { values, vectors })
    }

    /// Largest eigenvalue.
    #[inline]
    pub fn largest(&self) -> f64 {
        self.values[2]
    }

    /// Eigenvectors of the two largest eigenvalues as `(middle, largest)`.
    #[inline]
    pub fn dominant_plane(&self) -> (DVec3, DVec3) {
        (self.vectors[1], self.vectors[2])
    }
}

/// One Jacobi rotation zeroing `a[p][q]`, accumulated into `v`.
fn rotate(a: &mut [[f64; 3]; 3], v: &mut [[f64; 3]; 3], p: usize, q: usize) {
    let apq = a[p][q];
    if apq == 0.0 {
        return;
    }
    let theta = (a[q][q] - a[p][p]) / (2.0 * apq);
    let t = if theta == 0.0 {
        1.0
    } else {
        theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt())
    };
    let c = 1.0 / (t * t + 1.0).sqrt();
    let s = t * c;

    for k in 0..3 {
        let (akp, akq) = (a[k][p], a[k][q]);
        a[k][p] = c * akp - s * akq;
        a[k][q] = s * akp + c * akq;
    }
    for k in 0..3 {
        let (apk, aqk) = (a[p][k], a[q][k]);
        a[p][k] = c * apk - s * aqk;
        a[q][k] = s * apk + c * aqk;
    }
    a[p][q] = 0.0;
    a[q][p] = 0.0;
    for row in v.iter_mut() {
        let (vp, vq) = (row[p], row[q]);
        row[p] = c * vp - s * vq;
        row[q] = s * vp + c * vq;
    }
}

fn pin_sign(v: DVec3) -> DVec3 {
    let sum = v.x + v.y + v.z;
    let flip = if sum != 0.0 {
        sum < 0.0
    } else {
        v.to_array().iter().find(|c| **c != 0.0).is_some_and(|c| *c < 0.0)
    };
    if flip { -v } else { v }
}
