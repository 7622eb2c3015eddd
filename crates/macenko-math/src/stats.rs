//! Sample statistics: covariance partial sums and percentiles.
//!
//! Percentiles use linear interpolation between the two nearest order
//! statistics (the "linear" method, Hyndman & Fan type 7), the usual
//! default of array libraries.

use std::ops::{Add, AddAssign};

use glam::{DMat3, DVec3};

/// Accumulated products of mean-centered 3-channel samples.
///
/// Partial sums from independent chunks can be combined with `+`, which
/// lets parallel backends reduce in a fixed order and stay deterministic.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CrossProducts {
    /// Sum of `dx * dx`.
    pub xx: f64,
    /// Sum of `dx * dy`.
    pub xy: f64,
    /// Sum of `dx * dz`.
    pub xz: f64,
    /// Sum of `dy * dy`.
    pub yy: f64,
    /// Sum of `dy * dz`.
    pub yz: f64,
    /// Sum of `dz * dz`.
    pub zz: f64,
}

impl CrossProducts {
    /// Products of one centered sample.
    #[inline]
    pub fn from_centered(d: DVec3) -> Self {
        Self {
            xx: d.x * d.x,
            xy: d.x * d.y,
            xz: d.x * d.z,
            yy: d.y * d.y,
            yz: d.y * d.z,
            zz: d.z * d.z,
        }
    }

    /// Unbiased (n - 1) covariance matrix for `count` samples.
    ///
    /// Returns `None` for fewer than two samples.
    pub fn covariance(&self, count: usize) -> Option<DMat3> {
        if count < 2 {
            return None;
        }
        let k = 1.0 / (count - 1) as f64;
        Some(DMat3::from_cols(
            DVec3::new(self.xx, self.xy, self.xz) * k,
            DVec3::new(self.xy, self.yy, self.yz) * k,
            DVec3::new(self.xz, self.yz, self.zz) * k,
        ))
    }
}

impl Add for CrossProducts {
    type Output = Self;

    fn add(self, o: Self) -> Self {
        Self {
            xx: self.xx + o.xx,
            xy: self.xy + o.xy,
            xz: self.xz + o.xz,
            yy: self.yy + o.yy,
            yz: self.yz + o.yz,
            zz: self.zz + o.zz,
        }
    }
}

impl AddAssign for CrossProducts {
    fn add_assign(&mut self, o: Self) {
        *self = *self + o;
    }
}

/// `q`-th percentile (`q` in `[0, 100]`) of `values`.
///
/// Reorders `values` in place (selection, not a full sort). Returns `None`
/// when `values` is empty or `q` is outside `[0, 100]`.
pub fn percentile(values: &mut [f64], q: f64) -> Option<f64> {
    let n = values.len();
    if n == 0 || !(0.0..=100.0).contains(&q) {
        return None;
    }
    let pos = q / 100.0 * (n - 1) as f64;
    let lo = (pos.floor() as usize).min(n - 1);
    let t = pos - lo as f64;

    let (_, lo_val, upper) = values.select_nth_unstable_by(lo, f64::total_cmp);
    let a = *lo_val;
    let b = upper.iter().copied().min_by(f64::total_cmp).unwrap_or(a);
    Some(lerp(a, b, t))
}

/// Percentiles of the same data at each of `qs`, in order.
///
/// `None` under the same conditions as [`percentile`] for any `q`.
pub fn percentiles(values: &mut [f64], qs: &[f64]) -> Option<Vec<f64>> {
    qs.iter().map(|q| percentile(values, *q)).collect()
}

/// Interpolates from the nearer endpoint to keep the result monotone in `t`.
#[inline]
fn lerp(a: f64, b: f64, t: f64) -> f64 {
    let d = b - a;
    if t >= 0.5 { b - d * (1.0 - t) } else { a + d * t }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn covariance(samples: &[DVec3]) -> Option<DMat3> {
        let mean = samples.iter().fold(DVec3::ZERO, |acc, s| acc + *s) / samples.len() as f64;
        samples
            .iter()
            .fold(CrossProducts::default(), |acc, s| acc + CrossProducts::from_centered(*s - mean))
            .covariance(samples.len())
    }

    #[test]
    fn test_percentile_linear() {
        let mut v = vec![4.0, 1.0, 3.0, 2.0];
        assert_eq!(percentile(&mut v, 0.0), Some(1.0));
        assert_eq!(percentile(&mut v, 100.0), Some(4.0));
        assert_abs_diff_eq!(percentile(&mut v, 25.0).unwrap(), 1.75, epsilon = 1e-15);
        assert_abs_diff_eq!(percentile(&mut v, 50.0).unwrap(), 2.5, epsilon = 1e-15);
        assert_abs_diff_eq!(percentile(&mut v, 99.0).unwrap(), 3.97, epsilon = 1e-12);
    }

    #[test]
    fn test_percentile_edge_cases() {
        assert_eq!(percentile(&mut [], 50.0), None);
        assert_eq!(percentile(&mut [2.0], 101.0), None);
        assert_eq!(percentile(&mut [7.5], 1.0), Some(7.5));
        let mut v = [5.0, 5.0, 5.0];
        assert_eq!(percentiles(&mut v, &[1.0, 99.0]), Some(vec![5.0, 5.0]));
        assert_eq!(percentiles(&mut v, &[50.0, 120.0]), None);
        assert_eq!(percentiles(&mut v, &[]), Some(vec![]));
    }

    #[test]
    fn test_covariance_matches_definition() {
        let samples = [
            DVec3::new(1.0, 2.0, 0.5),
            DVec3::new(2.0, 4.5, 0.0),
            DVec3::new(3.0, 5.0, 1.0),
            DVec3::new(4.0, 8.5, 0.5),
        ];
        let cov = covariance(&samples).unwrap();
        // var(x) = 5/3, cov(x, y) = 10/3 with ddof = 1
        assert_abs_diff_eq!(cov.col(0).x, 5.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov.col(1).x, 10.0 / 3.0, epsilon = 1e-12);
        assert_eq!(cov.col(1).x, cov.col(0).y);
        assert!(covariance(&samples[..1]).is_none());
    }

    #[test]
    fn test_cross_products_merge() {
        let a = CrossProducts::from_centered(DVec3::new(1.0, 2.0, 3.0));
        let b = CrossProducts::from_centered(DVec3::new(-1.0, 0.0, 1.0));
        let mut c = a;
        c += b;
        assert_eq!(c, a + b);
        assert_eq!(c.xz, 3.0 - 1.0);
    }
}
