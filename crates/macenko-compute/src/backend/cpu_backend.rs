//! CPU backend using rayon for parallelization.
//!
//! Arrays are plain `Vec<f64>` in row-major `(rows, components)` layout.
//! Reductions split the rows into fixed-size chunks, reduce each chunk in
//! parallel, then combine the partials sequentially in chunk order, so the
//! result does not depend on the thread count.

use rayon::prelude::*;
use tracing::trace;

use macenko_math::{percentiles, unmix, CrossProducts, DVec3};

use super::primitives::{ArrayHandle, ReconstructParams, StainPrimitives, StainSelection, TissueStats};
use super::clip_intensity;
use crate::{ComputeError, ComputeResult};

/// Pixels per reduction chunk.
const CHUNK_PIXELS: usize = 1 << 14;

/// CPU array handle - data stored in RAM.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuArray {
    data: Vec<f64>,
    rows: usize,
    components: usize,
}

impl CpuArray {
    pub fn new(data: Vec<f64>, rows: usize, components: usize) -> ComputeResult<Self> {
        if data.len() != rows * components {
            return Err(ComputeError::BufferSizeMismatch {
                expected: rows * components,
                actual: data.len(),
            });
        }
        Ok(Self { data, rows, components })
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Values of one component, in row order.
    pub fn column(&self, component: usize) -> Vec<f64> {
        self.data
            .chunks_exact(self.components)
            .map(|row| row[component])
            .collect()
    }
}

impl ArrayHandle for CpuArray {
    fn shape(&self) -> (usize, usize) {
        (self.rows, self.components)
    }
}

/// CPU primitives implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuPrimitives;

impl CpuPrimitives {
    pub fn new() -> Self {
        Self
    }
}

#[inline]
fn pixel(row: &[f64]) -> DVec3 {
    DVec3::new(row[0], row[1], row[2])
}

#[inline]
fn is_tissue(row: &[f64], beta: f64) -> bool {
    row.iter().all(|v| *v >= beta)
}

fn expect_components(handle: &CpuArray, components: usize) -> ComputeResult<()> {
    if handle.components != components {
        return Err(ComputeError::BufferSizeMismatch {
            expected: handle.rows * components,
            actual: handle.len(),
        });
    }
    Ok(())
}

impl StainPrimitives for CpuPrimitives {
    type Handle = CpuArray;

    fn upload_samples(&self, samples: &[u8]) -> ComputeResult<Self::Handle> {
        if samples.len() % 3 != 0 {
            return Err(ComputeError::BufferSizeMismatch {
                expected: samples.len() / 3 * 3,
                actual: samples.len(),
            });
        }
        let data: Vec<f64> = samples.par_iter().map(|s| f64::from(*s)).collect();
        CpuArray::new(data, samples.len() / 3, 3)
    }

    fn download_samples(&self, handle: &Self::Handle) -> ComputeResult<Vec<u8>> {
        // truncating, saturating cast
        Ok(handle.data.par_iter().map(|v| *v as u8).collect())
    }

    fn exec_optical_density(&self, samples: &Self::Handle, io: f64) -> ComputeResult<Self::Handle> {
        trace!(rows = samples.rows, io, "cpu::optical_density");
        let data: Vec<f64> = samples
            .data
            .par_iter()
            .map(|s| -((s + 1.0) / io).ln())
            .collect();
        CpuArray::new(data, samples.rows, samples.components)
    }

    fn exec_tissue_stats(&self, od: &Self::Handle, beta: f64) -> ComputeResult<TissueStats> {
        expect_components(od, 3)?;
        trace!(rows = od.rows, beta, "cpu::tissue_stats");

        let sums: Vec<(usize, DVec3)> = od
            .data
            .par_chunks(3 * CHUNK_PIXELS)
            .map(|chunk| {
                chunk
                    .chunks_exact(3)
                    .filter(|row| is_tissue(row, beta))
                    .fold((0usize, DVec3::ZERO), |(n, s), row| (n + 1, s + pixel(row)))
            })
            .collect();
        let (count, sum) = sums
            .into_iter()
            .fold((0usize, DVec3::ZERO), |(n, s), (cn, cs)| (n + cn, s + cs));

        if count == 0 {
            return Ok(TissueStats { count, mean: DVec3::ZERO, products: CrossProducts::default() });
        }
        let mean = sum / count as f64;

        let partials: Vec<CrossProducts> = od
            .data
            .par_chunks(3 * CHUNK_PIXELS)
            .map(|chunk| {
                chunk
                    .chunks_exact(3)
                    .filter(|row| is_tissue(row, beta))
                    .fold(CrossProducts::default(), |acc, row| {
                        acc + CrossProducts::from_centered(pixel(row) - mean)
                    })
            })
            .collect();
        let products = partials.into_iter().fold(CrossProducts::default(), |a, b| a + b);

        Ok(TissueStats { count, mean, products })
    }

    fn exec_tissue_angles(&self, od: &Self::Handle, beta: f64, e0: DVec3, e1: DVec3) -> ComputeResult<Self::Handle> {
        expect_components(od, 3)?;
        trace!(rows = od.rows, beta, "cpu::tissue_angles");

        let angles: Vec<f64> = od
            .data
            .par_chunks_exact(3)
            .filter(|row| is_tissue(row, beta))
            .map(|row| macenko_math::plane_angle(pixel(row), e0, e1))
            .collect();
        let rows = angles.len();
        CpuArray::new(angles, rows, 1)
    }

    fn exec_unmix(&self, od: &Self::Handle, pinv: &[DVec3; 2]) -> ComputeResult<Self::Handle> {
        expect_components(od, 3)?;
        trace!(rows = od.rows, "cpu::unmix");

        let mut out = vec![0.0; od.rows * 2];
        out.par_chunks_mut(2)
            .zip(od.data.par_chunks_exact(3))
            .for_each(|(c, row)| {
                let [h, e] = unmix(pinv, pixel(row));
                c[0] = h;
                c[1] = e;
            });
        CpuArray::new(out, od.rows, 2)
    }

    fn exec_reconstruct(&self, concentrations: &Self::Handle, params: &ReconstructParams) -> ComputeResult<Self::Handle> {
        expect_components(concentrations, 2)?;
        trace!(rows = concentrations.rows, selection = ?params.selection, "cpu::reconstruct");

        let h = params.basis.hematoxylin;
        let e = params.basis.eosin;
        let [rh, re] = params.ratio;
        let io = params.io;
        let selection = params.selection;

        let mut out = vec![0.0; concentrations.rows * 3];
        out.par_chunks_mut(3)
            .zip(concentrations.data.par_chunks_exact(2))
            .for_each(|(px, c)| {
                let (ch, ce) = (c[0] / rh, c[1] / re);
                for k in 0..3 {
                    let od = match selection {
                        StainSelection::Combined => h[k] * ch + e[k] * ce,
                        StainSelection::Hematoxylin => h[k] * ch,
                        StainSelection::Eosin => e[k] * ce,
                    };
                    px[k] = clip_intensity(io * (-od).exp());
                }
            });
        CpuArray::new(out, concentrations.rows, 3)
    }

    fn percentiles(&self, handle: &Self::Handle, component: usize, qs: &[f64]) -> ComputeResult<Vec<f64>> {
        if component >= handle.components {
            return Err(ComputeError::OperationFailed(format!(
                "component {} out of range for {} components",
                component, handle.components
            )));
        }
        let mut values = handle.column(component);
        percentiles(&mut values, qs).ok_or_else(|| {
            ComputeError::OperationFailed(format!("percentiles {:?} of {} values", qs, values.len()))
        })
    }

    fn name(&self) -> &'static str {
        "cpu"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use macenko_core::StainBasis;

    #[test]
    fn test_optical_density() {
        let cpu = CpuPrimitives::new();
        let samples = cpu.upload_samples(&[239, 0, 255]).unwrap();
        let od = cpu.exec_optical_density(&samples, 240.0).unwrap();
        assert_eq!(od.shape(), (1, 3));
        assert_eq!(od.data()[0], 0.0);
        assert_abs_diff_eq!(od.data()[1], 240f64.ln(), epsilon = 1e-12);
        assert!(od.data()[2] < 0.0);
    }

    #[test]
    fn test_upload_rejects_partial_pixel() {
        let cpu = CpuPrimitives::new();
        assert!(matches!(
            cpu.upload_samples(&[1, 2, 3, 4]),
            Err(ComputeError::BufferSizeMismatch { actual: 4, .. })
        ));
    }

    #[test]
    fn test_tissue_stats_threshold_is_inclusive() {
        let cpu = CpuPrimitives::new();
        let od = CpuArray::new(vec![0.15, 0.2, 0.3, 0.1, 0.9, 0.9, 0.35, 0.4, 0.5], 3, 3).unwrap();
        let stats = cpu.exec_tissue_stats(&od, 0.15).unwrap();
        assert_eq!(stats.count, 2);
        assert_abs_diff_eq!(stats.mean.x, 0.25, epsilon = 1e-15);
        // two samples: var = d² * 2 / 1
        assert_abs_diff_eq!(stats.products.xx, 0.02, epsilon = 1e-15);
        let cov = stats.covariance().unwrap();
        assert_abs_diff_eq!(cov.col(0).x, 0.02, epsilon = 1e-15);
    }

    #[test]
    fn test_tissue_stats_chunk_independent() {
        let cpu = CpuPrimitives::new();
        let rows = CHUNK_PIXELS * 2 + 17;
        let data: Vec<f64> = (0..rows * 3).map(|i| 0.2 + ((i * 37) % 101) as f64 / 100.0).collect();
        let od = CpuArray::new(data.clone(), rows, 3).unwrap();
        let stats = cpu.exec_tissue_stats(&od, 0.15).unwrap();
        assert_eq!(stats.count, rows);

        // single-pass reference over the whole buffer
        let samples: Vec<DVec3> = data.chunks_exact(3).map(pixel).collect();
        let mean = samples.iter().fold(DVec3::ZERO, |acc, s| acc + *s) / rows as f64;
        let reference = samples
            .iter()
            .fold(CrossProducts::default(), |acc, s| acc + CrossProducts::from_centered(*s - mean))
            .covariance(rows)
            .unwrap();
        let cov = stats.covariance().unwrap();
        for c in 0..3 {
            assert_abs_diff_eq!(cov.col(c).x, reference.col(c).x, epsilon = 1e-12);
            assert_abs_diff_eq!(cov.col(c).y, reference.col(c).y, epsilon = 1e-12);
            assert_abs_diff_eq!(cov.col(c).z, reference.col(c).z, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_tissue_angles_filters() {
        let cpu = CpuPrimitives::new();
        let od = CpuArray::new(vec![1.0, 0.0, 1.0, 0.5, 0.5, 0.5], 2, 3).unwrap();
        let angles = cpu.exec_tissue_angles(&od, 0.15, DVec3::X, DVec3::Y).unwrap();
        assert_eq!(angles.shape(), (1, 1));
        assert_abs_diff_eq!(angles.data()[0], std::f64::consts::FRAC_PI_4, epsilon = 1e-15);
    }

    #[test]
    fn test_unmix_and_reconstruct() {
        let cpu = CpuPrimitives::new();
        let basis = StainBasis::REFERENCE;
        let h = DVec3::from_array(basis.hematoxylin);
        let e = DVec3::from_array(basis.eosin);
        let pinv = macenko_math::pseudo_inverse_3x2(h, e);

        let y = h * 0.8 + e * 0.3;
        let od = CpuArray::new(y.to_array().to_vec(), 1, 3).unwrap();
        let c = cpu.exec_unmix(&od, &pinv).unwrap();
        assert_abs_diff_eq!(c.data()[0], 0.8, epsilon = 1e-12);
        assert_abs_diff_eq!(c.data()[1], 0.3, epsilon = 1e-12);

        let params = ReconstructParams { basis, ratio: [1.0, 1.0], io: 240.0, selection: StainSelection::Combined };
        let out = cpu.exec_reconstruct(&c, &params).unwrap();
        for k in 0..3 {
            assert_abs_diff_eq!(out.data()[k], 240.0 * (-y[k]).exp(), epsilon = 1e-9);
        }

        let h_only = cpu
            .exec_reconstruct(&c, &ReconstructParams { selection: StainSelection::Hematoxylin, ..params })
            .unwrap();
        assert_abs_diff_eq!(h_only.data()[0], 240.0 * (-h.x * 0.8).exp(), epsilon = 1e-9);
    }

    #[test]
    fn test_reconstruct_overflow_clips() {
        let cpu = CpuPrimitives::new();
        let c = CpuArray::new(vec![-1.0, 0.0], 1, 2).unwrap();
        let params = ReconstructParams {
            basis: StainBasis::REFERENCE,
            ratio: [1.0, 1.0],
            io: 240.0,
            selection: StainSelection::Combined,
        };
        let out = cpu.exec_reconstruct(&c, &params).unwrap();
        // 240 * exp(0.5626) > 255
        assert_eq!(out.data()[0], 254.0);
        assert_eq!(cpu.download_samples(&out).unwrap()[0], 254);
    }

    #[test]
    fn test_percentiles_by_component() {
        let cpu = CpuPrimitives::new();
        let a = CpuArray::new(vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0], 4, 2).unwrap();
        let p = cpu.percentiles(&a, 1, &[0.0, 50.0]).unwrap();
        assert_eq!(p, vec![10.0, 25.0]);
        assert!(cpu.percentiles(&a, 2, &[50.0]).is_err());
    }
}
