//! Compute backends for stain normalization.
//!
//! Provides CPU (rayon) and wgpu backends with automatic selection.
//!
//! # Architecture
//!
//! ```text
//! estimate_stains / MacenkoNormalizer<P: StainPrimitives>
//!     +-- CpuPrimitives  (rayon parallelization)
//!     +-- WgpuPrimitives (Vulkan/Metal/DX12)
//! ```

mod cpu_backend;
mod detect;
mod primitives;

#[cfg(feature = "wgpu")]
mod wgpu_backend;

pub use cpu_backend::{CpuArray, CpuPrimitives};
pub use detect::{describe_backends, detect_backends, select_best_backend, BackendInfo, BACKEND_ENV};
pub use primitives::{ArrayHandle, ReconstructParams, StainPrimitives, StainSelection, TissueStats};

#[cfg(feature = "wgpu")]
pub use wgpu_backend::{WgpuArray, WgpuPrimitives};

/// Reconstructed intensities above this value are replaced.
pub const OVERFLOW_THRESHOLD: f64 = 255.0;

/// Replacement for intensities above [`OVERFLOW_THRESHOLD`].
pub const OVERFLOW_VALUE: f64 = 254.0;

/// Clamp rule applied to every reconstructed intensity before the 8-bit cast.
#[inline]
pub fn clip_intensity(v: f64) -> f64 {
    if v > OVERFLOW_THRESHOLD { OVERFLOW_VALUE } else { v }
}

/// Available compute backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Auto-select best available (wgpu > CPU).
    #[default]
    Auto,
    /// CPU backend using rayon for parallelization.
    Cpu,
    /// wgpu backend (Vulkan/Metal/DX12).
    Wgpu,
}

impl Backend {
    /// Check if this backend is available on current system.
    pub fn is_available(&self) -> bool {
        match self {
            Self::Auto => true,
            Self::Cpu => true,
            #[cfg(feature = "wgpu")]
            Self::Wgpu => WgpuPrimitives::is_available(),
            #[cfg(not(feature = "wgpu"))]
            Self::Wgpu => false,
        }
    }

    /// Get human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Cpu => "cpu",
            Self::Wgpu => "wgpu",
        }
    }

    /// Parse a backend name, case-insensitive.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "cpu" => Some(Self::Cpu),
            "wgpu" | "gpu" => Some(Self::Wgpu),
            _ => None,
        }
    }

    /// Resolve `Auto` to a concrete backend; other variants pass through.
    pub fn resolve(self) -> Self {
        match self {
            Self::Auto => select_best_backend(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_intensity() {
        assert_eq!(clip_intensity(255.0), 255.0);
        assert_eq!(clip_intensity(255.0001), 254.0);
        assert_eq!(clip_intensity(240.0), 240.0);
        assert_eq!(clip_intensity(f64::INFINITY), 254.0);
    }

    #[test]
    fn test_backend_names() {
        for b in [Backend::Auto, Backend::Cpu, Backend::Wgpu] {
            assert_eq!(Backend::from_name(b.name()), Some(b));
        }
        assert_eq!(Backend::from_name(" CPU "), Some(Backend::Cpu));
        assert_eq!(Backend::from_name("cuda"), None);
        assert!(Backend::Cpu.is_available());
        assert_eq!(Backend::Cpu.resolve(), Backend::Cpu);
    }
}
