//! Normalization parameters.
//!
//! The same three numbers drive both fitting and transforming:
//!
//! | Field   | Default | Meaning                                           |
//! |---------|---------|---------------------------------------------------|
//! | `io`    | 240     | Transmitted light intensity                       |
//! | `alpha` | 1.0     | Angular percentile margin, in percent             |
//! | `beta`  | 0.15    | Optical density below which a pixel is background |
//!
//! Parameters can be loaded from YAML; missing keys fall back to the defaults:
//!
//! ```rust
//! use macenko_core::NormalizeParams;
//!
//! let params = NormalizeParams::from_yaml_str("alpha: 2.5").unwrap();
//! assert_eq!(params.io, 240);
//! assert_eq!(params.alpha, 2.5);
//! ```

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default transmitted light intensity.
pub const DEFAULT_IO: u32 = 240;
/// Default angular percentile margin.
pub const DEFAULT_ALPHA: f64 = 1.0;
/// Default optical density background threshold.
pub const DEFAULT_BETA: f64 = 0.15;

/// Parameters shared by stain estimation and normalization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeParams {
    /// Transmitted light intensity (must be > 0).
    pub io: u32,
    /// Percentile margin in `[0, 50)` used for the robust angle bounds.
    pub alpha: f64,
    /// Optical density cutoff separating tissue from background.
    pub beta: f64,
}

impl Default for NormalizeParams {
    fn default() -> Self {
        Self {
            io: DEFAULT_IO,
            alpha: DEFAULT_ALPHA,
            beta: DEFAULT_BETA,
        }
    }
}

impl NormalizeParams {
    /// Creates parameters from explicit values.
    pub fn new(io: u32, alpha: f64, beta: f64) -> Self {
        Self { io, alpha, beta }
    }

    /// Sets the transmitted light intensity.
    pub fn with_io(mut self, io: u32) -> Self {
        self.io = io;
        self
    }

    /// Sets the percentile margin.
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    /// Sets the background threshold.
    pub fn with_beta(mut self, beta: f64) -> Self {
        self.beta = beta;
        self
    }

    /// `io` as a float, the form used by the math.
    #[inline]
    pub fn io_f64(&self) -> f64 {
        f64::from(self.io)
    }

    /// Checks every field against its valid range.
    pub fn validate(&self) -> Result<()> {
        if self.io == 0 {
            return Err(Error::invalid_parameter("io must be > 0"));
        }
        if !(self.alpha >= 0.0 && self.alpha < 50.0) {
            return Err(Error::invalid_parameter(format!(
                "alpha must be in [0, 50), got {}",
                self.alpha
            )));
        }
        if !self.beta.is_finite() {
            return Err(Error::invalid_parameter(format!(
                "beta must be finite, got {}",
                self.beta
            )));
        }
        Ok(())
    }

    /// Parses and validates parameters from a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let params: Self = serde_yaml::from_str(yaml)?;
        params.validate()?;
        Ok(params)
    }
}
