//! Stain basis and concentration statistics.
//!
//! A [`StainBasis`] is the 3x2 matrix whose columns are the optical-density
//! directions of hematoxylin and eosin. Paired with a [`MaxConcentration`]
//! it forms the [`ReferenceStains`] a normalizer maps every image onto.
//!
//! ```text
//!        H       E
//! R | h_r     e_r |
//! G | h_g     e_g |
//! B | h_b     e_b |
//! ```

use serde::{Deserialize, Serialize};

use crate::Result;

/// Two-stain (H&E) basis in optical-density RGB space.
///
/// Columns are not unit-normalized; an estimated basis is used exactly as
/// it falls out of the eigenvector combination.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StainBasis {
    /// Hematoxylin direction (column 0).
    pub hematoxylin: [f64; 3],
    /// Eosin direction (column 1).
    pub eosin: [f64; 3],
}

impl StainBasis {
    /// Default reference basis.
    pub const REFERENCE: Self = Self {
        hematoxylin: [0.5626, 0.7201, 0.4062],
        eosin: [0.2159, 0.8012, 0.5581],
    };

    /// Creates a basis from its two columns.
    #[inline]
    pub const fn new(hematoxylin: [f64; 3], eosin: [f64; 3]) -> Self {
        Self { hematoxylin, eosin }
    }

    /// Creates a basis from a row-major 3x2 matrix (rows = R, G, B).
    pub const fn from_rows(rows: [[f64; 2]; 3]) -> Self {
        Self {
            hematoxylin: [rows[0][0], rows[1][0], rows[2][0]],
            eosin: [rows[0][1], rows[1][1], rows[2][1]],
        }
    }

    /// Returns the row-major 3x2 matrix.
    pub fn to_rows(&self) -> [[f64; 2]; 3] {
        let (h, e) = (self.hematoxylin, self.eosin);
        [[h[0], e[0]], [h[1], e[1]], [h[2], e[2]]]
    }

    /// Returns column `i` (0 = hematoxylin, 1 = eosin), or `None` past
    /// the second column.
    #[inline]
    pub fn column(&self, i: usize) -> Option<[f64; 3]> {
        match i {
            0 => Some(self.hematoxylin),
            1 => Some(self.eosin),
            _ => None,
        }
    }

    /// Returns `true` if every entry is finite.
    pub fn is_finite(&self) -> bool {
        self.hematoxylin.iter().chain(self.eosin.iter()).all(|v| v.is_finite())
    }
}

impl Default for StainBasis {
    fn default() -> Self {
        Self::REFERENCE
    }
}

/// 99th-percentile concentration of each stain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaxConcentration {
    /// Hematoxylin concentration.
    pub hematoxylin: f64,
    /// Eosin concentration.
    pub eosin: f64,
}

impl MaxConcentration {
    /// Default reference concentrations.
    pub const REFERENCE: Self = Self {
        hematoxylin: 1.9705,
        eosin: 1.0308,
    };

    /// Creates a max-concentration pair.
    #[inline]
    pub const fn new(hematoxylin: f64, eosin: f64) -> Self {
        Self { hematoxylin, eosin }
    }

    /// As `[hematoxylin, eosin]`.
    #[inline]
    pub fn to_array(&self) -> [f64; 2] {
        [self.hematoxylin, self.eosin]
    }

    /// Returns `true` if both values are finite and strictly positive.
    /// Otherwise rescaling by them flips or saturates concentrations.
    pub fn is_usable(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite() && *v > 0.0)
    }

    /// Per-stain ratio `self / reference`, the factor input concentrations
    /// are divided by during normalization.
    pub fn ratio_to(&self, reference: &Self) -> [f64; 2] {
        [
            self.hematoxylin / reference.hematoxylin,
            self.eosin / reference.eosin,
        ]
    }
}

impl Default for MaxConcentration {
    fn default() -> Self {
        Self::REFERENCE
    }
}

/// The state a normalizer maps images onto.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ReferenceStains {
    /// Reference stain basis.
    pub basis: StainBasis,
    /// Reference max concentrations.
    pub max_concentration: MaxConcentration,
}

impl ReferenceStains {
    /// Creates a reference from its parts.
    #[inline]
    pub const fn new(basis: StainBasis, max_concentration: MaxConcentration) -> Self {
        Self { basis, max_concentration }
    }

    /// Serializes to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Parses a reference from YAML.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}
