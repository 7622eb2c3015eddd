//! 8-bit RGB image buffer.
//!
//! [`RgbImage`] is the only image type the normalizer accepts and returns.
//! Samples are stored row-major with interleaved channels, so the buffer
//! has shape `(height, width, 3)` in R, G, B order.
//!
//! # Example
//!
//! ```rust
//! use macenko_core::RgbImage;
//!
//! let img = RgbImage::from_fn(4, 2, |x, y| [x as u8 * 10, y as u8 * 10, 200]);
//! assert_eq!(img.pixel_count(), 8);
//! assert_eq!(img.pixel(3, 1), [30, 10, 200]);
//! ```

use crate::{Error, Result};

/// Number of channels in every image handled by this workspace.
pub const CHANNELS: usize = 3;

/// An owned 8-bit RGB image.
#[derive(Clone, PartialEq, Eq)]
pub struct RgbImage {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl RgbImage {
    /// Wraps a raw interleaved RGB buffer.
    ///
    /// Fails with [`Error::ShapeMismatch`] when `data.len()` is not
    /// `width * height * 3`, or when that product overflows `usize`
    /// (reported as an expected length of `usize::MAX`).
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = sample_count(width, height).unwrap_or(usize::MAX);
        if data.len() != expected {
            return Err(Error::shape_mismatch(expected, data.len()));
        }
        Ok(Self { data, width, height })
    }

    /// Creates an image filled with a single color.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self::from_fn(width, height, |_, _| rgb)
    }

    /// Creates an image by evaluating `f(x, y)` for every pixel.
    pub fn from_fn<F>(width: u32, height: u32, mut f: F) -> Self
    where
        F: FnMut(u32, u32) -> [u8; 3],
    {
        let mut data = Vec::with_capacity(sample_count(width, height).unwrap_or(0));
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&f(x, y));
            }
        }
        Self { data, width, height }
    }

    /// Image width in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Image height in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Shape as `(height, width, channels)`.
    #[inline]
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.height as usize, self.width as usize, CHANNELS)
    }

    /// Number of pixels (`width * height`).
    #[inline]
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Returns the pixel at `(x, y)`.
    ///
    /// # Panics
    ///
    /// Panics if the coordinates are out of bounds.
    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        assert!(x < self.width && y < self.height, "pixel ({x}, {y}) out of bounds");
        let i = (y as usize * self.width as usize + x as usize) * CHANNELS;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// Raw interleaved samples.
    #[inline]
    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the image and returns its samples.
    #[inline]
    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }

    /// Returns `true` if both images have the same width and height.
    #[inline]
    pub fn same_shape(&self, other: &Self) -> bool {
        self.width == other.width && self.height == other.height
    }
}

impl std::fmt::Debug for RgbImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RgbImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("samples", &self.data.len())
            .finish()
    }
}

/// Sample count of a `width x height` RGB buffer, `None` on overflow.
#[inline]
pub fn sample_count(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(CHANNELS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw_rejects_bad_length() {
        let err = RgbImage::from_raw(2, 2, vec![0; 11]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { expected: 12, actual: 11 }));
    }

    #[test]
    fn test_from_raw_rejects_oversized_dims() {
        let err = RgbImage::from_raw(u32::MAX, u32::MAX, Vec::new()).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { expected: usize::MAX, actual: 0 }));
        assert_eq!(sample_count(u32::MAX, u32::MAX), None);
        assert_eq!(sample_count(4, 2), Some(24));
    }

    #[test]
    fn test_from_fn_layout() {
        let img = RgbImage::from_fn(3, 2, |x, y| [x as u8, y as u8, 7]);
        assert_eq!(img.shape(), (2, 3, 3));
        // row-major, channel-interleaved
        assert_eq!(&img.as_raw()[..6], &[0, 0, 7, 1, 0, 7]);
        assert_eq!(img.pixel(2, 1), [2, 1, 7]);
    }

    #[test]
    fn test_filled() {
        let img = RgbImage::filled(5, 4, [1, 2, 3]);
        assert_eq!(img.pixel_count(), 20);
        assert!(img.as_raw().chunks(3).all(|p| p == [1, 2, 3]));
    }
}
