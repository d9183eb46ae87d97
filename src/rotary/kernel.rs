// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rotation math over contiguous host buffers.
//!
//! A buffer is viewed as `[n_tokens, groups, head_dim]`: every token owns
//! `groups` head vectors, of which the leading `rotated_groups` (the query
//! and key roles) are rotated. Within a head only the first `rotary_dim`
//! coordinates are touched; everything else is never written, so it comes
//! back byte-identical.
//!
//! For a coordinate pair `(x1, x2)` and angle row `(cos, sin)`:
//!
//! ```text
//! forward:  (x1*cos - x2*sin,  x1*sin + x2*cos)
//! inverse:  (x1*cos + x2*sin, -x1*sin + x2*cos)
//! ```
//!
//! The inverse is the transpose of the forward rotation matrix, which is
//! exactly the vector-Jacobian product of the forward pass.

use candle_core::WithDType;

use crate::config::RotaryLayout;

/// Direction of a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Rotate by `+angle` (forward pass).
    Forward,
    /// Rotate by `-angle` (gradient propagation).
    Inverse,
}

impl Direction {
    /// The opposite direction.
    #[must_use]
    pub const fn flip(self) -> Self {
        match self {
            Self::Forward => Self::Inverse,
            Self::Inverse => Self::Forward,
        }
    }

    /// Sign applied to `sin`.
    const fn sin_sign(self) -> f64 {
        match self {
            Self::Forward => 1.0,
            Self::Inverse => -1.0,
        }
    }
}

/// Arrangement of head vectors inside one tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowGeometry {
    /// Number of tokens (leading rows).
    pub n_tokens: usize,
    /// Head vectors per token, across all roles.
    pub groups: usize,
    /// Leading head vectors per token that are rotated.
    pub rotated_groups: usize,
    /// Coordinates per head vector.
    pub head_dim: usize,
}

impl RowGeometry {
    /// Elements per token.
    pub const fn token_stride(&self) -> usize {
        self.groups * self.head_dim
    }

    /// Elements in the whole tensor.
    pub const fn elem_count(&self) -> usize {
        self.n_tokens * self.token_stride()
    }
}

/// Everything a rotation needs besides the data and the angle rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationSpec {
    /// Layout of the rotated tensor.
    pub geometry: RowGeometry,
    /// Rotated prefix of every head vector.
    pub rotary_dim: usize,
    /// Coordinate pairing.
    pub layout: RotaryLayout,
    /// Rotation direction.
    pub direction: Direction,
}

impl RotationSpec {
    /// Same rotation in the opposite direction.
    #[must_use]
    pub const fn inverse(self) -> Self {
        Self {
            direction: self.direction.flip(),
            ..self
        }
    }

    /// Number of frequency pairs per angle row.
    pub const fn half_dim(&self) -> usize {
        self.rotary_dim / 2
    }

    /// Whether this rotation leaves every element unchanged.
    pub const fn is_identity(&self) -> bool {
        self.rotary_dim == 0 || self.geometry.rotated_groups == 0 || self.geometry.n_tokens == 0
    }

    /// Check buffer and angle-row element counts against the geometry.
    ///
    /// # Errors
    ///
    /// Returns a candle error describing the first disagreement.
    pub fn check(&self, buf_len: usize, cos_len: usize, sin_len: usize) -> candle_core::Result<()> {
        let RowGeometry {
            n_tokens,
            groups,
            rotated_groups,
            head_dim,
        } = self.geometry;
        let rows_len = n_tokens * self.half_dim();

        if self.rotary_dim % 2 != 0 || self.rotary_dim > head_dim || rotated_groups > groups {
            candle_core::bail!(
                "rotary: invalid geometry (rotary_dim {}, head_dim {head_dim}, {rotated_groups}/{groups} groups)",
                self.rotary_dim
            );
        }
        if buf_len != self.geometry.elem_count() {
            candle_core::bail!(
                "rotary: buffer has {buf_len} elements, geometry expects {}",
                self.geometry.elem_count()
            );
        }
        if cos_len != rows_len || sin_len != rows_len {
            candle_core::bail!("rotary: angle rows have {cos_len}/{sin_len} elements, expected {rows_len}");
        }
        Ok(())
    }

    /// Rotate `buf` in place with one `(cos, sin)` row per token.
    ///
    /// # Shapes
    /// - `buf`: `[n_tokens, groups, head_dim]` (flattened)
    /// - `cos`, `sin`: `[n_tokens, rotary_dim / 2]` (flattened)
    ///
    /// # Errors
    ///
    /// Returns a candle error if a slice length disagrees with the
    /// geometry; nothing is written in that case.
    pub fn apply<T: WithDType>(&self, buf: &mut [T], cos: &[T], sin: &[T]) -> candle_core::Result<()> {
        self.check(buf.len(), cos.len(), sin.len())?;
        if self.is_identity() {
            return Ok(());
        }
        let RowGeometry {
            rotated_groups,
            head_dim,
            ..
        } = self.geometry;
        let half = self.half_dim();

        let sign = self.direction.sin_sign();
        let rows = cos.chunks_exact(half).zip(sin.chunks_exact(half));
        for (token, (cos_row, sin_row)) in buf.chunks_exact_mut(self.geometry.token_stride()).zip(rows) {
            for head in token.chunks_exact_mut(head_dim).take(rotated_groups) {
                let (rotated, _pass_through) = head.split_at_mut(self.rotary_dim);
                rotate_head(rotated, cos_row, sin_row, self.layout, sign);
            }
        }
        Ok(())
    }
}

/// Rotate the `rotary_dim` prefix of one head vector.
fn rotate_head<T: WithDType>(v: &mut [T], cos: &[T], sin: &[T], layout: RotaryLayout, sign: f64) {
    match layout {
        RotaryLayout::PairedHalf => {
            let (first, second) = v.split_at_mut(v.len() / 2);
            let angles = cos.iter().zip(sin);
            for ((x1, x2), (c, s)) in first.iter_mut().zip(second.iter_mut()).zip(angles) {
                rotate_pair(x1, x2, *c, *s, sign);
            }
        }
        RotaryLayout::Interleaved => {
            let angles = cos.iter().zip(sin);
            for (pair, (c, s)) in v.chunks_exact_mut(2).zip(angles) {
                if let [x1, x2] = pair {
                    rotate_pair(x1, x2, *c, *s, sign);
                }
            }
        }
    }
}

/// Rotate one coordinate pair; arithmetic runs in `f64`.
#[inline]
fn rotate_pair<T: WithDType>(x1: &mut T, x2: &mut T, cos: T, sin: T, sign: f64) {
    let (a, b) = (x1.to_f64(), x2.to_f64());
    let (c, s) = (cos.to_f64(), sign * sin.to_f64());
    *x1 = T::from_f64(a * c - b * s);
    *x2 = T::from_f64(a * s + b * c);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::float_cmp)]
mod tests {
    use super::*;

    fn spec(groups: usize, rotated_groups: usize, head_dim: usize, rotary_dim: usize) -> RotationSpec {
        RotationSpec {
            geometry: RowGeometry {
                n_tokens: 1,
                groups,
                rotated_groups,
                head_dim,
            },
            rotary_dim,
            layout: RotaryLayout::PairedHalf,
            direction: Direction::Forward,
        }
    }

    #[test]
    fn paired_half_pairs_i_with_i_plus_half() {
        let (c, s) = (0.6_f32, 0.8_f32);
        let mut v = vec![1.0_f32, 2.0, 3.0, 4.0];
        spec(1, 1, 4, 4).apply(&mut v, &[c, 1.0], &[s, 0.0]).unwrap();
        // Pair (v[0], v[2]) rotated, pair (v[1], v[3]) at angle 0.
        assert!((v[0] - (1.0 * c - 3.0 * s)).abs() < 1e-6);
        assert!((v[2] - (1.0 * s + 3.0 * c)).abs() < 1e-6);
        assert_eq!(v[1], 2.0);
        assert_eq!(v[3], 4.0);
    }

    #[test]
    fn interleaved_pairs_adjacent() {
        let (c, s) = (0.6_f32, 0.8_f32);
        let mut v = vec![1.0_f32, 2.0, 3.0, 4.0];
        let mut interleaved = spec(1, 1, 4, 4);
        interleaved.layout = RotaryLayout::Interleaved;
        interleaved.apply(&mut v, &[c, 1.0], &[s, 0.0]).unwrap();
        assert!((v[0] - (1.0 * c - 2.0 * s)).abs() < 1e-6);
        assert!((v[1] - (1.0 * s + 2.0 * c)).abs() < 1e-6);
        assert_eq!(&v[2..], &[3.0, 4.0]);
    }

    #[test]
    fn inverse_undoes_forward() {
        let original: Vec<f64> = (0..24).map(|i| f64::from(i) * 0.37 - 2.0).collect();
        let cos: Vec<f64> = (0..3).map(|j| (f64::from(j) + 0.5).cos()).collect();
        let sin: Vec<f64> = (0..3).map(|j| (f64::from(j) + 0.5).sin()).collect();
        for layout in [RotaryLayout::PairedHalf, RotaryLayout::Interleaved] {
            let mut forward = spec(3, 2, 8, 6);
            forward.layout = layout;
            let mut v = original.clone();
            forward.apply(&mut v, &cos, &sin).unwrap();
            forward.inverse().apply(&mut v, &cos, &sin).unwrap();
            for (a, b) in v.iter().zip(&original) {
                assert!((a - b).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn untouched_groups_and_tail_are_identical() {
        let original: Vec<f32> = (0..24).map(|i| i as f32 + 0.25).collect();
        let mut v = original.clone();
        // 3 heads of 8, first 2 rotated on their first 4 coordinates.
        spec(3, 2, 8, 4)
            .apply(&mut v, &[0.1, 0.2], &[0.9, 0.7])
            .unwrap();
        for head in 0..2 {
            assert_eq!(&v[head * 8 + 4..head * 8 + 8], &original[head * 8 + 4..head * 8 + 8]);
            assert_ne!(&v[head * 8..head * 8 + 4], &original[head * 8..head * 8 + 4]);
        }
        assert_eq!(&v[16..], &original[16..]);
    }

    #[test]
    fn size_mismatch_writes_nothing() {
        let mut v = vec![1.0_f32; 8];
        let result = spec(1, 1, 8, 8).apply(&mut v, &[0.5; 3], &[0.5; 3]);
        assert!(result.is_err());
        assert!(v.iter().all(|x| *x == 1.0));
    }
}
