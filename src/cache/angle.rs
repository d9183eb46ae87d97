// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cosine/sine angle tables for rotary position embeddings.
//!
//! ## Numerics
//!
//! Inverse frequencies are computed in `f64`, positions and their products
//! with the frequencies in `f32`, and only the final `cos`/`sin` values are
//! cast to the working dtype. Half-precision angle products lose whole
//! radians once positions reach the low thousands.
//!
//! The angle table is an elementwise outer product (no reductions), so
//! the row for position `p` does not depend on how many rows were built.

use candle_core::{DType, Device, Tensor};

use crate::config::RopeConfig;
use crate::error::{Result, RopeError};

/// Pre-computed cosine and sine tables for rotary position embeddings.
///
/// # Shapes
///
/// - `cos`: `[cached_len, rotary_dim / 2]`
/// - `sin`: `[cached_len, rotary_dim / 2]`
#[derive(Debug, Clone)]
pub struct AngleCache {
    /// Cosine values: `[cached_len, rotary_dim / 2]`.
    cos: Tensor,
    /// Sine values: `[cached_len, rotary_dim / 2]`.
    sin: Tensor,
    /// Number of positions covered.
    cached_len: usize,
    /// Base frequency actually used (after dynamic NTK rescaling).
    base: f64,
    /// Incremented on every rebuild within one owner.
    generation: u64,
}

impl AngleCache {
    /// Build a fresh table covering positions `0..cached_len`, with the
    /// base the scaling policy gives for `cached_len`.
    ///
    /// # Errors
    ///
    /// Returns [`RopeError::Model`] on tensor operation failures.
    pub fn build(
        config: &RopeConfig,
        cached_len: usize,
        dtype: DType,
        device: &Device,
        generation: u64,
    ) -> Result<Self> {
        let base = config
            .scaling
            .effective_base(config.base, config.rotary_dim, cached_len);
        Self::build_with_base(config, cached_len, base, dtype, device, generation)
    }

    /// Build a fresh table covering positions `0..cached_len` with an
    /// explicit base frequency.
    ///
    /// # Errors
    ///
    /// Returns [`RopeError::Model`] on tensor operation failures.
    pub fn build_with_base(
        config: &RopeConfig,
        cached_len: usize,
        base: f64,
        dtype: DType,
        device: &Device,
        generation: u64,
    ) -> Result<Self> {
        let half_dim = config.half_dim();

        if half_dim == 0 {
            let empty = Tensor::zeros((cached_len, 0), dtype, device)?;
            return Ok(Self {
                cos: empty.clone(),
                sin: empty,
                cached_len,
                base,
                generation,
            });
        }

        // Inverse frequencies: base^(-2j/d) for j in 0..half_dim
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|j| {
                #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
                let exponent = 2.0 * j as f64 / config.rotary_dim as f64;
                // Safe: f64 → f32 truncation is intentional for RoPE frequencies
                #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
                let freq = (1.0 / base.powf(exponent)) as f32;
                freq
            })
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;

        // Positions, rescaled by the linear interpolation factor (1.0 otherwise)
        let scale = config.scaling.position_scale();
        let positions: Vec<f32> = (0..cached_len)
            .map(|p| {
                #[allow(
                    clippy::cast_precision_loss,
                    clippy::cast_possible_truncation,
                    clippy::as_conversions
                )]
                let pf = (p as f64 * scale) as f32;
                pf
            })
            .collect();
        let positions = Tensor::from_vec(positions, (cached_len, 1), device)?;

        // Outer product: [cached_len, half_dim]
        let angles = positions.broadcast_mul(&inv_freq)?;

        let cos = angles.cos()?.to_dtype(dtype)?;
        let sin = angles.sin()?.to_dtype(dtype)?;

        tracing::debug!(
            cached_len,
            half_dim,
            base,
            dtype = ?dtype,
            generation,
            "built rotary angle cache"
        );

        Ok(Self {
            cos,
            sin,
            cached_len,
            base,
            generation,
        })
    }

    /// Return a cache covering at least `min_len` positions at `dtype` on
    /// `device`, rebuilding `slot` only when the current table falls short.
    ///
    /// The base frequency is the one the scaling policy gives for `min_len`,
    /// so dynamic NTK scaling applies to the requesting call only: a table
    /// built with another base is a miss. Within the trained length this
    /// is always the configured base.
    ///
    /// A hit performs no tensor work. A rebuild replaces the whole table
    /// (never extends it) and keeps the covered length monotone: the new
    /// length is `max(min_len, previous length)`.
    ///
    /// # Errors
    ///
    /// Returns [`RopeError::Model`] on tensor operation failures.
    pub fn ensure<'a>(
        slot: &'a mut Option<Self>,
        config: &RopeConfig,
        min_len: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<&'a Self> {
        let min_len = min_len.max(1);
        let base = config
            .scaling
            .effective_base(config.base, config.rotary_dim, min_len);
        let (target_len, generation) = match slot.as_ref() {
            Some(cache) if cache.covers(min_len, base, dtype, device) => (None, cache.generation),
            Some(cache) => (Some(min_len.max(cache.cached_len)), cache.generation + 1),
            None => (Some(min_len), 0),
        };

        if let Some(len) = target_len {
            *slot = Some(Self::build_with_base(config, len, base, dtype, device, generation)?);
        }

        slot.as_ref().ok_or_else(|| RopeError::CacheRange {
            index: min_len - 1,
            cached_len: 0,
        })
    }

    /// Whether this table can serve `len` positions with base frequency
    /// `base` at `dtype` on `device` without rebuilding.
    pub fn covers(&self, len: usize, base: f64, dtype: DType, device: &Device) -> bool {
        len <= self.cached_len
            && self.base.to_bits() == base.to_bits()
            && self.cos.dtype() == dtype
            && self.cos.device().same_device(device)
    }

    /// Gather the cos/sin rows for the given positions.
    ///
    /// # Shapes
    /// - returns: `([rows.len(), rotary_dim / 2], [rows.len(), rotary_dim / 2])`
    ///
    /// # Errors
    ///
    /// Returns [`RopeError::CacheRange`] if a row is not covered by the
    /// table, and [`RopeError::Model`] on tensor operation failures.
    pub fn gather(&self, rows: &[u32]) -> Result<(Tensor, Tensor)> {
        if let Some(&max_row) = rows.iter().max() {
            #[allow(clippy::as_conversions)]
            let index = max_row as usize;
            if index >= self.cached_len {
                return Err(RopeError::CacheRange {
                    index,
                    cached_len: self.cached_len,
                });
            }
        }
        let ids = Tensor::from_slice(rows, rows.len(), self.cos.device())?;
        let cos = self.cos.index_select(&ids, 0)?;
        let sin = self.sin.index_select(&ids, 0)?;
        Ok((cos, sin))
    }

    /// Cosine table: `[cached_len, rotary_dim / 2]`.
    pub const fn cos(&self) -> &Tensor {
        &self.cos
    }

    /// Sine table: `[cached_len, rotary_dim / 2]`.
    pub const fn sin(&self) -> &Tensor {
        &self.sin
    }

    /// Number of positions covered.
    pub const fn len(&self) -> usize {
        self.cached_len
    }

    /// Whether the table covers no positions.
    pub const fn is_empty(&self) -> bool {
        self.cached_len == 0
    }

    /// Working dtype of the tables.
    pub fn dtype(&self) -> DType {
        self.cos.dtype()
    }

    /// Device holding the tables.
    pub fn device(&self) -> &Device {
        self.cos.device()
    }

    /// Base frequency the table was built with.
    pub const fn base(&self) -> f64 {
        self.base
    }

    /// Rebuild counter, starting at 0 for the first table.
    pub const fn generation(&self) -> u64 {
        self.generation
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::cast_precision_loss,
    clippy::as_conversions
)]
mod tests {
    use super::*;
    use crate::config::ScalingPolicy;

    fn table(cache: &AngleCache) -> (Vec<Vec<f32>>, Vec<Vec<f32>>) {
        (
            cache.cos().to_vec2::<f32>().unwrap(),
            cache.sin().to_vec2::<f32>().unwrap(),
        )
    }

    #[test]
    fn build_matches_closed_form() {
        let config = RopeConfig::new(8);
        let cache = AngleCache::build(&config, 16, DType::F32, &Device::Cpu, 0).unwrap();
        assert_eq!(cache.cos().dims(), &[16, 4]);
        let (cos, sin) = table(&cache);
        for (p, (cos_row, sin_row)) in cos.iter().zip(&sin).enumerate() {
            for j in 0..4 {
                let theta = 10_000f64.powf(-2.0 * j as f64 / 8.0);
                let angle = p as f64 * theta;
                assert!((f64::from(cos_row[j]) - angle.cos()).abs() < 1e-5);
                assert!((f64::from(sin_row[j]) - angle.sin()).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn ensure_hit_does_not_rebuild() {
        let config = RopeConfig::new(16);
        let mut slot = None;
        let first = AngleCache::ensure(&mut slot, &config, 32, DType::F32, &Device::Cpu)
            .unwrap()
            .generation();
        let again = AngleCache::ensure(&mut slot, &config, 10, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(again.generation(), first);
        assert_eq!(again.len(), 32);
    }

    #[test]
    fn growth_keeps_existing_rows() {
        let config = RopeConfig::new(16);
        let mut slot = None;
        let small = AngleCache::ensure(&mut slot, &config, 20, DType::F32, &Device::Cpu)
            .unwrap()
            .clone();
        let large = AngleCache::ensure(&mut slot, &config, 300, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(large.len(), 300);
        assert_eq!(large.generation(), small.generation() + 1);

        let (small_cos, small_sin) = table(&small);
        let (large_cos, large_sin) = table(large);
        assert_eq!(small_cos[..], large_cos[..20]);
        assert_eq!(small_sin[..], large_sin[..20]);
    }

    #[test]
    fn dtype_change_rebuilds_without_shrinking() {
        let config = RopeConfig::new(8);
        let mut slot = None;
        AngleCache::ensure(&mut slot, &config, 64, DType::F32, &Device::Cpu).unwrap();
        let cache = AngleCache::ensure(&mut slot, &config, 4, DType::F16, &Device::Cpu).unwrap();
        assert_eq!(cache.dtype(), DType::F16);
        assert_eq!(cache.len(), 64);
        assert_eq!(cache.generation(), 1);
    }

    #[test]
    fn linear_scaling_divides_positions() {
        let plain = RopeConfig::new(8);
        let scaled = RopeConfig::new(8).with_scaling(ScalingPolicy::Linear { factor: 2.0 });
        let plain = AngleCache::build(&plain, 32, DType::F32, &Device::Cpu, 0).unwrap();
        let scaled = AngleCache::build(&scaled, 32, DType::F32, &Device::Cpu, 0).unwrap();
        let (plain_cos, _) = table(&plain);
        let (scaled_cos, _) = table(&scaled);
        // Position 2p under factor 2 sees the angle of position p.
        for p in 0..16 {
            for j in 0..4 {
                assert!((scaled_cos[2 * p][j] - plain_cos[p][j]).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn dynamic_ntk_grows_base_past_trained_len() {
        let config = RopeConfig::new(8).with_scaling(ScalingPolicy::DynamicNtk {
            factor: 2.0,
            trained_len: 16,
        });
        let within = AngleCache::build(&config, 16, DType::F32, &Device::Cpu, 0).unwrap();
        assert!((within.base() - 10_000.0).abs() < f64::EPSILON);
        let beyond = AngleCache::build(&config, 64, DType::F32, &Device::Cpu, 0).unwrap();
        assert!(beyond.base() > 10_000.0);
    }

    #[test]
    fn dynamic_ntk_base_follows_each_request() {
        let config = RopeConfig::new(8).with_scaling(ScalingPolicy::DynamicNtk {
            factor: 2.0,
            trained_len: 16,
        });
        let mut slot = None;
        let long = AngleCache::ensure(&mut slot, &config, 200, DType::F32, &Device::Cpu)
            .unwrap()
            .base();
        assert!(long > 10_000.0);

        // Back within the trained length: plain base, length kept.
        let short = AngleCache::ensure(&mut slot, &config, 8, DType::F32, &Device::Cpu).unwrap();
        assert!((short.base() - 10_000.0).abs() < f64::EPSILON);
        assert_eq!(short.len(), 200);

        // A mid-length request gets its own base, not the longest one seen.
        let mid = AngleCache::ensure(&mut slot, &config, 50, DType::F32, &Device::Cpu).unwrap();
        let expected = config.scaling.effective_base(10_000.0, 8, 50);
        assert!((mid.base() - expected).abs() < 1e-9 * expected);
        assert!(mid.base() < long);
    }

    #[test]
    fn gather_rejects_uncovered_rows() {
        let config = RopeConfig::new(8);
        let cache = AngleCache::build(&config, 4, DType::F32, &Device::Cpu, 0).unwrap();
        let result = cache.gather(&[0, 4]);
        assert!(matches!(
            result,
            Err(RopeError::CacheRange {
                index: 4,
                cached_len: 4
            })
        ));
        let (cos, _) = cache.gather(&[3, 0]).unwrap();
        assert_eq!(cos.dims(), &[2, 4]);
    }
}
