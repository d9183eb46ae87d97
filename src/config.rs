// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rotary embedding configuration and `HuggingFace` `config.json` parsing.
//!
//! [`RopeConfig`] captures the four axes that distinguish the rotary
//! embeddings of published decoder families: how many coordinates of each
//! head are rotated, the base frequency, the pairing layout, and the
//! context-extension scaling strategy.
//!
//! # Usage
//!
//! ```
//! use candle_rotary::{RopeConfig, RotaryLayout, ScalingPolicy};
//!
//! let config_str = r#"{"model_type": "llama", "hidden_size": 4096,
//!     "num_attention_heads": 32, "rope_theta": 10000.0,
//!     "max_position_embeddings": 4096,
//!     "rope_scaling": {"type": "linear", "factor": 2.0}}"#;
//! let json: serde_json::Value = serde_json::from_str(config_str).unwrap();
//! let config = RopeConfig::from_hf_config(&json).unwrap();
//! assert_eq!(config.rotary_dim, 128);
//! assert_eq!(config.layout, RotaryLayout::PairedHalf);
//! assert_eq!(config.scaling, ScalingPolicy::Linear { factor: 2.0 });
//! ```

use std::fmt;

use serde_json::Value;

use crate::error::{Result, RopeError};

/// Default base frequency used when a config does not specify one.
pub const DEFAULT_ROPE_BASE: f64 = 10_000.0;

// ---------------------------------------------------------------------------
// Configuration enums
// ---------------------------------------------------------------------------

/// How coordinates of a head vector are paired for rotation.
///
/// Fixed for the lifetime of an engine: the cos/sin rows are the same for
/// both layouts, only the pairing differs, so switching mid-stream would
/// silently corrupt already-rotated keys.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotaryLayout {
    /// GPT-NeoX / `LLaMA` style: coordinate `i` pairs with `i + rotary_dim / 2`.
    #[default]
    PairedHalf,
    /// GPT-J style: coordinate `2i` pairs with `2i + 1`.
    Interleaved,
}

impl fmt::Display for RotaryLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PairedHalf => write!(f, "PairedHalf"),
            Self::Interleaved => write!(f, "Interleaved"),
        }
    }
}

/// Context-extension strategy applied while building the angle table.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ScalingPolicy {
    /// Plain `RoPE`.
    #[default]
    None,
    /// Position interpolation: positions are divided by `factor`.
    Linear {
        /// Interpolation factor (> 0).
        factor: f64,
    },
    /// Dynamic NTK-aware scaling: once the cache length exceeds
    /// `trained_len`, the base frequency grows with the cache length.
    DynamicNtk {
        /// Scaling factor (> 0).
        factor: f64,
        /// Context length the model was trained with.
        trained_len: usize,
    },
}

impl fmt::Display for ScalingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Linear { factor } => write!(f, "Linear(factor={factor})"),
            Self::DynamicNtk {
                factor,
                trained_len,
            } => write!(f, "DynamicNtk(factor={factor}, trained_len={trained_len})"),
        }
    }
}

impl ScalingPolicy {
    /// Multiplier applied to every position before it meets the inverse
    /// frequencies.
    pub fn position_scale(&self) -> f64 {
        match self {
            Self::Linear { factor } => 1.0 / factor,
            Self::None | Self::DynamicNtk { .. } => 1.0,
        }
    }

    /// Base frequency to use for a table of `cache_len` rows.
    ///
    /// Only [`DynamicNtk`](Self::DynamicNtk) changes the base, and only once
    /// `cache_len` exceeds the trained length.
    pub fn effective_base(&self, base: f64, rotary_dim: usize, cache_len: usize) -> f64 {
        match self {
            Self::DynamicNtk {
                factor,
                trained_len,
            } if cache_len > *trained_len => {
                #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
                let (len, trained, dim) = (cache_len as f64, *trained_len as f64, rotary_dim as f64);
                let growth = (factor * len / trained) - (factor - 1.0);
                base * growth.powf(dim / (dim - 2.0))
            }
            Self::None | Self::Linear { .. } | Self::DynamicNtk { .. } => base,
        }
    }
}

// ---------------------------------------------------------------------------
// RopeConfig
// ---------------------------------------------------------------------------

/// Configuration for a [`RopeEngine`](crate::RopeEngine).
///
/// # Example
///
/// ```
/// use candle_rotary::{RopeConfig, RotaryLayout, ScalingPolicy};
///
/// let config = RopeConfig::new(64)
///     .with_base(500_000.0)
///     .with_layout(RotaryLayout::Interleaved)
///     .with_scaling(ScalingPolicy::Linear { factor: 4.0 });
/// assert!(config.validate().is_ok());
/// assert_eq!(config.half_dim(), 32);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RopeConfig {
    /// Number of leading coordinates of each head vector that are rotated.
    /// Must be even; `0` disables rotation.
    pub rotary_dim: usize,
    /// Base frequency (`theta` in the `RoPE` paper).
    pub base: f64,
    /// Coordinate pairing layout.
    pub layout: RotaryLayout,
    /// Context-extension scaling.
    pub scaling: ScalingPolicy,
}

impl RopeConfig {
    /// Create a paired-half configuration with the default base and no
    /// scaling.
    #[must_use]
    pub const fn new(rotary_dim: usize) -> Self {
        Self {
            rotary_dim,
            base: DEFAULT_ROPE_BASE,
            layout: RotaryLayout::PairedHalf,
            scaling: ScalingPolicy::None,
        }
    }

    /// Replace the base frequency.
    #[must_use]
    pub fn with_base(mut self, base: f64) -> Self {
        self.base = base;
        self
    }

    /// Replace the pairing layout.
    #[must_use]
    pub fn with_layout(mut self, layout: RotaryLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Replace the scaling policy.
    #[must_use]
    pub fn with_scaling(mut self, scaling: ScalingPolicy) -> Self {
        self.scaling = scaling;
        self
    }

    /// Number of frequency pairs (`rotary_dim / 2`).
    pub const fn half_dim(&self) -> usize {
        self.rotary_dim / 2
    }

    /// Check the configuration invariants.
    ///
    /// # Errors
    ///
    /// Returns [`RopeError::InvalidConfig`] if `rotary_dim` is odd, the base
    /// is not a finite value above 1, a scaling factor is not finite and
    /// positive, or dynamic NTK scaling is combined with `rotary_dim <= 2`
    /// (its exponent `d / (d - 2)` is undefined there).
    pub fn validate(&self) -> Result<()> {
        if self.rotary_dim % 2 != 0 {
            return Err(RopeError::InvalidConfig(format!(
                "rotary_dim must be even, got {}",
                self.rotary_dim
            )));
        }
        if !self.base.is_finite() || self.base <= 1.0 {
            return Err(RopeError::InvalidConfig(format!(
                "base frequency must be finite and > 1, got {}",
                self.base
            )));
        }
        match self.scaling {
            ScalingPolicy::None => {}
            ScalingPolicy::Linear { factor } => check_factor(factor)?,
            ScalingPolicy::DynamicNtk {
                factor,
                trained_len,
            } => {
                check_factor(factor)?;
                if trained_len == 0 {
                    return Err(RopeError::InvalidConfig(
                        "dynamic NTK scaling needs a non-zero trained length".into(),
                    ));
                }
                if self.rotary_dim <= 2 {
                    return Err(RopeError::InvalidConfig(format!(
                        "dynamic NTK scaling needs rotary_dim > 2, got {}",
                        self.rotary_dim
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Reject scaling factors that are zero, negative, or not finite.
fn check_factor(factor: f64) -> Result<()> {
    if factor.is_finite() && factor > 0.0 {
        Ok(())
    } else {
        Err(RopeError::InvalidConfig(format!(
            "scaling factor must be finite and > 0, got {factor}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Config parsing
// ---------------------------------------------------------------------------

impl RopeConfig {
    /// Parse a [`RopeConfig`] from a `HuggingFace` `config.json` value.
    ///
    /// Reads the head dimension (explicit `head_dim`, or hidden size over
    /// head count), the rotary fraction (`rotary_dim`, `partial_rotary_factor`
    /// or `rotary_pct`), `rope_theta` / `rotary_emb_base`, and an optional
    /// `rope_scaling` object of type `linear` or `dynamic`. `gptj` and
    /// `codegen` models use the interleaved layout.
    ///
    /// # Errors
    ///
    /// Returns [`RopeError::Config`] if `model_type` or the head geometry is
    /// missing, or the scaling type is unsupported, and
    /// [`RopeError::InvalidConfig`] if the parsed values fail
    /// [`validate`](Self::validate).
    pub fn from_hf_config(config: &Value) -> Result<Self> {
        let model_type = config
            .get("model_type")
            .and_then(Value::as_str)
            .ok_or_else(|| RopeError::Config("missing 'model_type' field".into()))?;

        let layout = match model_type {
            "gptj" | "codegen" => RotaryLayout::Interleaved,
            _ => RotaryLayout::PairedHalf,
        };

        let head_dim = get_head_dim(config)?;
        let rotary_dim = get_rotary_dim(config, head_dim)?;
        let base = get_optional_f64(config, "rope_theta")
            .or_else(|| get_optional_f64(config, "rotary_emb_base"))
            .unwrap_or(DEFAULT_ROPE_BASE);
        let max_positions = get_optional_usize(config, "max_position_embeddings")
            .or_else(|| get_optional_usize(config, "n_positions"))
            .unwrap_or(2048);
        let scaling = parse_scaling(config.get("rope_scaling"), max_positions)?;

        let parsed = Self {
            rotary_dim,
            base,
            layout,
            scaling,
        };
        parsed.validate()?;
        Ok(parsed)
    }
}

/// Parse the `rope_scaling` object (absent or `null` means no scaling).
fn parse_scaling(scaling: Option<&Value>, max_positions: usize) -> Result<ScalingPolicy> {
    let Some(scaling) = scaling.filter(|v| !v.is_null()) else {
        return Ok(ScalingPolicy::None);
    };

    let kind = scaling
        .get("rope_type")
        .or_else(|| scaling.get("type"))
        .and_then(Value::as_str)
        .ok_or_else(|| RopeError::Config("rope_scaling without 'type' or 'rope_type'".into()))?;

    if kind == "default" {
        return Ok(ScalingPolicy::None);
    }

    let factor = get_optional_f64(scaling, "factor")
        .ok_or_else(|| RopeError::Config(format!("rope_scaling '{kind}' without 'factor'")))?;

    match kind {
        "linear" => Ok(ScalingPolicy::Linear { factor }),
        "dynamic" => Ok(ScalingPolicy::DynamicNtk {
            factor,
            trained_len: get_optional_usize(scaling, "original_max_position_embeddings")
                .unwrap_or(max_positions),
        }),
        other => Err(RopeError::Config(format!(
            "unsupported rope_scaling type: '{other}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract an optional `usize` field, returning `None` if absent.
fn get_optional_usize(config: &Value, key: &str) -> Option<usize> {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
}

/// Extract an optional `f64` field, returning `None` if absent.
fn get_optional_f64(config: &Value, key: &str) -> Option<f64> {
    config.get(key).and_then(Value::as_f64)
}

/// Extract `head_dim`, falling back to hidden size over head count.
///
/// Accepts both the modern (`hidden_size`, `num_attention_heads`) and the
/// GPT-2 era (`n_embd`, `n_head`) key names.
fn get_head_dim(config: &Value) -> Result<usize> {
    if let Some(head_dim) = get_optional_usize(config, "head_dim") {
        return Ok(head_dim);
    }

    let hidden_size = get_optional_usize(config, "hidden_size")
        .or_else(|| get_optional_usize(config, "n_embd"))
        .ok_or_else(|| RopeError::Config("missing 'hidden_size' / 'n_embd' field".into()))?;
    let num_heads = get_optional_usize(config, "num_attention_heads")
        .or_else(|| get_optional_usize(config, "n_head"))
        .ok_or_else(|| {
            RopeError::Config("missing 'num_attention_heads' / 'n_head' field".into())
        })?;

    if num_heads == 0 {
        return Err(RopeError::Config(
            "num_attention_heads is 0, cannot compute head_dim".into(),
        ));
    }
    Ok(hidden_size / num_heads)
}

/// Extract the number of rotated coordinates per head.
///
/// An explicit `rotary_dim` wins; otherwise a fraction of `head_dim` from
/// `partial_rotary_factor` or `rotary_pct` (truncated toward zero);
/// otherwise the whole head.
fn get_rotary_dim(config: &Value, head_dim: usize) -> Result<usize> {
    if let Some(rotary_dim) = get_optional_usize(config, "rotary_dim") {
        if rotary_dim > head_dim {
            return Err(RopeError::InvalidConfig(format!(
                "rotary_dim {rotary_dim} exceeds head_dim {head_dim}"
            )));
        }
        return Ok(rotary_dim);
    }

    let fraction = get_optional_f64(config, "partial_rotary_factor")
        .or_else(|| get_optional_f64(config, "rotary_pct"));
    match fraction {
        Some(f) if !(0.0..=1.0).contains(&f) => Err(RopeError::Config(format!(
            "rotary fraction must lie in [0, 1], got {f}"
        ))),
        Some(f) => {
            #[allow(
                clippy::cast_precision_loss,
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss,
                clippy::as_conversions
            )]
            let rotary_dim = (head_dim as f64 * f) as usize;
            Ok(rotary_dim)
        }
        None => Ok(head_dim),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
