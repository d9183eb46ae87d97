// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-rotary
//!
//! Rotary position embeddings (`RoPE`) for transformer attention, built on
//! [candle](https://github.com/huggingface/candle).
//!
//! A [`RopeEngine`] rotates query and key head vectors by position-dependent
//! angles, in place, for:
//!
//! - **Layouts**: paired-half (`GPT-NeoX`, `LLaMA`) and interleaved (`GPT-J`).
//! - **Partial rotation**: only the first `rotary_dim` coordinates of each
//!   head are touched (`Phi`, `GPT-NeoX`); the rest pass through unchanged.
//! - **Batches**: padded `[batch, seqlen, ...]` with scalar or per-sequence
//!   position offsets, or packed `[total_tokens, ...]` described by
//!   cumulative sequence lengths.
//! - **Head arrangements**: stacked QKV, fused QKV with grouped-query or
//!   multi-query key/value heads, separate query and key/value tensors.
//! - **Scaling**: linear position interpolation and dynamic NTK base
//!   rescaling for contexts past the trained length.
//!
//! Cosine/sine tables are cached per engine and rebuilt only when a call
//! needs a longer range, another dtype, or another device. Each rotation
//! returns a [`RotationContext`] holding the exact angle rows used, so the
//! gradient rotation ([`RopeEngine::backward`]) stays consistent with the
//! forward one.
//!
//! ```
//! use candle_core::{DType, Device, Tensor};
//! use candle_rotary::{Offsets, RopeConfig, RopeEngine, RotaryLayout};
//!
//! let config = RopeConfig::new(32).with_layout(RotaryLayout::Interleaved);
//! let mut engine = RopeEngine::new(config).unwrap();
//!
//! let q = Tensor::ones((1, 6, 4, 64), DType::F32, &Device::Cpu).unwrap();
//! let kv = Tensor::ones((1, 6, 2, 1, 64), DType::F32, &Device::Cpu).unwrap();
//! let out = engine.rotate(&q, Some(&kv), &Offsets::Scalar(10), None).unwrap();
//! assert_eq!(out.context.cos().dims(), &[6, 16]);
//! ```

#![deny(warnings)]
#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod error;
pub mod rotary;
pub mod util;

pub use cache::AngleCache;
pub use config::{DEFAULT_ROPE_BASE, RopeConfig, RotaryLayout, ScalingPolicy};
pub use error::{Result, RopeError};
pub use rotary::{
    Direction, EngineState, RopeEngine, RotateOptions, Rotated, RotationContext, RotationSpec,
    RowGeometry,
};
pub use util::positioning::{Offsets, PackedSequenceMeta};
