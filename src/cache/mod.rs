// SPDX-License-Identifier: MIT OR Apache-2.0

//! Angle caching for rotary embeddings.
//!
//! - [`AngleCache`]: per-position cosine/sine tables, rebuilt on demand
//!   when a longer range, another dtype, or another device is requested.

mod angle;

pub use angle::AngleCache;
