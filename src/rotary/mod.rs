// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rotary position embeddings.
//!
//! - [`kernel`]: rotation math over host buffers.
//! - [`op`]: candle operators wrapping the kernel, plus a composite path
//!   for devices without one.
//! - [`engine`]: [`RopeEngine`], which validates a call, resolves positions,
//!   keeps the angle cache, and rotates.

pub mod engine;
pub mod kernel;
pub mod op;

pub use engine::{EngineState, RopeEngine, RotateOptions, Rotated, RotationContext};
pub use kernel::{Direction, RotationSpec, RowGeometry};
