// SPDX-License-Identifier: MIT OR Apache-2.0

//! Rotary embedding engine: the entry point used by attention layers.
//!
//! [`RopeEngine::rotate`] takes query/key tensors in one of the shapes
//! below, resolves every token's angle row, grows the angle cache when
//! needed, and rotates the tensors **in place**. The returned
//! [`RotationContext`] keeps the exact angle rows used so that
//! [`RopeEngine::backward`] can replay the inverse rotation on gradients.
//!
//! # Accepted shapes
//!
//! Token dimensions are `[batch, seqlen]` for padded batches or
//! `[total_tokens]` when [`PackedSequenceMeta`] is supplied.
//!
//! | Call | Tensor | Rotated |
//! |------|--------|---------|
//! | primary only | `[.., roles, heads, head_dim]` (stacked QKV) | roles 0 and 1 |
//! | primary only | `[.., heads, head_dim]` | every head |
//! | primary only, `num_heads_q` | `[.., hq + 2 * hkv, head_dim]` (fused QKV) | first `hq + hkv` heads |
//! | with secondary | primary `[.., hq, head_dim]` | every head |
//! | with secondary | secondary `[.., roles, hkv, head_dim]` (KV) | role 0 |
//! | with secondary | secondary `[.., hkv, head_dim]` (K) | every head |
//!
//! Roles past the query/key roles (the value role) are never written.

use candle_core::{DType, Shape, Tensor};

use crate::cache::AngleCache;
use crate::config::{RopeConfig, RotaryLayout};
use crate::error::{Result, RopeError};
use crate::util::positioning::{self, Offsets, PackedSequenceMeta, TokenLayout};

use super::kernel::{Direction, RotationSpec, RowGeometry};
use super::op;

// ---------------------------------------------------------------------------
// Call types
// ---------------------------------------------------------------------------

/// Observable lifecycle of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No angle cache built yet.
    Uninitialized,
    /// An angle cache exists; later calls may grow it.
    Ready,
}

/// Optional knobs for [`RopeEngine::rotate_with_options`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotateOptions {
    /// Number of query heads in a fused `[.., hq + 2 * hkv, head_dim]`
    /// tensor. Ignored when a secondary tensor is given; rejected for a
    /// stacked `[.., roles, heads, head_dim]` tensor.
    pub num_heads_q: Option<usize>,
    /// Build the angle cache to at least this many positions, so a decode
    /// loop can size it once up front.
    pub cache_len_hint: Option<usize>,
}

/// Which tensor of a call is being planned.
#[derive(Debug, Clone, Copy)]
enum Role {
    /// Single tensor carrying query and key (and possibly value).
    Combined { num_heads_q: Option<usize> },
    /// Query tensor of a two-tensor call.
    Query,
    /// Key or key/value tensor of a two-tensor call.
    KeyValue,
}

/// Output of a rotation.
#[derive(Debug, Clone)]
pub struct Rotated {
    /// The primary tensor (same storage as the input for in-place calls).
    pub primary: Tensor,
    /// The secondary tensor, if one was given.
    pub secondary: Option<Tensor>,
    /// Angle rows and geometry needed to replay the inverse rotation.
    pub context: RotationContext,
}

// ---------------------------------------------------------------------------
// RotationContext
// ---------------------------------------------------------------------------

/// Record of one rotation, sufficient to rotate gradients back.
///
/// Holds the gathered angle rows themselves, not positions, so a later
/// cache rebuild (longer range, dynamic NTK base change) cannot change what
/// the backward pass uses.
#[derive(Debug, Clone)]
pub struct RotationContext {
    /// Cosine rows: `[n_tokens, rotary_dim / 2]`.
    cos: Tensor,
    /// Sine rows: `[n_tokens, rotary_dim / 2]`.
    sin: Tensor,
    /// Pairing layout of the engine.
    layout: RotaryLayout,
    /// Rotated prefix of every head.
    rotary_dim: usize,
    /// Geometry of the primary tensor.
    primary: RowGeometry,
    /// Geometry of the secondary tensor.
    secondary: Option<RowGeometry>,
    /// Shape of the primary tensor.
    primary_shape: Shape,
    /// Shape of the secondary tensor.
    secondary_shape: Option<Shape>,
    /// Cache generation the rows were gathered from.
    cache_generation: u64,
}

impl RotationContext {
    /// Cosine rows used, one per token.
    pub const fn cos(&self) -> &Tensor {
        &self.cos
    }

    /// Sine rows used, one per token.
    pub const fn sin(&self) -> &Tensor {
        &self.sin
    }

    /// Pairing layout used.
    pub const fn layout(&self) -> RotaryLayout {
        self.layout
    }

    /// Rotated prefix of every head.
    pub const fn rotary_dim(&self) -> usize {
        self.rotary_dim
    }

    /// Cache generation the rows were gathered from.
    pub const fn cache_generation(&self) -> u64 {
        self.cache_generation
    }

    /// Working dtype of the call.
    pub fn dtype(&self) -> DType {
        self.cos.dtype()
    }

    fn spec(&self, geometry: RowGeometry, direction: Direction) -> RotationSpec {
        RotationSpec {
            geometry,
            rotary_dim: self.rotary_dim,
            layout: self.layout,
            direction,
        }
    }

    /// Rotate gradients back through the recorded rotation, in place.
    ///
    /// Value roles and coordinates past `rotary_dim` receive the incoming
    /// gradient unchanged.
    ///
    /// # Shapes
    /// - `grad_primary`, `grad_secondary`: same shapes as the tensors that
    ///   were rotated
    ///
    /// # Errors
    ///
    /// Returns [`RopeError::ShapeMismatch`] if a gradient does not match the
    /// recorded geometry, is not contiguous, or a secondary gradient is
    /// missing / unexpected. Validation completes before any gradient is
    /// written.
    pub fn backward(
        &self,
        grad_primary: &Tensor,
        grad_secondary: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        check_gradient(grad_primary, &self.primary_shape, &self.cos, "primary")?;
        match (grad_secondary, &self.secondary_shape) {
            (Some(grad), Some(shape)) => check_gradient(grad, shape, &self.cos, "secondary")?,
            (None, None) => {}
            (Some(_), None) => {
                return Err(RopeError::ShapeMismatch(
                    "secondary gradient given but the rotation had no secondary tensor".into(),
                ));
            }
            (None, Some(_)) => {
                return Err(RopeError::ShapeMismatch(
                    "rotation had a secondary tensor but no secondary gradient was given".into(),
                ));
            }
        }

        let targets = self.targets(grad_primary, grad_secondary, Direction::Inverse);
        op::rotate_all_in_place(&targets, &self.cos, &self.sin)?;
        Ok((grad_primary.clone(), grad_secondary.cloned()))
    }

    /// Pair each tensor of a call with its rotation.
    fn targets<'t>(
        &self,
        primary: &'t Tensor,
        secondary: Option<&'t Tensor>,
        direction: Direction,
    ) -> Vec<(&'t Tensor, RotationSpec)> {
        let mut targets = vec![(primary, self.spec(self.primary, direction))];
        if let (Some(tensor), Some(geometry)) = (secondary, self.secondary) {
            targets.push((tensor, self.spec(geometry, direction)));
        }
        targets
    }
}

/// Check that a gradient has the shape of the tensor that was rotated.
fn check_gradient(grad: &Tensor, shape: &Shape, rows: &Tensor, what: &str) -> Result<()> {
    if grad.shape() != shape {
        return Err(RopeError::ShapeMismatch(format!(
            "{what} gradient has shape {:?}, the rotated tensor had {:?}",
            grad.dims(),
            shape.dims()
        )));
    }
    if !grad.is_contiguous() {
        return Err(RopeError::ShapeMismatch(format!(
            "{what} gradient must be contiguous to be rotated in place"
        )));
    }
    if grad.dtype() != rows.dtype() || !grad.device().same_device(rows.device()) {
        return Err(RopeError::ShapeMismatch(format!(
            "{what} gradient dtype/device differs from the recorded angle rows"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// RopeEngine
// ---------------------------------------------------------------------------

/// Rotary position embedding engine.
///
/// Owns its [`AngleCache`]; use one engine per thread of execution.
///
/// # Example
///
/// ```
/// use candle_core::{DType, Device, Tensor};
/// use candle_rotary::{EngineState, Offsets, RopeConfig, RopeEngine};
///
/// let mut engine = RopeEngine::new(RopeConfig::new(64)).unwrap();
/// assert_eq!(engine.state(), EngineState::Uninitialized);
///
/// // [batch, seqlen, 3, heads, head_dim]; q and k are rotated, v is not.
/// let qkv = Tensor::ones((2, 4, 3, 8, 128), DType::F32, &Device::Cpu).unwrap();
/// let out = engine.rotate(&qkv, None, &Offsets::Scalar(5), None).unwrap();
/// assert_eq!(engine.state(), EngineState::Ready);
/// assert_eq!(out.primary.dims(), qkv.dims());
/// ```
#[derive(Debug, Clone)]
pub struct RopeEngine {
    /// Immutable configuration.
    config: RopeConfig,
    /// Angle tables, built on first use.
    cache: Option<AngleCache>,
}

impl RopeEngine {
    /// Create an engine.
    ///
    /// # Errors
    ///
    /// Returns [`RopeError::InvalidConfig`] if the configuration fails
    /// [`RopeConfig::validate`].
    pub fn new(config: RopeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cache: None,
        })
    }

    /// Engine configuration.
    pub const fn config(&self) -> &RopeConfig {
        &self.config
    }

    /// Current angle cache, if built.
    pub const fn cache(&self) -> Option<&AngleCache> {
        self.cache.as_ref()
    }

    /// Lifecycle state.
    pub const fn state(&self) -> EngineState {
        match self.cache {
            Some(_) => EngineState::Ready,
            None => EngineState::Uninitialized,
        }
    }

    /// Rotate query/key tensors **in place**.
    ///
    /// The input tensors' storage is overwritten and the returned handles
    /// share it; copy the inputs first if the unrotated values are needed.
    /// In-place writes are not recorded by candle's autograd: pair this
    /// with [`backward`](Self::backward), or use
    /// [`rotate_tracked`](Self::rotate_tracked).
    ///
    /// See the [module docs](self) for accepted shapes.
    ///
    /// # Errors
    ///
    /// - [`RopeError::InvalidConfig`] if `rotary_dim` exceeds a head dim.
    /// - [`RopeError::ShapeMismatch`] if the tensors disagree with each
    ///   other, the offsets, or the packed metadata, or are not contiguous.
    /// - [`RopeError::Model`] on tensor operation failures.
    ///
    /// Validation errors leave both tensors untouched.
    pub fn rotate(
        &mut self,
        primary: &Tensor,
        secondary: Option<&Tensor>,
        offsets: &Offsets,
        packed: Option<&PackedSequenceMeta>,
    ) -> Result<Rotated> {
        self.rotate_with_options(primary, secondary, offsets, packed, &RotateOptions::default())
    }

    /// [`rotate`](Self::rotate) with explicit [`RotateOptions`].
    ///
    /// # Errors
    ///
    /// Same as [`rotate`](Self::rotate).
    pub fn rotate_with_options(
        &mut self,
        primary: &Tensor,
        secondary: Option<&Tensor>,
        offsets: &Offsets,
        packed: Option<&PackedSequenceMeta>,
        options: &RotateOptions,
    ) -> Result<Rotated> {
        for (tensor, what) in [(Some(primary), "primary"), (secondary, "secondary")] {
            if let Some(tensor) = tensor.filter(|t| !t.is_contiguous()) {
                return Err(RopeError::ShapeMismatch(format!(
                    "{what} tensor {:?} must be contiguous to be rotated in place",
                    tensor.dims()
                )));
            }
        }

        let context = self.prepare(primary, secondary, offsets, packed, options)?;
        let targets = context.targets(primary, secondary, Direction::Forward);
        op::rotate_all_in_place(&targets, &context.cos, &context.sin)?;

        tracing::trace!(
            n_tokens = context.primary.n_tokens,
            cache_generation = context.cache_generation,
            "rotated in place"
        );
        Ok(Rotated {
            primary: primary.clone(),
            secondary: secondary.cloned(),
            context,
        })
    }

    /// Rotate into new tensors whose backward pass is the explicit inverse
    /// rotation.
    ///
    /// The inputs are left untouched. Calling `backward()` on a loss built
    /// from the outputs propagates `R(-angle) * grad` to the inputs and no
    /// gradient to the angle rows.
    ///
    /// # Errors
    ///
    /// Same as [`rotate`](Self::rotate), minus the contiguity requirement.
    pub fn rotate_tracked(
        &mut self,
        primary: &Tensor,
        secondary: Option<&Tensor>,
        offsets: &Offsets,
        packed: Option<&PackedSequenceMeta>,
        options: &RotateOptions,
    ) -> Result<Rotated> {
        let context = self.prepare(primary, secondary, offsets, packed, options)?;
        let rotated_primary = op::rotate_tracked(
            primary,
            &context.cos,
            &context.sin,
            &context.spec(context.primary, Direction::Forward),
        )?;
        let rotated_secondary = match (secondary, context.secondary) {
            (Some(tensor), Some(geometry)) => Some(op::rotate_tracked(
                tensor,
                &context.cos,
                &context.sin,
                &context.spec(geometry, Direction::Forward),
            )?),
            _ => None,
        };
        Ok(Rotated {
            primary: rotated_primary,
            secondary: rotated_secondary,
            context,
        })
    }

    /// Rotate gradients of an earlier [`rotate`](Self::rotate) back, in
    /// place, using the rows recorded in `context`.
    ///
    /// # Errors
    ///
    /// See [`RotationContext::backward`].
    pub fn backward(
        &self,
        context: &RotationContext,
        grad_primary: &Tensor,
        grad_secondary: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        context.backward(grad_primary, grad_secondary)
    }

    /// Validate the call, resolve positions, ensure the cache, and gather
    /// the angle rows. Touches no input tensor.
    fn prepare(
        &mut self,
        primary: &Tensor,
        secondary: Option<&Tensor>,
        offsets: &Offsets,
        packed: Option<&PackedSequenceMeta>,
        options: &RotateOptions,
    ) -> Result<RotationContext> {
        let dtype = primary.dtype();
        if !dtype.is_float() {
            return Err(RopeError::ShapeMismatch(format!(
                "rotary embeddings need a float tensor, got {dtype:?}"
            )));
        }

        let tokens = token_layout(primary, packed)?;
        let (primary_geometry, secondary_geometry) = match secondary {
            None => (
                self.geometry(
                    primary,
                    tokens,
                    Role::Combined {
                        num_heads_q: options.num_heads_q,
                    },
                )?,
                None,
            ),
            Some(secondary) => {
                if secondary.dtype() != dtype || !secondary.device().same_device(primary.device()) {
                    return Err(RopeError::ShapeMismatch(
                        "primary and secondary tensors must share dtype and device".into(),
                    ));
                }
                (
                    self.geometry(primary, tokens, Role::Query)?,
                    Some(self.geometry(secondary, tokens, Role::KeyValue)?),
                )
            }
        };

        let index = positioning::resolve(tokens, offsets, packed)?;
        let needed = index
            .required_len()
            .max(options.cache_len_hint.unwrap_or(0));
        let cache = AngleCache::ensure(&mut self.cache, &self.config, needed, dtype, primary.device())?;

        let (cos, sin) = if self.config.rotary_dim == 0 {
            let empty = Tensor::zeros((index.len(), 0), dtype, primary.device())?;
            (empty.clone(), empty)
        } else {
            cache.gather(index.rows())?
        };

        Ok(RotationContext {
            cos,
            sin,
            layout: self.config.layout,
            rotary_dim: self.config.rotary_dim,
            primary: primary_geometry,
            secondary: secondary_geometry,
            primary_shape: primary.shape().clone(),
            secondary_shape: secondary.map(|t| t.shape().clone()),
            cache_generation: cache.generation(),
        })
    }

    /// Work out which head vectors of `tensor` are rotated.
    fn geometry(&self, tensor: &Tensor, tokens: TokenLayout, role: Role) -> Result<RowGeometry> {
        let dims = tensor.dims();
        let rank = tokens.rank();
        let expected_tokens = match tokens {
            TokenLayout::Padded { batch, seqlen } => vec![batch, seqlen],
            TokenLayout::Packed { total } => vec![total],
        };
        let (token_dims, trailing) = dims.split_at(rank.min(dims.len()));
        if token_dims != expected_tokens.as_slice() {
            return Err(RopeError::ShapeMismatch(format!(
                "tensor {dims:?} does not start with token dims {expected_tokens:?}"
            )));
        }

        let (groups, rotated_groups, head_dim) = match (role, trailing) {
            (Role::Combined { num_heads_q }, &[roles, heads, head_dim]) => {
                if let Some(hq) = num_heads_q {
                    return Err(RopeError::ShapeMismatch(format!(
                        "num_heads_q = {hq} given for stacked tensor {dims:?}; it only applies to fused [heads, head_dim] tensors"
                    )));
                }
                if roles < 2 {
                    return Err(RopeError::ShapeMismatch(format!(
                        "stacked tensor {dims:?} needs at least query and key roles"
                    )));
                }
                (roles * heads, 2 * heads, head_dim)
            }
            (Role::Combined { num_heads_q: Some(hq) }, &[heads, head_dim]) => {
                if heads <= hq || (heads - hq) % 2 != 0 {
                    return Err(RopeError::ShapeMismatch(format!(
                        "fused tensor with {heads} heads cannot hold {hq} query heads plus equal key/value heads"
                    )));
                }
                (heads, hq + (heads - hq) / 2, head_dim)
            }
            (Role::Combined { num_heads_q: None } | Role::Query, &[heads, head_dim])
            | (Role::KeyValue, &[heads, head_dim]) => (heads, heads, head_dim),
            (Role::KeyValue, &[roles, heads, head_dim]) => (roles * heads, heads, head_dim),
            _ => {
                return Err(RopeError::ShapeMismatch(format!(
                    "unsupported tensor shape {dims:?} for {role:?} after {rank} token dims"
                )));
            }
        };

        if self.config.rotary_dim > head_dim {
            return Err(RopeError::InvalidConfig(format!(
                "rotary_dim {} exceeds head_dim {head_dim}",
                self.config.rotary_dim
            )));
        }

        Ok(RowGeometry {
            n_tokens: tokens.n_tokens(),
            groups,
            rotated_groups,
            head_dim,
        })
    }
}

/// Token dimensions of the primary tensor.
fn token_layout(primary: &Tensor, packed: Option<&PackedSequenceMeta>) -> Result<TokenLayout> {
    match (packed, primary.dims()) {
        (Some(_), &[total, ..]) => Ok(TokenLayout::Packed { total }),
        (None, &[batch, seqlen, ..]) => Ok(TokenLayout::Padded { batch, seqlen }),
        _ => Err(RopeError::ShapeMismatch(format!(
            "tensor {:?} has no token dimensions",
            primary.dims()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::float_cmp,
    clippy::cast_precision_loss,
    clippy::as_conversions
)]
mod tests {
    use candle_core::{DType, Device, IndexOp};

    use super::*;

    #[test]
    fn unit_vector_at_offset_five() {
        let mut engine = RopeEngine::new(RopeConfig::new(64)).unwrap();
        let mut data = vec![0f32; 128];
        data[0] = 1.0;
        data[100] = 7.0;
        let x = Tensor::from_vec(data.clone(), (1, 1, 1, 128), &Device::Cpu).unwrap();
        engine.rotate(&x, None, &Offsets::Scalar(5), None).unwrap();

        let out: Vec<f32> = x.flatten_all().unwrap().to_vec1().unwrap();
        // theta_0 = base^0 = 1; its pair partner is coordinate 32.
        assert!((out[0] - 5f32.cos()).abs() < 1e-6);
        assert!((out[32] - 5f32.sin()).abs() < 1e-6);
        assert_eq!(&out[64..], &data[64..]);
    }

    #[test]
    fn value_role_untouched() {
        let mut engine = RopeEngine::new(RopeConfig::new(8)).unwrap();
        let qkv = Tensor::randn(0f32, 1.0, (2, 3, 3, 2, 8), &Device::Cpu).unwrap();
        let original = qkv.copy().unwrap();
        engine.rotate(&qkv, None, &Offsets::Scalar(4), None).unwrap();
        let v_out: Vec<f32> = qkv.i((.., .., 2)).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let v_in: Vec<f32> = original.i((.., .., 2)).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(v_out, v_in);
    }

    #[test]
    fn fused_heads_rotate_query_and_key_only() {
        let mut engine = RopeEngine::new(RopeConfig::new(4)).unwrap();
        // 4 query heads, 1 key head, 1 value head.
        let qkv = Tensor::randn(0f32, 1.0, (1, 5, 6, 4), &Device::Cpu).unwrap();
        let original = qkv.copy().unwrap();
        let options = RotateOptions {
            num_heads_q: Some(4),
            ..RotateOptions::default()
        };
        engine
            .rotate_with_options(&qkv, None, &Offsets::Scalar(1), None, &options)
            .unwrap();
        let diff = (qkv.i((.., .., 5)).unwrap() - original.i((.., .., 5)).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff, 0.0);
        let changed = (qkv.i((.., .., 4)).unwrap() - original.i((.., .., 4)).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(changed > 0.0);
    }

    #[test]
    fn shape_errors_leave_inputs_untouched() {
        let mut engine = RopeEngine::new(RopeConfig::new(8)).unwrap();
        let q = Tensor::randn(0f32, 1.0, (2, 3, 4, 8), &Device::Cpu).unwrap();
        let kv = Tensor::randn(0f32, 1.0, (2, 5, 2, 1, 8), &Device::Cpu).unwrap();
        let q_before = q.copy().unwrap();
        let result = engine.rotate(&q, Some(&kv), &Offsets::Scalar(0), None);
        assert!(matches!(result, Err(RopeError::ShapeMismatch(_))));
        let after: Vec<f32> = q.flatten_all().unwrap().to_vec1().unwrap();
        let before: Vec<f32> = q_before.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(after, before);
        assert_eq!(engine.state(), EngineState::Uninitialized);
    }

    #[test]
    fn rotary_dim_larger_than_head_dim_is_invalid() {
        let mut engine = RopeEngine::new(RopeConfig::new(16)).unwrap();
        let q = Tensor::zeros((1, 2, 1, 8), DType::F32, &Device::Cpu).unwrap();
        let result = engine.rotate(&q, None, &Offsets::Scalar(0), None);
        assert!(matches!(result, Err(RopeError::InvalidConfig(_))));
    }

    #[test]
    fn odd_rotary_dim_rejected_at_construction() {
        assert!(matches!(
            RopeEngine::new(RopeConfig::new(7)),
            Err(RopeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn integer_tensors_rejected() {
        let mut engine = RopeEngine::new(RopeConfig::new(4)).unwrap();
        let q = Tensor::zeros((1, 2, 1, 4), DType::U32, &Device::Cpu).unwrap();
        assert!(engine.rotate(&q, None, &Offsets::Scalar(0), None).is_err());
    }

    #[test]
    fn cache_hint_sizes_cache_once() {
        let mut engine = RopeEngine::new(RopeConfig::new(8)).unwrap();
        let options = RotateOptions {
            cache_len_hint: Some(256),
            ..RotateOptions::default()
        };
        for step in 0..4 {
            let q = Tensor::ones((1, 1, 2, 8), DType::F32, &Device::Cpu).unwrap();
            engine
                .rotate_with_options(&q, None, &Offsets::Scalar(step), None, &options)
                .unwrap();
        }
        let cache = engine.cache().unwrap();
        assert_eq!(cache.len(), 256);
        assert_eq!(cache.generation(), 0);
    }

    #[test]
    fn backward_checks_geometry() {
        let mut engine = RopeEngine::new(RopeConfig::new(8)).unwrap();
        let q = Tensor::randn(0f32, 1.0, (1, 3, 2, 8), &Device::Cpu).unwrap();
        let rotated = engine.rotate(&q, None, &Offsets::Scalar(0), None).unwrap();
        let wrong = Tensor::zeros((1, 2, 2, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(engine.backward(&rotated.context, &wrong, None).is_err());
        let extra = Tensor::zeros((1, 3, 2, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(engine.backward(&rotated.context, &extra, Some(&extra)).is_err());
    }

    #[test]
    fn backward_rejects_reshaped_gradient() {
        let mut engine = RopeEngine::new(RopeConfig::new(8)).unwrap();
        let q = Tensor::randn(0f32, 1.0, (1, 3, 2, 8), &Device::Cpu).unwrap();
        let rotated = engine.rotate(&q, None, &Offsets::Scalar(2), None).unwrap();
        // Same element count, heads folded into the head dim.
        let folded = Tensor::ones((1, 3, 1, 16), DType::F32, &Device::Cpu).unwrap();
        let result = engine.backward(&rotated.context, &folded, None);
        assert!(matches!(result, Err(RopeError::ShapeMismatch(_))));
        let untouched: Vec<f32> = folded.flatten_all().unwrap().to_vec1().unwrap();
        assert!(untouched.iter().all(|v| *v == 1.0));
    }

    #[test]
    fn num_heads_q_rejected_for_stacked_tensor() {
        let mut engine = RopeEngine::new(RopeConfig::new(8)).unwrap();
        let qkv = Tensor::randn(0f32, 1.0, (1, 2, 3, 4, 8), &Device::Cpu).unwrap();
        let before: Vec<f32> = qkv.flatten_all().unwrap().to_vec1().unwrap();
        let options = RotateOptions {
            num_heads_q: Some(2),
            ..RotateOptions::default()
        };
        let result = engine.rotate_with_options(&qkv, None, &Offsets::Scalar(0), None, &options);
        assert!(matches!(result, Err(RopeError::ShapeMismatch(_))));
        let after: Vec<f32> = qkv.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn zero_rotary_dim_is_identity() {
        let mut engine = RopeEngine::new(RopeConfig::new(0)).unwrap();
        let qkv = Tensor::randn(0f32, 1.0, (2, 3, 3, 2, 8), &Device::Cpu).unwrap();
        let original = qkv.copy().unwrap();
        engine.rotate(&qkv, None, &Offsets::Scalar(9), None).unwrap();
        let a: Vec<f32> = qkv.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = original.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
        assert_eq!(engine.state(), EngineState::Ready);
    }
}
