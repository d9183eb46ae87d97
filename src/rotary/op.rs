// SPDX-License-Identifier: MIT OR Apache-2.0

//! Candle bindings for the rotation kernel.
//!
//! - [`RotateInPlace`]: `InplaceOp3` that overwrites a CPU tensor's storage.
//! - [`RotaryFn`]: `CustomOp3` producing a new tensor, with a `bwd` that
//!   applies the inverse rotation to the incoming gradient and reports no
//!   gradient for the angle rows.
//! - [`rotate_tensor`]: the same rotation composed from broadcast
//!   elementwise tensor ops, for devices without a custom kernel.

use candle_core::{CpuStorage, CustomOp3, InplaceOp3, Layout, Shape, Tensor, WithDType};

use crate::config::RotaryLayout;
use crate::error::{Result, RopeError};

use super::kernel::{Direction, RotationSpec};

// ---------------------------------------------------------------------------
// Storage helpers
// ---------------------------------------------------------------------------

/// Contiguous element range of a layout.
fn contiguous_range(layout: &Layout, what: &str) -> candle_core::Result<(usize, usize)> {
    match layout.contiguous_offsets() {
        Some(range) => Ok(range),
        None => candle_core::bail!("rotary: {what} must be contiguous"),
    }
}

/// Borrow the elements of a contiguous layout.
fn view<'a, T>(data: &'a [T], layout: &Layout, what: &str) -> candle_core::Result<&'a [T]> {
    let (start, end) = contiguous_range(layout, what)?;
    match data.get(start..end) {
        Some(slice) => Ok(slice),
        None => candle_core::bail!("rotary: {what} layout exceeds its storage"),
    }
}

/// Mutably borrow the elements of a contiguous layout.
fn view_mut<'a, T>(data: &'a mut [T], layout: &Layout, what: &str) -> candle_core::Result<&'a mut [T]> {
    let (start, end) = contiguous_range(layout, what)?;
    match data.get_mut(start..end) {
        Some(slice) => Ok(slice),
        None => candle_core::bail!("rotary: {what} layout exceeds its storage"),
    }
}

// ---------------------------------------------------------------------------
// In-place op
// ---------------------------------------------------------------------------

/// Rotates a tensor's storage in place.
///
/// Not recorded by candle's backprop graph; use [`RotaryFn`] when gradients
/// must flow through the rotation.
#[derive(Debug, Clone, Copy)]
pub struct RotateInPlace(pub RotationSpec);

impl RotateInPlace {
    fn run<T: WithDType>(
        &self,
        x: &mut [T],
        lx: &Layout,
        cos: &[T],
        lc: &Layout,
        sin: &[T],
        ls: &Layout,
    ) -> candle_core::Result<()> {
        let x = view_mut(x, lx, "input")?;
        self.0.apply(x, view(cos, lc, "cos")?, view(sin, ls, "sin")?)
    }
}

impl InplaceOp3 for RotateInPlace {
    fn name(&self) -> &'static str {
        "rotary-emb-inplace"
    }

    fn cpu_fwd(
        &self,
        s1: &mut CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
        s3: &CpuStorage,
        l3: &Layout,
    ) -> candle_core::Result<()> {
        match (s1, s2, s3) {
            (CpuStorage::F32(x), CpuStorage::F32(c), CpuStorage::F32(s)) => {
                self.run(x, l1, c, l2, s, l3)
            }
            (CpuStorage::F64(x), CpuStorage::F64(c), CpuStorage::F64(s)) => {
                self.run(x, l1, c, l2, s, l3)
            }
            (CpuStorage::F16(x), CpuStorage::F16(c), CpuStorage::F16(s)) => {
                self.run(x, l1, c, l2, s, l3)
            }
            (CpuStorage::BF16(x), CpuStorage::BF16(c), CpuStorage::BF16(s)) => {
                self.run(x, l1, c, l2, s, l3)
            }
            _ => candle_core::bail!("rotary: input and angle rows must share a float dtype"),
        }
    }
}

// ---------------------------------------------------------------------------
// Differentiable op
// ---------------------------------------------------------------------------

/// Out-of-place rotation with an explicit backward pass.
#[derive(Debug, Clone, Copy)]
pub struct RotaryFn(pub RotationSpec);

impl RotaryFn {
    fn run<T: WithDType>(
        &self,
        x: &[T],
        lx: &Layout,
        cos: &[T],
        lc: &Layout,
        sin: &[T],
        ls: &Layout,
    ) -> candle_core::Result<Vec<T>> {
        let mut out = view(x, lx, "input")?.to_vec();
        self.0.apply(&mut out, view(cos, lc, "cos")?, view(sin, ls, "sin")?)?;
        Ok(out)
    }
}

impl CustomOp3 for RotaryFn {
    fn name(&self) -> &'static str {
        "rotary-emb"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
        s3: &CpuStorage,
        l3: &Layout,
    ) -> candle_core::Result<(CpuStorage, Shape)> {
        let storage = match (s1, s2, s3) {
            (CpuStorage::F32(x), CpuStorage::F32(c), CpuStorage::F32(s)) => {
                CpuStorage::F32(self.run(x, l1, c, l2, s, l3)?)
            }
            (CpuStorage::F64(x), CpuStorage::F64(c), CpuStorage::F64(s)) => {
                CpuStorage::F64(self.run(x, l1, c, l2, s, l3)?)
            }
            (CpuStorage::F16(x), CpuStorage::F16(c), CpuStorage::F16(s)) => {
                CpuStorage::F16(self.run(x, l1, c, l2, s, l3)?)
            }
            (CpuStorage::BF16(x), CpuStorage::BF16(c), CpuStorage::BF16(s)) => {
                CpuStorage::BF16(self.run(x, l1, c, l2, s, l3)?)
            }
            _ => candle_core::bail!("rotary: input and angle rows must share a float dtype"),
        };
        Ok((storage, l1.shape().clone()))
    }

    fn bwd(
        &self,
        _x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        _res: &Tensor,
        grad_res: &Tensor,
    ) -> candle_core::Result<(Option<Tensor>, Option<Tensor>, Option<Tensor>)> {
        // Angle rows are metadata: no gradient flows into them.
        let grad = grad_res
            .contiguous()?
            .apply_op3_no_bwd(cos, sin, &Self(self.0.inverse()))?;
        Ok((Some(grad), None, None))
    }
}

// ---------------------------------------------------------------------------
// Composite fallback
// ---------------------------------------------------------------------------

/// Rotate `x` with broadcast elementwise tensor ops.
///
/// Produces the same values as the kernel and works on every device;
/// candle's autograd differentiates through it.
///
/// # Shapes
/// - `x`: any shape with `n_tokens * groups * head_dim` elements,
///   token-major
/// - `cos`, `sin`: `[n_tokens, rotary_dim / 2]`
/// - returns: same shape as `x`
///
/// # Errors
///
/// Returns [`RopeError::Model`](crate::RopeError::Model) on tensor operation
/// or shape errors.
pub fn rotate_tensor(x: &Tensor, cos: &Tensor, sin: &Tensor, spec: &RotationSpec) -> Result<Tensor> {
    if spec.is_identity() {
        return Ok(x.clone());
    }
    let geometry = spec.geometry;
    let (n, groups, rotated_groups, head_dim) = (
        geometry.n_tokens,
        geometry.groups,
        geometry.rotated_groups,
        geometry.head_dim,
    );
    let (rotary_dim, half) = (spec.rotary_dim, spec.half_dim());

    let x3 = x.reshape((n, groups, head_dim))?;
    let heads = x3.narrow(1, 0, rotated_groups)?;
    let rot = heads.narrow(2, 0, rotary_dim)?;

    // [n, 1, half] broadcasts over every rotated head of a token.
    let cos = cos.unsqueeze(1)?;
    let sin = match spec.direction {
        Direction::Forward => sin.unsqueeze(1)?,
        Direction::Inverse => sin.neg()?.unsqueeze(1)?,
    };

    let rotated = match spec.layout {
        RotaryLayout::PairedHalf => {
            let x1 = rot.narrow(2, 0, half)?;
            let x2 = rot.narrow(2, half, half)?;
            let out1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
            let out2 = (x1.broadcast_mul(&sin)? + x2.broadcast_mul(&cos)?)?;
            Tensor::cat(&[&out1, &out2], 2)?
        }
        RotaryLayout::Interleaved => {
            let pairs = rot.contiguous()?.reshape((n, rotated_groups, half, 2))?;
            let x1 = pairs.narrow(3, 0, 1)?.squeeze(3)?;
            let x2 = pairs.narrow(3, 1, 1)?.squeeze(3)?;
            let out1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
            let out2 = (x1.broadcast_mul(&sin)? + x2.broadcast_mul(&cos)?)?;
            Tensor::stack(&[&out1, &out2], 3)?.reshape((n, rotated_groups, rotary_dim))?
        }
    };

    let heads = if rotary_dim < head_dim {
        let tail = heads.narrow(2, rotary_dim, head_dim - rotary_dim)?;
        Tensor::cat(&[&rotated, &tail], 2)?
    } else {
        rotated
    };
    let out = if rotated_groups < groups {
        let rest = x3.narrow(1, rotated_groups, groups - rotated_groups)?;
        Tensor::cat(&[&heads, &rest], 1)?
    } else {
        heads
    };
    Ok(out.reshape(x.shape())?)
}

/// Rotate `x` in place: the kernel on CPU, the composite path elsewhere.
///
/// # Errors
///
/// Same as [`rotate_all_in_place`].
pub fn rotate_in_place(x: &Tensor, cos: &Tensor, sin: &Tensor, spec: &RotationSpec) -> Result<()> {
    rotate_all_in_place(&[(x, *spec)], cos, sin)
}

/// Rotate several tensors in place with the same angle rows.
///
/// Every target is checked before the first write. Off the CPU the
/// rotated values of all targets are computed before any of them is
/// written back, so a failing target leaves every tensor untouched.
///
/// # Errors
///
/// Returns [`RopeError::ShapeMismatch`] if a target is not contiguous, and
/// [`RopeError::Model`] if a target disagrees with its spec or a tensor
/// operation fails.
pub fn rotate_all_in_place(targets: &[(&Tensor, RotationSpec)], cos: &Tensor, sin: &Tensor) -> Result<()> {
    let targets: Vec<&(&Tensor, RotationSpec)> =
        targets.iter().filter(|(_, spec)| !spec.is_identity()).collect();
    for (x, spec) in &targets {
        if !x.is_contiguous() {
            return Err(RopeError::ShapeMismatch(format!(
                "tensor {:?} must be contiguous to be rotated in place",
                x.dims()
            )));
        }
        spec.check(x.elem_count(), cos.elem_count(), sin.elem_count())?;
    }

    if targets.iter().all(|(x, _)| x.device().is_cpu()) {
        for (x, spec) in &targets {
            x.inplace_op3(cos, sin, &RotateInPlace(*spec))?;
        }
        return Ok(());
    }

    let rotated = targets
        .iter()
        .map(|(x, spec)| Ok(rotate_tensor(x, cos, sin, spec)?.contiguous()?))
        .collect::<Result<Vec<_>>>()?;
    for ((x, _), values) in targets.iter().zip(&rotated) {
        x.slice_set(values, 0, 0)?;
    }
    Ok(())
}

/// Rotate `x` into a new tensor that candle's backprop can differentiate.
///
/// # Errors
///
/// Returns [`RopeError::Model`](crate::RopeError::Model) on tensor operation
/// failures.
pub fn rotate_tracked(x: &Tensor, cos: &Tensor, sin: &Tensor, spec: &RotationSpec) -> Result<Tensor> {
    if spec.is_identity() {
        return Ok(x.clone());
    }
    if x.device().is_cpu() {
        Ok(x.contiguous()?.apply_op3(cos, sin, RotaryFn(*spec))?)
    } else {
        rotate_tensor(x, cos, sin, spec)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use candle_core::{DType, Device, Var};

    use super::*;
    use crate::rotary::kernel::RowGeometry;

    fn spec(layout: RotaryLayout) -> RotationSpec {
        RotationSpec {
            geometry: RowGeometry {
                n_tokens: 5,
                groups: 3,
                rotated_groups: 2,
                head_dim: 8,
            },
            rotary_dim: 6,
            layout,
            direction: Direction::Forward,
        }
    }

    fn angles() -> (Tensor, Tensor) {
        let dev = Device::Cpu;
        let angles = Tensor::arange(0u32, 15, &dev)
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap()
            .affine(0.3, 0.1)
            .unwrap()
            .reshape((5, 3))
            .unwrap();
        (angles.cos().unwrap(), angles.sin().unwrap())
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn composite_matches_kernel() {
        let (cos, sin) = angles();
        for layout in [RotaryLayout::PairedHalf, RotaryLayout::Interleaved] {
            for direction in [Direction::Forward, Direction::Inverse] {
                let spec = RotationSpec {
                    direction,
                    ..spec(layout)
                };
                let x = Tensor::randn(0f32, 1.0, (5, 3, 8), &Device::Cpu).unwrap();
                let composite = rotate_tensor(&x, &cos, &sin, &spec).unwrap();
                let tracked = rotate_tracked(&x, &cos, &sin, &spec).unwrap();
                assert!(max_abs_diff(&composite, &tracked) < 1e-5);
            }
        }
    }

    #[test]
    fn in_place_mutates_shared_storage() {
        let (cos, sin) = angles();
        let spec = spec(RotaryLayout::PairedHalf);
        let x = Tensor::randn(0f32, 1.0, (5, 3, 8), &Device::Cpu).unwrap();
        let original = x.copy().unwrap();
        let expected = rotate_tracked(&x, &cos, &sin, &spec).unwrap();
        let alias = x.clone();
        rotate_in_place(&x, &cos, &sin, &spec).unwrap();
        assert!(max_abs_diff(&alias, &expected) < 1e-6);
        assert!(max_abs_diff(&alias, &original) > 1e-3);
    }

    #[test]
    fn in_place_rejects_non_contiguous() {
        let (cos, sin) = angles();
        let spec = spec(RotaryLayout::PairedHalf);
        let x = Tensor::randn(0f32, 1.0, (8, 3, 5), &Device::Cpu)
            .unwrap()
            .t()
            .unwrap();
        assert!(rotate_in_place(&x, &cos, &sin, &spec).is_err());
    }

    #[test]
    fn failing_target_leaves_every_tensor_untouched() {
        let (cos, sin) = angles();
        let spec = spec(RotaryLayout::Interleaved);
        let first = Tensor::randn(0f32, 1.0, (5, 3, 8), &Device::Cpu).unwrap();
        let first_before = first.copy().unwrap();
        // Right element count, but transposed storage.
        let second = Tensor::randn(0f32, 1.0, (5, 8, 3), &Device::Cpu)
            .unwrap()
            .transpose(1, 2)
            .unwrap();
        assert!(rotate_all_in_place(&[(&first, spec), (&second, spec)], &cos, &sin).is_err());
        assert_eq!(max_abs_diff(&first, &first_before), 0.0);

        let short = Tensor::randn(0f32, 1.0, (4, 3, 8), &Device::Cpu).unwrap();
        assert!(rotate_all_in_place(&[(&first, spec), (&short, spec)], &cos, &sin).is_err());
        assert_eq!(max_abs_diff(&first, &first_before), 0.0);
    }

    #[test]
    fn backward_applies_inverse_rotation() {
        let (cos, sin) = angles();
        let spec = spec(RotaryLayout::Interleaved);
        let x = Var::from_tensor(&Tensor::randn(0f32, 1.0, (5, 3, 8), &Device::Cpu).unwrap()).unwrap();
        let y = rotate_tracked(x.as_tensor(), &cos, &sin, &spec).unwrap();
        let g = Tensor::randn(0f32, 1.0, (5, 3, 8), &Device::Cpu).unwrap();
        let grads = (y * &g).unwrap().sum_all().unwrap().backward().unwrap();
        let grad_x = grads.get(x.as_tensor()).unwrap();
        let expected = rotate_tensor(&g, &cos, &sin, &spec.inverse()).unwrap();
        assert!(max_abs_diff(grad_x, &expected) < 1e-5);
    }
}
