//! Dense array primitives on top of `ndarray`.
//!
//! Nothing in here is differentiable. These are the kernels the operation layer
//! wraps with gradient rules: NumPy-style broadcasting, axis reductions,
//! permutations and (batched) contractions, plus the shape bookkeeping the
//! backward pass needs to fold a broadcasted gradient back onto an input.

use crate::error::{Result, TensorError};
#[cfg(not(feature = "parallel"))]
use ndarray::linalg::general_mat_mul;
use ndarray::{Array3, ArrayD, ArrayViewD, Axis, IxDyn, Zip};
#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Right-aligned broadcast of two shapes.
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let ndim = a.len().max(b.len());
    let mut out = vec![1usize; ndim];
    for i in 0..ndim {
        let da = if i < a.len() { a[a.len() - 1 - i] } else { 1 };
        let db = if i < b.len() { b[b.len() - 1 - i] } else { 1 };
        out[ndim - 1 - i] = if da == db || db == 1 {
            da
        } else if da == 1 {
            db
        } else {
            return Err(TensorError::shape(format!(
                "cannot broadcast shapes {:?} and {:?}",
                a, b
            )));
        };
    }
    Ok(out)
}

/// Materialize `a` broadcast to `shape`.
pub fn broadcast_to(a: &ArrayD<f32>, shape: &[usize]) -> Result<ArrayD<f32>> {
    a.broadcast(IxDyn(shape))
        .map(|v| v.to_owned())
        .ok_or_else(|| {
            TensorError::shape(format!("cannot broadcast {:?} to {:?}", a.shape(), shape))
        })
}

/// Elementwise `f(a, b)` over the broadcast of both operands.
pub fn broadcast_binary<F>(a: &ArrayD<f32>, b: &ArrayD<f32>, f: F) -> Result<ArrayD<f32>>
where
    F: Fn(f32, f32) -> f32,
{
    if a.shape() == b.shape() {
        return Ok(Zip::from(a).and(b).map_collect(|&x, &y| f(x, y)));
    }
    let shape = broadcast_shape(a.shape(), b.shape())?;
    let av = a.broadcast(IxDyn(&shape)).ok_or_else(|| {
        TensorError::shape(format!("cannot broadcast {:?} to {:?}", a.shape(), shape))
    })?;
    let bv = b.broadcast(IxDyn(&shape)).ok_or_else(|| {
        TensorError::shape(format!("cannot broadcast {:?} to {:?}", b.shape(), shape))
    })?;
    Ok(Zip::from(&av).and(&bv).map_collect(|&x, &y| f(x, y)))
}

/// Reduce `grad` to `target_shape` by summing over broadcasted axes.
///
/// Leading axes that `target_shape` does not have are summed away, and axes where
/// the target has size 1 but the gradient does not are summed with the axis kept.
pub fn reduce_grad_to_shape(grad: &ArrayD<f32>, target_shape: &[usize]) -> Result<ArrayD<f32>> {
    if grad.shape() == target_shape {
        return Ok(grad.clone());
    }
    if target_shape.len() > grad.ndim() {
        return Err(TensorError::shape(format!(
            "cannot reduce gradient of shape {:?} to higher-rank shape {:?}",
            grad.shape(),
            target_shape
        )));
    }
    let mut res = grad.clone();
    for _ in 0..grad.ndim() - target_shape.len() {
        res = res.sum_axis(Axis(0));
    }
    for (axis, &dim) in target_shape.iter().enumerate() {
        if res.shape()[axis] == dim {
            continue;
        }
        if dim != 1 {
            return Err(TensorError::shape(format!(
                "gradient of shape {:?} is not a broadcast of {:?}",
                grad.shape(),
                target_shape
            )));
        }
        res = res.sum_axis(Axis(axis)).insert_axis(Axis(axis));
    }
    Ok(res)
}

/// Resolve a possibly negative axis against `ndim`.
pub fn normalize_axis(axis: isize, ndim: usize) -> Result<usize> {
    let n = ndim as isize;
    let resolved = if axis < 0 { axis + n } else { axis };
    if resolved < 0 || resolved >= n {
        return Err(TensorError::shape(format!(
            "axis {} is out of bounds for tensor of rank {}",
            axis, ndim
        )));
    }
    Ok(resolved as usize)
}

/// Resolve a list of axes; the result is sorted ascending. `None` selects every axis.
pub fn normalize_axes(axes: Option<&[isize]>, ndim: usize) -> Result<Vec<usize>> {
    let Some(axes) = axes else {
        return Ok((0..ndim).collect());
    };
    let mut out = axes
        .iter()
        .map(|&a| normalize_axis(a, ndim))
        .collect::<Result<Vec<_>>>()?;
    out.sort_unstable();
    if out.windows(2).any(|w| w[0] == w[1]) {
        return Err(TensorError::shape(format!("repeated axis in {:?}", axes)));
    }
    Ok(out)
}

/// Shape left after reducing `axes` (sorted ascending).
pub fn reduced_shape(shape: &[usize], axes: &[usize], keepdims: bool) -> Vec<usize> {
    shape
        .iter()
        .enumerate()
        .filter_map(|(i, &d)| match (axes.contains(&i), keepdims) {
            (false, _) => Some(d),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect()
}

fn check_reducible(shape: &[usize], axes: &[usize]) -> Result<()> {
    if let Some(&ax) = axes.iter().find(|&&ax| shape[ax] == 0) {
        return Err(TensorError::shape(format!(
            "cannot reduce over zero-length axis {} of shape {:?}",
            ax, shape
        )));
    }
    Ok(())
}

fn restore_axes(mut a: ArrayD<f32>, axes: &[usize], keepdims: bool) -> ArrayD<f32> {
    if keepdims {
        for &ax in axes {
            a = a.insert_axis(Axis(ax));
        }
    }
    a
}

/// Sum over `axes` (sorted ascending).
pub fn sum_axes(a: &ArrayD<f32>, axes: &[usize], keepdims: bool) -> Result<ArrayD<f32>> {
    check_reducible(a.shape(), axes)?;
    let mut res = a.clone();
    for &ax in axes.iter().rev() {
        res = res.sum_axis(Axis(ax));
    }
    Ok(restore_axes(res, axes, keepdims))
}

/// Fold over `axes` with `pick`, propagating NaN the way NumPy's max/min do.
fn extremum_axes<F>(a: &ArrayD<f32>, axes: &[usize], keepdims: bool, init: f32, pick: F) -> Result<ArrayD<f32>>
where
    F: Fn(f32, f32) -> bool,
{
    check_reducible(a.shape(), axes)?;
    let mut res = a.clone();
    for &ax in axes.iter().rev() {
        res = res.fold_axis(Axis(ax), init, |&acc, &x| {
            if acc.is_nan() || x.is_nan() {
                f32::NAN
            } else if pick(x, acc) {
                x
            } else {
                acc
            }
        });
    }
    Ok(restore_axes(res, axes, keepdims))
}

pub fn max_axes(a: &ArrayD<f32>, axes: &[usize], keepdims: bool) -> Result<ArrayD<f32>> {
    extremum_axes(a, axes, keepdims, f32::NEG_INFINITY, |x, acc| x > acc)
}

pub fn min_axes(a: &ArrayD<f32>, axes: &[usize], keepdims: bool) -> Result<ArrayD<f32>> {
    extremum_axes(a, axes, keepdims, f32::INFINITY, |x, acc| x < acc)
}

/// Broadcast a reduced array back up to `input_shape`, re-inserting dropped axes first.
pub fn expand_reduced(
    reduced: &ArrayD<f32>,
    input_shape: &[usize],
    axes: &[usize],
    keepdims: bool,
) -> Result<ArrayD<f32>> {
    let kept = if keepdims {
        reduced.clone()
    } else {
        restore_axes(reduced.clone(), axes, true)
    };
    broadcast_to(&kept, input_shape)
}

/// Check that `perm` is a permutation of `0..ndim`.
pub fn validate_permutation(perm: &[usize], ndim: usize) -> Result<()> {
    let mut seen = vec![false; ndim];
    if perm.len() != ndim {
        return Err(TensorError::shape(format!(
            "permutation {:?} does not match rank {}",
            perm, ndim
        )));
    }
    for &p in perm {
        if p >= ndim || seen[p] {
            return Err(TensorError::shape(format!(
                "invalid permutation {:?} for rank {}",
                perm, ndim
            )));
        }
        seen[p] = true;
    }
    Ok(())
}

pub fn inverse_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inv = vec![0usize; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inv[p] = i;
    }
    inv
}

pub fn permute(a: &ArrayD<f32>, perm: &[usize]) -> ArrayD<f32> {
    a.view().permuted_axes(perm.to_vec()).to_owned()
}

/// Transpose of the two trailing axes.
pub fn swap_last_two(a: &ArrayD<f32>) -> ArrayD<f32> {
    let nd = a.ndim();
    let mut v = a.view();
    v.swap_axes(nd - 1, nd - 2);
    v.to_owned()
}

/// Matrix product with NumPy `@` semantics.
///
/// 1-D operands are promoted to matrices (a row for the left operand, a column for
/// the right one) and the promoted axis is removed from the result. Leading batch
/// dimensions broadcast against each other.
pub fn matmul(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    if a.ndim() == 0 || b.ndim() == 0 {
        return Err(TensorError::shape(format!(
            "matmul operands must have at least one dimension, got {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let av = if a.ndim() == 1 {
        a.view().insert_axis(Axis(0))
    } else {
        a.view()
    };
    let bv = if b.ndim() == 1 {
        b.view().insert_axis(Axis(1))
    } else {
        b.view()
    };
    let mut out = batched_matmul(&av, &bv)?;
    if b.ndim() == 1 {
        let last = out.ndim() - 1;
        out = out.remove_axis(Axis(last));
    }
    if a.ndim() == 1 {
        let row_axis = if b.ndim() == 1 { out.ndim() - 1 } else { out.ndim() - 2 };
        out = out.remove_axis(Axis(row_axis));
    }
    Ok(out)
}

/// `(..., m, k) @ (..., k, n) -> (..., m, n)` with broadcast batch dimensions.
pub fn batched_matmul(a: &ArrayViewD<f32>, b: &ArrayViewD<f32>) -> Result<ArrayD<f32>> {
    let (ar, br) = (a.ndim(), b.ndim());
    if ar < 2 || br < 2 {
        return Err(TensorError::shape(format!(
            "batched matmul needs operands of rank >= 2, got {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let (m, k) = (a.shape()[ar - 2], a.shape()[ar - 1]);
    let (k2, n) = (b.shape()[br - 2], b.shape()[br - 1]);
    if k != k2 {
        return Err(TensorError::shape(format!(
            "matmul inner dimensions differ: {:?} @ {:?}",
            a.shape(),
            b.shape()
        )));
    }
    let batch = broadcast_shape(&a.shape()[..ar - 2], &b.shape()[..br - 2])?;
    let nb: usize = batch.iter().product();

    let mut a_full = batch.clone();
    a_full.extend_from_slice(&[m, k]);
    let mut b_full = batch.clone();
    b_full.extend_from_slice(&[k, n]);
    let a_b = a
        .broadcast(IxDyn(&a_full))
        .ok_or_else(|| TensorError::shape(format!("cannot broadcast {:?} to {:?}", a.shape(), a_full)))?;
    let b_b = b
        .broadcast(IxDyn(&b_full))
        .ok_or_else(|| TensorError::shape(format!("cannot broadcast {:?} to {:?}", b.shape(), b_full)))?;
    let a3 = a_b.to_shape((nb, m, k))?;
    let b3 = b_b.to_shape((nb, k, n))?;

    let mut out = Array3::<f32>::zeros((nb, m, n));
    #[cfg(not(feature = "parallel"))]
    for (i, mut o) in out.outer_iter_mut().enumerate() {
        general_mat_mul(
            1.0,
            &a3.index_axis(Axis(0), i),
            &b3.index_axis(Axis(0), i),
            0.0,
            &mut o,
        );
    }
    #[cfg(feature = "parallel")]
    {
        let blocks: Vec<_> = (0..nb)
            .into_par_iter()
            .map(|i| a3.index_axis(Axis(0), i).dot(&b3.index_axis(Axis(0), i)))
            .collect();
        for (mut o, block) in out.outer_iter_mut().zip(blocks) {
            o.assign(&block);
        }
        log::trace!("parallel batched matmul over {} blocks", nb);
    }

    let mut out_shape = batch;
    out_shape.extend_from_slice(&[m, n]);
    Ok(out.into_shape(IxDyn(&out_shape))?)
}

/// Contract the last `axes` dimensions of `a` with the first `axes` dimensions of `b`.
pub fn tensordot(a: &ArrayD<f32>, b: &ArrayD<f32>, axes: usize) -> Result<ArrayD<f32>> {
    let (a_free, b_free, m, k, n) = tensordot_dims(a.shape(), b.shape(), axes)?;
    let a2 = a.to_shape((m, k))?;
    let b2 = b.to_shape((k, n))?;
    let mut out_shape = a_free;
    out_shape.extend_from_slice(&b_free);
    Ok(a2.dot(&b2).into_shape(IxDyn(&out_shape))?)
}

/// Free dims of both operands and the flattened `(m, k, n)` of a tensordot.
#[allow(clippy::type_complexity)]
pub fn tensordot_dims(
    a: &[usize],
    b: &[usize],
    axes: usize,
) -> Result<(Vec<usize>, Vec<usize>, usize, usize, usize)> {
    if axes > a.len() || axes > b.len() {
        return Err(TensorError::shape(format!(
            "cannot contract {} axes of shapes {:?} and {:?}",
            axes, a, b
        )));
    }
    let (a_free, a_con) = a.split_at(a.len() - axes);
    let (b_con, b_free) = b.split_at(axes);
    if a_con != b_con {
        return Err(TensorError::shape(format!(
            "contracted dimensions differ: {:?} vs {:?}",
            a_con, b_con
        )));
    }
    let m = a_free.iter().product();
    let k = a_con.iter().product();
    let n = b_free.iter().product();
    Ok((a_free.to_vec(), b_free.to_vec(), m, k, n))
}
