use crate::backend::{self, reduce_grad_to_shape};
use crate::error::{Result, TensorError};
use crate::index::ResolvedKey;
use ndarray::{ArrayD, Axis, Dimension, IxDyn, Zip};
use std::cmp::Ordering;

const GELU_COEFF: f32 = 0.044_715;
// sqrt(2 / pi)
const SQRT_2_OVER_PI: f32 = 0.797_884_6;

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn unary(a: &ArrayD<f32>, f: impl Fn(f32) -> f32) -> ArrayD<f32> {
    a.mapv(f)
}

/// `grad * f(x)` elementwise, for unary ops whose derivative only needs the input.
fn chain(grad: &ArrayD<f32>, x: &ArrayD<f32>, df: impl Fn(f32) -> f32) -> ArrayD<f32> {
    Zip::from(grad).and(x).map_collect(|&g, &x| g * df(x))
}

/// A differentiable primitive together with the context its backward rule needs.
///
/// Every variant implements a forward computation over its input arrays and a
/// vector-Jacobian product mapping the gradient of the output to one gradient per
/// input, each with exactly that input's shape.
#[derive(Debug, Clone)]
pub enum Op {
    /// Elementwise `a + b` with broadcasting.
    Add,
    /// Elementwise `a - b` with broadcasting.
    Sub,
    /// Elementwise `a * b` with broadcasting.
    Mul,
    /// Elementwise `a / b` with broadcasting.
    Div,
    Neg,
    Exp,
    /// Natural logarithm.
    Log,
    /// `x^p` for a constant exponent.
    Pow(f32),
    /// `base^x` for a constant base.
    ExpBase(f32),
    Relu,
    /// GeLU, tanh approximation.
    Gelu,
    /// `x * sigmoid(x)`.
    Silu,
    Sigmoid,
    Tanh,
    /// Sum over `axes` (sorted, resolved).
    Sum { axes: Vec<usize>, keepdims: bool },
    Mean { axes: Vec<usize>, keepdims: bool },
    /// Maximum over `axes`; every element equal to the maximum receives the gradient.
    Max { axes: Vec<usize>, keepdims: bool },
    Min { axes: Vec<usize>, keepdims: bool },
    /// Row-major reshape to `shape`.
    Reshape { shape: Vec<usize> },
    /// Axis permutation; output axis `i` is input axis `perm[i]`.
    Permute { perm: Vec<usize> },
    BroadcastTo { shape: Vec<usize> },
    /// Basic slicing.
    Slice { key: ResolvedKey },
    /// Functional `out = a; out[key] = b`.
    SetSlice { key: ResolvedKey },
    /// Gather positions along `axis`; repeated indices are allowed.
    IndexSelect { axis: usize, indices: Vec<usize> },
    Concat { axis: usize },
    Flip { axes: Vec<usize> },
    /// Repeat each element `repeats` times along `axis` (flattened input when `None`).
    RepeatInterleave { repeats: usize, axis: Option<usize> },
    /// Copy; identity gradient.
    Clone,
    /// Batched matrix product with `@` semantics.
    MatMul,
    /// Contract the last `axes` dims of the left input with the first `axes` dims of the right one.
    TensorDot { axes: usize },
    Softmax { axis: usize },
    LogSoftmax { axis: usize },
    /// Replace positions where `mask` (already broadcast to the input shape) is 1.
    MaskedFill { mask: ArrayD<f32>, value: f32 },
    /// Gather along `axis` at positions chosen by [`topk_indices`]; `indices` has the
    /// output's shape.
    TopK { axis: usize, indices: ArrayD<usize> },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Neg => "neg",
            Op::Exp => "exp",
            Op::Log => "log",
            Op::Pow(_) => "pow",
            Op::ExpBase(_) => "exp_base",
            Op::Relu => "relu",
            Op::Gelu => "gelu",
            Op::Silu => "silu",
            Op::Sigmoid => "sigmoid",
            Op::Tanh => "tanh",
            Op::Sum { .. } => "sum",
            Op::Mean { .. } => "mean",
            Op::Max { .. } => "max",
            Op::Min { .. } => "min",
            Op::Reshape { .. } => "reshape",
            Op::Permute { .. } => "permute",
            Op::BroadcastTo { .. } => "broadcast_to",
            Op::Slice { .. } => "slice",
            Op::SetSlice { .. } => "set_slice",
            Op::IndexSelect { .. } => "index_select",
            Op::Concat { .. } => "concat",
            Op::Flip { .. } => "flip",
            Op::RepeatInterleave { .. } => "repeat_interleave",
            Op::Clone => "clone",
            Op::MatMul => "matmul",
            Op::TensorDot { .. } => "tensordot",
            Op::Softmax { .. } => "softmax",
            Op::LogSoftmax { .. } => "log_softmax",
            Op::MaskedFill { .. } => "masked_fill",
            Op::TopK { .. } => "topk",
        }
    }

    /// Ops that only move or copy values keep the element type of their inputs.
    pub fn preserves_dtype(&self) -> bool {
        matches!(
            self,
            Op::Reshape { .. }
                | Op::Permute { .. }
                | Op::BroadcastTo { .. }
                | Op::Slice { .. }
                | Op::SetSlice { .. }
                | Op::IndexSelect { .. }
                | Op::Concat { .. }
                | Op::Flip { .. }
                | Op::RepeatInterleave { .. }
                | Op::Clone
        )
    }

    /// Number of inputs the op consumes, `None` for variadic ops.
    pub fn arity(&self) -> Option<usize> {
        match self {
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::MatMul | Op::TensorDot { .. } => Some(2),
            Op::SetSlice { .. } => Some(2),
            Op::Concat { .. } => None,
            _ => Some(1),
        }
    }

    /// Computes the output values.
    pub fn forward(&self, inputs: &[&ArrayD<f32>]) -> Result<ArrayD<f32>> {
        match self.arity() {
            Some(n) if n != inputs.len() => {
                return Err(TensorError::invalid(format!(
                    "{} expects {} inputs, got {}",
                    self.name(),
                    n,
                    inputs.len()
                )))
            }
            None if inputs.is_empty() => {
                return Err(TensorError::invalid(format!("{} expects at least one input", self.name())))
            }
            _ => {}
        }
        let x = inputs[0];
        let out = match self {
            Op::Add => backend::broadcast_binary(x, inputs[1], |a, b| a + b)?,
            Op::Sub => backend::broadcast_binary(x, inputs[1], |a, b| a - b)?,
            Op::Mul => backend::broadcast_binary(x, inputs[1], |a, b| a * b)?,
            Op::Div => backend::broadcast_binary(x, inputs[1], |a, b| a / b)?,
            Op::Neg => unary(x, |v| -v),
            Op::Exp => unary(x, f32::exp),
            Op::Log => unary(x, f32::ln),
            Op::Pow(p) => {
                let p = *p;
                unary(x, |v| v.powf(p))
            }
            Op::ExpBase(base) => {
                let base = *base;
                unary(x, |v| base.powf(v))
            }
            Op::Relu => unary(x, |v| v.max(0.0)),
            Op::Gelu => unary(x, |v| {
                0.5 * v * (1.0 + (SQRT_2_OVER_PI * (v + GELU_COEFF * v * v * v)).tanh())
            }),
            Op::Silu => unary(x, |v| v * sigmoid(v)),
            Op::Sigmoid => unary(x, sigmoid),
            Op::Tanh => unary(x, f32::tanh),
            Op::Sum { axes, keepdims } => backend::sum_axes(x, axes, *keepdims)?,
            Op::Mean { axes, keepdims } => {
                let count = reduced_count(x.shape(), axes);
                backend::sum_axes(x, axes, *keepdims)? / count as f32
            }
            Op::Max { axes, keepdims } => backend::max_axes(x, axes, *keepdims)?,
            Op::Min { axes, keepdims } => backend::min_axes(x, axes, *keepdims)?,
            Op::Reshape { shape } => x.to_shape(IxDyn(shape))?.into_owned(),
            Op::Permute { perm } => {
                backend::validate_permutation(perm, x.ndim())?;
                backend::permute(x, perm)
            }
            Op::BroadcastTo { shape } => backend::broadcast_to(x, shape)?,
            Op::Slice { key } => key.view(x)?.to_owned(),
            Op::SetSlice { key } => {
                let value = inputs[1];
                if value.broadcast(IxDyn(key.out_shape())).is_none() {
                    return Err(TensorError::shape(format!(
                        "cannot assign value of shape {:?} to slice of shape {:?}",
                        value.shape(),
                        key.out_shape()
                    )));
                }
                let mut out = x.clone();
                key.view_mut(&mut out)?.assign(value);
                out
            }
            Op::IndexSelect { axis, indices } => {
                let len = x.shape()[*axis];
                if let Some(&bad) = indices.iter().find(|&&i| i >= len) {
                    return Err(TensorError::shape(format!(
                        "index {} is out of bounds for axis {} with size {}",
                        bad, axis, len
                    )));
                }
                x.select(Axis(*axis), indices)
            }
            Op::Concat { axis } => {
                let views: Vec<_> = inputs.iter().map(|a| a.view()).collect();
                ndarray::concatenate(Axis(*axis), &views)?
            }
            Op::Flip { axes } => {
                let mut v = x.view();
                for &ax in axes.iter() {
                    v.invert_axis(Axis(ax));
                }
                v.to_owned()
            }
            Op::RepeatInterleave { repeats, axis } => {
                let r = *repeats;
                match axis {
                    Some(ax) => x.select(Axis(*ax), &repeat_indices(x.shape()[*ax], r)),
                    None => {
                        let flat = x.to_shape(IxDyn(&[x.len()]))?;
                        flat.select(Axis(0), &repeat_indices(x.len(), r))
                    }
                }
            }
            Op::Clone => x.clone(),
            Op::MatMul => backend::matmul(x, inputs[1])?,
            Op::TensorDot { axes } => backend::tensordot(x, inputs[1], *axes)?,
            Op::Softmax { axis } => softmax(x, *axis)?,
            Op::LogSoftmax { axis } => {
                let max = backend::max_axes(x, &[*axis], true)?;
                let shifted = backend::broadcast_binary(x, &max, |v, m| v - m)?;
                let lse = backend::sum_axes(&shifted.mapv(f32::exp), &[*axis], true)?.mapv(f32::ln);
                backend::broadcast_binary(&shifted, &lse, |v, l| v - l)?
            }
            Op::MaskedFill { mask, value } => {
                if mask.shape() != x.shape() {
                    return Err(TensorError::shape(format!(
                        "mask of shape {:?} does not match input of shape {:?}",
                        mask.shape(),
                        x.shape()
                    )));
                }
                let value = *value;
                Zip::from(x)
                    .and(&*mask)
                    .map_collect(|&v, &m| if m != 0.0 { value } else { v })
            }
            Op::TopK { axis, indices } => {
                let lanes_match = indices.ndim() == x.ndim()
                    && (0..x.ndim()).all(|d| d == *axis || indices.shape()[d] == x.shape()[d]);
                if !lanes_match {
                    return Err(TensorError::shape(format!(
                        "top-k indices of shape {:?} do not fit input of shape {:?} along axis {}",
                        indices.shape(),
                        x.shape(),
                        axis
                    )));
                }
                let len = x.shape()[*axis];
                if indices.iter().any(|&i| i >= len) {
                    return Err(TensorError::shape(format!(
                        "top-k index out of bounds for axis {} with size {}",
                        axis, len
                    )));
                }
                let mut out = ArrayD::zeros(indices.raw_dim());
                for (pos, &src) in indices.indexed_iter() {
                    let mut at = pos.slice().to_vec();
                    at[*axis] = src;
                    out[pos.slice()] = x[at.as_slice()];
                }
                out
            }
        };
        Ok(out)
    }

    /// Vector-Jacobian product: one gradient per input, each shaped like that input.
    ///
    /// `output` is the value this op produced in its forward pass.
    pub fn backward(
        &self,
        inputs: &[&ArrayD<f32>],
        output: &ArrayD<f32>,
        grad: &ArrayD<f32>,
    ) -> Result<Vec<ArrayD<f32>>> {
        let x = inputs[0];
        let grads = match self {
            Op::Add => vec![
                reduce_grad_to_shape(grad, x.shape())?,
                reduce_grad_to_shape(grad, inputs[1].shape())?,
            ],
            Op::Sub => vec![
                reduce_grad_to_shape(grad, x.shape())?,
                reduce_grad_to_shape(&grad.mapv(|g| -g), inputs[1].shape())?,
            ],
            Op::Mul => {
                let b = inputs[1];
                let ga = backend::broadcast_binary(grad, b, |g, b| g * b)?;
                let gb = backend::broadcast_binary(grad, x, |g, a| g * a)?;
                vec![
                    reduce_grad_to_shape(&ga, x.shape())?,
                    reduce_grad_to_shape(&gb, b.shape())?,
                ]
            }
            Op::Div => {
                let b = inputs[1];
                let ga = backend::broadcast_binary(grad, b, |g, b| g / b)?;
                // -g * a / b^2 == -g * out / b
                let gb = backend::broadcast_binary(grad, output, |g, o| -g * o)?;
                let gb = backend::broadcast_binary(&gb, b, |v, b| v / b)?;
                vec![
                    reduce_grad_to_shape(&ga, x.shape())?,
                    reduce_grad_to_shape(&gb, b.shape())?,
                ]
            }
            Op::Neg => vec![grad.mapv(|g| -g)],
            Op::Exp => vec![grad * output],
            Op::Log => vec![grad / x],
            Op::Pow(p) => {
                let p = *p;
                vec![chain(grad, x, |v| p * v.powf(p - 1.0))]
            }
            Op::ExpBase(base) => {
                let ln_base = base.ln();
                vec![Zip::from(grad).and(output).map_collect(|&g, &o| g * o * ln_base)]
            }
            Op::Relu => vec![chain(grad, x, |v| if v > 0.0 { 1.0 } else { 0.0 })],
            Op::Gelu => vec![chain(grad, x, |v| {
                let t = (SQRT_2_OVER_PI * (v + GELU_COEFF * v * v * v)).tanh();
                0.5 * (1.0 + t)
                    + 0.5 * v * (1.0 - t * t) * SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_COEFF * v * v)
            })],
            Op::Silu => vec![chain(grad, x, |v| {
                let s = sigmoid(v);
                s * (1.0 + v * (1.0 - s))
            })],
            Op::Sigmoid => vec![Zip::from(grad).and(output).map_collect(|&g, &s| g * s * (1.0 - s))],
            Op::Tanh => vec![Zip::from(grad).and(output).map_collect(|&g, &t| g * (1.0 - t * t))],
            Op::Sum { axes, keepdims } => {
                vec![backend::expand_reduced(grad, x.shape(), axes, *keepdims)?]
            }
            Op::Mean { axes, keepdims } => {
                let count = reduced_count(x.shape(), axes) as f32;
                vec![backend::expand_reduced(grad, x.shape(), axes, *keepdims)? / count]
            }
            Op::Max { axes, keepdims } | Op::Min { axes, keepdims } => {
                let extremum = backend::expand_reduced(output, x.shape(), axes, *keepdims)?;
                let g = backend::expand_reduced(grad, x.shape(), axes, *keepdims)?;
                vec![Zip::from(x)
                    .and(&extremum)
                    .and(&g)
                    .map_collect(|&v, &e, &g| if v == e { g } else { 0.0 })]
            }
            Op::Reshape { .. } => vec![grad.to_shape(IxDyn(x.shape()))?.into_owned()],
            Op::Permute { perm } => vec![backend::permute(grad, &backend::inverse_permutation(perm))],
            Op::BroadcastTo { .. } => vec![reduce_grad_to_shape(grad, x.shape())?],
            Op::Slice { key } => {
                let mut g = ArrayD::zeros(x.raw_dim());
                key.view_mut(&mut g)?.assign(grad);
                vec![g]
            }
            Op::SetSlice { key } => {
                let mut ga = grad.clone();
                key.view_mut(&mut ga)?.fill(0.0);
                let region = key.view(grad)?.to_owned();
                vec![ga, reduce_grad_to_shape(&region, inputs[1].shape())?]
            }
            Op::IndexSelect { axis, indices } => {
                let mut g = ArrayD::zeros(x.raw_dim());
                for (i, &idx) in indices.iter().enumerate() {
                    let mut dst = g.index_axis_mut(Axis(*axis), idx);
                    dst += &grad.index_axis(Axis(*axis), i);
                }
                vec![g]
            }
            Op::Concat { axis } => {
                let mut start = 0usize;
                inputs
                    .iter()
                    .map(|input| {
                        let len = input.shape()[*axis];
                        let part = grad
                            .slice_axis(Axis(*axis), ndarray::Slice::from(start..start + len))
                            .to_owned();
                        start += len;
                        part
                    })
                    .collect()
            }
            Op::Flip { axes } => {
                let mut v = grad.view();
                for &ax in axes.iter() {
                    v.invert_axis(Axis(ax));
                }
                vec![v.to_owned()]
            }
            Op::RepeatInterleave { repeats, axis } => {
                let g = match axis {
                    Some(ax) => {
                        let mut shape = x.shape().to_vec();
                        shape.insert(*ax + 1, *repeats);
                        grad.to_shape(IxDyn(&shape))?.sum_axis(Axis(*ax + 1))
                    }
                    None => grad
                        .to_shape(IxDyn(&[x.len(), *repeats]))?
                        .sum_axis(Axis(1))
                        .to_shape(IxDyn(x.shape()))?
                        .into_owned(),
                };
                vec![g]
            }
            Op::Clone => vec![grad.clone()],
            Op::MatMul => matmul_backward(x, inputs[1], grad)?,
            Op::TensorDot { axes } => {
                let b = inputs[1];
                let (_, _, m, k, n) = backend::tensordot_dims(x.shape(), b.shape(), *axes)?;
                let g2 = grad.to_shape((m, n))?;
                let a2 = x.to_shape((m, k))?;
                let b2 = b.to_shape((k, n))?;
                let ga = g2.dot(&b2.t()).into_shape(IxDyn(x.shape()))?;
                let gb = a2.t().dot(&g2).into_shape(IxDyn(b.shape()))?;
                vec![ga, gb]
            }
            Op::Softmax { axis } => {
                // s * (g - sum(g * s))
                let gs = Zip::from(grad).and(output).map_collect(|&g, &s| g * s);
                let dot = backend::sum_axes(&gs, &[*axis], true)?;
                let centered = backend::broadcast_binary(grad, &dot, |g, d| g - d)?;
                vec![Zip::from(&centered).and(output).map_collect(|&c, &s| c * s)]
            }
            Op::LogSoftmax { axis } => {
                // g - softmax * sum(g)
                let total = backend::sum_axes(grad, &[*axis], true)?;
                let scaled = backend::broadcast_binary(&output.mapv(f32::exp), &total, |s, t| s * t)?;
                vec![grad - &scaled]
            }
            Op::MaskedFill { mask, .. } => {
                vec![Zip::from(grad).and(mask).map_collect(|&g, &m| if m != 0.0 { 0.0 } else { g })]
            }
            Op::TopK { axis, indices, .. } => {
                let mut g = ArrayD::zeros(x.raw_dim());
                for (pos, &src) in indices.indexed_iter() {
                    let mut target = pos.slice().to_vec();
                    target[*axis] = src;
                    g[target.as_slice()] += grad[pos.slice()];
                }
                vec![g]
            }
        };
        Ok(grads)
    }
}

fn reduced_count(shape: &[usize], axes: &[usize]) -> usize {
    axes.iter().map(|&ax| shape[ax]).product()
}

fn repeat_indices(len: usize, repeats: usize) -> Vec<usize> {
    (0..len)
        .flat_map(|i| std::iter::repeat(i).take(repeats))
        .collect()
}

fn softmax(x: &ArrayD<f32>, axis: usize) -> Result<ArrayD<f32>> {
    let max = backend::max_axes(x, &[axis], true)?;
    let e = backend::broadcast_binary(x, &max, |v, m| (v - m).exp())?;
    let total = backend::sum_axes(&e, &[axis], true)?;
    backend::broadcast_binary(&e, &total, |v, t| v / t)
}

/// Positions of the largest `k` entries along `axis`, sorted descending with ties
/// keeping the lower index first. NaN of either sign ranks below every number, so it
/// is only picked once `k` reaches past all of them.
pub fn topk_indices(x: &ArrayD<f32>, k: usize, axis: usize) -> Result<ArrayD<usize>> {
    let len = x.shape()[axis];
    if k > len {
        return Err(TensorError::shape(format!(
            "k = {} exceeds size {} of axis {}",
            k, len, axis
        )));
    }
    let mut out_shape = x.shape().to_vec();
    out_shape[axis] = k;
    let mut indices = ArrayD::<usize>::zeros(IxDyn(&out_shape));
    let mut order: Vec<usize> = Vec::with_capacity(len);
    for (lane, mut i_lane) in x
        .lanes(Axis(axis))
        .into_iter()
        .zip(indices.lanes_mut(Axis(axis)))
    {
        order.clear();
        order.extend(0..len);
        order.sort_by(|&i, &j| descending_nan_last(lane[i], lane[j]));
        for (t, &src) in order.iter().take(k).enumerate() {
            i_lane[t] = src;
        }
    }
    Ok(indices)
}

fn descending_nan_last(a: f32, b: f32) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
    }
}

fn matmul_backward(a: &ArrayD<f32>, b: &ArrayD<f32>, grad: &ArrayD<f32>) -> Result<Vec<ArrayD<f32>>> {
    let a_vec = a.ndim() == 1;
    let b_vec = b.ndim() == 1;
    let a2 = if a_vec { a.view().insert_axis(Axis(0)) } else { a.view() };
    let b2 = if b_vec { b.view().insert_axis(Axis(1)) } else { b.view() };

    // restore the axes the forward pass squeezed out
    let mut g = grad.view();
    if a_vec {
        let at = if b_vec { g.ndim() } else { g.ndim() - 1 };
        g = g.insert_axis(Axis(at));
    }
    if b_vec {
        let at = g.ndim();
        g = g.insert_axis(Axis(at));
    }

    let b_t = backend::swap_last_two(&b2.to_owned());
    let a_t = backend::swap_last_two(&a2.to_owned());
    let ga = backend::batched_matmul(&g, &b_t.view())?;
    let gb = backend::batched_matmul(&a_t.view(), &g)?;
    let ga = reduce_grad_to_shape(&ga, a2.shape())?;
    let gb = reduce_grad_to_shape(&gb, b2.shape())?;
    Ok(vec![
        ga.into_shape(IxDyn(a.shape()))?,
        gb.into_shape(IxDyn(b.shape()))?,
    ])
}
