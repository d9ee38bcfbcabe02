use crate::autograd::AutogradEngine;
use crate::backend;
use crate::dtype::DType;
use crate::error::{Result, TensorError};
use crate::grad_mode::is_grad_enabled;
use crate::index::{self, SliceArg};
use crate::ops::{self, Op};
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_distr::StandardNormal;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// The operation that produced a tensor, plus the tensors it consumed.
///
/// A node is owned by its output, and holds shared handles to its inputs, so a
/// graph only ever points from outputs towards leaves.
pub(crate) struct Node {
    pub(crate) op: Op,
    pub(crate) inputs: Vec<Tensor>,
}

/// The mutable part of a tensor: everything the backward pass writes.
struct GradState {
    grad: Option<ArrayD<f32>>,
    requires_grad: bool,
}

/// `TensorInner` holds a tensor's values and its place in the computation graph.
///
/// Values are immutable once constructed and live outside the lock, so an operation
/// may read the same input several times (`a * a`) while another thread reads the
/// gradient.
struct TensorInner {
    data: ArrayD<f32>,
    dtype: DType,
    node: Option<Node>,
    state: Mutex<GradState>,
}

impl Drop for TensorInner {
    // Unlink long chains iteratively so that dropping a deep graph does not recurse
    // once per node.
    fn drop(&mut self) {
        let Some(node) = self.node.take() else {
            return;
        };
        let mut stack = node.inputs;
        while let Some(t) = stack.pop() {
            if let Ok(mut inner) = Arc::try_unwrap(t.0) {
                if let Some(node) = inner.node.take() {
                    stack.extend(node.inputs);
                }
            }
        }
    }
}

/// A multi-dimensional array (tensor) that supports automatic differentiation.
///
/// Tensors are cheap shared handles: cloning one clones the handle, not the values.
/// Leaves are created with the constructors below; every operation method returns
/// a new tensor and, while gradient tracking is enabled and some input requires
/// gradients, records how it was produced so that [`Tensor::backward`] can walk
/// back to the leaves.
#[derive(Clone)]
pub struct Tensor(Arc<TensorInner>);

impl Tensor {
    fn from_parts(data: ArrayD<f32>, dtype: DType, node: Option<Node>, requires_grad: bool) -> Self {
        Tensor(Arc::new(TensorInner {
            data,
            dtype,
            node,
            state: Mutex::new(GradState {
                grad: None,
                requires_grad,
            }),
        }))
    }

    /// Creates a new `f32` leaf tensor.
    ///
    /// # Arguments
    ///
    /// * `data` - The tensor's data.
    /// * `requires_grad` - Whether this tensor should receive a gradient.
    pub fn new(data: ArrayD<f32>, requires_grad: bool) -> Self {
        Tensor::from_parts(data, DType::F32, None, requires_grad)
    }

    /// Builds a leaf from row-major `values`.
    pub fn from_vec(values: Vec<f32>, shape: &[usize], requires_grad: bool) -> Result<Self> {
        let data = ArrayD::from_shape_vec(IxDyn(shape), values)?;
        Ok(Tensor::new(data, requires_grad))
    }

    /// A rank-0 tensor.
    pub fn scalar(value: f32, requires_grad: bool) -> Self {
        Tensor::new(ArrayD::from_elem(IxDyn(&[]), value), requires_grad)
    }

    pub fn zeros(shape: &[usize], requires_grad: bool) -> Self {
        Tensor::new(ArrayD::zeros(IxDyn(shape)), requires_grad)
    }

    pub fn ones(shape: &[usize], requires_grad: bool) -> Self {
        Tensor::new(ArrayD::ones(IxDyn(shape)), requires_grad)
    }

    pub fn full(shape: &[usize], value: f32, requires_grad: bool) -> Self {
        Tensor::new(ArrayD::from_elem(IxDyn(shape), value), requires_grad)
    }

    /// Standard normal samples from the thread-local generator.
    pub fn randn(shape: &[usize], requires_grad: bool) -> Self {
        Tensor::randn_with_rng(shape, &mut rand::thread_rng(), requires_grad)
    }

    /// Standard normal samples from `rng`, for reproducible initialization.
    pub fn randn_with_rng<R: Rng + ?Sized>(shape: &[usize], rng: &mut R, requires_grad: bool) -> Self {
        let data = ArrayD::from_shape_simple_fn(IxDyn(shape), || rng.sample::<f32, _>(StandardNormal));
        Tensor::new(data, requires_grad)
    }

    /// An `i64` tensor, e.g. class labels or gather indices. Never requires gradients.
    pub fn from_ints(values: Vec<i64>, shape: &[usize]) -> Result<Self> {
        let data = ArrayD::from_shape_vec(IxDyn(shape), values.into_iter().map(|v| v as f32).collect())?;
        Ok(Tensor::from_parts(data, DType::I64, None, false))
    }

    /// A boolean tensor stored as 0/1, e.g. a mask for [`Tensor::masked_fill`].
    pub fn from_bools(values: Vec<bool>, shape: &[usize]) -> Result<Self> {
        let data = ArrayD::from_shape_vec(
            IxDyn(shape),
            values.into_iter().map(|v| if v { 1.0 } else { 0.0 }).collect(),
        )?;
        Ok(Tensor::from_parts(data, DType::Bool, None, false))
    }

    /// Tags existing values with `dtype`. Integral and boolean tags are checked
    /// against the values.
    pub fn from_array_with_dtype(data: ArrayD<f32>, dtype: DType) -> Result<Self> {
        let valid = match dtype {
            DType::F32 => true,
            DType::I64 => data.iter().all(|v| v.fract() == 0.0),
            DType::Bool => data.iter().all(|&v| v == 0.0 || v == 1.0),
        };
        if !valid {
            return Err(TensorError::invalid(format!("values are not representable as {}", dtype)));
        }
        Ok(Tensor::from_parts(data, dtype, None, false))
    }

    fn state(&self) -> MutexGuard<'_, GradState> {
        self.0.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn node(&self) -> Option<&Node> {
        self.0.node.as_ref()
    }

    /// Identity of the underlying allocation, shared by all clones of this handle.
    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn data(&self) -> &ArrayD<f32> {
        &self.0.data
    }

    pub fn shape(&self) -> &[usize] {
        self.0.data.shape()
    }

    pub fn ndim(&self) -> usize {
        self.0.data.ndim()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.0.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.data.is_empty()
    }

    pub fn dtype(&self) -> DType {
        self.0.dtype
    }

    /// The value of a single-element tensor.
    pub fn item(&self) -> Result<f32> {
        match self.0.data.iter().next() {
            Some(&v) if self.len() == 1 => Ok(v),
            _ => Err(TensorError::shape(format!(
                "item() needs exactly one element, tensor has shape {:?}",
                self.shape()
            ))),
        }
    }

    /// A copy of the accumulated gradient, `None` before the first backward pass
    /// reaches this tensor or after [`Tensor::zero_grad`].
    pub fn grad(&self) -> Option<ArrayD<f32>> {
        self.state().grad.clone()
    }

    pub fn requires_grad(&self) -> bool {
        self.state().requires_grad
    }

    /// Marks a leaf as a gradient sink (or not).
    ///
    /// Results of operations get their flag from their inputs and cannot be changed;
    /// non-float tensors can never require gradients.
    pub fn set_requires_grad(&self, requires_grad: bool) -> Result<()> {
        if !self.is_leaf() {
            return Err(TensorError::invalid(format!(
                "cannot change requires_grad on the output of {}; detach() it first",
                self.op_name().unwrap_or("an operation")
            )));
        }
        if requires_grad && !self.dtype().is_float() {
            return Err(TensorError::Dtype(format!(
                "only floating point tensors can require gradients, got {}",
                self.dtype()
            )));
        }
        self.state().requires_grad = requires_grad;
        Ok(())
    }

    /// Whether this tensor was created directly rather than by a tracked operation.
    pub fn is_leaf(&self) -> bool {
        self.0.node.is_none()
    }

    /// Name of the producing operation, if any.
    pub fn op_name(&self) -> Option<&'static str> {
        self.node().map(|n| n.op.name())
    }

    /// Handles to the tensors this one was computed from. Empty for leaves.
    pub fn inputs(&self) -> Vec<Tensor> {
        self.node().map(|n| n.inputs.clone()).unwrap_or_default()
    }

    /// Adds `grad` into the stored gradient, allocating it on first write.
    pub(crate) fn accumulate_grad(&self, grad: &ArrayD<f32>) -> Result<()> {
        if grad.shape() != self.shape() {
            return Err(TensorError::shape(format!(
                "gradient of shape {:?} does not match tensor of shape {:?}",
                grad.shape(),
                self.shape()
            )));
        }
        let mut state = self.state();
        match state.grad.as_mut() {
            Some(existing) => *existing += grad,
            None => state.grad = Some(grad.clone()),
        }
        Ok(())
    }

    /// Clears the gradient. Data and graph are left untouched.
    pub fn zero_grad(&self) {
        self.state().grad = None;
    }

    /// Performs backpropagation from this rank-0 tensor, seeding its gradient with 1.
    ///
    /// Gradients are added to every reachable tensor that requires them.
    pub fn backward(&self) -> Result<()> {
        AutogradEngine::new().backward(self)
    }

    /// Performs backpropagation seeded with `grad`, which must match this tensor's shape.
    pub fn backward_with_grad(&self, grad: &ArrayD<f32>) -> Result<()> {
        AutogradEngine::new().backward_with_grad(self, grad)
    }

    /// A new leaf with the same values and dtype, outside any graph.
    pub fn detach(&self) -> Tensor {
        Tensor::from_parts(self.0.data.clone(), self.dtype(), None, false)
    }

    /// Runs `op` over `inputs` and wires the result into the graph when tracking.
    fn apply(op: Op, inputs: &[&Tensor]) -> Result<Tensor> {
        let arrays: Vec<&ArrayD<f32>> = inputs.iter().map(|t| t.data()).collect();
        let data = op.forward(&arrays)?;

        let first = inputs.first().map(|t| t.dtype()).unwrap_or_default();
        let dtype = if op.preserves_dtype() && inputs.iter().all(|t| t.dtype() == first) {
            first
        } else {
            DType::F32
        };

        let tracking = is_grad_enabled() && inputs.iter().any(|t| t.requires_grad());
        let node = tracking.then(|| Node {
            op,
            inputs: inputs.iter().map(|&t| t.clone()).collect(),
        });
        Ok(Tensor::from_parts(data, dtype, node, tracking))
    }

    fn unary(&self, op: Op) -> Result<Tensor> {
        Tensor::apply(op, &[self])
    }

    /// Adds two tensors, broadcasting NumPy-style.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        Tensor::apply(Op::Add, &[self, other])
    }

    /// Subtracts `other` from `self`.
    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        Tensor::apply(Op::Sub, &[self, other])
    }

    /// Multiplies two tensors elementwise.
    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        Tensor::apply(Op::Mul, &[self, other])
    }

    /// Divides two tensors elementwise.
    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        Tensor::apply(Op::Div, &[self, other])
    }

    pub fn add_scalar(&self, value: f32) -> Result<Tensor> {
        self.add(&Tensor::scalar(value, false))
    }

    pub fn sub_scalar(&self, value: f32) -> Result<Tensor> {
        self.sub(&Tensor::scalar(value, false))
    }

    pub fn mul_scalar(&self, value: f32) -> Result<Tensor> {
        self.mul(&Tensor::scalar(value, false))
    }

    pub fn div_scalar(&self, value: f32) -> Result<Tensor> {
        self.div(&Tensor::scalar(value, false))
    }

    pub fn neg(&self) -> Result<Tensor> {
        self.unary(Op::Neg)
    }

    /// Raises every element to `power`.
    pub fn pow(&self, power: f32) -> Result<Tensor> {
        self.unary(Op::Pow(power))
    }

    pub fn sqrt(&self) -> Result<Tensor> {
        self.pow(0.5)
    }

    pub fn exp(&self) -> Result<Tensor> {
        self.unary(Op::Exp)
    }

    /// Element-wise natural logarithm.
    pub fn log(&self) -> Result<Tensor> {
        self.unary(Op::Log)
    }

    /// `base^x` elementwise.
    pub fn exp_base(&self, base: f32) -> Result<Tensor> {
        self.unary(Op::ExpBase(base))
    }

    pub fn relu(&self) -> Result<Tensor> {
        self.unary(Op::Relu)
    }

    /// GeLU activation (tanh approximation).
    pub fn gelu(&self) -> Result<Tensor> {
        self.unary(Op::Gelu)
    }

    pub fn silu(&self) -> Result<Tensor> {
        self.unary(Op::Silu)
    }

    pub fn sigmoid(&self) -> Result<Tensor> {
        self.unary(Op::Sigmoid)
    }

    pub fn tanh(&self) -> Result<Tensor> {
        self.unary(Op::Tanh)
    }

    /// Sum of all elements, as a rank-0 tensor.
    pub fn sum(&self) -> Result<Tensor> {
        let axes = backend::normalize_axes(None, self.ndim())?;
        self.unary(Op::Sum { axes, keepdims: false })
    }

    /// Sum over `axes`; negative axes count from the end.
    pub fn sum_axes(&self, axes: &[isize], keepdims: bool) -> Result<Tensor> {
        let axes = backend::normalize_axes(Some(axes), self.ndim())?;
        self.unary(Op::Sum { axes, keepdims })
    }

    /// Mean of all elements, as a rank-0 tensor.
    pub fn mean(&self) -> Result<Tensor> {
        let axes = backend::normalize_axes(None, self.ndim())?;
        self.unary(Op::Mean { axes, keepdims: false })
    }

    pub fn mean_axes(&self, axes: &[isize], keepdims: bool) -> Result<Tensor> {
        let axes = backend::normalize_axes(Some(axes), self.ndim())?;
        self.unary(Op::Mean { axes, keepdims })
    }

    /// Maximum over `axes`. Tied maxima all receive the full gradient.
    pub fn max_axes(&self, axes: &[isize], keepdims: bool) -> Result<Tensor> {
        let axes = backend::normalize_axes(Some(axes), self.ndim())?;
        self.unary(Op::Max { axes, keepdims })
    }

    pub fn min_axes(&self, axes: &[isize], keepdims: bool) -> Result<Tensor> {
        let axes = backend::normalize_axes(Some(axes), self.ndim())?;
        self.unary(Op::Min { axes, keepdims })
    }

    /// Reshapes the tensor. At most one dimension may be `-1` and is inferred.
    pub fn reshape(&self, shape: &[isize]) -> Result<Tensor> {
        let shape = infer_shape(shape, self.len(), self.shape())?;
        self.unary(Op::Reshape { shape })
    }

    /// Collapses the tensor to one dimension.
    pub fn flatten(&self) -> Result<Tensor> {
        self.reshape(&[-1])
    }

    /// Reorders axes: output axis `i` is input axis `perm[i]`.
    pub fn permute(&self, perm: &[usize]) -> Result<Tensor> {
        self.unary(Op::Permute { perm: perm.to_vec() })
    }

    /// Reverses the order of all axes.
    pub fn transpose(&self) -> Result<Tensor> {
        self.permute(&(0..self.ndim()).rev().collect::<Vec<_>>())
    }

    /// Exchanges two axes.
    pub fn swapaxes(&self, a: isize, b: isize) -> Result<Tensor> {
        let a = backend::normalize_axis(a, self.ndim())?;
        let b = backend::normalize_axis(b, self.ndim())?;
        let mut perm: Vec<usize> = (0..self.ndim()).collect();
        perm.swap(a, b);
        self.permute(&perm)
    }

    pub fn broadcast_to(&self, shape: &[usize]) -> Result<Tensor> {
        self.unary(Op::BroadcastTo { shape: shape.to_vec() })
    }

    /// NumPy-style basic indexing. Axes not covered by `key` are kept whole.
    ///
    /// ```
    /// use tensor_grad::{SliceArg, Tensor};
    ///
    /// let t = Tensor::from_vec((0..12).map(|v| v as f32).collect(), &[3, 4], false).unwrap();
    /// let row = t.slice(&[SliceArg::Index(-1), SliceArg::step(None, None, 2)]).unwrap();
    /// assert_eq!(row.data().iter().copied().collect::<Vec<_>>(), vec![8.0, 10.0]);
    /// ```
    pub fn slice(&self, key: &[SliceArg]) -> Result<Tensor> {
        let key = index::resolve(key, self.shape())?;
        self.unary(Op::Slice { key })
    }

    /// Returns a copy of `self` with the region selected by `key` replaced by `value`
    /// (broadcast to the region). `self` is not modified.
    pub fn set_slice(&self, key: &[SliceArg], value: &Tensor) -> Result<Tensor> {
        let key = index::resolve(key, self.shape())?;
        Tensor::apply(Op::SetSlice { key }, &[self, value])
    }

    /// Gathers the given positions along `axis`. Indices may repeat.
    pub fn index_select(&self, axis: isize, indices: &[usize]) -> Result<Tensor> {
        let axis = backend::normalize_axis(axis, self.ndim())?;
        self.unary(Op::IndexSelect {
            axis,
            indices: indices.to_vec(),
        })
    }

    /// Gathers along `axis` with an `i64` index tensor of any rank.
    ///
    /// The indexed axis is replaced by the index tensor's shape, so for `axis = 0` the
    /// result has shape `indices.shape() + self.shape()[1..]` (an embedding lookup).
    /// Repeated indices accumulate their gradients.
    pub fn index_select_by(&self, axis: isize, indices: &Tensor) -> Result<Tensor> {
        if indices.dtype() != DType::I64 {
            return Err(TensorError::Dtype(format!(
                "index tensor must be i64, got {} of shape {:?}",
                indices.dtype(),
                indices.shape()
            )));
        }
        let axis = backend::normalize_axis(axis, self.ndim())?;
        let positions = indices
            .data()
            .iter()
            .map(|&v| {
                if v < 0.0 {
                    Err(TensorError::shape(format!("negative index {}", v)))
                } else {
                    Ok(v as usize)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        let picked = self.unary(Op::IndexSelect {
            axis,
            indices: positions,
        })?;
        if indices.ndim() == 1 {
            return Ok(picked);
        }
        let mut shape = self.shape()[..axis].to_vec();
        shape.extend_from_slice(indices.shape());
        shape.extend_from_slice(&self.shape()[axis + 1..]);
        picked.unary(Op::Reshape { shape })
    }

    /// Boolean-mask selection, `x[mask]`.
    ///
    /// `mask` covers the leading `mask.ndim()` axes of `self` and holds only 0 and 1.
    /// The result has shape `[count] + self.shape()[mask.ndim()..]`, rows taken in
    /// row-major order; unselected positions get a zero gradient.
    pub fn masked_select(&self, mask: &Tensor) -> Result<Tensor> {
        if mask.ndim() == 0 || mask.ndim() > self.ndim() || mask.shape() != &self.shape()[..mask.ndim()] {
            return Err(TensorError::shape(format!(
                "mask of shape {:?} does not cover the leading axes of {:?}",
                mask.shape(),
                self.shape()
            )));
        }
        if mask.data().iter().any(|&m| m != 0.0 && m != 1.0) {
            return Err(TensorError::invalid("mask must contain only 0 and 1"));
        }
        let rest = &self.shape()[mask.ndim()..];
        let mut rows = vec![mask.len()];
        rows.extend_from_slice(rest);
        let positions: Vec<usize> = mask
            .data()
            .iter()
            .enumerate()
            .filter(|&(_, &m)| m != 0.0)
            .map(|(i, _)| i)
            .collect();
        self.unary(Op::Reshape { shape: rows })?.unary(Op::IndexSelect {
            axis: 0,
            indices: positions,
        })
    }

    /// Concatenates tensors along an existing axis.
    pub fn concat(tensors: &[Tensor], axis: isize) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| TensorError::invalid("concat needs at least one tensor"))?;
        let axis = backend::normalize_axis(axis, first.ndim())?;
        let inputs: Vec<&Tensor> = tensors.iter().collect();
        Tensor::apply(Op::Concat { axis }, &inputs)
    }

    /// Stacks equally shaped tensors along a new axis.
    pub fn stack(tensors: &[Tensor], axis: isize) -> Result<Tensor> {
        let first = tensors
            .first()
            .ok_or_else(|| TensorError::invalid("stack needs at least one tensor"))?;
        let axis = backend::normalize_axis(axis, first.ndim() + 1)?;
        let expanded = tensors
            .iter()
            .map(|t| {
                if t.shape() != first.shape() {
                    return Err(TensorError::shape(format!(
                        "stack needs equal shapes, got {:?} and {:?}",
                        first.shape(),
                        t.shape()
                    )));
                }
                let mut shape = t.shape().to_vec();
                shape.insert(axis, 1);
                t.unary(Op::Reshape { shape })
            })
            .collect::<Result<Vec<_>>>()?;
        Tensor::concat(&expanded, axis as isize)
    }

    /// Reverses the order of elements along `axes`.
    pub fn flip(&self, axes: &[isize]) -> Result<Tensor> {
        let axes = backend::normalize_axes(Some(axes), self.ndim())?;
        self.unary(Op::Flip { axes })
    }

    /// Repeats each element `repeats` times along `axis`, or over the flattened
    /// tensor when `axis` is `None`.
    pub fn repeat_interleave(&self, repeats: usize, axis: Option<isize>) -> Result<Tensor> {
        if repeats == 0 {
            return Err(TensorError::invalid("repeats must be positive"));
        }
        let axis = axis.map(|a| backend::normalize_axis(a, self.ndim())).transpose()?;
        self.unary(Op::RepeatInterleave { repeats, axis })
    }

    /// A tracked copy; gradients flow straight through.
    pub fn clone_tensor(&self) -> Result<Tensor> {
        self.unary(Op::Clone)
    }

    /// Matrix product with NumPy `@` semantics (1-D promotion, broadcast batch dims).
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        Tensor::apply(Op::MatMul, &[self, other])
    }

    /// Contracts the last `axes` dimensions of `self` with the first `axes` of `other`.
    pub fn tensordot(&self, other: &Tensor, axes: usize) -> Result<Tensor> {
        Tensor::apply(Op::TensorDot { axes }, &[self, other])
    }

    /// Numerically stable softmax along `axis`.
    pub fn softmax(&self, axis: isize) -> Result<Tensor> {
        let axis = backend::normalize_axis(axis, self.ndim())?;
        self.unary(Op::Softmax { axis })
    }

    /// Stable log-softmax along `axis`.
    pub fn log_softmax(&self, axis: isize) -> Result<Tensor> {
        let axis = backend::normalize_axis(axis, self.ndim())?;
        self.unary(Op::LogSoftmax { axis })
    }

    /// Replaces the elements where `mask` is 1 by `value`. The mask broadcasts to
    /// `self` and must only contain 0 and 1; it never receives gradients.
    pub fn masked_fill(&self, mask: &Tensor, value: f32) -> Result<Tensor> {
        if mask.data().iter().any(|&m| m != 0.0 && m != 1.0) {
            return Err(TensorError::invalid("mask must contain only 0 and 1"));
        }
        let mask = backend::broadcast_to(mask.data(), self.shape())?;
        self.unary(Op::MaskedFill { mask, value })
    }

    /// The `k` largest entries along `axis` in descending order, and their positions
    /// as an `i64` tensor. Only the values are differentiable.
    pub fn topk(&self, k: usize, axis: isize) -> Result<(Tensor, Tensor)> {
        if k == 0 {
            return Err(TensorError::invalid("k must be positive"));
        }
        let axis = backend::normalize_axis(axis, self.ndim())?;
        let indices = ops::topk_indices(self.data(), k, axis)?;
        let positions = Tensor::from_parts(indices.mapv(|i| i as f32), DType::I64, None, false);
        let values = self.unary(Op::TopK { axis, indices })?;
        Ok((values, positions))
    }
}

/// Resolves a reshape target with at most one `-1` against `len` elements.
fn infer_shape(shape: &[isize], len: usize, from: &[usize]) -> Result<Vec<usize>> {
    let mismatch = || TensorError::shape(format!("cannot reshape tensor of shape {:?} to {:?}", from, shape));
    let mut inferred = None;
    let mut known = 1usize;
    for (i, &d) in shape.iter().enumerate() {
        match d {
            -1 if inferred.is_none() => inferred = Some(i),
            d if d >= 0 => known = known.checked_mul(d as usize).ok_or_else(mismatch)?,
            _ => return Err(mismatch()),
        }
    }
    let mut out: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
    match inferred {
        Some(i) => {
            if known == 0 || len % known != 0 {
                return Err(mismatch());
            }
            out[i] = len / known;
        }
        None if known != len => return Err(mismatch()),
        None => {}
    }
    Ok(out)
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Tensor")
            .field("shape", &self.shape())
            .field("dtype", &self.dtype())
            .field("requires_grad", &state.requires_grad)
            .field("op", &self.op_name())
            .field("data", &self.0.data)
            .finish()
    }
}

// Tensors compare by identity, which is what graph bookkeeping needs.
impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Tensor {}

impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}
