//! This crate provides a tensor library with reverse-mode automatic differentiation.
//!
//! Tensors wrap dense `f32` arrays. Every operation returns a new tensor and, while
//! gradient tracking is on and one of its inputs requires gradients, records itself
//! in a define-by-run computation graph. Calling [`Tensor::backward`] on a scalar
//! walks that graph once in reverse topological order and adds the gradient of the
//! scalar to every tensor that requires one.
//!
//! ```
//! use ndarray::arr2;
//! use tensor_grad::Tensor;
//!
//! let a = Tensor::new(arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn(), true);
//! let b = Tensor::ones(&[2, 2], true);
//! let c = a.mul(&b)?.sum()?;
//! c.backward()?;
//!
//! assert_eq!(c.item()?, 10.0);
//! assert_eq!(b.grad().unwrap(), arr2(&[[1.0f32, 2.0], [3.0, 4.0]]).into_dyn());
//! # Ok::<(), tensor_grad::TensorError>(())
//! ```
//!
//! Inference code can switch tracking off for a scope:
//!
//! ```
//! use tensor_grad::{no_grad, Tensor};
//!
//! let w = Tensor::ones(&[3], true);
//! let y = no_grad(|| w.mul_scalar(2.0)).unwrap();
//! assert!(!y.requires_grad());
//! ```

pub mod autograd;
pub mod backend;
pub mod dtype;
pub mod error;
pub mod grad_mode;
pub mod index;
pub mod ops;
pub mod tensor;

pub use autograd::AutogradEngine;
pub use dtype::DType;
pub use error::{Result, TensorError};
pub use grad_mode::{enable_grad, is_grad_enabled, no_grad, set_grad_enabled, EnableGradGuard, NoGradGuard};
pub use index::SliceArg;
pub use tensor::Tensor;
