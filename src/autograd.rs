use crate::error::{Result, TensorError};
use crate::tensor::Tensor;
use log::{debug, trace, warn};
use ndarray::{ArrayD, IxDyn};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

/// The `AutogradEngine` is responsible for orchestrating the backward pass.
///
/// It walks the graph behind an output in reverse topological order, so every
/// tensor has received the gradient of all of its consumers before its own
/// operation pushes gradients further towards the leaves. Gradients are always
/// added, never overwritten: a tensor reached through several paths sums them, and
/// calling backward twice without [`Tensor::zero_grad`] doubles them.
#[derive(Debug, Clone)]
pub struct AutogradEngine {
    retain_intermediate_grads: bool,
}

impl AutogradEngine {
    /// Creates a new `AutogradEngine` that stores gradients on every tensor it reaches.
    pub fn new() -> Self {
        AutogradEngine {
            retain_intermediate_grads: true,
        }
    }

    /// When `false`, only leaves keep their gradient; intermediate results pass
    /// theirs on without storing it.
    pub fn retain_intermediate_grads(mut self, retain: bool) -> Self {
        self.retain_intermediate_grads = retain;
        self
    }

    /// Starts backpropagation from a rank-0 tensor with an implicit seed of 1.
    ///
    /// # Arguments
    ///
    /// * `tensor` - The scalar to differentiate, typically a loss.
    pub fn backward(&self, tensor: &Tensor) -> Result<()> {
        if tensor.ndim() != 0 {
            return Err(TensorError::shape(format!(
                "backward() needs a scalar output, got shape {:?}; use backward_with_grad",
                tensor.shape()
            )));
        }
        self.run(tensor, ArrayD::ones(IxDyn(&[])))
    }

    /// Starts backpropagation from any tensor with an explicit seed gradient.
    pub fn backward_with_grad(&self, tensor: &Tensor, grad: &ArrayD<f32>) -> Result<()> {
        if grad.shape() != tensor.shape() {
            return Err(TensorError::shape(format!(
                "seed gradient of shape {:?} does not match output of shape {:?}",
                grad.shape(),
                tensor.shape()
            )));
        }
        self.run(tensor, grad.clone())
    }

    fn run(&self, root: &Tensor, seed: ArrayD<f32>) -> Result<()> {
        if !root.requires_grad() {
            warn!(
                "backward called on a tensor of shape {:?} that does not require gradients",
                root.shape()
            );
            return Err(TensorError::GradientTrackingDisabled(
                "tensor does not require gradients; was it computed under no_grad or from constant inputs?"
                    .to_string(),
            ));
        }

        let order = topological_order(root);
        let mut pending: HashMap<usize, ArrayD<f32>> = HashMap::new();
        pending.insert(root.id(), seed);
        let mut leaves = 0usize;

        for tensor in order.iter().rev() {
            let Some(grad) = pending.remove(&tensor.id()) else {
                continue;
            };
            let Some(node) = tensor.node() else {
                tensor.accumulate_grad(&grad)?;
                leaves += 1;
                continue;
            };
            if self.retain_intermediate_grads {
                tensor.accumulate_grad(&grad)?;
            }

            let inputs: Vec<&ArrayD<f32>> = node.inputs.iter().map(|t| t.data()).collect();
            let input_grads = node.op.backward(&inputs, tensor.data(), &grad)?;
            trace!(
                "{} backward: grad {:?} -> {} input(s)",
                node.op.name(),
                grad.shape(),
                input_grads.len()
            );

            for (input, input_grad) in node.inputs.iter().zip(input_grads) {
                if !input.requires_grad() {
                    continue;
                }
                if input_grad.shape() != input.shape() {
                    return Err(TensorError::shape(format!(
                        "{} produced a gradient of shape {:?} for an input of shape {:?}",
                        node.op.name(),
                        input_grad.shape(),
                        input.shape()
                    )));
                }
                match pending.entry(input.id()) {
                    Entry::Occupied(mut e) => *e.get_mut() += &input_grad,
                    Entry::Vacant(e) => {
                        e.insert(input_grad);
                    }
                }
            }
        }

        debug!(
            "backward pass visited {} tensor(s), reached {} leaf tensor(s)",
            order.len(),
            leaves
        );
        Ok(())
    }
}

impl Default for AutogradEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Post-order over the tensors reachable from `root` that require gradients:
/// every tensor appears after all of its inputs. Iterative, so deep graphs do not
/// exhaust the stack.
fn topological_order(root: &Tensor) -> Vec<Tensor> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![(root.clone(), false)];
    while let Some((tensor, expanded)) = stack.pop() {
        if expanded {
            order.push(tensor);
            continue;
        }
        if !visited.insert(tensor.id()) {
            continue;
        }
        let inputs: Vec<Tensor> = tensor
            .node()
            .map(|n| {
                n.inputs
                    .iter()
                    .filter(|t| t.requires_grad() && !visited.contains(&t.id()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        stack.push((tensor, true));
        stack.extend(inputs.into_iter().rev().map(|t| (t, false)));
    }
    order
}
