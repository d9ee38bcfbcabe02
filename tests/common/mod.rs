#![allow(dead_code)]

use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Uniform};
use tensor_grad::{no_grad, Result, Tensor};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Uniform values in `[-1, 1)` from a fixed seed.
pub fn random_array(shape: &[usize], seed: u64) -> ArrayD<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let dist = Uniform::new(-1.0f32, 1.0);
    ArrayD::from_shape_simple_fn(IxDyn(shape), || dist.sample(&mut rng))
}

/// Uniform values in `[lo, hi)` from a fixed seed.
pub fn random_range(shape: &[usize], lo: f32, hi: f32, seed: u64) -> ArrayD<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let dist = Uniform::new(lo, hi);
    ArrayD::from_shape_simple_fn(IxDyn(shape), || dist.sample(&mut rng))
}

// Helper function to compute numeric gradient using centered finite differences
pub fn numeric_gradient<F>(f: F, x: &ArrayD<f32>, h: f32) -> ArrayD<f32>
where
    F: Fn(&ArrayD<f32>) -> f32,
{
    let x = x.as_standard_layout().to_owned();
    let mut grad = ArrayD::zeros(x.raw_dim());
    for i in 0..x.len() {
        // Relative step to mitigate cancellation for large magnitude f32 values.
        let base = x.as_slice().unwrap()[i].abs();
        let h_local = h * (1.0 + base);
        let mut x_plus = x.clone();
        let mut x_minus = x.clone();
        x_plus.as_slice_mut().unwrap()[i] += h_local;
        x_minus.as_slice_mut().unwrap()[i] -= h_local;
        grad.as_slice_mut().unwrap()[i] = (f(&x_plus) - f(&x_minus)) / (2.0 * h_local);
    }
    grad
}

pub fn assert_close(actual: &ArrayD<f32>, expected: &ArrayD<f32>, tol: f32) {
    assert_eq!(actual.shape(), expected.shape(), "shape mismatch");
    for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!(
            (a - e).abs() <= tol * (1.0 + e.abs()),
            "element {}: got {}, expected {} (tol {})",
            i,
            a,
            e,
            tol
        );
    }
}

/// Compares the analytic gradient of `sum(f(inputs) * w)` for a random `w` against
/// centered finite differences, for every input.
pub fn check_gradients<F>(f: F, inputs: &[ArrayD<f32>], h: f32, tol: f32)
where
    F: Fn(&[Tensor]) -> Result<Tensor>,
{
    let leaves: Vec<Tensor> = inputs.iter().map(|x| Tensor::new(x.clone(), true)).collect();
    let out = f(&leaves).unwrap();
    let w = Tensor::new(random_array(out.shape(), 0xfeed), false);
    let loss = out.mul(&w).unwrap().sum().unwrap();
    loss.backward().unwrap();

    for (i, leaf) in leaves.iter().enumerate() {
        let analytic = leaf
            .grad()
            .unwrap_or_else(|| ArrayD::zeros(leaf.data().raw_dim()));
        let numeric = numeric_gradient(
            |xi| {
                no_grad(|| {
                    let mut probe: Vec<Tensor> =
                        inputs.iter().map(|x| Tensor::new(x.clone(), false)).collect();
                    probe[i] = Tensor::new(xi.clone(), false);
                    f(&probe).unwrap().mul(&w).unwrap().sum().unwrap().item().unwrap()
                })
            },
            &inputs[i],
            h,
        );
        assert_close(&analytic, &numeric, tol);
    }
}
