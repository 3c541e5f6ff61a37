//! Gram matrices, the channel correlation statistics used as a style
//! fingerprint.

use ndarray::{Array2, Array4};

use crate::parallel;

/// Computes the normalized Gram matrix of an `[a, b, c, d]` activation.
///
/// The activation is viewed as `a * b` feature rows of `c * d` responses,
/// multiplied with its own transpose and divided by the element count
/// `a * b * c * d`, which keeps losses of large and small layers comparable.
pub fn gram(x: &Array4<f32>) -> Array2<f32> {
    gram_threaded(x, 1)
}

pub(crate) fn gram_threaded(x: &Array4<f32>, max_threads: usize) -> Array2<f32> {
    let features = flatten(x);
    let mut g = parallel::dot(features.view(), features.t(), max_threads);
    g /= x.len().max(1) as f32;
    g
}

/// Chains `grad` (the gradient with respect to `gram(x)`) back to `x`:
/// `(dG + dGᵀ) · F / n`, folded back into the activation's shape.
pub(crate) fn gram_backward(x: &Array4<f32>, grad: &Array2<f32>, max_threads: usize) -> Array4<f32> {
    let (_, b, _, d) = x.dim();
    let features = flatten(x);

    let sym = grad + &grad.t();
    let mut df = parallel::dot(sym.view(), features.view(), max_threads);
    df /= x.len().max(1) as f32;

    Array4::from_shape_fn(x.raw_dim(), |(i, j, k, l)| df[[i * b + j, k * d + l]])
}

fn flatten(x: &Array4<f32>) -> Array2<f32> {
    let (a, b, c, d) = x.dim();
    Array2::from_shape_fn((a * b, c * d), |(row, col)| {
        x[[row / b, row % b, col / d, col % d]]
    })
}
