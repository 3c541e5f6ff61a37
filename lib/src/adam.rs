use ndarray::{Array4, Zip};

use crate::{layers::shape_mismatch, Error};

pub const DEFAULT_BETA1: f32 = 0.9;
pub const DEFAULT_BETA2: f32 = 0.999;
pub const DEFAULT_EPSILON: f32 = 1e-8;

/// Adam with bias corrected moment estimates, updating a single image tensor.
#[derive(Clone, Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    beta1_t: f32,
    beta2_t: f32,
    m: Array4<f32>,
    v: Array4<f32>,
}

impl Adam {
    pub fn new(shape: [usize; 4], learning_rate: f32) -> Self {
        Self::with_hyperparameters(shape, learning_rate, DEFAULT_BETA1, DEFAULT_BETA2, DEFAULT_EPSILON)
    }

    pub fn with_hyperparameters(
        shape: [usize; 4],
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    ) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            beta1_t: 1.0,
            beta2_t: 1.0,
            m: Array4::zeros(shape),
            v: Array4::zeros(shape),
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Applies one update to `params` given the gradient of the loss.
    ///
    /// `p -= lr * m̂ / (sqrt(v̂) + eps)` with `m̂ = m / (1 - β1ᵗ)` and
    /// `v̂ = v / (1 - β2ᵗ)`.
    pub fn step(&mut self, params: &mut Array4<f32>, grad: &Array4<f32>) -> Result<(), Error> {
        if params.shape() != self.m.shape() {
            return Err(shape_mismatch("optimized image", self.m.shape(), params.shape()));
        }
        if grad.shape() != self.m.shape() {
            return Err(shape_mismatch("image gradient", self.m.shape(), grad.shape()));
        }

        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let bc1 = 1.0 - self.beta1_t;
        let bc2_sqrt = (1.0 - self.beta2_t).sqrt();
        let step_size = lr / bc1;

        Zip::from(params)
            .and(grad)
            .and(&mut self.m)
            .and(&mut self.v)
            .for_each(|p, g, m, v| {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                *p -= step_size * *m / (v.sqrt() / bc2_sqrt + eps);
            });

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_step_moves_by_learning_rate() {
        // with bias correction the first step is lr * sign(g) (up to eps)
        let mut adam = Adam::new([1, 1, 1, 3], 0.1);
        let mut p = Array4::from_elem((1, 1, 1, 3), 0.5);
        let g = Array4::from_shape_vec((1, 1, 1, 3), vec![2.0, -0.001, 0.0]).unwrap();

        adam.step(&mut p, &g).unwrap();

        assert!((p[[0, 0, 0, 0]] - 0.4).abs() < 1e-5);
        assert!((p[[0, 0, 0, 1]] - 0.6).abs() < 1e-4);
        assert_eq!(p[[0, 0, 0, 2]], 0.5);
    }

    #[test]
    fn minimizes_a_quadratic() {
        let target = Array4::from_shape_vec((1, 1, 2, 2), vec![0.2, 0.8, -0.3, 1.5]).unwrap();
        let mut p = Array4::zeros((1, 1, 2, 2));
        let mut adam = Adam::new([1, 1, 2, 2], 0.05);

        for _ in 0..2000 {
            let grad = (&p - &target) * 2.0;
            adam.step(&mut p, &grad).unwrap();
        }

        for (p, t) in p.iter().zip(target.iter()) {
            assert!((p - t).abs() < 1e-2, "{} vs {}", p, t);
        }
    }

    #[test]
    fn rejects_other_shapes() {
        let mut adam = Adam::new([1, 3, 2, 2], 0.1);
        let mut p = Array4::zeros((1, 3, 2, 2));
        let g = Array4::zeros((1, 3, 2, 3));

        assert!(matches!(adam.step(&mut p, &g), Err(Error::ShapeMismatch(_))));
    }
}
