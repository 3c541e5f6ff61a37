//! Content and style loss terms.
//!
//! A loss term captures its target once, as an owned copy, and never changes
//! it afterwards. Evaluating a term doesn't store anything: the values of a
//! whole forward pass are collected into a [`LossRecord`].

use ndarray::{Array2, Array4, ArrayView, Dimension, Zip};

use crate::{
    gram::{gram_backward, gram_threaded},
    layers::shape_mismatch,
    Error,
};

/// Compares an activation against the content image's activation of the
/// same layer.
#[derive(Clone, Debug)]
pub struct ContentLoss {
    target: Array4<f32>,
}

impl ContentLoss {
    pub fn new(activation: &Array4<f32>) -> Self {
        Self {
            target: activation.to_owned(),
        }
    }

    pub fn target(&self) -> &Array4<f32> {
        &self.target
    }

    /// Mean squared error between `x` and the captured activation
    pub fn evaluate(&self, x: &Array4<f32>) -> Result<f32, Error> {
        self.check(x)?;
        Ok(mse(x.view(), self.target.view()))
    }

    pub(crate) fn loss_and_gradient(&self, x: &Array4<f32>) -> Result<(f32, Array4<f32>), Error> {
        self.check(x)?;

        let n = x.len().max(1) as f32;
        let grad = Zip::from(x)
            .and(&self.target)
            .map_collect(|x, t| 2.0 * (x - t) / n);

        Ok((mse(x.view(), self.target.view()), grad))
    }

    fn check(&self, x: &Array4<f32>) -> Result<(), Error> {
        if x.shape() != self.target.shape() {
            return Err(shape_mismatch(
                "content loss input",
                self.target.shape(),
                x.shape(),
            ));
        }

        Ok(())
    }
}

/// Compares the Gram matrix of an activation against the Gram matrix of the
/// style image's activation of the same layer.
#[derive(Clone, Debug)]
pub struct StyleLoss {
    target: Array2<f32>,
}

impl StyleLoss {
    pub fn new(activation: &Array4<f32>) -> Self {
        Self::with_threads(activation, 1)
    }

    pub(crate) fn with_threads(activation: &Array4<f32>, max_threads: usize) -> Self {
        Self {
            target: gram_threaded(activation, max_threads),
        }
    }

    /// The captured Gram matrix
    pub fn target(&self) -> &Array2<f32> {
        &self.target
    }

    /// Mean squared error between the Gram matrix of `x` and the captured one
    pub fn evaluate(&self, x: &Array4<f32>) -> Result<f32, Error> {
        self.evaluate_threaded(x, 1)
    }

    pub(crate) fn evaluate_threaded(&self, x: &Array4<f32>, max_threads: usize) -> Result<f32, Error> {
        let g = self.gram_of(x, max_threads)?;
        Ok(mse(g.view(), self.target.view()))
    }

    pub(crate) fn loss_and_gradient(
        &self,
        x: &Array4<f32>,
        max_threads: usize,
    ) -> Result<(f32, Array4<f32>), Error> {
        let g = self.gram_of(x, max_threads)?;

        let n = g.len().max(1) as f32;
        let d_gram = Zip::from(&g)
            .and(&self.target)
            .map_collect(|g, t| 2.0 * (g - t) / n);

        Ok((
            mse(g.view(), self.target.view()),
            gram_backward(x, &d_gram, max_threads),
        ))
    }

    fn gram_of(&self, x: &Array4<f32>, max_threads: usize) -> Result<Array2<f32>, Error> {
        let features = x.shape()[0] * x.shape()[1];
        if features != self.target.nrows() {
            return Err(shape_mismatch(
                "style loss input",
                &[1, self.target.nrows(), x.shape()[2], x.shape()[3]],
                x.shape(),
            ));
        }

        Ok(gram_threaded(x, max_threads))
    }
}

/// A loss observer spliced into a truncated model
#[derive(Clone, Debug)]
pub enum LossTerm {
    Content(ContentLoss),
    Style(StyleLoss),
}

impl LossTerm {
    pub fn is_content(&self) -> bool {
        matches!(self, Self::Content(_))
    }

    pub fn is_style(&self) -> bool {
        matches!(self, Self::Style(_))
    }
}

/// How strongly each loss category pulls on the image
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LossWeights {
    pub content: f32,
    pub style: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            content: 100.0,
            style: 1e6,
        }
    }
}

/// The loss values of one forward pass, in the order their observers appear
/// in the model
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LossRecord {
    pub content: Vec<f32>,
    pub style: Vec<f32>,
}

impl LossRecord {
    pub fn content_total(&self) -> f32 {
        self.content.iter().sum()
    }

    pub fn style_total(&self) -> f32 {
        self.style.iter().sum()
    }

    /// `style_weight * style_total + content_weight * content_total`
    pub fn weighted_total(&self, weights: LossWeights) -> f32 {
        weights.style * self.style_total() + weights.content * self.content_total()
    }

    pub fn is_finite(&self) -> bool {
        self.content.iter().chain(self.style.iter()).all(|l| l.is_finite())
    }
}

fn mse<D: Dimension>(a: ArrayView<'_, f32, D>, b: ArrayView<'_, f32, D>) -> f32 {
    let sum = Zip::from(&a)
        .and(&b)
        .fold(0f64, |acc, a, b| acc + f64::from(a - b).powi(2));

    (sum / a.len().max(1) as f64) as f32
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gram::gram;

    fn activation(seed: usize) -> Array4<f32> {
        Array4::from_shape_fn((1, 3, 4, 4), |(_, c, y, x)| {
            ((seed + c * 5 + y * 3 + x) % 7) as f32 / 7.0
        })
    }

    #[test]
    fn content_loss_is_mse() {
        let target = Array4::zeros((1, 2, 2, 2));
        let loss = ContentLoss::new(&target);

        let x = Array4::from_elem((1, 2, 2, 2), 2.0);
        assert!((loss.evaluate(&x).unwrap() - 4.0).abs() < 1e-6);

        let (value, grad) = loss.loss_and_gradient(&x).unwrap();
        assert!((value - 4.0).abs() < 1e-6);
        assert!(grad.iter().all(|g| (g - 0.5).abs() < 1e-6));
    }

    #[test]
    fn zero_at_target() {
        let act = activation(1);
        assert_eq!(ContentLoss::new(&act).evaluate(&act).unwrap(), 0.0);
        assert_eq!(StyleLoss::new(&act).evaluate(&act).unwrap(), 0.0);
    }

    #[test]
    fn target_is_a_copy() {
        let mut act = activation(2);
        let content = ContentLoss::new(&act);
        let style = StyleLoss::new(&act);
        let expected_gram = gram(&act);

        act.fill(100.0);

        assert_eq!(content.target(), &activation(2));
        assert_eq!(style.target(), &expected_gram);
    }

    #[test]
    fn style_loss_compares_grams() {
        let style = StyleLoss::new(&activation(0));
        let x = activation(3);

        let expected = mse(gram(&x).view(), gram(&activation(0)).view());
        assert!((style.evaluate(&x).unwrap() - expected).abs() < 1e-7);

        // the spatial size doesn't have to match, only the channel count
        let bigger = Array4::from_elem((1, 3, 8, 6), 0.5);
        assert!(style.evaluate(&bigger).is_ok());
        assert!(style.evaluate(&Array4::zeros((1, 4, 4, 4))).is_err());
    }

    #[test]
    fn content_shape_mismatch() {
        let content = ContentLoss::new(&activation(0));
        assert!(matches!(
            content.evaluate(&Array4::zeros((1, 3, 4, 5))),
            Err(Error::ShapeMismatch(_))
        ));
    }

    #[test]
    fn style_gradient_matches_finite_difference() {
        let style = StyleLoss::new(&activation(0));
        let x = activation(4);
        let (_, grad) = style.loss_and_gradient(&x, 1).unwrap();

        let dir = Array4::from_shape_fn(x.raw_dim(), |(_, c, y, xx)| ((c * 2 + y + xx) % 3) as f32 - 1.0);
        let eps = 1e-2;
        let plus = style.evaluate(&(&x + &(&dir * eps))).unwrap();
        let minus = style.evaluate(&(&x - &(&dir * eps))).unwrap();
        let numeric = (plus - minus) / (2.0 * eps);
        let analytic = (&grad * &dir).sum();

        assert!(
            (numeric - analytic).abs() < 0.05 * analytic.abs() + 1e-5,
            "{} vs {}",
            numeric,
            analytic
        );
    }

    #[test]
    fn weighted_totals() {
        let record = LossRecord {
            content: vec![1.0, 2.0],
            style: vec![0.5, 0.25, 0.25],
        };

        assert_eq!(record.content_total(), 3.0);
        assert_eq!(record.style_total(), 1.0);
        assert_eq!(
            record.weighted_total(LossWeights {
                content: 2.0,
                style: 10.0
            }),
            16.0
        );
        assert!(record.is_finite());

        let diverged = LossRecord {
            content: vec![f32::NAN],
            style: vec![],
        };
        assert!(!diverged.is_finite());
    }
}
