//! The frozen layers a feature network is made of.
//!
//! Every layer is a pure function of its input: `forward` always allocates a
//! fresh output and never writes through or aliases the input, so any layer
//! can be followed by a loss observer that keeps reading that output while
//! gradients are propagated. `backward` only produces the gradient with
//! respect to the layer input, the layer parameters are never trained.

use ndarray::{s, Array1, Array2, Array4, ArrayView2, ArrayView3, ArrayViewMut3, Axis, Zip};

use crate::{errors::ShapeMismatch, parallel, Error};

/// The role a layer plays, used to give it a semantic name.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Convolution,
    Activation,
    Pooling,
    Normalization,
}

/// A 2D convolution with a square kernel.
#[derive(Clone, Debug)]
pub struct Conv2d {
    /// The kernel flattened to `[out_channels, in_channels * k * k]`
    weights: Array2<f32>,
    bias: Array1<f32>,
    in_channels: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
}

impl Conv2d {
    /// Creates a convolution from a `[out, in, k, k]` kernel and a bias with
    /// one entry per output channel.
    pub fn new(
        weight: Array4<f32>,
        bias: Array1<f32>,
        stride: usize,
        padding: usize,
    ) -> Result<Self, Error> {
        let (out_channels, in_channels, kh, kw) = weight.dim();

        if kh != kw || kh == 0 {
            return Err(shape_mismatch(
                "convolution kernel",
                &[out_channels, in_channels, kh, kh.max(1)],
                weight.shape(),
            ));
        }

        if bias.len() != out_channels {
            return Err(shape_mismatch("convolution bias", &[out_channels], bias.shape()));
        }

        if stride == 0 {
            return Err(Error::InvalidRange(crate::errors::InvalidRange {
                min: 1.0,
                max: f32::MAX,
                value: 0.0,
                name: "stride",
            }));
        }

        let taps = kh * kw;
        let weights = Array2::from_shape_fn((out_channels, in_channels * taps), |(o, i)| {
            weight[[o, i / taps, (i % taps) / kw, i % kw]]
        });

        Ok(Self {
            weights,
            bias,
            in_channels,
            kernel_size: kh,
            stride,
            padding,
        })
    }

    /// Builds a convolution from a kernel that is already flattened to
    /// `[out_channels, in_channels * k * k]`
    pub(crate) fn from_matrix(
        weights: Array2<f32>,
        bias: Array1<f32>,
        kernel_size: usize,
        padding: usize,
    ) -> Self {
        let kernel_size = kernel_size.max(1);
        Self {
            in_channels: weights.ncols() / (kernel_size * kernel_size),
            weights,
            bias,
            kernel_size,
            stride: 1,
            padding,
        }
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.weights.nrows()
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    fn output_dims(&self, input: &[usize]) -> Result<(usize, usize), Error> {
        let (h, w) = (input[2], input[3]);
        let k = self.kernel_size;

        if input[1] != self.in_channels || h + 2 * self.padding < k || w + 2 * self.padding < k {
            return Err(shape_mismatch(
                "convolution input",
                &[input[0], self.in_channels, h.max(k), w.max(k)],
                input,
            ));
        }

        Ok((
            (h + 2 * self.padding - k) / self.stride + 1,
            (w + 2 * self.padding - k) / self.stride + 1,
        ))
    }

    fn forward(&self, x: &Array4<f32>, max_threads: usize) -> Result<Array4<f32>, Error> {
        let (oh, ow) = self.output_dims(x.shape())?;
        let mut out = Array4::zeros((x.len_of(Axis(0)), self.out_channels(), oh, ow));

        for (item, mut out_item) in x.outer_iter().zip(out.outer_iter_mut()) {
            let cols = self.im2col(item, oh, ow);
            let mut res = parallel::dot(self.weights.view(), cols.view(), max_threads);

            for (mut row, b) in res.outer_iter_mut().zip(self.bias.iter()) {
                row += *b;
            }

            // [out, oh * ow] and [out, oh, ow] share the same logical order
            for (dst, src) in out_item.iter_mut().zip(res.iter()) {
                *dst = *src;
            }
        }

        Ok(out)
    }

    fn backward(&self, input: &Array4<f32>, grad: &Array4<f32>, max_threads: usize) -> Array4<f32> {
        let (_, _, h, w) = input.dim();
        let (_, _, oh, ow) = grad.dim();
        let mut grad_input = Array4::zeros(input.raw_dim());

        for (g_item, mut gi_item) in grad.outer_iter().zip(grad_input.outer_iter_mut()) {
            let g_mat = Array2::from_shape_fn((self.out_channels(), oh * ow), |(c, i)| {
                g_item[[c, i / ow, i % ow]]
            });

            let cols = parallel::dot(self.weights.t(), g_mat.view(), max_threads);
            self.col2im(&cols, &mut gi_item, (h, w), (oh, ow));
        }

        grad_input
    }

    /// Unfolds every receptive field of `x` into a column, so the convolution
    /// becomes a single matrix product.
    fn im2col(&self, x: ArrayView3<'_, f32>, oh: usize, ow: usize) -> Array2<f32> {
        let (channels, h, w) = x.dim();
        let k = self.kernel_size;
        let mut cols = Array2::zeros((channels * k * k, oh * ow));

        for c in 0..channels {
            for ky in 0..k {
                for kx in 0..k {
                    let mut dst = cols.row_mut((c * k + ky) * k + kx);

                    for oy in 0..oh {
                        let iy = match self.source_index(oy, ky, h) {
                            Some(iy) => iy,
                            None => continue,
                        };

                        for ox in 0..ow {
                            if let Some(ix) = self.source_index(ox, kx, w) {
                                dst[oy * ow + ox] = x[[c, iy, ix]];
                            }
                        }
                    }
                }
            }
        }

        cols
    }

    fn col2im(
        &self,
        cols: &Array2<f32>,
        out: &mut ArrayViewMut3<'_, f32>,
        (h, w): (usize, usize),
        (oh, ow): (usize, usize),
    ) {
        let k = self.kernel_size;

        for c in 0..self.in_channels {
            for ky in 0..k {
                for kx in 0..k {
                    let src = cols.row((c * k + ky) * k + kx);

                    for oy in 0..oh {
                        let iy = match self.source_index(oy, ky, h) {
                            Some(iy) => iy,
                            None => continue,
                        };

                        for ox in 0..ow {
                            if let Some(ix) = self.source_index(ox, kx, w) {
                                out[[c, iy, ix]] += src[oy * ow + ox];
                            }
                        }
                    }
                }
            }
        }
    }

    /// Maps an output coordinate and kernel tap back into the input, `None`
    /// when it lands in the zero padding.
    #[inline]
    fn source_index(&self, out: usize, tap: usize, len: usize) -> Option<usize> {
        let pos = out * self.stride + tap;
        if pos < self.padding || pos - self.padding >= len {
            None
        } else {
            Some(pos - self.padding)
        }
    }
}

/// Max pooling without padding, windows that would run past the edge are
/// dropped.
#[derive(Clone, Copy, Debug)]
pub struct MaxPool2d {
    kernel_size: usize,
    stride: usize,
}

impl MaxPool2d {
    pub fn new(kernel_size: usize, stride: usize) -> Self {
        Self {
            kernel_size: kernel_size.max(1),
            stride: stride.max(1),
        }
    }

    fn output_dims(&self, input: &[usize]) -> Result<(usize, usize), Error> {
        let (h, w) = (input[2], input[3]);
        let k = self.kernel_size;

        if h < k || w < k {
            return Err(shape_mismatch(
                "pooling input",
                &[input[0], input[1], h.max(k), w.max(k)],
                input,
            ));
        }

        Ok(((h - k) / self.stride + 1, (w - k) / self.stride + 1))
    }

    /// Index of the first maximum in the window starting at `(y0, x0)`.
    fn argmax(&self, plane: ArrayView2<'_, f32>, y0: usize, x0: usize) -> (usize, usize) {
        let mut best = (y0, x0);
        let mut best_val = plane[[y0, x0]];

        for y in y0..y0 + self.kernel_size {
            for x in x0..x0 + self.kernel_size {
                if plane[[y, x]] > best_val {
                    best_val = plane[[y, x]];
                    best = (y, x);
                }
            }
        }

        best
    }

    fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, Error> {
        let (oh, ow) = self.output_dims(x.shape())?;
        let (n, c, _, _) = x.dim();
        let mut out = Array4::zeros((n, c, oh, ow));

        for b in 0..n {
            for ch in 0..c {
                let src = x.slice(s![b, ch, .., ..]);
                let mut dst = out.slice_mut(s![b, ch, .., ..]);

                for oy in 0..oh {
                    for ox in 0..ow {
                        let (y, x) = self.argmax(src, oy * self.stride, ox * self.stride);
                        dst[[oy, ox]] = src[[y, x]];
                    }
                }
            }
        }

        Ok(out)
    }

    fn backward(&self, input: &Array4<f32>, grad: &Array4<f32>) -> Array4<f32> {
        let (n, c, oh, ow) = grad.dim();
        let mut grad_input = Array4::zeros(input.raw_dim());

        for b in 0..n {
            for ch in 0..c {
                let src = input.slice(s![b, ch, .., ..]);
                let g = grad.slice(s![b, ch, .., ..]);
                let mut dst = grad_input.slice_mut(s![b, ch, .., ..]);

                for oy in 0..oh {
                    for ox in 0..ow {
                        let (y, x) = self.argmax(src, oy * self.stride, ox * self.stride);
                        dst[[y, x]] += g[[oy, ox]];
                    }
                }
            }
        }

        grad_input
    }
}

/// Batch normalization in inference mode, folded into a per-channel scale
/// and shift.
#[derive(Clone, Debug)]
pub struct BatchNorm2d {
    scale: Array1<f32>,
    shift: Array1<f32>,
}

impl BatchNorm2d {
    pub fn new(
        running_mean: Array1<f32>,
        running_var: Array1<f32>,
        gamma: Array1<f32>,
        beta: Array1<f32>,
        eps: f32,
    ) -> Result<Self, Error> {
        let channels = running_mean.len();
        if running_var.len() != channels {
            return Err(shape_mismatch("batch norm variance", &[channels], running_var.shape()));
        }
        if gamma.len() != channels {
            return Err(shape_mismatch("batch norm gamma", &[channels], gamma.shape()));
        }
        if beta.len() != channels {
            return Err(shape_mismatch("batch norm beta", &[channels], beta.shape()));
        }

        let scale = Zip::from(&gamma)
            .and(&running_var)
            .map_collect(|g, v| g / (v + eps).sqrt());
        let shift = Zip::from(&beta)
            .and(&running_mean)
            .and(&scale)
            .map_collect(|b, m, s| b - m * s);

        Ok(Self { scale, shift })
    }

    pub fn channels(&self) -> usize {
        self.scale.len()
    }

    fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, Error> {
        check_channels("batch norm input", x, self.channels())?;

        let mut out = x.to_owned();
        for (c, mut plane) in out.axis_iter_mut(Axis(1)).enumerate() {
            let (s, b) = (self.scale[c], self.shift[c]);
            plane.mapv_inplace(|v| v * s + b);
        }

        Ok(out)
    }

    fn backward(&self, grad: &Array4<f32>) -> Array4<f32> {
        let mut out = grad.to_owned();
        for (c, mut plane) in out.axis_iter_mut(Axis(1)).enumerate() {
            let s = self.scale[c];
            plane.mapv_inplace(|v| v * s);
        }

        out
    }
}

/// A single layer of a feature network.
#[derive(Clone, Debug)]
pub enum Layer {
    Conv2d(Conv2d),
    /// A rectified linear unit. It never operates in place.
    Relu,
    MaxPool2d(MaxPool2d),
    BatchNorm2d(BatchNorm2d),
}

impl Layer {
    pub fn kind(&self) -> LayerKind {
        match self {
            Self::Conv2d(_) => LayerKind::Convolution,
            Self::Relu => LayerKind::Activation,
            Self::MaxPool2d(_) => LayerKind::Pooling,
            Self::BatchNorm2d(_) => LayerKind::Normalization,
        }
    }

    /// Evaluates the layer on `x`, `max_threads` bounds the workers used by
    /// convolutions.
    pub fn forward(&self, x: &Array4<f32>, max_threads: usize) -> Result<Array4<f32>, Error> {
        match self {
            Self::Conv2d(conv) => conv.forward(x, max_threads),
            Self::Relu => Ok(x.mapv(|v| v.max(0.0))),
            Self::MaxPool2d(pool) => pool.forward(x),
            Self::BatchNorm2d(bn) => bn.forward(x),
        }
    }

    /// Propagates `grad` (the gradient with respect to this layer's output)
    /// back to the layer's `input`.
    pub fn backward(&self, input: &Array4<f32>, grad: &Array4<f32>, max_threads: usize) -> Array4<f32> {
        match self {
            Self::Conv2d(conv) => conv.backward(input, grad, max_threads),
            Self::Relu => Zip::from(input)
                .and(grad)
                .map_collect(|x, g| if *x > 0.0 { *g } else { 0.0 }),
            Self::MaxPool2d(pool) => pool.backward(input, grad),
            Self::BatchNorm2d(bn) => bn.backward(grad),
        }
    }
}

pub(crate) fn shape_mismatch(what: &'static str, expected: &[usize], actual: &[usize]) -> Error {
    Error::ShapeMismatch(ShapeMismatch {
        what,
        expected: expected.to_vec(),
        actual: actual.to_vec(),
    })
}

pub(crate) fn check_channels(what: &'static str, x: &Array4<f32>, channels: usize) -> Result<(), Error> {
    let shape = x.shape();
    if shape[1] != channels {
        return Err(shape_mismatch(
            what,
            &[shape[0], channels, shape[2], shape[3]],
            shape,
        ));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::{arr1, Array};

    fn ramp(shape: (usize, usize, usize, usize)) -> Array4<f32> {
        Array::from_shape_fn(shape, |(n, c, y, x)| {
            ((n * 31 + c * 17 + y * 5 + x * 3) % 13) as f32 / 13.0 - 0.4
        })
    }

    fn inner(a: &Array4<f32>, b: &Array4<f32>) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn identity_kernel_adds_bias() {
        let mut weight = Array4::zeros((2, 2, 3, 3));
        weight[[0, 0, 1, 1]] = 1.0;
        weight[[1, 1, 1, 1]] = 2.0;
        let conv = Conv2d::new(weight, arr1(&[0.5, -1.0]), 1, 1).unwrap();

        let x = ramp((1, 2, 4, 5));
        let y = Layer::Conv2d(conv).forward(&x, 1).unwrap();

        assert_eq!(y.shape(), &[1, 2, 4, 5]);
        for ((_, c, yy, xx), v) in y.indexed_iter() {
            let expected = if c == 0 {
                x[[0, 0, yy, xx]] + 0.5
            } else {
                2.0 * x[[0, 1, yy, xx]] - 1.0
            };
            assert!((v - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn strided_output_dims() {
        let conv = Conv2d::new(Array4::zeros((4, 3, 3, 3)), Array1::zeros(4), 2, 1).unwrap();
        let y = conv.forward(&ramp((1, 3, 9, 8)), 1).unwrap();

        assert_eq!(y.shape(), &[1, 4, 5, 4]);
    }

    #[test]
    fn conv_backward_is_adjoint() {
        // without bias the convolution is linear, so <Ax, g> == <x, A^T g>
        let weight = ramp((3, 2, 3, 3));
        let conv = Conv2d::new(weight, Array1::zeros(3), 1, 1).unwrap();

        let x = ramp((1, 2, 6, 7));
        let y = conv.forward(&x, 2).unwrap();
        let g = y.mapv(|v| (v * 3.0).sin());

        let gx = conv.backward(&x, &g, 2);

        let lhs = inner(&y, &g);
        let rhs = inner(&x, &gx);
        assert!((lhs - rhs).abs() < 1e-3 * lhs.abs().max(1.0), "{} vs {}", lhs, rhs);
    }

    #[test]
    fn rejects_wrong_channel_count() {
        let conv = Conv2d::new(Array4::zeros((4, 3, 3, 3)), Array1::zeros(4), 1, 1).unwrap();
        assert!(matches!(
            conv.forward(&ramp((1, 2, 8, 8)), 1),
            Err(Error::ShapeMismatch(_))
        ));
    }

    #[test]
    fn rejects_bias_mismatch() {
        assert!(Conv2d::new(Array4::zeros((4, 3, 3, 3)), Array1::zeros(3), 1, 1).is_err());
    }

    #[test]
    fn relu_leaves_input_untouched() {
        let x = ramp((1, 2, 3, 3));
        let before = x.clone();
        let y = Layer::Relu.forward(&x, 1).unwrap();

        assert_eq!(x, before);
        assert!(y.iter().all(|v| *v >= 0.0));

        let g = Array4::from_elem(x.raw_dim(), 1.0);
        let gx = Layer::Relu.backward(&x, &g, 1);
        for (xi, gi) in x.iter().zip(gx.iter()) {
            assert_eq!(*gi, if *xi > 0.0 { 1.0 } else { 0.0 });
        }
    }

    #[test]
    fn max_pool_routes_gradient_to_max() {
        let mut x = Array4::zeros((1, 1, 4, 4));
        x[[0, 0, 1, 0]] = 5.0;
        x[[0, 0, 2, 3]] = 7.0;
        let pool = Layer::MaxPool2d(MaxPool2d::new(2, 2));

        let y = pool.forward(&x, 1).unwrap();
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        assert_eq!(y[[0, 0, 0, 0]], 5.0);
        assert_eq!(y[[0, 0, 1, 1]], 7.0);

        let g = Array4::from_elem(y.raw_dim(), 1.0);
        let gx = pool.backward(&x, &g, 1);
        assert_eq!(gx[[0, 0, 1, 0]], 1.0);
        assert_eq!(gx[[0, 0, 2, 3]], 1.0);
        // ties on an all zero window go to the first element
        assert_eq!(gx[[0, 0, 0, 2]], 1.0);
        assert_eq!(gx.sum(), 4.0);
    }

    #[test]
    fn pool_drops_partial_windows() {
        let y = MaxPool2d::new(2, 2).forward(&ramp((1, 3, 5, 7))).unwrap();
        assert_eq!(y.shape(), &[1, 3, 2, 3]);
    }

    #[test]
    fn batch_norm_folds_statistics() {
        let bn = BatchNorm2d::new(
            arr1(&[1.0, -1.0]),
            arr1(&[4.0, 0.25]),
            arr1(&[2.0, 1.0]),
            arr1(&[0.0, 3.0]),
            0.0,
        )
        .unwrap();

        let x = Array4::from_elem((1, 2, 1, 1), 3.0);
        let y = Layer::BatchNorm2d(bn.clone()).forward(&x, 1).unwrap();

        assert!((y[[0, 0, 0, 0]] - 2.0).abs() < 1e-6);
        assert!((y[[0, 1, 0, 0]] - 11.0).abs() < 1e-6);

        let g = bn.backward(&Array4::from_elem((1, 2, 1, 1), 1.0));
        assert!((g[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((g[[0, 1, 0, 0]] - 2.0).abs() < 1e-6);
    }
}
