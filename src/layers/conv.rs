use rand::Rng;
use serde::{Serialize, Deserialize};

use crate::error::{Error, Result};
use crate::math::{matrix::Matrix, param::Param, tensor::Tensor};

/// 2-D convolution over a `C x H x W` feature map with zero padding.
///
/// Weights are laid out as `[out][in][ky][kx]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2d {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    pub weights: Param,
    pub bias: Option<Param>,
}

impl Conv2d {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        bias: bool,
        rng: &mut R,
    ) -> Conv2d {
        let fan_in = in_channels * kernel * kernel;
        Conv2d {
            in_channels,
            out_channels,
            kernel,
            stride: stride.max(1),
            padding,
            weights: Matrix::he(out_channels, fan_in, rng).into(),
            bias: bias.then(|| Param::zeros(out_channels)),
        }
    }

    pub fn output_shape(&self, shape: (usize, usize, usize)) -> Result<(usize, usize, usize)> {
        let (c, h, w) = shape;
        if c != self.in_channels {
            return Err(Error::shape(
                format!("{} input channels", self.in_channels),
                format!("{} channels", c),
            ));
        }
        let (ph, pw) = (h + 2 * self.padding, w + 2 * self.padding);
        if ph < self.kernel || pw < self.kernel {
            return Err(Error::shape(
                format!("padded map of at least {0}x{0}", self.kernel),
                format!("{}x{}", ph, pw),
            ));
        }
        Ok((
            self.out_channels,
            (ph - self.kernel) / self.stride + 1,
            (pw - self.kernel) / self.stride + 1,
        ))
    }

    /// Output spatial size; the input shape is validated by `output_shape`
    /// when the owning model is built.
    fn spatial_out(&self, h: usize, w: usize) -> (usize, usize) {
        let ph = (h + 2 * self.padding).saturating_sub(self.kernel);
        let pw = (w + 2 * self.padding).saturating_sub(self.kernel);
        (ph / self.stride + 1, pw / self.stride + 1)
    }

    pub fn forward(&self, input: &Tensor) -> Tensor {
        let (out_h, out_w) = self.spatial_out(input.height, input.width);
        let geometry = Geometry::of(self);
        let mut out = Tensor::zeros(self.out_channels, out_h, out_w);

        for oc in 0..self.out_channels {
            let b = self.bias.as_ref().map_or(0.0, |b| b.data[oc]);
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut acc = b;
                    for ic in 0..self.in_channels {
                        for ky in 0..self.kernel {
                            let Some(iy) = geometry.source(oy, ky, input.height) else { continue };
                            for kx in 0..self.kernel {
                                let Some(ix) = geometry.source(ox, kx, input.width) else { continue };
                                acc += input.get(ic, iy, ix)
                                    * self.weights.data[geometry.weight_index(oc, ic, ky, kx)];
                            }
                        }
                    }
                    out.set(oc, oy, ox, acc);
                }
            }
        }
        out
    }

    /// Accumulates weight/bias gradients and returns `dL/dinput`.
    pub fn backward(&mut self, input: &Tensor, grad_out: &Tensor) -> Tensor {
        let mut grad_in = Tensor::zeros(input.channels, input.height, input.width);
        let geometry = Geometry::of(self);

        if let Some(bias) = self.bias.as_mut() {
            let bg = bias.grad_mut();
            for oc in 0..grad_out.channels {
                bg[oc] += grad_out.plane(oc).iter().sum::<f64>();
            }
        }

        let (weights, wg) = self.weights.value_and_grad_mut();
        for oc in 0..grad_out.channels {
            for oy in 0..grad_out.height {
                for ox in 0..grad_out.width {
                    let g = grad_out.get(oc, oy, ox);
                    if g == 0.0 {
                        continue;
                    }
                    for ic in 0..geometry.in_channels {
                        for ky in 0..geometry.kernel {
                            let Some(iy) = geometry.source(oy, ky, input.height) else { continue };
                            for kx in 0..geometry.kernel {
                                let Some(ix) = geometry.source(ox, kx, input.width) else { continue };
                                let wi = geometry.weight_index(oc, ic, ky, kx);
                                wg[wi] += g * input.get(ic, iy, ix);
                                let ii = grad_in.index(ic, iy, ix);
                                grad_in.data[ii] += g * weights[wi];
                            }
                        }
                    }
                }
            }
        }
        grad_in
    }
}

/// Copy of the kernel geometry so index math does not borrow the layer.
#[derive(Clone, Copy)]
struct Geometry {
    in_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
}

impl Geometry {
    fn of(conv: &Conv2d) -> Geometry {
        Geometry {
            in_channels: conv.in_channels,
            kernel: conv.kernel,
            stride: conv.stride,
            padding: conv.padding,
        }
    }

    #[inline]
    fn weight_index(&self, oc: usize, ic: usize, ky: usize, kx: usize) -> usize {
        ((oc * self.in_channels + ic) * self.kernel + ky) * self.kernel + kx
    }

    /// Maps an output coordinate and kernel offset to an input coordinate,
    /// or `None` when it falls in the zero padding.
    #[inline]
    fn source(&self, out: usize, k: usize, limit: usize) -> Option<usize> {
        let pos = (out * self.stride + k) as isize - self.padding as isize;
        if pos >= 0 && (pos as usize) < limit {
            Some(pos as usize)
        } else {
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    pub(crate) fn random_tensor(c: usize, h: usize, w: usize, seed: u64) -> Tensor {
        let mut rng = StdRng::seed_from_u64(seed);
        Tensor::from_data(c, h, w, (0..c * h * w).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .unwrap()
    }

    /// Scalar objective used by the gradient checks: sum(y * upstream).
    pub(crate) fn weighted_loss(y: &Tensor, upstream: &Tensor) -> f64 {
        y.data.iter().zip(upstream.data.iter()).map(|(a, b)| a * b).sum()
    }

    #[test]
    fn test_output_shape_with_padding_and_stride() {
        let mut rng = StdRng::seed_from_u64(1);
        let conv = Conv2d::new(3, 4, 3, 2, 1, true, &mut rng);
        assert_eq!(conv.output_shape((3, 8, 8)).unwrap(), (4, 4, 4));
        assert!(conv.output_shape((2, 8, 8)).is_err());
    }

    #[test]
    fn test_identity_kernel_copies_input() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut conv = Conv2d::new(1, 1, 3, 1, 1, false, &mut rng);
        conv.weights.data = vec![0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        let x = random_tensor(1, 4, 5, 3);
        assert_eq!(conv.forward(&x), x);
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut conv = Conv2d::new(2, 3, 3, 2, 1, true, &mut rng);
        let x = random_tensor(2, 5, 5, 5);
        let y = conv.forward(&x);
        let upstream = random_tensor(y.channels, y.height, y.width, 9);

        let grad_in = conv.backward(&x, &upstream);
        let analytic_w = conv.weights.grad().to_vec();
        let eps = 1e-6;

        for i in [0, 7, 20, conv.weights.len() - 1] {
            let mut plus = conv.clone();
            plus.weights.data[i] += eps;
            let mut minus = conv.clone();
            minus.weights.data[i] -= eps;
            let numeric = (weighted_loss(&plus.forward(&x), &upstream)
                - weighted_loss(&minus.forward(&x), &upstream)) / (2.0 * eps);
            assert!((numeric - analytic_w[i]).abs() < 1e-6, "weight {}: {} vs {}", i, numeric, analytic_w[i]);
        }

        for i in [0, 12, 31, x.data.len() - 1] {
            let mut xp = x.clone();
            xp.data[i] += eps;
            let mut xm = x.clone();
            xm.data[i] -= eps;
            let numeric = (weighted_loss(&conv.forward(&xp), &upstream)
                - weighted_loss(&conv.forward(&xm), &upstream)) / (2.0 * eps);
            assert!((numeric - grad_in.data[i]).abs() < 1e-6, "input {}: {} vs {}", i, numeric, grad_in.data[i]);
        }

        let bias_grad = conv.bias.as_ref().unwrap().grad().to_vec();
        for oc in 0..3 {
            let expected: f64 = upstream.plane(oc).iter().sum();
            assert!((bias_grad[oc] - expected).abs() < 1e-12);
        }
    }
}
