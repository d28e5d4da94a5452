use serde::{Serialize, Deserialize};

use crate::error::{Error, Result};
use crate::math::{param::Param, tensor::Tensor};

/// Per-channel normalisation of a `C x H x W` map followed by a learned
/// scale (`gamma`) and shift (`beta`).
///
/// Samples are forwarded one at a time, so training statistics are taken
/// over the spatial positions of the current image. Eval mode uses the
/// running statistics instead. Those are folded in during `backward`, the
/// only pass with mutable access, from the statistics a training forward
/// recorded in its cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNorm2d {
    pub channels: usize,
    pub gamma: Param,
    pub beta: Param,
    pub running_mean: Vec<f64>,
    pub running_var: Vec<f64>,
    pub momentum: f64,
    pub eps: f64,
}

#[derive(Debug, Clone)]
pub struct BatchNormCache {
    normalized: Tensor,
    inv_std: Vec<f64>,
    /// Per-channel mean and biased variance of the input, present only when
    /// the forward pass normalised with them.
    batch_stats: Option<(Vec<f64>, Vec<f64>)>,
}

impl BatchNorm2d {
    pub fn new(channels: usize) -> BatchNorm2d {
        BatchNorm2d {
            channels,
            gamma: Param::new(vec![1.0; channels]),
            beta: Param::zeros(channels),
            running_mean: vec![0.0; channels],
            running_var: vec![1.0; channels],
            momentum: 0.1,
            eps: 1e-5,
        }
    }

    pub fn output_shape(&self, shape: (usize, usize, usize)) -> Result<(usize, usize, usize)> {
        if shape.0 != self.channels {
            return Err(Error::shape(
                format!("{} channels", self.channels),
                format!("{} channels", shape.0),
            ));
        }
        Ok(shape)
    }

    pub fn forward(&self, input: &Tensor, training: bool) -> (Tensor, BatchNormCache) {
        let area = input.area();
        let n = area.max(1) as f64;
        let mut normalized = Tensor::zeros(input.channels, input.height, input.width);
        let mut out = normalized.clone();
        let mut inv_std = Vec::with_capacity(input.channels);
        let (mut means, mut vars) = (Vec::new(), Vec::new());

        for c in 0..input.channels {
            let plane = input.plane(c);
            let (mean, var) = if training {
                let mean = plane.iter().sum::<f64>() / n;
                let var = plane.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
                means.push(mean);
                vars.push(var);
                (mean, var)
            } else {
                (self.running_mean[c], self.running_var[c])
            };
            let scale = 1.0 / (var + self.eps).sqrt();
            let (g, b) = (self.gamma.data[c], self.beta.data[c]);
            let range = c * area..(c + 1) * area;
            let targets = normalized.data[range.clone()].iter_mut().zip(out.data[range].iter_mut());
            for ((xhat, y), &x) in targets.zip(plane) {
                *xhat = (x - mean) * scale;
                *y = g * *xhat + b;
            }
            inv_std.push(scale);
        }

        let batch_stats = training.then_some((means, vars));
        (out, BatchNormCache { normalized, inv_std, batch_stats })
    }

    /// Accumulates `gamma`/`beta` gradients, updates the running statistics
    /// after a training forward, and returns `dL/dinput`.
    pub fn backward(&mut self, cache: &BatchNormCache, grad_out: &Tensor) -> Tensor {
        let area = grad_out.area();
        let n = area.max(1) as f64;
        let mut grad_in = Tensor::zeros(grad_out.channels, grad_out.height, grad_out.width);

        for c in 0..grad_out.channels {
            let range = c * area..(c + 1) * area;
            let dy = &grad_out.data[range.clone()];
            let xhat = &cache.normalized.data[range.clone()];
            let sum_dy: f64 = dy.iter().sum();
            let sum_dy_xhat: f64 = dy.iter().zip(xhat).map(|(d, x)| d * x).sum();
            self.gamma.grad_mut()[c] += sum_dy_xhat;
            self.beta.grad_mut()[c] += sum_dy;

            let scale = self.gamma.data[c] * cache.inv_std[c];
            let dx = &mut grad_in.data[range];
            if cache.batch_stats.is_some() {
                for ((g, d), x) in dx.iter_mut().zip(dy).zip(xhat) {
                    *g = scale * (d - sum_dy / n - x * sum_dy_xhat / n);
                }
            } else {
                for (g, d) in dx.iter_mut().zip(dy) {
                    *g = scale * d;
                }
            }
        }

        if let Some((means, vars)) = &cache.batch_stats {
            let unbiased = if area > 1 { n / (n - 1.0) } else { 1.0 };
            let m = self.momentum;
            for c in 0..self.channels {
                self.running_mean[c] = (1.0 - m) * self.running_mean[c] + m * means[c];
                self.running_var[c] = (1.0 - m) * self.running_var[c] + m * vars[c] * unbiased;
            }
        }
        grad_in
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.gamma, &mut self.beta]
    }

    /// Non-learnable state that still has to travel with the weights.
    pub fn buffers_mut(&mut self) -> Vec<&mut Vec<f64>> {
        vec![&mut self.running_mean, &mut self.running_var]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::conv::tests::{random_tensor, weighted_loss};

    fn shifted_layer() -> BatchNorm2d {
        let mut bn = BatchNorm2d::new(2);
        bn.gamma.data = vec![1.5, -0.7];
        bn.beta.data = vec![0.2, 0.3];
        bn
    }

    #[test]
    fn test_training_output_is_standardised_per_channel() {
        let bn = BatchNorm2d::new(3);
        let x = random_tensor(3, 4, 4, 2).map(|v| 5.0 * v + 2.0);
        let (y, _) = bn.forward(&x, true);
        for c in 0..3 {
            let plane = y.plane(c);
            let mean = plane.iter().sum::<f64>() / 16.0;
            let var = plane.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 16.0;
            assert!(mean.abs() < 1e-12);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_eval_uses_running_statistics() {
        let mut bn = BatchNorm2d::new(1);
        bn.running_mean = vec![2.0];
        bn.running_var = vec![4.0 - bn.eps];
        let x = Tensor::from_data(1, 1, 2, vec![2.0, 6.0]).unwrap();
        let (y, cache) = bn.forward(&x, false);
        assert!((y.data[0] - 0.0).abs() < 1e-12);
        assert!((y.data[1] - 2.0).abs() < 1e-12);

        let before = (bn.running_mean.clone(), bn.running_var.clone());
        bn.backward(&cache, &Tensor::from_data(1, 1, 2, vec![1.0, 1.0]).unwrap());
        assert_eq!((bn.running_mean.clone(), bn.running_var.clone()), before);
    }

    #[test]
    fn test_backward_moves_running_statistics_toward_batch() {
        let mut bn = BatchNorm2d::new(1);
        let x = Tensor::from_data(1, 1, 2, vec![1.0, 3.0]).unwrap();
        let (y, cache) = bn.forward(&x, true);
        bn.backward(&cache, &Tensor::zeros(1, 1, 2));
        assert_eq!(y.shape(), (1, 1, 2));
        assert!((bn.running_mean[0] - 0.2).abs() < 1e-12);
        // biased variance 1.0, unbiased 2.0
        assert!((bn.running_var[0] - (0.9 + 0.1 * 2.0)).abs() < 1e-12);
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let mut bn = shifted_layer();
        let x = random_tensor(2, 3, 4, 21);
        let (y, cache) = bn.forward(&x, true);
        let upstream = random_tensor(y.channels, y.height, y.width, 22);

        let grad_in = bn.backward(&cache, &upstream);
        let analytic_gamma = bn.gamma.grad().to_vec();
        let analytic_beta = bn.beta.grad().to_vec();
        let eps = 1e-6;
        let loss = |layer: &BatchNorm2d, input: &Tensor| weighted_loss(&layer.forward(input, true).0, &upstream);

        for i in 0..x.data.len() {
            let mut xp = x.clone();
            xp.data[i] += eps;
            let mut xm = x.clone();
            xm.data[i] -= eps;
            let numeric = (loss(&bn, &xp) - loss(&bn, &xm)) / (2.0 * eps);
            assert!((numeric - grad_in.data[i]).abs() < 1e-5, "input {}: {} vs {}", i, numeric, grad_in.data[i]);
        }

        for c in 0..2 {
            let mut plus = bn.clone();
            plus.gamma.data[c] += eps;
            let mut minus = bn.clone();
            minus.gamma.data[c] -= eps;
            let numeric = (loss(&plus, &x) - loss(&minus, &x)) / (2.0 * eps);
            assert!((numeric - analytic_gamma[c]).abs() < 1e-6, "gamma {}", c);

            let mut plus = bn.clone();
            plus.beta.data[c] += eps;
            let mut minus = bn.clone();
            minus.beta.data[c] -= eps;
            let numeric = (loss(&plus, &x) - loss(&minus, &x)) / (2.0 * eps);
            assert!((numeric - analytic_beta[c]).abs() < 1e-6, "beta {}", c);
        }
    }

    #[test]
    fn test_rejects_wrong_channel_count() {
        assert!(BatchNorm2d::new(4).output_shape((3, 2, 2)).is_err());
        assert_eq!(BatchNorm2d::new(3).output_shape((3, 2, 2)).unwrap(), (3, 2, 2));
    }
}
