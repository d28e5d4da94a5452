use rand::Rng;
use serde::{Serialize, Deserialize};

use crate::activation::activation::ActivationFunction;
use crate::layers::conv::Conv2d;
use crate::math::{param::Param, tensor::Tensor};

/// Spatial gate: a 7x7 convolution over the channel-mean and channel-max
/// maps, squashed by a sigmoid, rescales every position of the input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialAttention {
    pub conv: Conv2d,
}

#[derive(Debug, Clone)]
pub struct SpatialCache {
    input: Tensor,
    pooled: Tensor,
    argmax: Vec<usize>,
    pre_gate: Tensor,
    gate: Vec<f64>,
}

const GATE: ActivationFunction = ActivationFunction::Sigmoid;

impl SpatialAttention {
    pub fn new<R: Rng + ?Sized>(rng: &mut R) -> SpatialAttention {
        SpatialAttention {
            conv: Conv2d::new(2, 1, 7, 1, 3, false, rng),
        }
    }

    pub fn forward(&self, input: &Tensor) -> (Tensor, SpatialCache) {
        let (c, h, w) = input.shape();
        let n = h * w;
        let mut pooled = Tensor::zeros(2, h, w);
        let mut argmax = vec![0usize; n];

        for pos in 0..n {
            let mut sum = 0.0;
            let mut best = f64::NEG_INFINITY;
            for ch in 0..c {
                let v = input.data[ch * n + pos];
                sum += v;
                if v > best {
                    best = v;
                    argmax[pos] = ch;
                }
            }
            pooled.data[pos] = sum / c.max(1) as f64;
            pooled.data[n + pos] = best;
        }

        let pre_gate = self.conv.forward(&pooled);
        let gate: Vec<f64> = pre_gate.data.iter().map(|&z| GATE.function(z)).collect();

        let mut out = input.clone();
        for ch in 0..c {
            for pos in 0..n {
                out.data[ch * n + pos] *= gate[pos];
            }
        }

        let cache = SpatialCache {
            input: input.clone(),
            pooled,
            argmax,
            pre_gate,
            gate,
        };
        (out, cache)
    }

    pub fn backward(&mut self, cache: &SpatialCache, grad_out: &Tensor) -> Tensor {
        let (c, h, w) = cache.input.shape();
        let n = h * w;

        let mut grad_in = Tensor::zeros(c, h, w);
        let mut d_pre = Tensor::zeros(1, h, w);
        for pos in 0..n {
            let mut d_gate = 0.0;
            for ch in 0..c {
                let i = ch * n + pos;
                d_gate += grad_out.data[i] * cache.input.data[i];
                grad_in.data[i] = grad_out.data[i] * cache.gate[pos];
            }
            d_pre.data[pos] = d_gate * GATE.derivative(cache.pre_gate.data[pos]);
        }

        let d_pooled = self.conv.backward(&cache.pooled, &d_pre);
        let inv_c = 1.0 / c.max(1) as f64;
        for pos in 0..n {
            let d_avg = d_pooled.data[pos] * inv_c;
            for ch in 0..c {
                grad_in.data[ch * n + pos] += d_avg;
            }
            grad_in.data[cache.argmax[pos] * n + pos] += d_pooled.data[n + pos];
        }
        grad_in
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.conv.weights]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::conv::tests::{weighted_loss, random_tensor};
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_gate_bounds_output_magnitude() {
        let mut rng = StdRng::seed_from_u64(5);
        let block = SpatialAttention::new(&mut rng);
        let x = random_tensor(4, 5, 5, 6);
        let (y, _) = block.forward(&x);
        for (a, b) in y.data.iter().zip(x.data.iter()) {
            assert!(a.abs() <= b.abs() + 1e-12);
        }
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let mut rng = StdRng::seed_from_u64(31);
        let mut block = SpatialAttention::new(&mut rng);
        let x = random_tensor(3, 4, 4, 32);
        let (y, cache) = block.forward(&x);
        let upstream = random_tensor(y.channels, y.height, y.width, 33);
        let grad_in = block.backward(&cache, &upstream);
        let eps = 1e-6;

        for i in [0, 9, 20, x.data.len() - 1] {
            let mut xp = x.clone();
            xp.data[i] += eps;
            let mut xm = x.clone();
            xm.data[i] -= eps;
            let numeric = (weighted_loss(&block.forward(&xp).0, &upstream)
                - weighted_loss(&block.forward(&xm).0, &upstream)) / (2.0 * eps);
            assert!((numeric - grad_in.data[i]).abs() < 1e-5, "input {}: {} vs {}", i, numeric, grad_in.data[i]);
        }

        let analytic = block.conv.weights.grad().to_vec();
        for i in [0, 24, 60, analytic.len() - 1] {
            let mut plus = block.clone();
            plus.conv.weights.data[i] += eps;
            let mut minus = block.clone();
            minus.conv.weights.data[i] -= eps;
            let numeric = (weighted_loss(&plus.forward(&x).0, &upstream)
                - weighted_loss(&minus.forward(&x).0, &upstream)) / (2.0 * eps);
            assert!((numeric - analytic[i]).abs() < 1e-5, "weight {}: {} vs {}", i, numeric, analytic[i]);
        }
    }
}
