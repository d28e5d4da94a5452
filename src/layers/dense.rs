use rand::Rng;
use serde::{Serialize, Deserialize};

use crate::{activation::activation::ActivationFunction, math::{matrix::Matrix, param::Param}};

/// Fully connected layer: `a = f(x W + b)` with `W` stored `input_size x size`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer{
    pub size: usize,
    pub input_size: usize,
    pub weights: Param,
    pub biases: Param,
    pub activator: ActivationFunction
}

/// Input and pre-activation values (z = xW + b) needed for the derivative.
#[derive(Debug, Clone)]
pub struct DenseCache {
    input: Vec<f64>,
    pre_neurons: Vec<f64>,
}

impl Layer {
    pub fn new<R: Rng + ?Sized>(size: usize, input_size: usize, activation: ActivationFunction, rng: &mut R) -> Layer {
        // He init drawn as (size, fan_in) and stored transposed.
        let weights = Matrix::he(size, input_size, rng).transpose();

        Layer {
            size,
            input_size,
            weights: weights.into(),
            biases: Param::zeros(size),
            activator: activation
        }
    }

    pub fn feed_from(&self, input: &[f64]) -> (Vec<f64>, DenseCache) {
        assert_eq!(input.len(), self.input_size, "dense input width mismatch");
        let mut z = self.biases.data.clone();
        for (i, &x) in input.iter().enumerate() {
            if x == 0.0 {
                continue;
            }
            let row = &self.weights.data[i * self.size..(i + 1) * self.size];
            for (zj, wij) in z.iter_mut().zip(row.iter()) {
                *zj += x * wij;
            }
        }
        let a = z.iter().map(|&x| self.activator.function(x)).collect();
        (a, DenseCache { input: input.to_vec(), pre_neurons: z })
    }

    /// Accumulates weight/bias gradients and returns ∂L/∂input.
    /// `next_layer_delta` is ∂L/∂a for this layer (error in activation space).
    pub fn compute_gradients(&mut self, cache: &DenseCache, next_layer_delta: &[f64]) -> Vec<f64> {
        // δ = error ⊙ σ'(z)
        let layer_delta: Vec<f64> = next_layer_delta.iter().zip(cache.pre_neurons.iter())
            .map(|(e, &z)| e * self.activator.derivative(z))
            .collect();

        for (g, d) in self.biases.grad_mut().iter_mut().zip(layer_delta.iter()) {
            *g += d;
        }

        let size = self.size;
        let (weights, wg) = self.weights.value_and_grad_mut();
        let mut input_delta = vec![0.0; cache.input.len()];
        for (i, &x) in cache.input.iter().enumerate() {
            let row = i * size..(i + 1) * size;
            let mut back = 0.0;
            for ((g, w), d) in wg[row.clone()].iter_mut().zip(weights[row].iter()).zip(layer_delta.iter()) {
                *g += x * d;
                back += w * d;
            }
            input_delta[i] = back;
        }
        input_delta
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weights, &mut self.biases]
    }
}
