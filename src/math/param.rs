use serde::{Serialize, Deserialize};

use crate::math::matrix::Matrix;

/// A learnable buffer plus its gradient accumulator.
///
/// Gradients are summed over every sample of a mini-batch by the layers'
/// backward passes and cleared by `zero_grad` after each optimizer step.
/// Only the values are persisted; the accumulator is rebuilt on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub data: Vec<f64>,
    #[serde(skip)]
    grad: Vec<f64>,
}

impl Param {
    pub fn new(data: Vec<f64>) -> Param {
        let grad = vec![0.0; data.len()];
        Param { data, grad }
    }

    pub fn zeros(len: usize) -> Param {
        Param::new(vec![0.0; len])
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Gradient accumulator, sized to match the values.
    pub fn grad_mut(&mut self) -> &mut [f64] {
        if self.grad.len() != self.data.len() {
            self.grad = vec![0.0; self.data.len()];
        }
        &mut self.grad
    }

    pub fn grad(&self) -> &[f64] {
        &self.grad
    }

    pub fn zero_grad(&mut self) {
        self.grad.clear();
        self.grad.resize(self.data.len(), 0.0);
    }

    /// Multiplies the accumulated gradient, e.g. by `1 / batch_size`.
    pub fn scale_grad(&mut self, factor: f64) {
        for g in self.grad_mut() {
            *g *= factor;
        }
    }

    /// Values and gradient accumulator borrowed together, as backward
    /// passes need to read one while writing the other.
    pub fn value_and_grad_mut(&mut self) -> (&[f64], &mut [f64]) {
        if self.grad.len() != self.data.len() {
            self.grad = vec![0.0; self.data.len()];
        }
        (&self.data, &mut self.grad)
    }

    /// Mutable values with the gradient, as optimizers need them.
    pub fn split_mut(&mut self) -> (&mut [f64], &[f64]) {
        if self.grad.len() != self.data.len() {
            self.grad = vec![0.0; self.data.len()];
        }
        (&mut self.data, &self.grad)
    }
}

impl From<Matrix> for Param {
    fn from(m: Matrix) -> Param {
        Param::new(m.to_flat())
    }
}
