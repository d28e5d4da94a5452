use serde::{Serialize, Deserialize};

use crate::error::{Error, Result};
use crate::math::tensor::Tensor;

/// Max pooling over square windows; partial windows at the border are dropped.
///
/// `padding` widens the map on every side with cells that never win.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaxPool2d {
    pub kernel: usize,
    pub stride: usize,
    #[serde(default)]
    pub padding: usize,
}

impl MaxPool2d {
    pub fn new(kernel: usize, stride: usize, padding: usize) -> MaxPool2d {
        MaxPool2d { kernel: kernel.max(1), stride: stride.max(1), padding }
    }

    pub fn output_shape(&self, shape: (usize, usize, usize)) -> Result<(usize, usize, usize)> {
        let (c, h, w) = shape;
        if 2 * self.padding > self.kernel {
            return Err(Error::shape(
                format!("padding of at most {}", self.kernel / 2),
                format!("padding {}", self.padding),
            ));
        }
        let (ph, pw) = (h + 2 * self.padding, w + 2 * self.padding);
        if ph < self.kernel || pw < self.kernel {
            return Err(Error::shape(
                format!("padded map of at least {0}x{0}", self.kernel),
                format!("{}x{}", ph, pw),
            ));
        }
        Ok((c, (ph - self.kernel) / self.stride + 1, (pw - self.kernel) / self.stride + 1))
    }

    /// Input coordinate for an output cell and window offset, or `None` in the padding.
    #[inline]
    fn source(&self, out: usize, k: usize, limit: usize) -> Option<usize> {
        (out * self.stride + k).checked_sub(self.padding).filter(|&pos| pos < limit)
    }

    /// Returns the pooled map and, for every output cell, the flat index of
    /// the input element that won.
    pub fn forward(&self, input: &Tensor) -> (Tensor, Vec<usize>) {
        let out_h = (input.height + 2 * self.padding).saturating_sub(self.kernel) / self.stride + 1;
        let out_w = (input.width + 2 * self.padding).saturating_sub(self.kernel) / self.stride + 1;
        let mut out = Tensor::zeros(input.channels, out_h, out_w);
        let mut winners = Vec::with_capacity(out.data.len());

        for c in 0..input.channels {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut best = f64::NEG_INFINITY;
                    let mut best_idx = None;
                    for ky in 0..self.kernel {
                        let Some(iy) = self.source(oy, ky, input.height) else { continue };
                        for kx in 0..self.kernel {
                            let Some(ix) = self.source(ox, kx, input.width) else { continue };
                            let idx = input.index(c, iy, ix);
                            if best_idx.is_none() || input.data[idx] > best {
                                best = input.data[idx];
                                best_idx = Some(idx);
                            }
                        }
                    }
                    out.set(c, oy, ox, best);
                    winners.push(best_idx.unwrap_or_default());
                }
            }
        }
        (out, winners)
    }

    /// Routes each output gradient back to the element that produced it.
    pub fn backward(input_shape: (usize, usize, usize), winners: &[usize], grad_out: &Tensor) -> Tensor {
        let (c, h, w) = input_shape;
        let mut grad_in = Tensor::zeros(c, h, w);
        for (g, &idx) in grad_out.data.iter().zip(winners.iter()) {
            grad_in.data[idx] += g;
        }
        grad_in
    }
}
