use rand::Rng;
use serde::{Serialize, Deserialize};

use crate::math::{matrix::Matrix, param::Param, tensor::Tensor};

/// Non-local self-attention over the spatial positions of a feature map.
///
/// Queries and keys are 1x1 projections to `max(C / 8, 1)` channels, values a
/// 1x1 projection to `C` channels. Every position attends to every other:
///
/// ```text
/// A   = softmax_j(q_i . k_j)          (HW x HW)
/// out = gamma * (V A^T) + x           (C x HW)
/// ```
///
/// `gamma` starts at zero, so a freshly built block is the identity and the
/// network learns how much attention to mix in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfAttention {
    pub channels: usize,
    pub inner: usize,
    pub query_w: Param,
    pub query_b: Param,
    pub key_w: Param,
    pub key_b: Param,
    pub value_w: Param,
    pub value_b: Param,
    pub gamma: Param,
}

/// Intermediate values kept from the forward pass.
#[derive(Debug, Clone)]
pub struct AttentionCache {
    x: Matrix,
    q: Matrix,
    k: Matrix,
    v: Matrix,
    attn: Matrix,
    mixed: Matrix,
    height: usize,
    width: usize,
}

impl SelfAttention {
    pub fn new<R: Rng + ?Sized>(channels: usize, rng: &mut R) -> SelfAttention {
        let inner = (channels / 8).max(1);
        SelfAttention {
            channels,
            inner,
            query_w: Matrix::xavier(inner, channels, rng).into(),
            query_b: Param::zeros(inner),
            key_w: Matrix::xavier(inner, channels, rng).into(),
            key_b: Param::zeros(inner),
            value_w: Matrix::xavier(channels, channels, rng).into(),
            value_b: Param::zeros(channels),
            gamma: Param::zeros(1),
        }
    }

    pub fn forward(&self, input: &Tensor) -> (Tensor, AttentionCache) {
        let x = input.to_matrix();
        let q = project(&self.query_w, &self.query_b, self.inner, self.channels, &x);
        let k = project(&self.key_w, &self.key_b, self.inner, self.channels, &x);
        let v = project(&self.value_w, &self.value_b, self.channels, self.channels, &x);

        let attn = q.transpose().dot(&k).softmax_rows();
        let mixed = v.dot(&attn.transpose());

        let gamma = self.gamma.data[0];
        let mut out = Tensor::from_matrix(&mixed, input.height, input.width);
        for (o, xi) in out.data.iter_mut().zip(input.data.iter()) {
            *o = gamma * *o + xi;
        }

        let cache = AttentionCache {
            x,
            q,
            k,
            v,
            attn,
            mixed,
            height: input.height,
            width: input.width,
        };
        (out, cache)
    }

    pub fn backward(&mut self, cache: &AttentionCache, grad_out: &Tensor) -> Tensor {
        let dy = grad_out.to_matrix();
        let gamma = self.gamma.data[0];

        self.gamma.grad_mut()[0] += dy.data.iter().zip(cache.mixed.data.iter())
            .map(|(dr, mr)| dr.iter().zip(mr.iter()).map(|(a, b)| a * b).sum::<f64>())
            .sum::<f64>();

        let d_mixed = dy.map(|g| g * gamma);
        let d_attn = d_mixed.transpose().dot(&cache.v);
        let dv = d_mixed.dot(&cache.attn);

        // Softmax Jacobian, row by row.
        let mut d_scores = Matrix::zeros(cache.attn.rows, cache.attn.cols);
        for i in 0..cache.attn.rows {
            let a = &cache.attn.data[i];
            let da = &d_attn.data[i];
            let dot: f64 = a.iter().zip(da.iter()).map(|(p, g)| p * g).sum();
            for j in 0..cache.attn.cols {
                d_scores.data[i][j] = a[j] * (da[j] - dot);
            }
        }

        let dq = cache.k.dot(&d_scores.transpose());
        let dk = cache.q.dot(&d_scores);

        let mut dx = dy;
        project_backward(&mut self.query_w, &mut self.query_b, self.inner, self.channels, &cache.x, &dq, &mut dx);
        project_backward(&mut self.key_w, &mut self.key_b, self.inner, self.channels, &cache.x, &dk, &mut dx);
        project_backward(&mut self.value_w, &mut self.value_b, self.channels, self.channels, &cache.x, &dv, &mut dx);

        Tensor::from_matrix(&dx, cache.height, cache.width)
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![
            &mut self.query_w,
            &mut self.query_b,
            &mut self.key_w,
            &mut self.key_b,
            &mut self.value_w,
            &mut self.value_b,
            &mut self.gamma,
        ]
    }
}

/// 1x1 convolution expressed as `W x + b` over a `C x HW` matrix.
fn project(w: &Param, b: &Param, rows: usize, cols: usize, x: &Matrix) -> Matrix {
    let mut out = Matrix::from_flat(rows, cols, &w.data).dot(x);
    for (row, bias) in out.data.iter_mut().zip(b.data.iter()) {
        for v in row.iter_mut() {
            *v += bias;
        }
    }
    out
}

/// Accumulates the projection's gradients and adds `W^T dout` into `dx`.
fn project_backward(
    w: &mut Param,
    b: &mut Param,
    rows: usize,
    cols: usize,
    x: &Matrix,
    dout: &Matrix,
    dx: &mut Matrix,
) {
    let dw = dout.dot(&x.transpose());
    for (g, d) in w.grad_mut().iter_mut().zip(dw.to_flat()) {
        *g += d;
    }
    for (g, row) in b.grad_mut().iter_mut().zip(dout.data.iter()) {
        *g += row.iter().sum::<f64>();
    }
    let back = Matrix::from_flat(rows, cols, &w.data).transpose().dot(dout);
    for (row, back_row) in dx.data.iter_mut().zip(back.data.iter()) {
        for (d, b) in row.iter_mut().zip(back_row.iter()) {
            *d += b;
        }
    }
}
