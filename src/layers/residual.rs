use rand::Rng;
use serde::{Serialize, Deserialize};

use crate::activation::activation::ActivationFunction;
use crate::error::Result;
use crate::layers::{
    batchnorm::{BatchNorm2d, BatchNormCache},
    conv::Conv2d,
};
use crate::math::{param::Param, tensor::Tensor};

const RELU: ActivationFunction = ActivationFunction::ReLU;

/// Two 3x3 conv + batch-norm layers with an identity (or projected) skip
/// connection: `relu(bn2(conv2(relu(bn1(conv1(x))))) + shortcut(x))`.
///
/// The first conv carries the stride. When the block changes channel count
/// or resolution the shortcut is a strided 1x1 conv followed by batch norm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualBlock {
    pub conv1: Conv2d,
    pub bn1: BatchNorm2d,
    pub conv2: Conv2d,
    pub bn2: BatchNorm2d,
    pub shortcut: Option<Projection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub conv: Conv2d,
    pub bn: BatchNorm2d,
}

#[derive(Debug, Clone)]
pub struct ResidualCache {
    input: Tensor,
    bn1: BatchNormCache,
    pre_relu: Tensor,
    hidden: Tensor,
    bn2: BatchNormCache,
    shortcut: Option<BatchNormCache>,
    sum: Tensor,
}

impl ResidualBlock {
    pub fn new<R: Rng + ?Sized>(in_channels: usize, out_channels: usize, stride: usize, rng: &mut R) -> ResidualBlock {
        let stride = stride.max(1);
        let shortcut = (stride != 1 || in_channels != out_channels).then(|| Projection {
            conv: Conv2d::new(in_channels, out_channels, 1, stride, 0, false, rng),
            bn: BatchNorm2d::new(out_channels),
        });
        ResidualBlock {
            conv1: Conv2d::new(in_channels, out_channels, 3, stride, 1, false, rng),
            bn1: BatchNorm2d::new(out_channels),
            conv2: Conv2d::new(out_channels, out_channels, 3, 1, 1, false, rng),
            bn2: BatchNorm2d::new(out_channels),
            shortcut,
        }
    }

    pub fn output_shape(&self, shape: (usize, usize, usize)) -> Result<(usize, usize, usize)> {
        let main = self.conv2.output_shape(self.conv1.output_shape(shape)?)?;
        if let Some(projection) = &self.shortcut {
            projection.conv.output_shape(shape)?;
        }
        Ok(main)
    }

    pub fn forward(&self, input: &Tensor, training: bool) -> (Tensor, ResidualCache) {
        let (pre_relu, bn1) = self.bn1.forward(&self.conv1.forward(input), training);
        let hidden = pre_relu.map(|x| RELU.function(x));
        let (mut sum, bn2) = self.bn2.forward(&self.conv2.forward(&hidden), training);

        let shortcut = match &self.shortcut {
            Some(projection) => {
                let (skip, cache) = projection.bn.forward(&projection.conv.forward(input), training);
                sum.add_assign(&skip);
                Some(cache)
            }
            None => {
                sum.add_assign(input);
                None
            }
        };

        let out = sum.map(|x| RELU.function(x));
        let cache = ResidualCache { input: input.clone(), bn1, pre_relu, hidden, bn2, shortcut, sum };
        (out, cache)
    }

    /// Accumulates gradients of both paths and returns `dL/dinput`.
    pub fn backward(&mut self, cache: &ResidualCache, grad_out: &Tensor) -> Tensor {
        let mut d_sum = grad_out.clone();
        for (g, &z) in d_sum.data.iter_mut().zip(cache.sum.data.iter()) {
            *g *= RELU.derivative(z);
        }

        let d_conv2 = self.bn2.backward(&cache.bn2, &d_sum);
        let mut d_hidden = self.conv2.backward(&cache.hidden, &d_conv2);
        for (g, &z) in d_hidden.data.iter_mut().zip(cache.pre_relu.data.iter()) {
            *g *= RELU.derivative(z);
        }
        let d_conv1 = self.bn1.backward(&cache.bn1, &d_hidden);
        let mut d_input = self.conv1.backward(&cache.input, &d_conv1);

        match (self.shortcut.as_mut(), cache.shortcut.as_ref()) {
            (Some(projection), Some(bn_cache)) => {
                let d_proj = projection.bn.backward(bn_cache, &d_sum);
                d_input.add_assign(&projection.conv.backward(&cache.input, &d_proj));
            }
            _ => d_input.add_assign(&d_sum),
        }
        d_input
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = vec![&mut self.conv1.weights];
        params.extend(self.bn1.params_mut());
        params.push(&mut self.conv2.weights);
        params.extend(self.bn2.params_mut());
        if let Some(projection) = self.shortcut.as_mut() {
            params.push(&mut projection.conv.weights);
            params.extend(projection.bn.params_mut());
        }
        params
    }

    pub fn buffers_mut(&mut self) -> Vec<&mut Vec<f64>> {
        let mut buffers = self.bn1.buffers_mut();
        buffers.extend(self.bn2.buffers_mut());
        if let Some(projection) = self.shortcut.as_mut() {
            buffers.extend(projection.bn.buffers_mut());
        }
        buffers
    }
}
