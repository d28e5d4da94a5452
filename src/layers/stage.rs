use rand::Rng;
use serde::{Serialize, Deserialize};

use crate::activation::activation::ActivationFunction;
use crate::error::Result;
use crate::layers::{
    attention::{AttentionCache, SelfAttention},
    batchnorm::{BatchNorm2d, BatchNormCache},
    conv::Conv2d,
    dense::{DenseCache, Layer},
    dropout::Dropout,
    pool::MaxPool2d,
    residual::{ResidualBlock, ResidualCache},
    spatial::{SpatialAttention, SpatialCache},
};
use crate::math::{param::Param, tensor::Tensor};

// ---------------------------------------------------------------------------
// Feature-map layers (backbone)
// ---------------------------------------------------------------------------

/// One step of the convolutional backbone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeatureLayer {
    Conv(Conv2d),
    Activation { function: ActivationFunction },
    MaxPool(MaxPool2d),
    BatchNorm(BatchNorm2d),
    Residual(Box<ResidualBlock>),
    SelfAttention(SelfAttention),
    SpatialAttention(SpatialAttention),
}

/// What a feature layer remembers from its forward pass.
#[derive(Debug, Clone)]
pub enum FeatureCache {
    Conv { input: Tensor },
    Activation { pre: Tensor },
    MaxPool { shape: (usize, usize, usize), winners: Vec<usize> },
    BatchNorm(BatchNormCache),
    Residual(Box<ResidualCache>),
    SelfAttention(AttentionCache),
    SpatialAttention(SpatialCache),
}

impl FeatureLayer {
    pub fn output_shape(&self, shape: (usize, usize, usize)) -> Result<(usize, usize, usize)> {
        match self {
            FeatureLayer::Conv(conv) => conv.output_shape(shape),
            FeatureLayer::MaxPool(pool) => pool.output_shape(shape),
            FeatureLayer::BatchNorm(bn) => bn.output_shape(shape),
            FeatureLayer::Residual(block) => block.output_shape(shape),
            FeatureLayer::SelfAttention(block) => {
                if shape.0 != block.channels {
                    return Err(crate::error::Error::shape(
                        format!("{} channels", block.channels),
                        format!("{} channels", shape.0),
                    ));
                }
                Ok(shape)
            }
            FeatureLayer::Activation { .. } | FeatureLayer::SpatialAttention(_) => Ok(shape),
        }
    }

    /// `training` selects batch statistics over running ones in batch norm.
    pub fn forward(&self, input: &Tensor, training: bool) -> (Tensor, FeatureCache) {
        match self {
            FeatureLayer::Conv(conv) => (conv.forward(input), FeatureCache::Conv { input: input.clone() }),
            FeatureLayer::Activation { function } => (
                input.map(|x| function.function(x)),
                FeatureCache::Activation { pre: input.clone() },
            ),
            FeatureLayer::MaxPool(pool) => {
                let (out, winners) = pool.forward(input);
                (out, FeatureCache::MaxPool { shape: input.shape(), winners })
            }
            FeatureLayer::BatchNorm(bn) => {
                let (out, cache) = bn.forward(input, training);
                (out, FeatureCache::BatchNorm(cache))
            }
            FeatureLayer::Residual(block) => {
                let (out, cache) = block.forward(input, training);
                (out, FeatureCache::Residual(Box::new(cache)))
            }
            FeatureLayer::SelfAttention(block) => {
                let (out, cache) = block.forward(input);
                (out, FeatureCache::SelfAttention(cache))
            }
            FeatureLayer::SpatialAttention(block) => {
                let (out, cache) = block.forward(input);
                (out, FeatureCache::SpatialAttention(cache))
            }
        }
    }

    /// Accumulates parameter gradients and returns the gradient w.r.t. the input.
    pub fn backward(&mut self, cache: &FeatureCache, grad_out: &Tensor) -> Tensor {
        match (self, cache) {
            (FeatureLayer::Conv(conv), FeatureCache::Conv { input }) => conv.backward(input, grad_out),
            (FeatureLayer::Activation { function }, FeatureCache::Activation { pre }) => {
                let mut grad = grad_out.clone();
                for (g, &z) in grad.data.iter_mut().zip(pre.data.iter()) {
                    *g *= function.derivative(z);
                }
                grad
            }
            (FeatureLayer::MaxPool(_), FeatureCache::MaxPool { shape, winners }) => {
                MaxPool2d::backward(*shape, winners, grad_out)
            }
            (FeatureLayer::BatchNorm(bn), FeatureCache::BatchNorm(c)) => bn.backward(c, grad_out),
            (FeatureLayer::Residual(block), FeatureCache::Residual(c)) => block.backward(c, grad_out),
            (FeatureLayer::SelfAttention(block), FeatureCache::SelfAttention(c)) => block.backward(c, grad_out),
            (FeatureLayer::SpatialAttention(block), FeatureCache::SpatialAttention(c)) => block.backward(c, grad_out),
            _ => unreachable!("feature cache does not belong to this layer"),
        }
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        match self {
            FeatureLayer::Conv(conv) => {
                let mut params = vec![&mut conv.weights];
                if let Some(b) = conv.bias.as_mut() {
                    params.push(b);
                }
                params
            }
            FeatureLayer::BatchNorm(bn) => bn.params_mut(),
            FeatureLayer::Residual(block) => block.params_mut(),
            FeatureLayer::SelfAttention(block) => block.params_mut(),
            FeatureLayer::SpatialAttention(block) => block.params_mut(),
            FeatureLayer::Activation { .. } | FeatureLayer::MaxPool(_) => Vec::new(),
        }
    }

    /// Batch-norm running statistics, in the same order as `params_mut`.
    pub fn buffers_mut(&mut self) -> Vec<&mut Vec<f64>> {
        match self {
            FeatureLayer::BatchNorm(bn) => bn.buffers_mut(),
            FeatureLayer::Residual(block) => block.buffers_mut(),
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Vector layers (classifier head)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeadLayer {
    Dense(Layer),
    Dropout(Dropout),
}

#[derive(Debug, Clone)]
pub enum HeadCache {
    Dense(DenseCache),
    Dropout { mask: Vec<f64> },
}

impl HeadLayer {
    pub fn forward<R: Rng + ?Sized>(&self, input: &[f64], training: bool, rng: &mut R) -> (Vec<f64>, HeadCache) {
        match self {
            HeadLayer::Dense(layer) => {
                let (out, cache) = layer.feed_from(input);
                (out, HeadCache::Dense(cache))
            }
            HeadLayer::Dropout(d) => {
                let (out, mask) = d.forward(input, training, rng);
                (out, HeadCache::Dropout { mask })
            }
        }
    }

    pub fn backward(&mut self, cache: &HeadCache, grad_out: &[f64]) -> Vec<f64> {
        match (self, cache) {
            (HeadLayer::Dense(layer), HeadCache::Dense(c)) => layer.compute_gradients(c, grad_out),
            (HeadLayer::Dropout(_), HeadCache::Dropout { mask }) => Dropout::backward(mask, grad_out),
            _ => unreachable!("head cache does not belong to this layer"),
        }
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        match self {
            HeadLayer::Dense(layer) => layer.params_mut(),
            HeadLayer::Dropout(_) => Vec::new(),
        }
    }
}
