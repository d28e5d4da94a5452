use rand::Rng;
use serde::{Serialize, Deserialize};

use crate::activation::activation::ActivationFunction;
use crate::error::Result;
use crate::layers::{
    attention::SelfAttention,
    batchnorm::BatchNorm2d,
    conv::Conv2d,
    pool::MaxPool2d,
    residual::ResidualBlock,
    spatial::SpatialAttention,
    stage::{FeatureCache, FeatureLayer},
};
use crate::math::{param::Param, tensor::Tensor};
use crate::network::spec::{ModelConfig, StageSpec};

/// Sees every stage output on the way forward and the gradient with respect
/// to every stage output on the way back.
///
/// `branch` is 0 for the first (or only) image of a sample and 1 for the
/// second image in dual mode. Saliency methods implement this to capture an
/// intermediate layer without the model knowing about them.
pub trait StageObserver {
    fn forward_output(&mut self, _branch: usize, _stage: usize, _output: &Tensor) {}
    fn backward_output(&mut self, _branch: usize, _stage: usize, _grad: &Tensor) {}
}

/// Observer that ignores everything.
pub struct NoObserver;

impl StageObserver for NoObserver {}

/// The convolutional feature extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backbone {
    pub layers: Vec<FeatureLayer>,
}

/// Per-stage caches from one forward pass of one image.
#[derive(Debug, Clone)]
pub struct BackboneTrace {
    caches: Vec<FeatureCache>,
}

impl Backbone {
    /// Instantiates the stages of `config`, tracking channel counts so
    /// attention blocks are sized to their input.
    pub fn build<R: Rng + ?Sized>(config: &ModelConfig, rng: &mut R) -> Result<Backbone> {
        let mut shape = (config.input_channels, config.input_size, config.input_size);
        let mut layers = Vec::with_capacity(config.stages.len());

        for stage in &config.stages {
            let channels = shape.0;
            let layer = match *stage {
                StageSpec::Conv { out_channels, kernel, stride, padding } => {
                    FeatureLayer::Conv(Conv2d::new(channels, out_channels, kernel, stride, padding, true, rng))
                }
                StageSpec::Relu => FeatureLayer::Activation { function: ActivationFunction::ReLU },
                StageSpec::MaxPool { kernel, stride, padding } => {
                    FeatureLayer::MaxPool(MaxPool2d::new(kernel, stride, padding))
                }
                StageSpec::BatchNorm => FeatureLayer::BatchNorm(BatchNorm2d::new(channels)),
                StageSpec::Residual { out_channels, stride } => {
                    FeatureLayer::Residual(Box::new(ResidualBlock::new(channels, out_channels, stride, rng)))
                }
                StageSpec::SelfAttention => FeatureLayer::SelfAttention(SelfAttention::new(channels, rng)),
                StageSpec::SpatialAttention => FeatureLayer::SpatialAttention(SpatialAttention::new(rng)),
            };
            shape = layer.output_shape(shape)?;
            layers.push(layer);
        }
        Ok(Backbone { layers })
    }

    pub fn forward(
        &self,
        input: &Tensor,
        training: bool,
        branch: usize,
        observer: &mut dyn StageObserver,
    ) -> (Tensor, BackboneTrace) {
        let mut caches = Vec::with_capacity(self.layers.len());
        let mut current = input.clone();
        for (stage, layer) in self.layers.iter().enumerate() {
            let (out, cache) = layer.forward(&current, training);
            observer.forward_output(branch, stage, &out);
            caches.push(cache);
            current = out;
        }
        (current, BackboneTrace { caches })
    }

    /// Back-propagates `grad` (w.r.t. the backbone output) to the image,
    /// accumulating parameter gradients on the way.
    pub fn backward(
        &mut self,
        trace: &BackboneTrace,
        grad: Tensor,
        branch: usize,
        observer: &mut dyn StageObserver,
    ) -> Tensor {
        let mut delta = grad;
        for (stage, layer) in self.layers.iter_mut().enumerate().rev() {
            observer.backward_output(branch, stage, &delta);
            delta = layer.backward(&trace.caches[stage], &delta);
        }
        delta
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        self.layers.iter_mut().flat_map(|l| l.params_mut()).collect()
    }

    pub fn buffers_mut(&mut self) -> Vec<&mut Vec<f64>> {
        self.layers.iter_mut().flat_map(|l| l.buffers_mut()).collect()
    }

    /// Index of the last attention stage, the default GradCAM target.
    pub fn last_attention_stage(&self) -> Option<usize> {
        self.layers.iter().rposition(|l| {
            matches!(l, FeatureLayer::SelfAttention(_) | FeatureLayer::SpatialAttention(_))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[derive(Default)]
    struct Recorder {
        forward: Vec<(usize, usize, (usize, usize, usize))>,
        backward: Vec<usize>,
    }

    impl StageObserver for Recorder {
        fn forward_output(&mut self, branch: usize, stage: usize, output: &Tensor) {
            self.forward.push((branch, stage, output.shape()));
        }
        fn backward_output(&mut self, _branch: usize, stage: usize, _grad: &Tensor) {
            self.backward.push(stage);
        }
    }

    #[test]
    fn test_observer_sees_every_stage_in_order() {
        let mut rng = StdRng::seed_from_u64(4);
        let cfg = ModelConfig::compact(8);
        let mut backbone = Backbone::build(&cfg, &mut rng).unwrap();
        let x = Tensor::zeros(3, 8, 8);
        let mut rec = Recorder::default();
        let (out, trace) = backbone.forward(&x, false, 1, &mut rec);
        assert_eq!(out.shape(), (16, 2, 2));
        assert_eq!(rec.forward.len(), cfg.stages.len());
        assert_eq!(rec.forward[0], (1, 0, (8, 8, 8)));

        let grad = Tensor::zeros(16, 2, 2);
        let back = backbone.backward(&trace, grad, 1, &mut rec);
        assert_eq!(back.shape(), (3, 8, 8));
        let expected: Vec<usize> = (0..cfg.stages.len()).rev().collect();
        assert_eq!(rec.backward, expected);
    }

    #[test]
    fn test_last_attention_stage() {
        let mut rng = StdRng::seed_from_u64(4);
        let backbone = Backbone::build(&ModelConfig::compact(8), &mut rng).unwrap();
        assert_eq!(backbone.last_attention_stage(), Some(7));
    }

    #[test]
    fn test_residual_stages_train_end_to_end() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut cfg = ModelConfig::compact(8);
        cfg.stages = vec![
            StageSpec::Conv { out_channels: 4, kernel: 3, stride: 1, padding: 1 },
            StageSpec::BatchNorm,
            StageSpec::Relu,
            StageSpec::MaxPool { kernel: 3, stride: 2, padding: 1 },
            StageSpec::Residual { out_channels: 4, stride: 1 },
            StageSpec::Residual { out_channels: 8, stride: 2 },
            StageSpec::SelfAttention,
        ];
        let mut backbone = Backbone::build(&cfg, &mut rng).unwrap();
        assert_eq!(backbone.buffers_mut().len(), 2 + 2 * 2 + 3 * 2);

        let x = crate::layers::conv::tests::random_tensor(3, 8, 8, 2);
        let (out, trace) = backbone.forward(&x, true, 0, &mut NoObserver);
        assert_eq!(out.shape(), (8, 2, 2));
        let back = backbone.backward(&trace, Tensor::zeros(8, 2, 2).map(|_| 1.0), 0, &mut NoObserver);
        assert_eq!(back.shape(), (3, 8, 8));
        assert!(backbone.params_mut().iter().any(|p| p.grad().iter().any(|&g| g != 0.0)));
        assert!(backbone.buffers_mut()[0].iter().any(|&m| m != 0.0));
    }
}
