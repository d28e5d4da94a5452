use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Serialize, Deserialize};
use std::path::Path;

use crate::activation::activation::ActivationFunction;
use crate::data::dataset::PairingMode;
use crate::error::{Error, Result};
use crate::layers::{dense::Layer, dropout::Dropout, stage::{HeadCache, HeadLayer}};
use crate::math::{param::Param, tensor::Tensor};
use crate::network::backbone::{Backbone, BackboneTrace, NoObserver, StageObserver};
use crate::network::spec::{ModelConfig, Pooling};

/// One network input: a single fundus image or both images of one eye.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Single(Tensor),
    Dual(Tensor, Tensor),
}

impl Input {
    pub fn images(&self) -> Vec<&Tensor> {
        match self {
            Input::Single(t) => vec![t],
            Input::Dual(a, b) => vec![a, b],
        }
    }

    pub fn mode(&self) -> PairingMode {
        match self {
            Input::Single(_) => PairingMode::Single,
            Input::Dual(..) => PairingMode::Dual,
        }
    }
}

/// Whether dropout is active and batch norm normalises with batch statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// Attention-augmented CNN classifier: shared backbone, pooling, dense head.
///
/// In dual mode both images pass through the same backbone and their
/// pooled features are concatenated before the head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classifier {
    pub config: ModelConfig,
    pub backbone: Backbone,
    pub head: Vec<HeadLayer>,
}

/// Everything `backward` needs from one forward pass.
#[derive(Debug, Clone)]
pub struct ForwardTrace {
    branches: Vec<(BackboneTrace, (usize, usize, usize))>,
    head: Vec<HeadCache>,
}

impl Classifier {
    pub fn new<R: Rng + ?Sized>(config: ModelConfig, rng: &mut R) -> Result<Classifier> {
        let head_input = config.head_input_len()?;
        let backbone = Backbone::build(&config, rng)?;

        let mut head = Vec::new();
        let mut width = head_input;
        for &hidden in &config.hidden {
            head.push(HeadLayer::Dense(Layer::new(hidden, width, ActivationFunction::ReLU, rng)));
            head.push(HeadLayer::Dropout(Dropout::new(config.dropout)));
            width = hidden;
        }
        head.push(HeadLayer::Dense(Layer::new(config.num_classes, width, ActivationFunction::Identity, rng)));

        Ok(Classifier { config, backbone, head })
    }

    pub fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    fn check_input(&self, input: &Input) -> Result<()> {
        if input.mode() != self.config.mode {
            return Err(Error::shape(
                format!("{:?} input", self.config.mode),
                format!("{:?} input", input.mode()),
            ));
        }
        let expected = (self.config.input_channels, self.config.input_size, self.config.input_size);
        for image in input.images() {
            if image.shape() != expected {
                return Err(Error::shape(format!("{:?}", expected), format!("{:?}", image.shape())));
            }
        }
        Ok(())
    }

    /// Forward pass returning raw logits and the trace needed for backprop.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        input: &Input,
        mode: Mode,
        rng: &mut R,
        observer: &mut dyn StageObserver,
    ) -> Result<(Vec<f64>, ForwardTrace)> {
        self.check_input(input)?;

        let training = mode == Mode::Train;
        let mut features = Vec::new();
        let mut branches = Vec::new();
        for (branch, image) in input.images().into_iter().enumerate() {
            let (map, trace) = self.backbone.forward(image, training, branch, observer);
            features.extend(pool(&map, self.config.pooling));
            branches.push((trace, map.shape()));
        }

        let mut current = features;
        let mut head = Vec::with_capacity(self.head.len());
        for layer in &self.head {
            let (out, cache) = layer.forward(&current, training, rng);
            head.push(cache);
            current = out;
        }
        Ok((current, ForwardTrace { branches, head }))
    }

    /// Back-propagates `grad_logits` (∂L/∂logits) through head and backbone,
    /// accumulating gradients into every parameter.
    pub fn backward(&mut self, trace: &ForwardTrace, grad_logits: &[f64], observer: &mut dyn StageObserver) {
        let mut delta = grad_logits.to_vec();
        for (layer, cache) in self.head.iter_mut().zip(trace.head.iter()).rev() {
            delta = layer.backward(cache, &delta);
        }

        let mut offset = 0;
        for (branch, (bt, shape)) in trace.branches.iter().enumerate() {
            let len = match self.config.pooling {
                Pooling::Flatten => shape.0 * shape.1 * shape.2,
                Pooling::GlobalAverage => shape.0,
            };
            let grad_map = unpool(&delta[offset..offset + len], *shape, self.config.pooling);
            offset += len;
            self.backbone.backward(bt, grad_map, branch, observer);
        }
    }

    /// Eval-mode logits.
    pub fn logits(&self, input: &Input) -> Result<Vec<f64>> {
        // Dropout is off in eval mode, so the generator is never drawn from.
        let mut rng = StdRng::seed_from_u64(0);
        Ok(self.forward(input, Mode::Eval, &mut rng, &mut NoObserver)?.0)
    }

    /// Predicted class (argmax of the logits) with the logits themselves.
    pub fn predict(&self, input: &Input) -> Result<(usize, Vec<f64>)> {
        let logits = self.logits(input)?;
        Ok((argmax(&logits), logits))
    }

    /// Every learnable buffer in a stable order (backbone first, then head).
    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.backbone.params_mut();
        params.extend(self.head.iter_mut().flat_map(|l| l.params_mut()));
        params
    }

    pub fn zero_grad(&mut self) {
        for p in self.params_mut() {
            p.zero_grad();
        }
    }

    pub fn parameter_count(&mut self) -> usize {
        self.params_mut().iter().map(|p| p.len()).sum()
    }

    /// Copies backbone weights (and batch-norm running statistics) from
    /// `source` wherever stage kinds and parameter shapes line up;
    /// mismatching stages are skipped.
    /// Returns the number of parameter buffers copied.
    pub fn load_backbone_from(&mut self, source: &Classifier) -> usize {
        let (target_stages, source_stages) = (self.backbone.layers.len(), source.backbone.layers.len());
        if target_stages != source_stages {
            tracing::warn!(target_stages, source_stages, "backbone depths differ, unmatched stages left untouched");
        }

        let mut copied = 0;
        for (stage, (dst, src)) in self.backbone.layers.iter_mut()
            .zip(source.backbone.layers.iter())
            .enumerate()
        {
            if std::mem::discriminant(dst) != std::mem::discriminant(src) {
                tracing::warn!(stage, "backbone stage kinds differ, skipping");
                continue;
            }
            let mut src = src.clone();
            let src_params = src.params_mut();
            let dst_params = dst.params_mut();
            if src_params.len() != dst_params.len()
                || src_params.iter().zip(dst_params.iter()).any(|(s, d)| s.len() != d.len())
            {
                tracing::warn!(stage, "backbone parameter shapes differ, skipping");
                continue;
            }
            for (d, s) in dst_params.into_iter().zip(src_params) {
                d.data.copy_from_slice(&s.data);
                copied += 1;
            }
            for (d, s) in dst.buffers_mut().into_iter().zip(src.buffers_mut()) {
                d.copy_from_slice(s);
            }
        }
        tracing::info!(copied, "transferred backbone parameters");
        copied
    }

    /// Checks that the stored layers agree with the stored config.
    fn check_layers(&self) -> Result<()> {
        if self.backbone.layers.len() != self.config.stages.len() {
            return Err(Error::Config(format!(
                "config lists {} backbone stages but {} were stored",
                self.config.stages.len(),
                self.backbone.layers.len()
            )));
        }
        let mut shape = (self.config.input_channels, self.config.input_size, self.config.input_size);
        for (stage, layer) in self.backbone.layers.iter().enumerate() {
            shape = layer
                .output_shape(shape)
                .map_err(|e| Error::Config(format!("backbone stage {}: {}", stage, e)))?;
        }

        let mut width = self.config.head_input_len()?;
        let dense: Vec<&Layer> = self.head.iter()
            .filter_map(|layer| match layer {
                HeadLayer::Dense(l) => Some(l),
                HeadLayer::Dropout(_) => None,
            })
            .collect();
        let expected: Vec<usize> = self.config.hidden.iter().copied()
            .chain(std::iter::once(self.config.num_classes))
            .collect();
        if dense.len() != expected.len() {
            return Err(Error::Config(format!(
                "config asks for {} dense head layers but {} were stored", expected.len(), dense.len()
            )));
        }
        for (index, (layer, &size)) in dense.iter().zip(expected.iter()).enumerate() {
            if layer.input_size != width || layer.size != size {
                return Err(Error::Config(format!(
                    "head layer {} maps {} -> {} but config implies {} -> {}",
                    index, layer.input_size, layer.size, width, size
                )));
            }
            width = size;
        }
        Ok(())
    }

    /// Serializes the classifier (config and weights) to a JSON file.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    /// Deserializes a classifier previously written by `save_json`.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Classifier> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let mut model: Classifier = serde_json::from_reader(reader)?;
        model.check_layers()?;
        model.zero_grad();
        Ok(model)
    }
}

/// Index of the maximum element in a slice.
pub fn argmax(v: &[f64]) -> usize {
    v.iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn pool(map: &Tensor, pooling: Pooling) -> Vec<f64> {
    match pooling {
        Pooling::Flatten => map.data.clone(),
        Pooling::GlobalAverage => {
            let area = map.area().max(1) as f64;
            (0..map.channels).map(|c| map.plane(c).iter().sum::<f64>() / area).collect()
        }
    }
}

fn unpool(grad: &[f64], shape: (usize, usize, usize), pooling: Pooling) -> Tensor {
    let (c, h, w) = shape;
    match pooling {
        Pooling::Flatten => Tensor { channels: c, height: h, width: w, data: grad.to_vec() },
        Pooling::GlobalAverage => {
            let area = (h * w).max(1) as f64;
            let mut t = Tensor::zeros(c, h, w);
            for ch in 0..c {
                let g = grad[ch] / area;
                for v in &mut t.data[ch * h * w..(ch + 1) * h * w] {
                    *v = g;
                }
            }
            t
        }
    }
}
