use serde::{Serialize, Deserialize};
use std::path::Path;

use crate::data::dataset::PairingMode;
use crate::error::{Error, Result};
use crate::network::metadata::ModelMetadata;

/// Describes one backbone stage.
///
/// Fields of `Conv`:
/// - `out_channels` - number of filters
/// - `kernel`       - square kernel size
/// - `stride`       - step between windows (default 1)
/// - `padding`      - zero padding on every side
///
/// `Residual` is a two-conv basic block with batch norm; its first conv
/// carries `stride` and the skip path is projected when the shape changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageSpec {
    Conv {
        out_channels: usize,
        kernel: usize,
        #[serde(default = "one")]
        stride: usize,
        #[serde(default)]
        padding: usize,
    },
    Relu,
    MaxPool {
        kernel: usize,
        stride: usize,
        #[serde(default)]
        padding: usize,
    },
    BatchNorm,
    Residual {
        out_channels: usize,
        #[serde(default = "one")]
        stride: usize,
    },
    SelfAttention,
    SpatialAttention,
}

fn one() -> usize {
    1
}

/// How the final feature map becomes the classifier's input vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pooling {
    /// Every value of the map, channel-major (VGG-style head).
    Flatten,
    /// One mean per channel (ResNet-style head).
    GlobalAverage,
}

impl StageSpec {
    pub fn output_shape(&self, shape: (usize, usize, usize)) -> Result<(usize, usize, usize)> {
        let (c, h, w) = shape;
        match *self {
            StageSpec::Conv { out_channels, kernel, stride, padding } => {
                let stride = stride.max(1);
                let (ph, pw) = (h + 2 * padding, w + 2 * padding);
                if ph < kernel || pw < kernel {
                    return Err(Error::Config(format!(
                        "conv{0}x{0} does not fit a padded {1}x{2} map", kernel, ph, pw
                    )));
                }
                Ok((out_channels, (ph - kernel) / stride + 1, (pw - kernel) / stride + 1))
            }
            StageSpec::MaxPool { kernel, stride, padding } => {
                let stride = stride.max(1);
                if 2 * padding > kernel {
                    return Err(Error::Config(format!(
                        "maxpool{} padding {} exceeds half the window", kernel, padding
                    )));
                }
                let (ph, pw) = (h + 2 * padding, w + 2 * padding);
                if ph < kernel || pw < kernel {
                    return Err(Error::Config(format!(
                        "maxpool{0} does not fit a padded {1}x{2} map", kernel, ph, pw
                    )));
                }
                Ok((c, (ph - kernel) / stride + 1, (pw - kernel) / stride + 1))
            }
            StageSpec::Residual { out_channels, stride } => {
                if h == 0 || w == 0 {
                    return Err(Error::Config("residual block needs a non-empty map".to_string()));
                }
                let stride = stride.max(1);
                Ok((out_channels, (h - 1) / stride + 1, (w - 1) / stride + 1))
            }
            StageSpec::Relu | StageSpec::BatchNorm | StageSpec::SelfAttention | StageSpec::SpatialAttention => {
                Ok(shape)
            }
        }
    }
}

/// A fully serializable description of a classifier: backbone stages,
/// pooling, head widths, class count and pairing mode.
///
/// `ModelConfig` is stored inside every saved model so weights can be
/// reloaded without knowing the architecture in advance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Human-readable name used as the model file stem.
    pub name: String,
    pub input_channels: usize,
    /// Images are square `input_size x input_size`.
    pub input_size: usize,
    /// Ordered backbone stages (input → feature map).
    pub stages: Vec<StageSpec>,
    pub pooling: Pooling,
    /// Hidden widths of the head; each is Dense + ReLU + Dropout.
    pub hidden: Vec<usize>,
    pub dropout: f64,
    pub num_classes: usize,
    #[serde(default)]
    pub mode: PairingMode,
    #[serde(default)]
    pub metadata: Option<ModelMetadata>,
}

impl ModelConfig {
    /// VGG16 feature stack with self-attention on the last 512-channel map,
    /// flattened into a 256 → 128 → 5 head with dropout 0.52.
    pub fn vgg16_attention() -> ModelConfig {
        let mut stages = Vec::new();
        for &(width, repeats) in &[(64, 2), (128, 2), (256, 3), (512, 3), (512, 3)] {
            for _ in 0..repeats {
                stages.push(StageSpec::Conv { out_channels: width, kernel: 3, stride: 1, padding: 1 });
                stages.push(StageSpec::Relu);
            }
            stages.push(StageSpec::MaxPool { kernel: 2, stride: 2, padding: 0 });
        }
        stages.push(StageSpec::SelfAttention);

        ModelConfig {
            name: "vgg16_attention".to_string(),
            input_channels: 3,
            input_size: 224,
            stages,
            pooling: Pooling::Flatten,
            hidden: vec![256, 128],
            dropout: 0.52,
            num_classes: 5,
            mode: PairingMode::Single,
            metadata: Some(ModelMetadata::fundus()),
        }
    }

    /// ResNet34 (basic blocks 3-4-6-3) with self-attention after the third
    /// and fourth groups, globally averaged into a 256 → 128 → 5 head.
    pub fn resnet34_attention() -> ModelConfig {
        let mut stages = vec![
            StageSpec::Conv { out_channels: 64, kernel: 7, stride: 2, padding: 3 },
            StageSpec::BatchNorm,
            StageSpec::Relu,
            StageSpec::MaxPool { kernel: 3, stride: 2, padding: 1 },
        ];
        for &(width, blocks) in &[(64, 3), (128, 4), (256, 6), (512, 3)] {
            for block in 0..blocks {
                let stride = if block == 0 && width != 64 { 2 } else { 1 };
                stages.push(StageSpec::Residual { out_channels: width, stride });
            }
            if width >= 256 {
                stages.push(StageSpec::SelfAttention);
            }
        }

        ModelConfig {
            name: "resnet34_attention".to_string(),
            input_channels: 3,
            input_size: 224,
            stages,
            pooling: Pooling::GlobalAverage,
            hidden: vec![256, 128],
            dropout: 0.52,
            num_classes: 5,
            mode: PairingMode::Single,
            metadata: Some(ModelMetadata::fundus()),
        }
    }

    /// A small network for CPU experiments: two conv blocks, spatial and
    /// self-attention, global average pooling.
    pub fn compact(input_size: usize) -> ModelConfig {
        ModelConfig {
            name: "compact_attention".to_string(),
            input_channels: 3,
            input_size,
            stages: vec![
                StageSpec::Conv { out_channels: 8, kernel: 3, stride: 1, padding: 1 },
                StageSpec::Relu,
                StageSpec::MaxPool { kernel: 2, stride: 2, padding: 0 },
                StageSpec::Conv { out_channels: 16, kernel: 3, stride: 1, padding: 1 },
                StageSpec::Relu,
                StageSpec::SpatialAttention,
                StageSpec::MaxPool { kernel: 2, stride: 2, padding: 0 },
                StageSpec::SelfAttention,
            ],
            pooling: Pooling::GlobalAverage,
            hidden: vec![32, 16],
            dropout: 0.2,
            num_classes: 5,
            mode: PairingMode::Single,
            metadata: Some(ModelMetadata::fundus()),
        }
    }

    pub fn with_mode(mut self, mode: PairingMode) -> ModelConfig {
        self.mode = mode;
        self
    }

    /// Shape of the backbone output, checking every stage fits.
    pub fn feature_shape(&self) -> Result<(usize, usize, usize)> {
        if self.input_channels == 0 || self.input_size == 0 {
            return Err(Error::Config("input must have at least one channel and pixel".into()));
        }
        if self.num_classes < 2 {
            return Err(Error::Config(format!("need at least 2 classes, got {}", self.num_classes)));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Config(format!("dropout {} outside [0, 1)", self.dropout)));
        }
        let mut shape = (self.input_channels, self.input_size, self.input_size);
        for stage in &self.stages {
            shape = stage.output_shape(shape)?;
        }
        Ok(shape)
    }

    /// Length of the vector entering the head (both images in dual mode).
    pub fn head_input_len(&self) -> Result<usize> {
        let (c, h, w) = self.feature_shape()?;
        let per_image = match self.pooling {
            Pooling::Flatten => c * h * w,
            Pooling::GlobalAverage => c,
        };
        Ok(per_image * self.mode.images_per_sample())
    }

    /// Serializes the config to a pretty-printed JSON file.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Deserializes a `ModelConfig` from a JSON file.
    pub fn load_json(path: impl AsRef<Path>) -> Result<ModelConfig> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}
