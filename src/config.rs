use std::path::{Path, PathBuf};

use serde::{Serialize, Deserialize};

use crate::data::dataset::{DrLevel, PairingMode};
use crate::ensemble::{BoostingParams, MetaFeatures};
use crate::error::{Error, Result};
use crate::network::metadata::Normalization;
use crate::network::spec::ModelConfig;
use crate::train::train_config::TrainConfig;

/// Annotation tables and image directories of the three splits.
/// Defaults follow the DeepDRiD layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataPaths {
    pub train_csv: PathBuf,
    pub train_dir: PathBuf,
    pub val_csv: PathBuf,
    pub val_dir: PathBuf,
    /// Unlabelled split; no prediction file is written when absent.
    pub test_csv: Option<PathBuf>,
    pub test_dir: PathBuf,
}

impl Default for DataPaths {
    fn default() -> Self {
        DataPaths {
            train_csv: "./DeepDRiD/train.csv".into(),
            train_dir: "./DeepDRiD/train/".into(),
            val_csv: "./DeepDRiD/val.csv".into(),
            val_dir: "./DeepDRiD/val/".into(),
            test_csv: Some("./DeepDRiD/test.csv".into()),
            test_dir: "./DeepDRiD/test/".into(),
        }
    }
}

/// Serializable subset of `TrainConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub lr_step: usize,
    pub lr_gamma: f64,
    pub restore_best: bool,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        let base = TrainConfig::default();
        TrainingSettings {
            epochs: base.epochs,
            batch_size: base.batch_size,
            learning_rate: base.learning_rate,
            lr_step: base.lr_step,
            lr_gamma: base.lr_gamma,
            restore_best: base.restore_best,
        }
    }
}

/// Everything `run_pipeline` needs, loadable from JSON. Missing fields take
/// their defaults, so `{}` is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data: DataPaths,
    /// Overrides `model.mode`.
    pub mode: PairingMode,
    pub model: ModelConfig,
    /// Training augmentation: resize to `resize`, random crop to `crop`,
    /// then pad back to `model.input_size`.
    pub resize: usize,
    pub crop: usize,
    pub members: usize,
    pub training: TrainingSettings,
    pub boosting: BoostingParams,
    pub meta_features: MetaFeatures,
    /// A saved classifier whose backbone weights seed every member.
    pub pretrained_backbone: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub visualize_count: usize,
    pub seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            data: DataPaths::default(),
            mode: PairingMode::Single,
            model: ModelConfig::vgg16_attention(),
            resize: 256,
            crop: 210,
            members: 5,
            training: TrainingSettings::default(),
            boosting: BoostingParams::default(),
            meta_features: MetaFeatures::Predictions,
            pretrained_backbone: None,
            output_dir: "./output".into(),
            visualize_count: 5,
            seed: 42,
        }
    }
}

impl PipelineConfig {
    pub fn load_json(path: impl AsRef<Path>) -> Result<PipelineConfig> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let config: PipelineConfig = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.members == 0 {
            return Err(Error::Config("ensemble needs at least one member".into()));
        }
        if self.training.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.crop > self.resize {
            return Err(Error::Config(format!("crop {} larger than resize {}", self.crop, self.resize)));
        }
        if self.crop > self.model.input_size {
            return Err(Error::Config(format!(
                "crop {} larger than model input {}; padding cannot restore the input size",
                self.crop, self.model.input_size
            )));
        }
        if self.model.num_classes < DrLevel::ALL.len() {
            return Err(Error::Config(format!(
                "model has {} classes but DR labels span {}",
                self.model.num_classes,
                DrLevel::ALL.len()
            )));
        }
        self.model_config().feature_shape()?;
        Ok(())
    }

    /// The model config with the pipeline's pairing mode applied.
    pub fn model_config(&self) -> ModelConfig {
        self.model.clone().with_mode(self.mode)
    }

    /// Normalisation stored with the model, ImageNet statistics otherwise.
    pub fn normalization(&self) -> Normalization {
        self.model
            .metadata
            .as_ref()
            .and_then(|m| m.normalization.clone())
            .unwrap_or(Normalization::IMAGENET)
    }

    pub fn train_config(&self) -> TrainConfig {
        let mut config = TrainConfig::new(self.training.epochs, self.training.batch_size, self.training.learning_rate)
            .with_seed(self.seed);
        config.lr_step = self.training.lr_step;
        config.lr_gamma = self.training.lr_gamma;
        config.restore_best = self.training.restore_best;
        config
    }
}
