pub mod error;
pub mod math;
pub mod activation;
pub mod layers;
pub mod network;
pub mod loss;
pub mod optim;
pub mod data;
pub mod metrics;
pub mod train;
pub mod ensemble;
pub mod explain;
pub mod config;
pub mod pipeline;

// Convenience re-exports
pub use error::{Error, Result};
pub use math::{Matrix, Param, Tensor};
pub use activation::ActivationFunction;
pub use network::{Classifier, Input, Mode, ModelConfig};
pub use loss::CrossEntropyLoss;
pub use optim::{Adam, Optimizer, Sgd, StepLr};
pub use data::{DrLevel, PairingMode, RetinopathyDataset};
pub use metrics::{compute_metrics, quadratic_weighted_kappa, Metrics};
pub use train::{evaluate_model, train_model, TrainConfig, TrainingHistory};
pub use ensemble::{BoostingEnsemble, BoostingParams, GradientBoostingClassifier, MetaFeatures};
pub use explain::{visualize_and_explain, GradCam};
pub use config::PipelineConfig;
pub use pipeline::{predict_with_ensemble, run_pipeline, PipelineReport};
