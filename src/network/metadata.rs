use serde::{Deserialize, Serialize};

use crate::data::dataset::DrLevel;

/// Optional annotations attached to a saved model.
/// All fields are Option<> so bare configs deserialize cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelMetadata {
    pub description: Option<String>,
    /// Human-readable class labels for the output layer.
    pub output_labels: Option<Vec<String>>,
    /// Per-channel normalisation the model was trained with.
    pub normalization: Option<Normalization>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: [f64; 3],
    pub std: [f64; 3],
}

impl Normalization {
    pub const IMAGENET: Normalization = Normalization {
        mean: [0.485, 0.456, 0.406],
        std: [0.229, 0.224, 0.225],
    };
}

impl ModelMetadata {
    /// Metadata for a five-level DR grader on ImageNet-normalised RGB input.
    pub fn fundus() -> ModelMetadata {
        ModelMetadata {
            description: Some("Diabetic retinopathy severity grading (5 ordinal levels)".to_string()),
            output_labels: Some(DrLevel::ALL.iter().map(|l| l.name().to_string()).collect()),
            normalization: Some(Normalization::IMAGENET),
        }
    }
}
