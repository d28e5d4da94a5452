use std::path::PathBuf;

/// Errors raised while loading data, training, ensembling or explaining.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot decode image '{path}': {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("invalid DR level {0} (expected 0..=4)")]
    InvalidLabel(i64),

    #[error("row {row}: {message}")]
    Annotation { row: usize, message: String },

    #[error("shape mismatch: expected {expected}, got {actual}")]
    Shape { expected: String, actual: String },

    #[error("dataset is empty")]
    EmptyDataset,

    #[error("sample {0} has no label")]
    MissingLabel(usize),

    #[error("label {label} outside the model's {classes} classes")]
    LabelOutOfRange { label: usize, classes: usize },

    #[error("booster has not been fitted")]
    NotFitted,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn shape(expected: impl ToString, actual: impl ToString) -> Error {
        Error::Shape {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// `label` as a logit index, or `LabelOutOfRange` when the model has no
    /// such output.
    pub(crate) fn check_label(label: usize, classes: usize) -> Result<usize> {
        if label < classes {
            Ok(label)
        } else {
            Err(Error::LabelOutOfRange { label, classes })
        }
    }
}
