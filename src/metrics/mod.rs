//! Grading metrics: quadratic weighted kappa plus accuracy and
//! support-weighted precision/recall.

pub mod classification;
pub mod kappa;

use std::fmt;

use serde::{Serialize, Deserialize};

pub use classification::{accuracy, per_class_scores, weighted_precision_recall, ClassScore};
pub use kappa::quadratic_weighted_kappa;

/// Scores of one set of predictions against the labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub kappa: f64,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    /// Filled when requested from `compute_metrics`.
    pub per_class: Option<Vec<ClassScore>>,
}

/// Computes every grading metric; `per_class` adds per-grade precision and
/// recall over the label union.
pub fn compute_metrics(preds: &[usize], labels: &[usize], per_class: bool) -> Metrics {
    let (precision, recall) = weighted_precision_recall(labels, preds);
    Metrics {
        kappa: quadratic_weighted_kappa(labels, preds),
        accuracy: accuracy(labels, preds),
        precision,
        recall,
        per_class: per_class.then(|| per_class_scores(labels, preds)),
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "kappa={:.4} acc={:.4} prec={:.4} rec={:.4}",
            self.kappa, self.accuracy, self.precision, self.recall,
        )?;
        if let Some(classes) = &self.per_class {
            for c in classes {
                write!(f, "\n  class {}: prec={:.4} rec={:.4}", c.label, c.precision, c.recall)?;
            }
        }
        Ok(())
    }
}
