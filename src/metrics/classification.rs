use serde::{Serialize, Deserialize};

use crate::metrics::kappa::label_union;

/// Fraction of predictions equal to the label.
pub fn accuracy(labels: &[usize], preds: &[usize]) -> f64 {
    if labels.is_empty() {
        return 0.0;
    }
    let correct = labels.iter().zip(preds.iter()).filter(|(t, p)| t == p).count();
    correct as f64 / labels.len() as f64
}

/// Precision and recall of one class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassScore {
    pub label: usize,
    pub precision: f64,
    pub recall: f64,
    /// Number of true samples of this class.
    pub support: usize,
}

/// Per-class precision and recall over the sorted label union. A class
/// that is never predicted (or never present) scores 0 rather than NaN.
pub fn per_class_scores(labels: &[usize], preds: &[usize]) -> Vec<ClassScore> {
    label_union(labels, preds)
        .into_iter()
        .map(|c| {
            let mut tp = 0usize;
            let mut fp = 0usize;
            let mut fn_count = 0usize;
            for (&t, &p) in labels.iter().zip(preds.iter()) {
                match (t == c, p == c) {
                    (true, true) => tp += 1,
                    (false, true) => fp += 1,
                    (true, false) => fn_count += 1,
                    (false, false) => {}
                }
            }
            ClassScore {
                label: c,
                precision: ratio(tp, tp + fp),
                recall: ratio(tp, tp + fn_count),
                support: tp + fn_count,
            }
        })
        .collect()
}

/// Support-weighted mean precision and recall.
pub fn weighted_precision_recall(labels: &[usize], preds: &[usize]) -> (f64, f64) {
    let scores = per_class_scores(labels, preds);
    let total: usize = scores.iter().map(|s| s.support).sum();
    if total == 0 {
        return (0.0, 0.0);
    }
    let weighted = |f: fn(&ClassScore) -> f64| {
        scores.iter().map(|s| f(s) * s.support as f64).sum::<f64>() / total as f64
    };
    (weighted(|s| s.precision), weighted(|s| s.recall))
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}
