use serde::{Serialize, Deserialize};

use crate::metrics::Metrics;

/// Per-epoch training statistics emitted by `train_model`.
///
/// When a `progress_tx` channel is configured in `TrainConfig`, the training
/// loop sends one `EpochStats` value at the end of every completed epoch.
/// Receivers use this to drive progress reporting or external early stopping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochStats {
    /// 1-based epoch number.
    pub epoch: usize,
    /// Total epochs requested for this run.
    pub total_epochs: usize,
    /// Mean training loss over all samples in this epoch.
    pub train_loss: f64,
    /// Metrics of the predictions made while training (dropout active).
    pub train_metrics: Metrics,
    /// Mean validation loss, if a validation set was provided.
    pub val_loss: Option<f64>,
    pub val_metrics: Option<Metrics>,
    /// Learning rate used during this epoch.
    pub learning_rate: f64,
    /// Wall-clock duration of this single epoch in milliseconds.
    pub elapsed_ms: u64,
}
