use serde::{Serialize, Deserialize};
use std::path::Path;

use crate::error::Result;
use crate::train::epoch_stats::EpochStats;

/// Loss and accuracy curves of one training run, one value per epoch.
/// Validation vectors stay empty when no validation set was used.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub train_loss: Vec<f64>,
    pub val_loss: Vec<f64>,
    pub train_accuracy: Vec<f64>,
    pub val_accuracy: Vec<f64>,
    #[serde(default)]
    pub val_kappa: Vec<f64>,
}

impl TrainingHistory {
    pub fn record(&mut self, stats: &EpochStats) {
        self.train_loss.push(stats.train_loss);
        self.train_accuracy.push(stats.train_metrics.accuracy);
        if let (Some(loss), Some(metrics)) = (stats.val_loss, &stats.val_metrics) {
            self.val_loss.push(loss);
            self.val_accuracy.push(metrics.accuracy);
            self.val_kappa.push(metrics.kappa);
        }
    }

    pub fn epochs(&self) -> usize {
        self.train_loss.len()
    }

    /// Serializes the history to a pretty-printed JSON file.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<TrainingHistory> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::compute_metrics;

    fn stats(epoch: usize, with_val: bool) -> EpochStats {
        EpochStats {
            epoch,
            total_epochs: 2,
            train_loss: 1.0 / epoch as f64,
            train_metrics: compute_metrics(&[0, 1], &[0, 0], false),
            val_loss: with_val.then_some(0.5),
            val_metrics: with_val.then(|| compute_metrics(&[1, 1], &[1, 1], false)),
            learning_rate: 1e-4,
            elapsed_ms: 3,
        }
    }

    #[test]
    fn test_record_and_json_roundtrip() {
        let mut history = TrainingHistory::default();
        history.record(&stats(1, true));
        history.record(&stats(2, false));
        assert_eq!(history.epochs(), 2);
        assert_eq!(history.train_accuracy, vec![0.5, 0.5]);
        assert_eq!(history.val_accuracy, vec![1.0]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        history.save_json(&path).unwrap();
        assert_eq!(TrainingHistory::load_json(&path).unwrap(), history);
    }
}
