use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, atomic::AtomicBool};

use crate::train::epoch_stats::EpochStats;

/// Configuration for a `train_model` run.
///
/// # Fields
/// - `epochs`          - total number of full passes over the training data
/// - `batch_size`      - samples per mini-batch; gradients are averaged over it
/// - `learning_rate`   - initial Adam learning rate
/// - `lr_step`/`lr_gamma` - StepLR schedule: multiply the rate by `lr_gamma`
///                       every `lr_step` epochs
/// - `seed`            - seeds shuffling, augmentation and dropout
/// - `checkpoint_path` - where the model is written whenever validation kappa
///                       improves
/// - `restore_best`    - return the best-kappa weights instead of the final ones
/// - `progress_tx`     - optional channel sender; one `EpochStats` is sent per
///                       completed epoch.  If the receiver is dropped the loop
///                       terminates early (clean shutdown).
/// - `stop_flag`       - optional atomic flag; when set to `true` from another
///                       thread the loop terminates after the current epoch.
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub lr_step: usize,
    pub lr_gamma: f64,
    pub seed: u64,
    pub checkpoint_path: Option<PathBuf>,
    pub restore_best: bool,
    pub progress_tx: Option<mpsc::Sender<EpochStats>>,
    pub stop_flag: Option<Arc<AtomicBool>>,
}

impl TrainConfig {
    /// Creates a `TrainConfig` with the default schedule, no checkpoint,
    /// no progress channel and no stop flag.
    pub fn new(epochs: usize, batch_size: usize, learning_rate: f64) -> Self {
        TrainConfig {
            epochs,
            batch_size,
            learning_rate,
            lr_step: 10,
            lr_gamma: 0.1,
            seed: 42,
            checkpoint_path: None,
            restore_best: false,
            progress_tx: None,
            stop_flag: None,
        }
    }

    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(path.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig::new(10, 24, 1e-4)
    }
}
