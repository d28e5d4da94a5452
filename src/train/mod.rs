pub mod epoch_stats;
pub mod evaluate;
pub mod history;
pub mod loop_fn;
pub mod train_config;
pub mod trainer;

pub use epoch_stats::EpochStats;
pub use evaluate::{evaluate_model, extract_logits, predict_dataset, write_predictions, Evaluation, Prediction};
pub use history::TrainingHistory;
pub use loop_fn::{train_model, TrainOutcome};
pub use train_config::TrainConfig;
pub use trainer::{train_batch, BatchResult};
