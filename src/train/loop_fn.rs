use std::sync::atomic::Ordering;
use std::time::Instant;

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::data::dataset::RetinopathyDataset;
use crate::error::{Error, Result};
use crate::metrics::compute_metrics;
use crate::network::network::Classifier;
use crate::optim::{Adam, Optimizer, StepLr};
use crate::train::epoch_stats::EpochStats;
use crate::train::evaluate::evaluate_model;
use crate::train::history::TrainingHistory;
use crate::train::train_config::TrainConfig;
use crate::train::trainer::train_batch;

/// What a training run produced besides the updated model.
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub history: TrainingHistory,
    /// 1-based epoch with the highest validation kappa, if any epoch was
    /// validated.
    pub best_epoch: Option<usize>,
    /// Highest validation kappa seen; `-1.0` when nothing was validated.
    pub best_kappa: f64,
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Trains `model` for `config.epochs` epochs with Adam and a StepLR schedule.
///
/// # Arguments
/// - `model`     - mutable reference to the classifier; modified in place
/// - `train_set` - labelled training samples (augmenting transform)
/// - `val_set`   - optional labelled validation samples (eval transform)
/// - `config`    - hyperparameters, checkpointing, optional progress channel
///                 and stop flag
///
/// # Checkpointing
/// Whenever validation kappa is strictly greater than the best so far
/// (starting from `-1.0`) the model is snapshotted and, if
/// `config.checkpoint_path` is set, written there. The final model is kept
/// unless `config.restore_best` is set.
///
/// # Early termination
/// The loop breaks early if:
/// - the `progress_tx` receiver has been dropped, **or**
/// - `config.stop_flag` is set to `true`.
pub fn train_model(
    model: &mut Classifier,
    train_set: &RetinopathyDataset,
    val_set: Option<&RetinopathyDataset>,
    config: &TrainConfig,
) -> Result<TrainOutcome> {
    if train_set.is_empty() {
        return Err(Error::EmptyDataset);
    }
    if config.batch_size == 0 {
        return Err(Error::Config("batch_size must be at least 1".into()));
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut optimizer = Adam::new(config.learning_rate);
    let mut scheduler = StepLr::new(config.learning_rate, config.lr_step, config.lr_gamma);

    let mut history = TrainingHistory::default();
    let mut best_kappa = -1.0;
    let mut best_epoch = None;
    let mut best_model: Option<Classifier> = None;

    for epoch in 1..=config.epochs {
        // Check stop flag at the top of each epoch.
        if stop_requested(config) {
            break;
        }

        let t_start = Instant::now();
        let learning_rate = optimizer.learning_rate();

        // ── One full pass over the training data ───────────────────────────
        let mut indices: Vec<usize> = (0..train_set.len()).collect();
        indices.shuffle(&mut rng);

        let mut loss_sum = 0.0;
        let mut preds = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        for batch in indices.chunks(config.batch_size) {
            let result = train_batch(model, train_set, batch, &mut optimizer, &mut rng)?;
            tracing::trace!(epoch, loss = result.loss_sum / batch.len() as f64, "batch");
            loss_sum += result.loss_sum;
            preds.extend(result.preds);
            labels.extend(result.labels);
        }
        scheduler.step(&mut optimizer);

        let train_loss = loss_sum / indices.len() as f64;
        let train_metrics = compute_metrics(&preds, &labels, true);
        tracing::info!(epoch, total = config.epochs, lr = learning_rate, loss = train_loss, "[train] {}", train_metrics);

        // ── Validation ────────────────────────────────────────────────────
        let (val_loss, val_metrics) = match val_set {
            Some(val) => {
                let eval = evaluate_model(model, val)?;
                tracing::info!(epoch, loss = eval.loss, "[val] {}", eval.metrics);
                (Some(eval.loss), Some(eval.metrics))
            }
            None => (None, None),
        };

        // ── Checkpoint on improved kappa ──────────────────────────────────
        if let Some(kappa) = val_metrics.as_ref().map(|m| m.kappa) {
            if kappa > best_kappa {
                best_kappa = kappa;
                best_epoch = Some(epoch);
                best_model = Some(model.clone());
                if let Some(path) = &config.checkpoint_path {
                    model.save_json(path)?;
                    tracing::debug!(epoch, kappa, path = %path.display(), "checkpoint saved");
                }
            }
        }

        // ── Emit progress ─────────────────────────────────────────────────
        let stats = EpochStats {
            epoch,
            total_epochs: config.epochs,
            train_loss,
            train_metrics,
            val_loss,
            val_metrics,
            learning_rate,
            elapsed_ms: t_start.elapsed().as_millis() as u64,
        };
        history.record(&stats);

        if let Some(ref tx) = config.progress_tx {
            // If the receiver has been dropped, stop training.
            if tx.send(stats).is_err() {
                break;
            }
        }

        // Check stop flag again after potentially expensive eval.
        if stop_requested(config) {
            break;
        }
    }

    match best_epoch {
        Some(epoch) => tracing::info!(epoch, kappa = best_kappa, "[val] best kappa"),
        None => tracing::info!("training finished without validation"),
    }
    if config.restore_best {
        if let Some(best) = best_model {
            *model = best;
        }
    }

    Ok(TrainOutcome { history, best_epoch, best_kappa })
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn stop_requested(config: &TrainConfig) -> bool {
    config
        .stop_flag
        .as_ref()
        .map(|flag| flag.load(Ordering::Relaxed))
        .unwrap_or(false)
}
