use std::path::{Path, PathBuf};

use rand::{rngs::StdRng, SeedableRng};

use crate::config::PipelineConfig;
use crate::data::dataset::RetinopathyDataset;
use crate::data::transform::Compose;
use crate::ensemble::BoostingEnsemble;
use crate::error::{Error, Result};
use crate::explain::visualize_and_explain;
use crate::metrics::Metrics;
use crate::network::metadata::Normalization;
use crate::network::network::Classifier;
use crate::train::evaluate::write_predictions;
use crate::train::loop_fn::TrainOutcome;

/// Files and scores produced by one `run_pipeline` call.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub outcomes: Vec<TrainOutcome>,
    /// Booster scores on the validation split.
    pub validation: Metrics,
    pub visualizations: Vec<PathBuf>,
    pub predictions_path: Option<PathBuf>,
    pub ensemble_path: PathBuf,
}

/// Trains the ensemble members, fits the booster on their training-set
/// outputs, scores it on validation, explains the first member with GradCAM
/// and writes test predictions.
///
/// Layout under `config.output_dir`:
/// - `members/member_{i}.json` - best-kappa checkpoint of member `i`
/// - `visualizations/` - GradCAM panels and `training_history.json`
/// - `test_predictions.csv` - `ID,TARGET` rows, if a test split is configured
/// - `ensemble.json` - members and booster
pub fn run_pipeline(config: &PipelineConfig) -> Result<PipelineReport> {
    config.validate()?;
    let model_config = config.model_config();
    let norm = config.normalization();
    let size = model_config.input_size;
    let eval_transform = Compose::eval(size, &norm);
    let data = &config.data;

    let train_set = RetinopathyDataset::from_csv(
        &data.train_csv,
        &data.train_dir,
        config.mode,
        Compose::train(config.resize, config.crop, size, &norm),
        false,
    )?;
    let val_set = RetinopathyDataset::from_csv(&data.val_csv, &data.val_dir, config.mode, eval_transform.clone(), false)?;
    tracing::info!(train = train_set.len(), val = val_set.len(), mode = ?config.mode, "datasets loaded");

    let output_dir = &config.output_dir;
    let checkpoint_dir = output_dir.join("members");
    std::fs::create_dir_all(&checkpoint_dir)?;

    // ── Build and train members ───────────────────────────────────────────
    let pretrained = match &config.pretrained_backbone {
        Some(path) => Some(Classifier::load_json(path)?),
        None => None,
    };
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut members = Vec::with_capacity(config.members);
    for _ in 0..config.members {
        let mut member = Classifier::new(model_config.clone(), &mut rng)?;
        if let Some(source) = &pretrained {
            member.load_backbone_from(source);
        }
        members.push(member);
    }
    if let Some(first) = members.first_mut() {
        tracing::info!(members = config.members, parameters = first.parameter_count(), model = %model_config.name, "ensemble built");
    }

    let mut ensemble = BoostingEnsemble::new(members, config.boosting.clone(), config.meta_features);
    let outcomes = ensemble.train_members(&train_set, Some(&val_set), &config.train_config(), Some(&checkpoint_dir))?;

    // ── Meta-learner ──────────────────────────────────────────────────────
    let train_eval = train_set.with_transform(eval_transform.clone());
    let (x_train, y_train) = ensemble.labelled_meta_features(&train_eval)?;
    ensemble.fit_boosting(&x_train, &y_train)?;
    let (x_val, y_val) = ensemble.labelled_meta_features(&val_set)?;
    let validation = ensemble.evaluate_boosting(&x_val, &y_val)?;

    // ── Explanations ──────────────────────────────────────────────────────
    let visualizations = visualize_and_explain(
        &ensemble.members[0],
        &val_set,
        config.visualize_count,
        output_dir.join("visualizations"),
        outcomes.first().map(|o| &o.history),
        &norm,
    )?;

    // ── Test predictions ──────────────────────────────────────────────────
    let predictions_path = match &data.test_csv {
        Some(csv) => {
            let test_set = RetinopathyDataset::from_csv(csv, &data.test_dir, config.mode, eval_transform, true)?;
            let path = output_dir.join("test_predictions.csv");
            write_predictions(&path, &ensemble.predict_dataset(&test_set)?)?;
            Some(path)
        }
        None => None,
    };

    let ensemble_path = output_dir.join("ensemble.json");
    ensemble.save_json(&ensemble_path)?;
    tracing::info!(path = %ensemble_path.display(), "ensemble saved");

    Ok(PipelineReport { outcomes, validation, visualizations, predictions_path, ensemble_path })
}

/// Grades an unlabelled annotation table with a saved ensemble and writes
/// `ID,TARGET` rows to `output`. Input size, pairing mode and normalisation
/// come from the first member's config. Returns the number of rows written.
pub fn predict_with_ensemble(
    model_path: impl AsRef<Path>,
    annotations: impl AsRef<Path>,
    image_dir: impl AsRef<Path>,
    output: impl AsRef<Path>,
) -> Result<usize> {
    let ensemble = BoostingEnsemble::load_json(model_path)?;
    let config = &ensemble
        .members
        .first()
        .ok_or_else(|| Error::Config("ensemble has no members".into()))?
        .config;
    let norm = config
        .metadata
        .as_ref()
        .and_then(|m| m.normalization.clone())
        .unwrap_or(Normalization::IMAGENET);

    let dataset = RetinopathyDataset::from_csv(
        annotations,
        image_dir,
        config.mode,
        Compose::eval(config.input_size, &norm),
        true,
    )?;
    let predictions = ensemble.predict_dataset(&dataset)?;
    write_predictions(output, &predictions)?;
    Ok(predictions.len())
}
