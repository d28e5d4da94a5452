use std::path::Path;

use rand::{rngs::StdRng, SeedableRng};
use serde::{Serialize, Deserialize};

use crate::data::dataset::RetinopathyDataset;
use crate::error::{Error, Result};
use crate::loss::cross_entropy::CrossEntropyLoss;
use crate::metrics::{compute_metrics, Metrics};
use crate::network::network::{argmax, Classifier};

/// Eval-mode results on a labelled dataset.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub metrics: Metrics,
    /// Mean cross-entropy over all samples.
    pub loss: f64,
    pub predictions: Vec<usize>,
    pub labels: Vec<usize>,
}

/// One row of a prediction file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "TARGET")]
    pub target: usize,
}

/// Runs `f` on the eval-mode logits of every sample, in dataset order.
fn for_each_logits<F>(model: &Classifier, dataset: &RetinopathyDataset, mut f: F) -> Result<()>
where
    F: FnMut(usize, Option<usize>, Vec<f64>) -> Result<()>,
{
    // Evaluation transforms are deterministic; the generator only satisfies
    // the dataset interface.
    let mut rng = StdRng::seed_from_u64(0);
    for idx in 0..dataset.len() {
        let sample = dataset.get(idx, &mut rng)?;
        let logits = model.logits(&sample.input)?;
        f(idx, sample.label.map(|l| l.index()), logits)?;
    }
    Ok(())
}

/// Scores `model` on a labelled dataset without updating it.
pub fn evaluate_model(model: &Classifier, dataset: &RetinopathyDataset) -> Result<Evaluation> {
    if dataset.is_empty() {
        return Err(Error::EmptyDataset);
    }
    let mut loss = 0.0;
    let mut predictions = Vec::with_capacity(dataset.len());
    let mut labels = Vec::with_capacity(dataset.len());
    for_each_logits(model, dataset, |idx, label, logits| {
        let label = Error::check_label(label.ok_or(Error::MissingLabel(idx))?, logits.len())?;
        loss += CrossEntropyLoss::loss(&logits, label);
        predictions.push(argmax(&logits));
        labels.push(label);
        Ok(())
    })?;

    Ok(Evaluation {
        metrics: compute_metrics(&predictions, &labels, false),
        loss: loss / dataset.len() as f64,
        predictions,
        labels,
    })
}

/// Predicted grade per image file. In dual mode both images of a pair
/// receive the pair's prediction, first image then second.
pub fn predict_dataset(model: &Classifier, dataset: &RetinopathyDataset) -> Result<Vec<Prediction>> {
    let mut out = Vec::with_capacity(dataset.len() * dataset.mode().images_per_sample());
    for_each_logits(model, dataset, |idx, _, logits| {
        let target = argmax(&logits);
        out.extend(dataset.image_ids(idx).into_iter().map(|id| Prediction { id, target }));
        Ok(())
    })?;
    Ok(out)
}

/// Writes predictions as CSV with the header `ID,TARGET`.
pub fn write_predictions(path: impl AsRef<Path>, predictions: &[Prediction]) -> Result<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path)?;
    for p in predictions {
        writer.serialize(p)?;
    }
    writer.flush()?;
    tracing::info!(path = %path.display(), rows = predictions.len(), "saved predictions");
    Ok(())
}

/// Eval-mode logits of every sample with its label (if any).
pub fn extract_logits(model: &Classifier, dataset: &RetinopathyDataset) -> Result<(Vec<Vec<f64>>, Vec<Option<usize>>)> {
    let mut logits_out = Vec::with_capacity(dataset.len());
    let mut labels = Vec::with_capacity(dataset.len());
    for_each_logits(model, dataset, |_, label, logits| {
        logits_out.push(logits);
        labels.push(label);
        Ok(())
    })?;
    Ok((logits_out, labels))
}
