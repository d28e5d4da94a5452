use std::path::Path;

use serde::{Serialize, Deserialize};

use crate::data::dataset::RetinopathyDataset;
use crate::ensemble::boosting::{BoostingParams, GradientBoostingClassifier};
use crate::error::{Error, Result};
use crate::metrics::{compute_metrics, Metrics};
use crate::network::network::{argmax, Classifier, Input};
use crate::train::evaluate::{extract_logits, Prediction};
use crate::train::loop_fn::{train_model, TrainOutcome};
use crate::train::train_config::TrainConfig;

/// What each base model contributes to a meta-feature row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaFeatures {
    /// The predicted grade of every member, one column per member.
    #[default]
    Predictions,
    /// The raw logits of every member, concatenated.
    Logits,
}

/// Stacked ensemble: several CNN graders feed a gradient-boosted
/// meta-learner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostingEnsemble {
    pub members: Vec<Classifier>,
    pub booster: GradientBoostingClassifier,
    pub features: MetaFeatures,
}

impl BoostingEnsemble {
    pub fn new(members: Vec<Classifier>, params: BoostingParams, features: MetaFeatures) -> BoostingEnsemble {
        BoostingEnsemble {
            members,
            booster: GradientBoostingClassifier::new(params),
            features,
        }
    }

    /// Predicted class of every member for one input.
    pub fn base_predictions(&self, input: &Input) -> Result<Vec<usize>> {
        self.members
            .iter()
            .map(|m| m.predict(input).map(|(class, _)| class))
            .collect()
    }

    /// One meta-feature row per sample, with the sample's label if any.
    pub fn meta_features(&self, dataset: &RetinopathyDataset) -> Result<(Vec<Vec<f64>>, Vec<Option<usize>>)> {
        if self.members.is_empty() {
            return Err(Error::Config("ensemble has no members".into()));
        }
        let mut rows = vec![Vec::new(); dataset.len()];
        let mut labels = Vec::new();
        for member in &self.members {
            let (logits, member_labels) = extract_logits(member, dataset)?;
            for (row, l) in rows.iter_mut().zip(logits) {
                match self.features {
                    MetaFeatures::Predictions => row.push(argmax(&l) as f64),
                    MetaFeatures::Logits => row.extend(l),
                }
            }
            labels = member_labels;
        }
        Ok((rows, labels))
    }

    /// Meta-features of a labelled dataset; unlabelled samples are an error.
    pub fn labelled_meta_features(&self, dataset: &RetinopathyDataset) -> Result<(Vec<Vec<f64>>, Vec<usize>)> {
        let (x, labels) = self.meta_features(dataset)?;
        let y = labels
            .into_iter()
            .enumerate()
            .map(|(i, l)| l.ok_or(Error::MissingLabel(i)))
            .collect::<Result<Vec<usize>>>()?;
        Ok((x, y))
    }

    pub fn fit_boosting(&mut self, x: &[Vec<f64>], y: &[usize]) -> Result<()> {
        self.booster.fit(x, y)
    }

    pub fn predict_boosting(&self, x: &[Vec<f64>]) -> Result<Vec<usize>> {
        self.booster.predict(x)
    }

    /// Scores the booster on held-out meta-features and logs the result.
    pub fn evaluate_boosting(&self, x: &[Vec<f64>], y: &[usize]) -> Result<Metrics> {
        let preds = self.predict_boosting(x)?;
        let metrics = compute_metrics(&preds, y, false);
        tracing::info!("[boosting] {}", metrics);
        Ok(metrics)
    }

    /// Booster predictions keyed by image file name; in dual mode both
    /// images of a pair share the pair's grade.
    pub fn predict_dataset(&self, dataset: &RetinopathyDataset) -> Result<Vec<Prediction>> {
        let (x, _) = self.meta_features(dataset)?;
        let grades = self.predict_boosting(&x)?;
        Ok(grades
            .into_iter()
            .enumerate()
            .flat_map(|(idx, target)| {
                dataset.image_ids(idx).into_iter().map(move |id| Prediction { id, target })
            })
            .collect())
    }

    /// Trains every member with `train_model`. Member `i` uses seed
    /// `config.seed + i` and, when `checkpoint_dir` is given, checkpoints to
    /// `member_{i}.json` inside it.
    pub fn train_members(
        &mut self,
        train_set: &RetinopathyDataset,
        val_set: Option<&RetinopathyDataset>,
        config: &TrainConfig,
        checkpoint_dir: Option<&Path>,
    ) -> Result<Vec<TrainOutcome>> {
        let total = self.members.len();
        let mut outcomes = Vec::with_capacity(total);
        for (i, member) in self.members.iter_mut().enumerate() {
            tracing::info!(member = i + 1, total, "training ensemble member");
            let member_config = TrainConfig {
                epochs: config.epochs,
                batch_size: config.batch_size,
                learning_rate: config.learning_rate,
                lr_step: config.lr_step,
                lr_gamma: config.lr_gamma,
                seed: config.seed.wrapping_add(i as u64),
                checkpoint_path: checkpoint_dir.map(|d| d.join(format!("member_{}.json", i))),
                restore_best: config.restore_best,
                progress_tx: config.progress_tx.clone(),
                stop_flag: config.stop_flag.clone(),
            };
            outcomes.push(train_model(member, train_set, val_set, &member_config)?);
        }
        Ok(outcomes)
    }

    /// Serializes members and booster to one JSON file.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<BoostingEnsemble> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let mut ensemble: BoostingEnsemble = serde_json::from_reader(reader)?;
        for member in &mut ensemble.members {
            member.zero_grad();
        }
        Ok(ensemble)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::{DrLevel, Entry, PairingMode};
    use crate::data::image::MemoryImageLoader;
    use crate::data::transform::Compose;
    use crate::layers::conv::tests::random_tensor;
    use crate::network::spec::ModelConfig;
    use rand::{rngs::StdRng, SeedableRng};

    fn dataset(n: usize) -> RetinopathyDataset {
        let mut loader = MemoryImageLoader::new();
        let mut entries = Vec::new();
        for i in 0..n {
            let name = format!("{}.png", i);
            loader.insert(name.clone(), random_tensor(3, 8, 8, 50 + i as u64));
            entries.push(Entry { images: vec![name.into()], label: Some(DrLevel::ALL[i % 2]) });
        }
        RetinopathyDataset::from_entries(entries, PairingMode::Single, Compose::default(), Box::new(loader))
    }

    fn ensemble(members: usize, features: MetaFeatures) -> BoostingEnsemble {
        let mut rng = StdRng::seed_from_u64(21);
        let models = (0..members)
            .map(|_| Classifier::new(ModelConfig::compact(8), &mut rng).unwrap())
            .collect();
        BoostingEnsemble::new(models, BoostingParams { n_estimators: 5, ..Default::default() }, features)
    }

    #[test]
    fn test_meta_feature_widths() {
        let ds = dataset(4);
        let (x, y) = ensemble(3, MetaFeatures::Predictions).meta_features(&ds).unwrap();
        assert_eq!(x.len(), 4);
        assert!(x.iter().all(|r| r.len() == 3));
        assert_eq!(y, vec![Some(0), Some(1), Some(0), Some(1)]);

        let (x, _) = ensemble(2, MetaFeatures::Logits).meta_features(&ds).unwrap();
        assert!(x.iter().all(|r| r.len() == 10));
    }

    #[test]
    fn test_base_predictions_match_members() {
        let e = ensemble(2, MetaFeatures::Predictions);
        let input = Input::Single(random_tensor(3, 8, 8, 9));
        let preds = e.base_predictions(&input).unwrap();
        assert_eq!(preds.len(), 2);
        assert_eq!(preds[1], e.members[1].predict(&input).unwrap().0);
    }

    #[test]
    fn test_fit_and_evaluate_on_logits() {
        let ds = dataset(6);
        let mut e = ensemble(2, MetaFeatures::Logits);
        e.booster.params.n_estimators = 50;
        let (x, y) = e.labelled_meta_features(&ds).unwrap();
        e.fit_boosting(&x, &y).unwrap();
        let metrics = e.evaluate_boosting(&x, &y).unwrap();
        // Distinct logit rows are separable on the training set.
        assert_eq!(metrics.accuracy, 1.0);
        let preds = e.predict_dataset(&ds).unwrap();
        assert_eq!(preds.iter().map(|p| p.target).collect::<Vec<_>>(), y);
        assert_eq!(preds[1].id, "1.png");
    }

    #[test]
    fn test_predict_before_fit_fails() {
        let e = ensemble(1, MetaFeatures::Predictions);
        assert!(matches!(e.predict_boosting(&[vec![0.0]]), Err(Error::NotFitted)));
    }

    #[test]
    fn test_train_members_writes_checkpoints() {
        let (train, val) = (dataset(4), dataset(3));
        let dir = tempfile::tempdir().unwrap();
        let mut e = ensemble(2, MetaFeatures::Predictions);
        let config = TrainConfig::new(1, 4, 1e-3);
        let outcomes = e.train_members(&train, Some(&val), &config, Some(dir.path())).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(dir.path().join("member_0.json").exists());
        assert!(dir.path().join("member_1.json").exists());
    }
}
