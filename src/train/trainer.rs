use rand::Rng;

use crate::data::dataset::RetinopathyDataset;
use crate::error::{Error, Result};
use crate::loss::cross_entropy::CrossEntropyLoss;
use crate::network::backbone::NoObserver;
use crate::network::network::{argmax, Classifier, Mode};
use crate::optim::Optimizer;

/// Loss and predictions collected from one mini-batch.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub loss_sum: f64,
    pub preds: Vec<usize>,
    pub labels: Vec<usize>,
}

/// Runs one optimisation step on the samples at `indices`.
///
/// Every sample is forwarded in training mode and back-propagated on its
/// own; parameter gradients accumulate across the batch, are averaged, and
/// are applied by `optimizer` once.
pub fn train_batch<R: Rng + ?Sized>(
    model: &mut Classifier,
    dataset: &RetinopathyDataset,
    indices: &[usize],
    optimizer: &mut dyn Optimizer,
    rng: &mut R,
) -> Result<BatchResult> {
    let mut result = BatchResult::default();
    if indices.is_empty() {
        return Ok(result);
    }
    model.zero_grad();

    for &idx in indices {
        let sample = dataset.get(idx, rng)?;
        let label = sample.label.ok_or(Error::MissingLabel(idx))?.index();

        let (logits, trace) = model.forward(&sample.input, Mode::Train, rng, &mut NoObserver)?;
        let label = Error::check_label(label, logits.len())?;
        result.loss_sum += CrossEntropyLoss::loss(&logits, label);
        result.preds.push(argmax(&logits));
        result.labels.push(label);

        // Initial delta: ∂L/∂logits = softmax - one_hot
        let delta = CrossEntropyLoss::derivative(&logits, label);
        model.backward(&trace, &delta, &mut NoObserver);
    }

    let inv_batch = 1.0 / indices.len() as f64;
    for param in model.params_mut() {
        param.scale_grad(inv_batch);
    }
    optimizer.step(model.params_mut());
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::{DrLevel, Entry, PairingMode};
    use crate::data::image::MemoryImageLoader;
    use crate::data::transform::Compose;
    use crate::layers::conv::tests::random_tensor;
    use crate::network::network::Input;
    use crate::network::spec::ModelConfig;
    use crate::optim::Adam;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_repeated_steps_fit_a_tiny_batch() {
        let mut loader = MemoryImageLoader::new();
        let mut entries = Vec::new();
        for i in 0..3 {
            let name = format!("{}.png", i);
            loader.insert(name.clone(), random_tensor(3, 8, 8, 100 + i as u64));
            entries.push(Entry { images: vec![name.into()], label: Some(DrLevel::ALL[i]) });
        }
        let ds = RetinopathyDataset::from_entries(entries, PairingMode::Single, Compose::default(), Box::new(loader));

        let mut cfg = ModelConfig::compact(8);
        cfg.dropout = 0.0;
        let mut rng = StdRng::seed_from_u64(0);
        let mut model = Classifier::new(cfg, &mut rng).unwrap();
        let mut adam = Adam::new(0.01);

        let first = train_batch(&mut model, &ds, &[0, 1, 2], &mut adam, &mut rng).unwrap();
        let mut last = first.clone();
        for _ in 0..60 {
            last = train_batch(&mut model, &ds, &[0, 1, 2], &mut adam, &mut rng).unwrap();
        }
        assert!(last.loss_sum < first.loss_sum, "{} !< {}", last.loss_sum, first.loss_sum);
        assert_eq!(last.labels, vec![0, 1, 2]);

        let x = ds.get(1, &mut rng).unwrap().input;
        assert!(matches!(x, Input::Single(_)));
    }

    #[test]
    fn test_unlabelled_sample_is_rejected() {
        let mut loader = MemoryImageLoader::new();
        loader.insert("a.png", random_tensor(3, 8, 8, 1));
        let entries = vec![Entry { images: vec!["a.png".into()], label: None }];
        let ds = RetinopathyDataset::from_entries(entries, PairingMode::Single, Compose::default(), Box::new(loader));
        let mut rng = StdRng::seed_from_u64(0);
        let mut model = Classifier::new(ModelConfig::compact(8), &mut rng).unwrap();
        let err = train_batch(&mut model, &ds, &[0], &mut Adam::new(1e-3), &mut rng);
        assert!(matches!(err, Err(Error::MissingLabel(0))));
    }

    #[test]
    fn test_label_beyond_model_classes_is_rejected() {
        let mut loader = MemoryImageLoader::new();
        loader.insert("a.png", random_tensor(3, 8, 8, 1));
        let entries = vec![Entry { images: vec!["a.png".into()], label: Some(DrLevel::Proliferative) }];
        let ds = RetinopathyDataset::from_entries(entries, PairingMode::Single, Compose::default(), Box::new(loader));
        let mut cfg = ModelConfig::compact(8);
        cfg.num_classes = 3;
        let mut rng = StdRng::seed_from_u64(0);
        let mut model = Classifier::new(cfg, &mut rng).unwrap();
        let err = train_batch(&mut model, &ds, &[0], &mut Adam::new(1e-3), &mut rng);
        assert!(matches!(err, Err(Error::LabelOutOfRange { label: 4, classes: 3 })));
    }
}
