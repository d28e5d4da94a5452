use rand::{rngs::StdRng, seq::index::sample, SeedableRng};
use serde::{Serialize, Deserialize};

use crate::ensemble::tree::{RegressionTree, TreeParams};
use crate::error::{Error, Result};
use crate::loss::cross_entropy::softmax;
use crate::network::network::argmax;

/// Below this the Newton denominator counts as zero and the leaf gets 0.
const MIN_DENOMINATOR: f64 = 1e-150;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostingParams {
    pub n_estimators: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Fraction of rows drawn (without replacement) for each round.
    pub subsample: f64,
    pub seed: u64,
}

impl Default for BoostingParams {
    fn default() -> Self {
        BoostingParams {
            n_estimators: 100,
            learning_rate: 0.1,
            max_depth: 3,
            min_samples_split: 2,
            min_samples_leaf: 1,
            subsample: 1.0,
            seed: 42,
        }
    }
}

/// Gradient-boosted trees for classification.
///
/// Two classes use logistic deviance with one tree per round; more use
/// multinomial deviance with one tree per class per round. Raw scores start
/// at the log class priors (log-odds for two classes) and each tree's leaves
/// hold a single Newton step on the loss.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GradientBoostingClassifier {
    pub params: BoostingParams,
    /// Sorted distinct training labels; empty until fitted.
    pub classes: Vec<usize>,
    n_features: usize,
    init: Vec<f64>,
    /// `rounds[m][k]` is the tree for output column `k` at round `m`.
    rounds: Vec<Vec<RegressionTree>>,
}

impl GradientBoostingClassifier {
    pub fn new(params: BoostingParams) -> GradientBoostingClassifier {
        GradientBoostingClassifier { params, ..Default::default() }
    }

    pub fn is_fitted(&self) -> bool {
        !self.classes.is_empty()
    }

    /// Number of raw score columns: 1 for two classes, K otherwise.
    fn n_outputs(&self) -> usize {
        if self.classes.len() == 2 { 1 } else { self.classes.len() }
    }

    pub fn fit(&mut self, x: &[Vec<f64>], y: &[usize]) -> Result<()> {
        if x.is_empty() {
            return Err(Error::EmptyDataset);
        }
        if x.len() != y.len() {
            return Err(Error::shape(format!("{} labels", x.len()), y.len()));
        }
        let n_features = x[0].len();
        if let Some(row) = x.iter().find(|r| r.len() != n_features) {
            return Err(Error::shape(format!("{} features", n_features), row.len()));
        }

        let mut classes = y.to_vec();
        classes.sort_unstable();
        classes.dedup();
        if classes.len() < 2 {
            return Err(Error::Config(format!("boosting needs at least 2 classes, got {}", classes.len())));
        }
        let encoded: Vec<usize> = y.iter().map(|v| classes.binary_search(v).unwrap_or(0)).collect();

        self.classes = classes;
        self.n_features = n_features;
        self.rounds.clear();

        let n = x.len();
        let k = self.classes.len();
        let mut counts = vec![0usize; k];
        for &c in &encoded {
            counts[c] += 1;
        }
        let priors: Vec<f64> = counts.iter().map(|&c| c as f64 / n as f64).collect();
        self.init = if k == 2 {
            vec![(priors[1] / priors[0]).ln()]
        } else {
            priors.iter().map(|p| p.ln()).collect()
        };

        let tree_params = TreeParams {
            max_depth: self.params.max_depth,
            min_samples_split: self.params.min_samples_split,
            min_samples_leaf: self.params.min_samples_leaf,
        };
        let mut rng = StdRng::seed_from_u64(self.params.seed);
        let n_bag = ((self.params.subsample.clamp(0.0, 1.0) * n as f64) as usize).max(1);
        let outputs = self.n_outputs();
        let mut raw: Vec<Vec<f64>> = vec![self.init.clone(); n];

        for _ in 0..self.params.n_estimators {
            let bag: Vec<usize> = if n_bag < n {
                let mut idx = sample(&mut rng, n, n_bag).into_vec();
                idx.sort_unstable();
                idx
            } else {
                (0..n).collect()
            };

            // Probabilities are frozen for the whole round.
            let probs: Vec<Vec<f64>> = raw.iter().map(|r| self.probabilities(r)).collect();
            let mut round = Vec::with_capacity(outputs);

            for out in 0..outputs {
                let class = if outputs == 1 { 1 } else { out };
                let residual: Vec<f64> = (0..n)
                    .map(|i| (encoded[i] == class) as u8 as f64 - probs[i][class])
                    .collect();
                let mut tree = RegressionTree::fit(x, &residual, &bag, &tree_params);

                let mut num = vec![0.0; tree.nodes.len()];
                let mut den = vec![0.0; tree.nodes.len()];
                for &i in &bag {
                    let leaf = tree.leaf_of(&x[i]);
                    let r = residual[i];
                    num[leaf] += r;
                    den[leaf] += r.abs() * (1.0 - r.abs());
                }
                let scale = if outputs == 1 { 1.0 } else { (k as f64 - 1.0) / k as f64 };
                for leaf in 0..tree.nodes.len() {
                    let value = if den[leaf].abs() < MIN_DENOMINATOR { 0.0 } else { scale * num[leaf] / den[leaf] };
                    tree.set_leaf(leaf, value);
                }

                for (i, row) in x.iter().enumerate() {
                    raw[i][out] += self.params.learning_rate * tree.predict(row);
                }
                round.push(tree);
            }
            self.rounds.push(round);
        }

        tracing::debug!(
            rounds = self.rounds.len(),
            classes = k,
            features = n_features,
            "fitted gradient boosting"
        );
        Ok(())
    }

    fn probabilities(&self, raw: &[f64]) -> Vec<f64> {
        if raw.len() == 1 {
            let p = 1.0 / (1.0 + (-raw[0]).exp());
            vec![1.0 - p, p]
        } else {
            softmax(raw)
        }
    }

    fn check_input(&self, x: &[Vec<f64>]) -> Result<()> {
        if !self.is_fitted() {
            return Err(Error::NotFitted);
        }
        match x.iter().find(|r| r.len() != self.n_features) {
            Some(row) => Err(Error::shape(format!("{} features", self.n_features), row.len())),
            None => Ok(()),
        }
    }

    /// Raw additive scores: one column for two classes, K columns otherwise.
    pub fn decision_function(&self, x: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        self.check_input(x)?;
        Ok(x.iter()
            .map(|row| {
                let mut raw = self.init.clone();
                for round in &self.rounds {
                    for (out, tree) in round.iter().enumerate() {
                        raw[out] += self.params.learning_rate * tree.predict(row);
                    }
                }
                raw
            })
            .collect())
    }

    /// Class probabilities, columns ordered as `classes`.
    pub fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        Ok(self.decision_function(x)?.iter().map(|r| self.probabilities(r)).collect())
    }

    pub fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<usize>> {
        Ok(self.predict_proba(x)?.iter().map(|p| self.classes[argmax(p)]).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blobs() -> (Vec<Vec<f64>>, Vec<usize>) {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for class in 0..3usize {
            for i in 0..10 {
                x.push(vec![class as f64 * 2.0 + (i as f64) * 0.05, (i % 3) as f64]);
                y.push(class * 2);
            }
        }
        (x, y)
    }

    #[test]
    fn test_multiclass_fits_separable_data() {
        let (x, y) = blobs();
        let mut gb = GradientBoostingClassifier::new(BoostingParams { n_estimators: 20, ..Default::default() });
        gb.fit(&x, &y).unwrap();
        assert_eq!(gb.classes, vec![0, 2, 4]);
        assert_eq!(gb.predict(&x).unwrap(), y);
        let proba = gb.predict_proba(&x[..1]).unwrap();
        assert!((proba[0].iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(proba[0][0] > 0.8);
    }

    #[test]
    fn test_zero_rounds_predict_the_majority_prior() {
        let x = vec![vec![0.0], vec![1.0], vec![2.0], vec![3.0]];
        let y = vec![1, 1, 1, 3];
        let mut gb = GradientBoostingClassifier::new(BoostingParams { n_estimators: 0, ..Default::default() });
        gb.fit(&x, &y).unwrap();
        let raw = gb.decision_function(&x[..1]).unwrap();
        // Binary: log-odds of class 3 = ln(0.25 / 0.75)
        assert_eq!(raw[0].len(), 1);
        assert!((raw[0][0] - (1.0f64 / 3.0).ln()).abs() < 1e-12);
        assert_eq!(gb.predict(&x).unwrap(), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_binary_first_round_newton_step() {
        // One feature that separates perfectly; a single stump round.
        let x = vec![vec![0.0], vec![0.0], vec![1.0], vec![1.0]];
        let y = vec![0, 0, 1, 1];
        let params = BoostingParams { n_estimators: 1, learning_rate: 1.0, max_depth: 1, ..Default::default() };
        let mut gb = GradientBoostingClassifier::new(params);
        gb.fit(&x, &y).unwrap();
        // Prior 0.5 -> raw 0, residuals +-0.5, leaf = sum(r) / sum(p(1-p)) = +-2.
        let raw = gb.decision_function(&x).unwrap();
        assert!((raw[0][0] + 2.0).abs() < 1e-12);
        assert!((raw[3][0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_multiclass_leaf_scaling() {
        let x = vec![vec![0.0], vec![1.0], vec![2.0]];
        let y = vec![0, 1, 2];
        let params = BoostingParams { n_estimators: 1, learning_rate: 1.0, max_depth: 0, ..Default::default() };
        let mut gb = GradientBoostingClassifier::new(params);
        gb.fit(&x, &y).unwrap();
        // Root-only trees: every residual sum is 0, so raw scores stay at the priors.
        let raw = gb.decision_function(&x[..1]).unwrap();
        for v in &raw[0] {
            assert!((v - (1.0f64 / 3.0).ln()).abs() < 1e-12);
        }
    }

    #[test]
    fn test_subsample_is_reproducible() {
        let (x, y) = blobs();
        let params = BoostingParams { n_estimators: 10, subsample: 0.5, ..Default::default() };
        let mut a = GradientBoostingClassifier::new(params.clone());
        let mut b = GradientBoostingClassifier::new(params);
        a.fit(&x, &y).unwrap();
        b.fit(&x, &y).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_errors() {
        let gb = GradientBoostingClassifier::default();
        assert!(matches!(gb.predict(&[vec![0.0]]), Err(Error::NotFitted)));

        let mut gb = GradientBoostingClassifier::new(BoostingParams::default());
        assert!(matches!(gb.fit(&[vec![0.0], vec![1.0]], &[2, 2]), Err(Error::Config(_))));
        gb.fit(&[vec![0.0], vec![1.0]], &[0, 1]).unwrap();
        assert!(matches!(gb.predict(&[vec![0.0, 1.0]]), Err(Error::Shape { .. })));
    }

    #[test]
    fn test_serde_roundtrip_keeps_predictions() {
        let (x, y) = blobs();
        let mut gb = GradientBoostingClassifier::new(BoostingParams { n_estimators: 5, ..Default::default() });
        gb.fit(&x, &y).unwrap();
        let json = serde_json::to_string(&gb).unwrap();
        let back: GradientBoostingClassifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back.predict(&x).unwrap(), gb.predict(&x).unwrap());
    }
}
