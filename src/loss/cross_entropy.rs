/// Categorical cross-entropy over raw logits and a class index.
///
/// Softmax is folded into the loss, so the classifier head ends in an
/// identity layer and never materialises probabilities during training.
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    /// Computes the scalar loss:
    ///   L = logsumexp(logits) - logits[target]
    ///
    /// The maximum logit is subtracted first for numerical stability.
    pub fn loss(logits: &[f64], target: usize) -> f64 {
        let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let lse = max + logits.iter().map(|z| (z - max).exp()).sum::<f64>().ln();
        lse - logits[target]
    }

    /// Gradient with respect to the logits:
    ///   ∂L/∂z_i = softmax(z)_i - [i == target]
    ///
    /// This is the initial delta passed into `Classifier::backward`.
    pub fn derivative(logits: &[f64], target: usize) -> Vec<f64> {
        let mut grad = softmax(logits);
        grad[target] -= 1.0;
        grad
    }
}

/// Numerically stable softmax of a logit vector.
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|z| (z - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_logits_give_log_k() {
        let loss = CrossEntropyLoss::loss(&[0.0; 5], 2);
        assert!((loss - 5f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_large_logits_stay_finite() {
        let loss = CrossEntropyLoss::loss(&[1000.0, -1000.0], 1);
        assert!((loss - 2000.0).abs() < 1e-9);
    }

    #[test]
    fn test_derivative_matches_finite_differences() {
        let z = [0.3, -1.2, 2.0, 0.1];
        let grad = CrossEntropyLoss::derivative(&z, 1);
        let eps = 1e-6;
        for i in 0..z.len() {
            let mut plus = z;
            plus[i] += eps;
            let mut minus = z;
            minus[i] -= eps;
            let numeric = (CrossEntropyLoss::loss(&plus, 1) - CrossEntropyLoss::loss(&minus, 1)) / (2.0 * eps);
            assert!((numeric - grad[i]).abs() < 1e-7);
        }
        assert!(grad.iter().sum::<f64>().abs() < 1e-12);
    }
}
