//! Quadratic weighted Cohen's kappa, the DR grading selection metric.

/// Sorted union of the labels observed in either sequence.
pub fn label_union(a: &[usize], b: &[usize]) -> Vec<usize> {
    let mut labels: Vec<usize> = a.iter().chain(b.iter()).copied().collect();
    labels.sort_unstable();
    labels.dedup();
    labels
}

/// Cohen's kappa with quadratic weights.
///
/// The confusion matrix is built over the sorted union of observed labels
/// and the weight of cell `(i, j)` is `(i - j)^2` in that list's positions,
/// so an unobserved grade between two observed ones does not widen the gap.
/// Returns 0.0 when the expected weighted disagreement is zero (for example
/// when both raters use a single grade) or when the inputs are empty.
pub fn quadratic_weighted_kappa(labels: &[usize], preds: &[usize]) -> f64 {
    let n = labels.len().min(preds.len());
    if n == 0 {
        return 0.0;
    }
    let classes = label_union(&labels[..n], &preds[..n]);
    let k = classes.len();
    let pos = |v: usize| classes.binary_search(&v).unwrap_or(0);

    let mut confusion = vec![vec![0.0; k]; k];
    for (&t, &p) in labels.iter().zip(preds.iter()) {
        confusion[pos(t)][pos(p)] += 1.0;
    }
    let row_sums: Vec<f64> = confusion.iter().map(|r| r.iter().sum()).collect();
    let col_sums: Vec<f64> = (0..k).map(|j| confusion.iter().map(|r| r[j]).sum()).collect();
    let total = n as f64;

    let mut observed = 0.0;
    let mut expected = 0.0;
    for i in 0..k {
        for j in 0..k {
            let w = ((i as f64) - (j as f64)).powi(2);
            observed += w * confusion[i][j];
            expected += w * row_sums[i] * col_sums[j] / total;
        }
    }
    if expected == 0.0 {
        return 0.0;
    }
    1.0 - observed / expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_agreement_is_one() {
        let y = [0, 1, 2, 3, 4, 2];
        assert!((quadratic_weighted_kappa(&y, &y) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_known_value() {
        // Confusion over labels [0, 1, 2]: [[1,1,0],[0,1,1],[0,0,1]], n = 5.
        let labels = [0, 0, 1, 1, 2];
        let preds = [0, 1, 1, 2, 2];
        // observed = 2, expected = 6.4
        let k = quadratic_weighted_kappa(&labels, &preds);
        assert!((k - (1.0 - 2.0 / 6.4)).abs() < 1e-12, "{}", k);
    }

    #[test]
    fn test_weights_use_positions_in_label_union() {
        // Labels {0, 4} behave exactly like {0, 1}.
        let a = quadratic_weighted_kappa(&[0, 0, 4, 4], &[0, 4, 4, 0]);
        let b = quadratic_weighted_kappa(&[0, 0, 1, 1], &[0, 1, 1, 0]);
        assert!((a - b).abs() < 1e-12);
        assert!(a.abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_inputs_give_zero() {
        assert_eq!(quadratic_weighted_kappa(&[2, 2, 2], &[2, 2, 2]), 0.0);
        assert_eq!(quadratic_weighted_kappa(&[], &[]), 0.0);
    }

    #[test]
    fn test_systematic_disagreement_is_negative() {
        let k = quadratic_weighted_kappa(&[0, 1, 2, 3, 4], &[4, 3, 2, 1, 0]);
        assert!(k < 0.0);
    }
}
