use rand::Rng;
use serde::{Serialize, Deserialize};

/// Inverted dropout: surviving units are scaled by `1 / (1 - p)` during
/// training so evaluation is a plain pass-through.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dropout {
    pub p: f64,
}

impl Dropout {
    pub fn new(p: f64) -> Dropout {
        Dropout { p: p.clamp(0.0, 1.0) }
    }

    /// Returns the output and the per-unit multiplier applied to it.
    pub fn forward<R: Rng + ?Sized>(&self, input: &[f64], training: bool, rng: &mut R) -> (Vec<f64>, Vec<f64>) {
        if !training || self.p == 0.0 {
            return (input.to_vec(), vec![1.0; input.len()]);
        }
        let keep = 1.0 - self.p;
        let mask: Vec<f64> = input.iter()
            .map(|_| if keep > 0.0 && rng.gen::<f64>() < keep { 1.0 / keep } else { 0.0 })
            .collect();
        let out = input.iter().zip(mask.iter()).map(|(x, m)| x * m).collect();
        (out, mask)
    }

    pub fn backward(mask: &[f64], grad_out: &[f64]) -> Vec<f64> {
        grad_out.iter().zip(mask.iter()).map(|(g, m)| g * m).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_eval_mode_is_identity() {
        let mut rng = StdRng::seed_from_u64(0);
        let (y, mask) = Dropout::new(0.52).forward(&[1.0, -2.0, 3.0], false, &mut rng);
        assert_eq!(y, vec![1.0, -2.0, 3.0]);
        assert_eq!(mask, vec![1.0; 3]);
    }

    #[test]
    fn test_training_mask_is_zero_or_rescaled() {
        let mut rng = StdRng::seed_from_u64(0);
        let d = Dropout::new(0.5);
        let (y, mask) = d.forward(&vec![1.0; 1000], true, &mut rng);
        assert!(mask.iter().all(|&m| m == 0.0 || (m - 2.0).abs() < 1e-12));
        let kept = mask.iter().filter(|&&m| m > 0.0).count();
        assert!(kept > 400 && kept < 600);
        assert_eq!(Dropout::backward(&mask, &y), y.iter().zip(mask.iter()).map(|(a, b)| a * b).collect::<Vec<_>>());
    }
}
