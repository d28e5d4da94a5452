use rand::{rngs::StdRng, SeedableRng};

use crate::error::{Error, Result};
use crate::math::tensor::Tensor;
use crate::network::backbone::StageObserver;
use crate::network::network::{argmax, Classifier, Input, Mode};

/// Gradient-weighted class activation mapping on one backbone stage.
///
/// Attached as a `StageObserver`, it keeps the target stage's output on the
/// way forward and the gradient with respect to that output on the way
/// back. `branch` selects which image of a dual-mode pair is explained.
#[derive(Debug, Clone)]
pub struct GradCam {
    pub stage: usize,
    pub branch: usize,
    activation: Option<Tensor>,
    gradient: Option<Tensor>,
}

/// A normalised saliency map and the classes involved.
#[derive(Debug, Clone)]
pub struct CamResult {
    /// `1 x h x w` map in [0, 1] at the target stage's resolution.
    pub map: Tensor,
    /// Argmax of the logits.
    pub predicted: usize,
    /// Class whose logit was back-propagated.
    pub target: usize,
}

impl StageObserver for GradCam {
    fn forward_output(&mut self, branch: usize, stage: usize, output: &Tensor) {
        if branch == self.branch && stage == self.stage {
            self.activation = Some(output.clone());
        }
    }

    fn backward_output(&mut self, branch: usize, stage: usize, grad: &Tensor) {
        if branch == self.branch && stage == self.stage {
            self.gradient = Some(grad.clone());
        }
    }
}

impl GradCam {
    pub fn new(stage: usize, branch: usize) -> GradCam {
        GradCam { stage, branch, activation: None, gradient: None }
    }

    /// Targets the last attention stage of `model`, or its last stage when
    /// it has no attention.
    pub fn for_model(model: &Classifier) -> Result<GradCam> {
        let stages = model.backbone.layers.len();
        if stages == 0 {
            return Err(Error::Config("model has no backbone stages to explain".into()));
        }
        let stage = model.backbone.last_attention_stage().unwrap_or(stages - 1);
        Ok(GradCam::new(stage, 0))
    }

    /// Runs one eval-mode forward and backward pass and builds the map for
    /// `target` (the predicted class when `None`). Gradients left in the
    /// model are cleared afterwards.
    pub fn generate(&mut self, model: &mut Classifier, input: &Input, target: Option<usize>) -> Result<CamResult> {
        if self.stage >= model.backbone.layers.len() {
            return Err(Error::Config(format!(
                "stage {} out of range for a {}-stage backbone",
                self.stage,
                model.backbone.layers.len()
            )));
        }
        self.activation = None;
        self.gradient = None;

        // Dropout is inactive in eval mode, so the generator is never drawn from.
        let mut rng = StdRng::seed_from_u64(0);
        let (logits, trace) = model.forward(input, Mode::Eval, &mut rng, self)?;
        let predicted = argmax(&logits);
        let target = target.unwrap_or(predicted);
        if target >= logits.len() {
            return Err(Error::shape(format!("class < {}", logits.len()), target));
        }

        let mut one_hot = vec![0.0; logits.len()];
        one_hot[target] = 1.0;
        model.backward(&trace, &one_hot, self);
        model.zero_grad();

        let (activation, gradient) = match (self.activation.take(), self.gradient.take()) {
            (Some(a), Some(g)) => (a, g),
            _ => {
                return Err(Error::Config(format!(
                    "branch {} was not observed; is the model in dual mode?",
                    self.branch
                )))
            }
        };
        Ok(CamResult { map: class_activation_map(&activation, &gradient), predicted, target })
    }
}

/// `ReLU(sum_c w_c A_c)` with `w_c` the spatial mean of channel `c`'s
/// gradient, min-max normalised to [0, 1]. A flat map becomes all zeros.
pub fn class_activation_map(activation: &Tensor, gradient: &Tensor) -> Tensor {
    let area = activation.area();
    let mut cam = Tensor::zeros(1, activation.height, activation.width);
    for c in 0..activation.channels {
        let weight = gradient.plane(c).iter().sum::<f64>() / area.max(1) as f64;
        for (out, a) in cam.data.iter_mut().zip(activation.plane(c)) {
            *out += weight * a;
        }
    }

    let cam = cam.map(|v| v.max(0.0));
    let min = cam.data.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = cam.data.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    if range <= 0.0 || !range.is_finite() {
        return Tensor::zeros(1, cam.height, cam.width);
    }
    cam.map(|v| (v - min) / range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::PairingMode;
    use crate::layers::conv::tests::random_tensor;
    use crate::network::spec::ModelConfig;

    #[test]
    fn test_map_from_known_activations() {
        let activation = Tensor::from_data(2, 1, 3, vec![1.0, 2.0, 3.0, 3.0, 0.0, 0.0]).unwrap();
        // Channel weights 1 and -1: raw map [-2, 2, 3] -> relu [0, 2, 3].
        let gradient = Tensor::from_data(2, 1, 3, vec![1.0, 1.0, 1.0, -1.0, -1.0, -1.0]).unwrap();
        let cam = class_activation_map(&activation, &gradient);
        assert_eq!(cam.data, vec![0.0, 2.0 / 3.0, 1.0]);
    }

    #[test]
    fn test_flat_map_is_zero() {
        let activation = Tensor::from_data(1, 2, 2, vec![1.0; 4]).unwrap();
        let gradient = Tensor::from_data(1, 2, 2, vec![-1.0; 4]).unwrap();
        assert_eq!(class_activation_map(&activation, &gradient).data, vec![0.0; 4]);
    }

    #[test]
    fn test_generate_on_attention_stage() {
        let mut rng = StdRng::seed_from_u64(8);
        let mut model = Classifier::new(ModelConfig::compact(8), &mut rng).unwrap();
        let mut cam = GradCam::for_model(&model).unwrap();
        assert_eq!(cam.stage, 7);

        let input = Input::Single(random_tensor(3, 8, 8, 4));
        let result = cam.generate(&mut model, &input, None).unwrap();
        assert_eq!(result.map.shape(), (1, 2, 2));
        assert_eq!(result.target, result.predicted);
        assert!(result.map.data.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(model.params_mut().iter().all(|p| p.grad().iter().all(|g| *g == 0.0)));

        let other = cam.generate(&mut model, &input, Some(4)).unwrap();
        assert_eq!(other.target, 4);
        assert!(cam.generate(&mut model, &input, Some(9)).is_err());
    }

    #[test]
    fn test_second_branch_needs_dual_input() {
        let mut rng = StdRng::seed_from_u64(8);
        let mut model = Classifier::new(ModelConfig::compact(8), &mut rng).unwrap();
        let mut cam = GradCam::new(3, 1);
        let input = Input::Single(random_tensor(3, 8, 8, 4));
        assert!(matches!(cam.generate(&mut model, &input, None), Err(Error::Config(_))));

        let mut dual = Classifier::new(ModelConfig::compact(8).with_mode(PairingMode::Dual), &mut rng).unwrap();
        let pair = Input::Dual(random_tensor(3, 8, 8, 4), random_tensor(3, 8, 8, 5));
        let result = cam.generate(&mut dual, &pair, None).unwrap();
        assert_eq!(result.map.shape(), (1, 4, 4));
    }
}
