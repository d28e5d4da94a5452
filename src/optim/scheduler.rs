use crate::optim::Optimizer;

/// Multiplies the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone)]
pub struct StepLr {
    pub step_size: usize,
    pub gamma: f64,
    base_lr: f64,
    epoch: usize,
}

impl StepLr {
    pub fn new(base_lr: f64, step_size: usize, gamma: f64) -> StepLr {
        StepLr { step_size: step_size.max(1), gamma, base_lr, epoch: 0 }
    }

    /// Learning rate for a given number of completed epochs.
    pub fn lr_at(&self, epoch: usize) -> f64 {
        self.base_lr * self.gamma.powi((epoch / self.step_size) as i32)
    }

    /// Marks one epoch complete and updates the optimizer's learning rate.
    pub fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.epoch += 1;
        optimizer.set_learning_rate(self.lr_at(self.epoch));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::Sgd;

    #[test]
    fn test_decays_every_step_size_epochs() {
        let mut sgd = Sgd::new(1e-4);
        let mut sched = StepLr::new(1e-4, 10, 0.1);
        for _ in 0..9 {
            sched.step(&mut sgd);
        }
        assert!((sgd.learning_rate() - 1e-4).abs() < 1e-15);
        sched.step(&mut sgd);
        assert!((sgd.learning_rate() - 1e-5).abs() < 1e-15);
        assert!((sched.lr_at(25) - 1e-6).abs() < 1e-15);
    }
}
