use crate::math::param::Param;
use crate::optim::Optimizer;

/// Plain stochastic gradient descent: `w -= lr * g`.
pub struct Sgd {
    pub learning_rate: f64,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> Sgd {
        Sgd { learning_rate }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: Vec<&mut Param>) {
        for param in params {
            let (values, grad) = param.split_mut();
            for (w, g) in values.iter_mut().zip(grad) {
                *w -= self.learning_rate * g;
            }
        }
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }
}
