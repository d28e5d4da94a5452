pub mod adam;
pub mod scheduler;
pub mod sgd;

use crate::math::param::Param;

/// Applies averaged gradients to a model's parameters.
///
/// `params` must be passed in the same order on every call; stateful
/// optimizers key their moment buffers by position.
pub trait Optimizer {
    fn step(&mut self, params: Vec<&mut Param>);
    fn learning_rate(&self) -> f64;
    fn set_learning_rate(&mut self, lr: f64);
}

pub use adam::Adam;
pub use scheduler::StepLr;
pub use sgd::Sgd;
