pub mod matrix;
pub mod param;
pub mod tensor;

pub use matrix::Matrix;
pub use param::Param;
pub use tensor::Tensor;
