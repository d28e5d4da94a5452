pub mod attention;
pub mod batchnorm;
pub mod conv;
pub mod dense;
pub mod dropout;
pub mod pool;
pub mod residual;
pub mod spatial;
pub mod stage;

pub use attention::SelfAttention;
pub use batchnorm::BatchNorm2d;
pub use conv::Conv2d;
pub use dense::Layer;
pub use dropout::Dropout;
pub use pool::MaxPool2d;
pub use residual::ResidualBlock;
pub use spatial::SpatialAttention;
pub use stage::{FeatureCache, FeatureLayer, HeadCache, HeadLayer};
