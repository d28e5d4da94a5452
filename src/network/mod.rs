pub mod backbone;
pub mod metadata;
pub mod network;
pub mod spec;

pub use backbone::{Backbone, NoObserver, StageObserver};
pub use metadata::{ModelMetadata, Normalization};
pub use network::{argmax, Classifier, ForwardTrace, Input, Mode};
pub use spec::{ModelConfig, Pooling, StageSpec};
