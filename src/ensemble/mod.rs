pub mod boosting;
pub mod ensemble;
pub mod tree;

pub use boosting::{BoostingParams, GradientBoostingClassifier};
pub use ensemble::{BoostingEnsemble, MetaFeatures};
pub use tree::{RegressionTree, TreeParams};
