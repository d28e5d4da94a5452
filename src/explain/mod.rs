pub mod gradcam;
pub mod render;

pub use gradcam::{class_activation_map, CamResult, GradCam};
pub use render::{heatmap, jet, overlay, save_panel, visualize_and_explain};
