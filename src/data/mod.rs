pub mod annotations;
pub mod dataset;
pub mod image;
pub mod transform;

pub use annotations::{read_annotations, AnnotationRow};
pub use dataset::{DrLevel, Entry, PairingMode, RetinopathyDataset, Sample};
pub use image::{DiskImageLoader, ImageLoader, MemoryImageLoader};
pub use transform::{Compose, Transform};
