//! Image decoding for the fundus datasets.
//!
//! Images are decoded (PNG/JPEG/BMP/GIF), converted to RGB and laid out as a
//! channel-major `3 x H x W` tensor with values in [0, 1]. Resizing happens
//! later in the transform pipeline.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::math::tensor::Tensor;

/// Source of decoded images keyed by path.
pub trait ImageLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Tensor>;
}

/// Reads images from disk with the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskImageLoader;

impl ImageLoader for DiskImageLoader {
    fn load(&self, path: &Path) -> Result<Tensor> {
        let img = image::open(path).map_err(|source| Error::Image {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(rgb_to_tensor(&img.to_rgb8()))
    }
}

/// Serves pre-built tensors, for tests and synthetic data.
#[derive(Debug, Clone, Default)]
pub struct MemoryImageLoader {
    images: HashMap<PathBuf, Tensor>,
}

impl MemoryImageLoader {
    pub fn new() -> MemoryImageLoader {
        MemoryImageLoader::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, image: Tensor) {
        self.images.insert(path.into(), image);
    }
}

impl ImageLoader for MemoryImageLoader {
    fn load(&self, path: &Path) -> Result<Tensor> {
        self.images.get(path).cloned().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no in-memory image for {}", path.display()),
            ))
        })
    }
}

/// Flattens an RGB buffer into a `3 x H x W` tensor normalized to [0, 1].
pub fn rgb_to_tensor(rgb: &image::RgbImage) -> Tensor {
    let (w, h) = (rgb.width() as usize, rgb.height() as usize);
    let mut t = Tensor::zeros(3, h, w);
    for (x, y, px) in rgb.enumerate_pixels() {
        for c in 0..3 {
            t.set(c, y as usize, x as usize, px.0[c] as f64 / 255.0);
        }
    }
    t
}

/// Inverse of `rgb_to_tensor`; values are clipped to [0, 1].
pub fn tensor_to_rgb(t: &Tensor) -> image::RgbImage {
    image::RgbImage::from_fn(t.width as u32, t.height as u32, |x, y| {
        let px = |c: usize| {
            let v = if c < t.channels { t.get(c, y as usize, x as usize) } else { t.get(0, y as usize, x as usize) };
            (v.clamp(0.0, 1.0) * 255.0).round() as u8
        };
        image::Rgb([px(0), px(1), px(2)])
    })
}
