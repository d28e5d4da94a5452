use rand::Rng;
use serde::{Serialize, Deserialize};

use crate::math::tensor::Tensor;
use crate::network::metadata::Normalization;

/// One augmentation or preprocessing step on a `3 x H x W` image in [0, 1].
///
/// Random steps draw from the generator passed to `apply`, so a seeded
/// `StdRng` reproduces the same augmentation sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transform {
    /// Bilinear resize to exactly `height x width`.
    Resize { height: usize, width: usize },
    /// Crop a random `height x width` window (no-op on a smaller image).
    RandomCrop { height: usize, width: usize },
    /// Zero-pad up to `height x width`, splitting the padding randomly
    /// between the two sides of each axis.
    RandomPad { height: usize, width: usize },
    HorizontalFlip { p: f64 },
    VerticalFlip { p: f64 },
    /// Multiply by a factor drawn uniformly from `[min, max]`, then clip.
    Brightness { min: f64, max: f64 },
    /// With probability `p`, rotate about the centre by an angle drawn from
    /// `[-degrees, degrees]`; uncovered pixels become 0.
    Rotate { p: f64, degrees: f64 },
    /// With probability `p`, zero a `size x size` square at a random position.
    CutOut { size: usize, p: f64 },
    Normalize { mean: [f64; 3], std: [f64; 3] },
}

impl Transform {
    pub fn apply<R: Rng + ?Sized>(&self, img: Tensor, rng: &mut R) -> Tensor {
        match *self {
            Transform::Resize { height, width } => img.resize_bilinear(height, width),
            Transform::RandomCrop { height, width } => random_crop(img, height, width, rng),
            Transform::RandomPad { height, width } => random_pad(img, height, width, rng),
            Transform::HorizontalFlip { p } => {
                if rng.gen::<f64>() < p { flip(img, false) } else { img }
            }
            Transform::VerticalFlip { p } => {
                if rng.gen::<f64>() < p { flip(img, true) } else { img }
            }
            Transform::Brightness { min, max } => {
                let factor = if max > min { rng.gen_range(min..=max) } else { min };
                img.map(|v| (v * factor).clamp(0.0, 1.0))
            }
            Transform::Rotate { p, degrees } => {
                if rng.gen::<f64>() < p {
                    let angle = if degrees > 0.0 { rng.gen_range(-degrees..=degrees) } else { 0.0 };
                    rotate(&img, angle)
                } else {
                    img
                }
            }
            Transform::CutOut { size, p } => {
                if rng.gen::<f64>() < p { cut_out(img, size, rng) } else { img }
            }
            Transform::Normalize { mean, std } => normalize(img, &mean, &std),
        }
    }
}

/// An ordered list of transforms.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Compose {
    pub steps: Vec<Transform>,
}

impl Compose {
    pub fn new(steps: Vec<Transform>) -> Compose {
        Compose { steps }
    }

    pub fn apply<R: Rng + ?Sized>(&self, img: Tensor, rng: &mut R) -> Tensor {
        self.steps.iter().fold(img, |acc, t| t.apply(acc, rng))
    }

    /// Training augmentation: resize to `resize`, random crop to `crop`,
    /// random pad to `size`, random flips, brightness jitter, normalisation.
    /// The full-size pipeline is `train(256, 210, 224, ..)`.
    pub fn train(resize: usize, crop: usize, size: usize, norm: &Normalization) -> Compose {
        Compose::new(vec![
            Transform::Resize { height: resize, width: resize },
            Transform::RandomCrop { height: crop, width: crop },
            Transform::RandomPad { height: size, width: size },
            Transform::HorizontalFlip { p: 0.5 },
            Transform::VerticalFlip { p: 0.5 },
            Transform::Brightness { min: 0.1, max: 0.9 },
            Transform::Normalize { mean: norm.mean, std: norm.std },
        ])
    }

    /// Deterministic evaluation pipeline: resize then normalise.
    pub fn eval(size: usize, norm: &Normalization) -> Compose {
        Compose::new(vec![
            Transform::Resize { height: size, width: size },
            Transform::Normalize { mean: norm.mean, std: norm.std },
        ])
    }

    /// Whether any step draws random numbers.
    pub fn is_random(&self) -> bool {
        self.steps.iter().any(|t| !matches!(t, Transform::Resize { .. } | Transform::Normalize { .. }))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn random_crop<R: Rng + ?Sized>(img: Tensor, height: usize, width: usize, rng: &mut R) -> Tensor {
    if img.height < height || img.width < width {
        return img;
    }
    let top = rng.gen_range(0..=img.height - height);
    let left = rng.gen_range(0..=img.width - width);
    let mut out = Tensor::zeros(img.channels, height, width);
    for c in 0..img.channels {
        for y in 0..height {
            for x in 0..width {
                out.set(c, y, x, img.get(c, top + y, left + x));
            }
        }
    }
    out
}

fn random_pad<R: Rng + ?Sized>(img: Tensor, height: usize, width: usize, rng: &mut R) -> Tensor {
    let pad_h = height.saturating_sub(img.height);
    let pad_w = width.saturating_sub(img.width);
    if pad_h == 0 && pad_w == 0 {
        return img;
    }
    let top = rng.gen_range(0..=pad_h);
    let left = rng.gen_range(0..=pad_w);
    let mut out = Tensor::zeros(img.channels, img.height + pad_h, img.width + pad_w);
    for c in 0..img.channels {
        for y in 0..img.height {
            for x in 0..img.width {
                out.set(c, top + y, left + x, img.get(c, y, x));
            }
        }
    }
    out
}

fn flip(img: Tensor, vertical: bool) -> Tensor {
    let mut out = Tensor::zeros(img.channels, img.height, img.width);
    for c in 0..img.channels {
        for y in 0..img.height {
            for x in 0..img.width {
                let (sy, sx) = if vertical { (img.height - 1 - y, x) } else { (y, img.width - 1 - x) };
                out.set(c, y, x, img.get(c, sy, sx));
            }
        }
    }
    out
}

/// Counter-clockwise rotation by `degrees` with bilinear sampling.
fn rotate(img: &Tensor, degrees: f64) -> Tensor {
    let (sin, cos) = degrees.to_radians().sin_cos();
    let cy = (img.height as f64 - 1.0) / 2.0;
    let cx = (img.width as f64 - 1.0) / 2.0;
    let mut out = Tensor::zeros(img.channels, img.height, img.width);
    for y in 0..img.height {
        for x in 0..img.width {
            let (dy, dx) = (y as f64 - cy, x as f64 - cx);
            // Inverse map from output pixel back into the source image.
            let sx = cos * dx - sin * dy + cx;
            let sy = sin * dx + cos * dy + cy;
            for c in 0..img.channels {
                out.set(c, y, x, img.sample_bilinear(c, sy, sx));
            }
        }
    }
    out
}

fn cut_out<R: Rng + ?Sized>(mut img: Tensor, size: usize, rng: &mut R) -> Tensor {
    let (mh, mw) = (size.min(img.height), size.min(img.width));
    if mh == 0 || mw == 0 {
        return img;
    }
    let y0 = rng.gen_range(0..=img.height - mh);
    let x0 = rng.gen_range(0..=img.width - mw);
    for c in 0..img.channels {
        for y in y0..y0 + mh {
            for x in x0..x0 + mw {
                img.set(c, y, x, 0.0);
            }
        }
    }
    img
}

fn normalize(mut img: Tensor, mean: &[f64; 3], std: &[f64; 3]) -> Tensor {
    let area = img.area();
    for c in 0..img.channels.min(3) {
        for v in &mut img.data[c * area..(c + 1) * area] {
            *v = (*v - mean[c]) / std[c];
        }
    }
    img
}

/// Undoes `Normalize` and clips to [0, 1], for display.
pub fn denormalize(img: &Tensor, norm: &Normalization) -> Tensor {
    let mut out = img.clone();
    let area = out.area();
    for c in 0..out.channels.min(3) {
        for v in &mut out.data[c * area..(c + 1) * area] {
            *v = (*v * norm.std[c] + norm.mean[c]).clamp(0.0, 1.0);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn ramp(h: usize, w: usize) -> Tensor {
        let data = (0..3 * h * w).map(|i| (i % (h * w)) as f64 / (h * w) as f64).collect();
        Tensor::from_data(3, h, w, data).unwrap()
    }

    #[test]
    fn test_train_pipeline_output_size() {
        let mut rng = StdRng::seed_from_u64(0);
        let pipeline = Compose::train(20, 14, 16, &Normalization::IMAGENET);
        for _ in 0..5 {
            let out = pipeline.apply(ramp(31, 17), &mut rng);
            assert_eq!(out.shape(), (3, 16, 16));
        }
        assert!(pipeline.is_random());
        assert!(!Compose::eval(16, &Normalization::IMAGENET).is_random());
    }

    #[test]
    fn test_random_pad_keeps_content() {
        let mut rng = StdRng::seed_from_u64(3);
        let img = Tensor::from_data(1, 2, 2, vec![1.0; 4]).unwrap();
        let out = random_pad(img, 5, 4, &mut rng);
        assert_eq!(out.shape(), (1, 5, 4));
        assert_eq!(out.data.iter().sum::<f64>(), 4.0);
    }

    #[test]
    fn test_flips_are_involutions() {
        let img = ramp(3, 4);
        assert_eq!(flip(flip(img.clone(), false), false), img);
        assert_eq!(flip(img.clone(), true).get(0, 0, 1), img.get(0, 2, 1));
        assert_eq!(flip(img.clone(), false).get(1, 2, 0), img.get(1, 2, 3));
    }

    #[test]
    fn test_rotate_by_zero_is_identity() {
        let img = ramp(5, 5);
        let out = rotate(&img, 0.0);
        for (a, b) in out.data.iter().zip(img.data.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_cut_out_zeroes_a_square() {
        let mut rng = StdRng::seed_from_u64(1);
        let img = Tensor::from_data(1, 10, 10, vec![1.0; 100]).unwrap();
        let out = Transform::CutOut { size: 4, p: 1.0 }.apply(img, &mut rng);
        let zeros = out.data.iter().filter(|&&v| v == 0.0).count();
        assert_eq!(zeros, 16);
    }

    #[test]
    fn test_brightness_is_clipped() {
        let mut rng = StdRng::seed_from_u64(2);
        let img = Tensor::from_data(1, 1, 2, vec![0.5, 1.0]).unwrap();
        let out = Transform::Brightness { min: 1.5, max: 1.5 }.apply(img, &mut rng);
        assert_eq!(out.data, vec![0.75, 1.0]);
    }

    #[test]
    fn test_normalize_roundtrip_through_denormalize() {
        let img = ramp(2, 2);
        let norm = Normalization::IMAGENET;
        let back = denormalize(&normalize(img.clone(), &norm.mean, &norm.std), &norm);
        for (a, b) in back.data.iter().zip(img.data.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }
}
