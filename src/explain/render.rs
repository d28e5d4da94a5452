use std::path::{Path, PathBuf};

use rand::{rngs::StdRng, SeedableRng};

use crate::data::dataset::{DrLevel, RetinopathyDataset};
use crate::data::image::tensor_to_rgb;
use crate::data::transform::denormalize;
use crate::error::{Error, Result};
use crate::explain::gradcam::GradCam;
use crate::math::tensor::Tensor;
use crate::network::metadata::Normalization;
use crate::network::network::{Classifier, Input};
use crate::train::history::TrainingHistory;

/// Jet colour map: blue (0) through cyan, yellow to red (1).
pub fn jet(v: f64) -> [f64; 3] {
    let v = v.clamp(0.0, 1.0);
    let channel = |centre: f64| (1.5 - (4.0 * v - centre).abs()).clamp(0.0, 1.0);
    [channel(3.0), channel(2.0), channel(1.0)]
}

/// Colours a `1 x H x W` map in [0, 1] as a `3 x H x W` RGB heatmap.
pub fn heatmap(map: &Tensor) -> Tensor {
    let mut out = Tensor::zeros(3, map.height, map.width);
    for y in 0..map.height {
        for x in 0..map.width {
            let rgb = jet(map.get(0, y, x));
            for (c, v) in rgb.iter().enumerate() {
                out.set(c, y, x, *v);
            }
        }
    }
    out
}

/// `0.7 * image + 0.3 * heatmap`, both RGB in [0, 1].
pub fn overlay(image: &Tensor, heat: &Tensor) -> Tensor {
    let mut out = image.clone();
    for (o, h) in out.data.iter_mut().zip(heat.data.iter()) {
        *o = 0.7 * *o + 0.3 * h;
    }
    out
}

/// Lays out original, heatmap and overlay side by side and writes a PNG.
/// `image` is a display-ready RGB tensor; `cam` is upsampled to its size.
pub fn save_panel(path: &Path, image: &Tensor, cam: &Tensor) -> Result<()> {
    let cam = cam.resize_bilinear(image.height, image.width);
    let heat = heatmap(&cam);
    let blended = overlay(image, &heat);

    let (w, h) = (image.width as u32, image.height as u32);
    let mut canvas = image::RgbImage::new(w * 3, h);
    for (panel, tensor) in [image, &heat, &blended].into_iter().enumerate() {
        image::imageops::replace(&mut canvas, &tensor_to_rgb(tensor), i64::from(w) * panel as i64, 0);
    }
    canvas.save(path).map_err(|source| Error::Image { path: path.to_path_buf(), source })
}

/// Writes GradCAM panels for the first `count` samples of `dataset` and the
/// training history, returning every file written.
///
/// Panels are named `gradcam_visualization_{i}.png`; the history goes to
/// `training_history.json`. In dual mode the first image of each pair is
/// explained.
pub fn visualize_and_explain(
    model: &Classifier,
    dataset: &RetinopathyDataset,
    count: usize,
    save_dir: impl AsRef<Path>,
    history: Option<&TrainingHistory>,
    norm: &Normalization,
) -> Result<Vec<PathBuf>> {
    let save_dir = save_dir.as_ref();
    std::fs::create_dir_all(save_dir)?;
    let mut written = Vec::new();

    if let Some(history) = history {
        let path = save_dir.join("training_history.json");
        history.save_json(&path)?;
        written.push(path);
    }

    let mut scratch = model.clone();
    let mut cam = GradCam::for_model(&scratch)?;
    let mut rng = StdRng::seed_from_u64(0);

    for idx in 0..count.min(dataset.len()) {
        let sample = dataset.get(idx, &mut rng)?;
        let result = cam.generate(&mut scratch, &sample.input, None)?;
        let shown = match &sample.input {
            Input::Single(img) | Input::Dual(img, _) => denormalize(img, norm),
        };

        let path = save_dir.join(format!("gradcam_visualization_{}.png", idx));
        save_panel(&path, &shown, &result.map)?;
        tracing::info!(
            sample = idx,
            predicted = %level_name(result.predicted),
            truth = %sample.label.map(|l| l.name()).unwrap_or("unknown"),
            path = %path.display(),
            "saved GradCAM panel"
        );
        written.push(path);
    }
    Ok(written)
}

fn level_name(class: usize) -> String {
    DrLevel::ALL
        .get(class)
        .map(|l| l.name().to_string())
        .unwrap_or_else(|| format!("class {}", class))
}
