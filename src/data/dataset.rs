use std::fmt;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Serialize, Deserialize};

use crate::data::annotations::{group_by_eye, read_annotations};
use crate::data::image::{DiskImageLoader, ImageLoader};
use crate::data::transform::Compose;
use crate::error::{Error, Result};
use crate::network::network::Input;

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Diabetic retinopathy severity, graded 0 (none) to 4 (proliferative).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DrLevel {
    NoDr = 0,
    Mild = 1,
    Moderate = 2,
    Severe = 3,
    Proliferative = 4,
}

impl DrLevel {
    pub const ALL: [DrLevel; 5] = [
        DrLevel::NoDr,
        DrLevel::Mild,
        DrLevel::Moderate,
        DrLevel::Severe,
        DrLevel::Proliferative,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DrLevel::NoDr => "No DR",
            DrLevel::Mild => "Mild DR",
            DrLevel::Moderate => "Moderate DR",
            DrLevel::Severe => "Severe DR",
            DrLevel::Proliferative => "Proliferative DR",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<i64> for DrLevel {
    type Error = Error;

    fn try_from(value: i64) -> Result<DrLevel> {
        usize::try_from(value)
            .ok()
            .and_then(|i| DrLevel::ALL.get(i).copied())
            .ok_or(Error::InvalidLabel(value))
    }
}

impl fmt::Display for DrLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether a sample is one image or both images of one eye.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingMode {
    #[default]
    Single,
    Dual,
}

impl PairingMode {
    pub fn images_per_sample(self) -> usize {
        match self {
            PairingMode::Single => 1,
            PairingMode::Dual => 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Dataset
// ---------------------------------------------------------------------------

/// One dataset item before decoding: one or two image paths and the label
/// (absent in test mode).
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub images: Vec<PathBuf>,
    pub label: Option<DrLevel>,
}

/// A decoded, transformed item.
#[derive(Debug, Clone)]
pub struct Sample {
    pub input: Input,
    pub label: Option<DrLevel>,
}

/// Fundus images listed in an annotation CSV, served one sample at a time.
pub struct RetinopathyDataset {
    entries: Vec<Entry>,
    mode: PairingMode,
    transform: Compose,
    loader: Box<dyn ImageLoader>,
}

impl RetinopathyDataset {
    /// Loads an annotation table; image paths are joined onto `image_dir`.
    /// In `test` mode labels are not read.
    pub fn from_csv(
        ann_file: impl AsRef<Path>,
        image_dir: impl AsRef<Path>,
        mode: PairingMode,
        transform: Compose,
        test: bool,
    ) -> Result<RetinopathyDataset> {
        let entries = load_entries(ann_file.as_ref(), image_dir.as_ref(), mode, test)?;
        Ok(RetinopathyDataset::from_entries(entries, mode, transform, Box::new(DiskImageLoader)))
    }

    pub fn from_entries(
        entries: Vec<Entry>,
        mode: PairingMode,
        transform: Compose,
        loader: Box<dyn ImageLoader>,
    ) -> RetinopathyDataset {
        RetinopathyDataset { entries, mode, transform, loader }
    }

    /// Same entries and loader configuration with a different transform,
    /// e.g. to evaluate the training set without augmentation.
    pub fn with_transform(self, transform: Compose) -> RetinopathyDataset {
        RetinopathyDataset { transform, ..self }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn mode(&self) -> PairingMode {
        self.mode
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn label(&self, index: usize) -> Option<DrLevel> {
        self.entries.get(index).and_then(|e| e.label)
    }

    /// Decodes and transforms item `index`. Both images of a pair are
    /// transformed independently.
    pub fn get<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> Result<Sample> {
        let entry = self.entries.get(index).ok_or_else(|| {
            Error::shape(format!("index < {}", self.entries.len()), index)
        })?;
        let mut images = Vec::with_capacity(entry.images.len());
        for path in &entry.images {
            let raw = self.loader.load(path)?;
            images.push(self.transform.apply(raw, rng));
        }
        let input = match (self.mode, images.len()) {
            (PairingMode::Single, 1) => Input::Single(images.remove(0)),
            (PairingMode::Dual, 2) => {
                let second = images.remove(1);
                Input::Dual(images.remove(0), second)
            }
            (_, n) => {
                return Err(Error::shape(
                    format!("{} image(s) per sample", self.mode.images_per_sample()),
                    n,
                ))
            }
        };
        Ok(Sample { input, label: entry.label })
    }

    /// File names of the images behind item `index`, used as prediction IDs.
    pub fn image_ids(&self, index: usize) -> Vec<String> {
        self.entries
            .get(index)
            .map(|e| {
                e.images
                    .iter()
                    .map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn load_entries(ann_file: &Path, image_dir: &Path, mode: PairingMode, test: bool) -> Result<Vec<Entry>> {
    let rows = read_annotations(ann_file)?;
    let label_of = |i: usize| -> Result<Option<DrLevel>> {
        if test { Ok(None) } else { rows[i].level(i + 1).map(Some) }
    };

    let mut entries = Vec::new();
    match mode {
        PairingMode::Single => {
            for (i, row) in rows.iter().enumerate() {
                entries.push(Entry { images: vec![image_dir.join(&row.img_path)], label: label_of(i)? });
            }
        }
        PairingMode::Dual => {
            for ((patient, eye), members) in group_by_eye(&rows)? {
                if members.len() < 2 {
                    tracing::warn!(%patient, %eye, "eye has a single image, skipping");
                    continue;
                }
                entries.push(Entry {
                    images: members[..2].iter().map(|&i| image_dir.join(&rows[i].img_path)).collect(),
                    label: label_of(members[0])?,
                });
            }
        }
    }
    tracing::debug!(file = %ann_file.display(), entries = entries.len(), ?mode, "loaded annotations");
    Ok(entries)
}
