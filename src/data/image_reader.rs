// ============================================================
// Layer 4 — Image Reader
// ============================================================
// Indexes an image-classification split laid out as
//
//   <root>/
//     <class_a>/ img_001.jpg, img_002.jpg, ...
//     <class_b>/ ...
//
// Class directories are sorted by name and numbered from 0, and
// images are sorted inside each class, so the item order (and
// with it every label sequence and embedding bank) is the same
// on every run.
//
// Decoding happens lazily in `Dataset::get`, which burn's data
// loader calls from its worker threads.

use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::data::dataset::Dataset;
use image::imageops::FilterType;

use crate::data::dataset::ImageItem;
use crate::error::{TrainError, TrainResult};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

// ImageNet channel statistics used for input normalisation
const CHANNEL_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const CHANNEL_STD:  [f32; 3] = [0.229, 0.224, 0.225];

/// Labelled images of one dataset split.
#[derive(Debug, Clone)]
pub struct ImageReader {
    classes:    Vec<String>,
    images:     Vec<PathBuf>,
    labels:     Vec<usize>,
    image_size: u32,
}

impl ImageReader {
    /// Index `root`. Fails when the directory is missing or holds no images.
    pub fn open(root: impl AsRef<Path>, image_size: u32) -> TrainResult<Self> {
        let root = root.as_ref();
        if image_size == 0 {
            return Err(TrainError::InvalidConfig("image size must be positive".into()));
        }

        let mut class_dirs: Vec<PathBuf> = fs::read_dir(root)
            .map_err(|e| TrainError::Dataset(format!("cannot read '{}': {e}", root.display())))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        class_dirs.sort();

        let mut classes = Vec::with_capacity(class_dirs.len());
        let mut images  = Vec::new();
        let mut labels  = Vec::new();

        for dir in class_dirs {
            let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| is_image(p))
                .collect();
            if files.is_empty() {
                tracing::warn!("Skipping class directory without images: '{}'", dir.display());
                continue;
            }
            files.sort();

            let label = classes.len();
            classes.push(class_name(&dir));
            labels.extend(std::iter::repeat(label).take(files.len()));
            images.extend(files);
        }

        if images.is_empty() {
            return Err(TrainError::Dataset(format!(
                "no images found under '{}'",
                root.display()
            )));
        }

        tracing::info!(
            "Indexed {} images in {} classes from '{}'",
            images.len(),
            classes.len(),
            root.display()
        );

        Ok(Self { classes, images, labels, image_size })
    }

    /// Class names; a label is an index into this list.
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Image paths in item order.
    pub fn images(&self) -> &[PathBuf] {
        &self.images
    }

    /// Labels aligned with `images()`.
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Decode, resize and normalise one image into CHW order.
    pub fn load_pixels(&self, index: usize) -> TrainResult<Vec<f32>> {
        let path = self.images.get(index).ok_or_else(|| {
            TrainError::Dataset(format!("image index {index} out of range"))
        })?;

        let side = self.image_size;
        let rgb  = image::open(path)?
            .resize_exact(side, side, FilterType::Triangle)
            .to_rgb8();

        let plane      = (side * side) as usize;
        let mut pixels = vec![0.0f32; 3 * plane];
        for (i, px) in rgb.pixels().enumerate() {
            for c in 0..3 {
                let v = f32::from(px[c]) / 255.0;
                pixels[c * plane + i] = (v - CHANNEL_MEAN[c]) / CHANNEL_STD[c];
            }
        }
        Ok(pixels)
    }

    /// The item at `index`. Decode failures travel inside the item
    /// so the training loop can abort on them.
    pub fn item(&self, index: usize) -> Option<ImageItem> {
        let label = *self.labels.get(index)?;
        let pixels = self.load_pixels(index).map_err(|e| {
            format!("{}: {e}", self.images[index].display())
        });
        Some(ImageItem { index, label, pixels })
    }
}

impl Dataset<ImageItem> for ImageReader {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.item(index)
    }

    fn len(&self) -> usize {
        self.images.len()
    }
}

fn is_image(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

fn class_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
