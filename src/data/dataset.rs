use std::sync::Arc;

use burn::data::dataset::Dataset;

use crate::data::image_reader::ImageReader;

/// One decoded (or failed) image with its label.
#[derive(Debug, Clone)]
pub struct ImageItem {
    /// Position in the underlying `ImageReader`
    pub index:  usize,
    pub label:  usize,
    /// CHW pixels, or the decode error message
    pub pixels: Result<Vec<f32>, String>,
}

/// A reader viewed through an epoch plan of item indices.
///
/// The training loader iterates this without shuffling, so every
/// consecutive `batch_size` chunk of the plan becomes one batch.
pub struct SampledDataset {
    reader: Arc<ImageReader>,
    plan:   Vec<usize>,
}

impl SampledDataset {
    pub fn new(reader: Arc<ImageReader>, plan: Vec<usize>) -> Self {
        Self { reader, plan }
    }

    /// Every item of the reader, in reader order.
    pub fn sequential(reader: Arc<ImageReader>) -> Self {
        let plan = (0..reader.len()).collect();
        Self { reader, plan }
    }
}

impl Dataset<ImageItem> for SampledDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.reader.item(*self.plan.get(index)?)
    }

    fn len(&self) -> usize {
        self.plan.len()
    }
}
