// ============================================================
// Layer 4 — Image Batcher
// ============================================================
// Implements Burn's Batcher trait: stacks a Vec<ImageItem> into
// one image tensor plus the labels, both as an Int tensor on the
// device (for accuracy) and on the host (for the loss masks).
//
//   Input:  N items, each 3 * S * S pixels in CHW order
//   Output: images [N, 3, S, S], targets [N]
//
// A Batcher cannot fail, so items that failed to decode are
// zero-filled and listed in `failures`; consumers call
// `ensure_decoded()` before using the batch.

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
};

use crate::data::dataset::ImageItem;
use crate::error::{TrainError, TrainResult};

#[derive(Debug, Clone)]
pub struct ImageBatch<B: Backend> {
    /// shape: [batch_size, 3, side, side]
    pub images:   Tensor<B, 4>,
    /// shape: [batch_size]
    pub targets:  Tensor<B, 1, Int>,
    /// Same labels as `targets`, on the host
    pub labels:   Vec<usize>,
    /// Reader indices of the items, in batch order
    pub indices:  Vec<usize>,
    /// (reader index, error) for items that failed to decode
    pub failures: Vec<(usize, String)>,
}

impl<B: Backend> ImageBatch<B> {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn ensure_decoded(&self) -> TrainResult<()> {
        match self.failures.first() {
            None => Ok(()),
            Some((index, err)) => Err(TrainError::Dataset(format!(
                "failed to decode image {index} ({} failures in batch): {err}",
                self.failures.len()
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ImageBatcher<B: Backend> {
    pub device:     B::Device,
    pub image_size: usize,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self { device, image_size }
    }
}

impl<B: Backend> Batcher<ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>) -> ImageBatch<B> {
        let batch_size = items.len();
        let side       = self.image_size;
        let plane      = 3 * side * side;

        let mut pixels   = Vec::with_capacity(batch_size * plane);
        let mut labels   = Vec::with_capacity(batch_size);
        let mut indices  = Vec::with_capacity(batch_size);
        let mut failures = Vec::new();

        for item in items {
            match item.pixels {
                Ok(p) if p.len() == plane => pixels.extend(p),
                Ok(p) => {
                    failures.push((item.index, format!("expected {plane} values, got {}", p.len())));
                    pixels.resize(pixels.len() + plane, 0.0);
                }
                Err(e) => {
                    failures.push((item.index, e));
                    pixels.resize(pixels.len() + plane, 0.0);
                }
            }
            labels.push(item.label);
            indices.push(item.index);
        }

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(pixels, [batch_size, 3, side, side]),
            &self.device,
        );

        let target_ints: Vec<i64> = labels.iter().map(|&l| l as i64).collect();
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(target_ints, [batch_size]),
            &self.device,
        );

        ImageBatch { images, targets, labels, indices, failures }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    fn item(index: usize, label: usize, value: f32) -> ImageItem {
        ImageItem { index, label, pixels: Ok(vec![value; 3 * 2 * 2]) }
    }

    #[test]
    fn test_batch_shapes_and_labels() {
        let batcher = ImageBatcher::<NdArray>::new(Default::default(), 2);
        let batch   = batcher.batch(vec![item(4, 1, 0.5), item(9, 0, -0.5)]);

        assert_eq!(batch.images.dims(), [2, 3, 2, 2]);
        assert_eq!(batch.targets.dims(), [2]);
        assert_eq!(batch.labels, vec![1, 0]);
        assert_eq!(batch.indices, vec![4, 9]);
        assert!(batch.ensure_decoded().is_ok());
    }

    #[test]
    fn test_decode_failure_surfaces() {
        let batcher = ImageBatcher::<NdArray>::new(Default::default(), 2);
        let broken  = ImageItem { index: 3, label: 0, pixels: Err("bad header".into()) };
        let batch   = batcher.batch(vec![item(0, 0, 1.0), broken]);

        assert_eq!(batch.images.dims(), [2, 3, 2, 2]);
        let err = batch.ensure_decoded().unwrap_err().to_string();
        assert!(err.contains("bad header"));
    }
}
