// ============================================================
// Layer 5 — Loss Functions
// ============================================================
// Two criteria, summed without weights by the training step:
//
//   LabelSmoothingCrossEntropy  (logits [N, C], labels) → scalar
//     target:  1 - s + s/C on the true class, s/C elsewhere
//     loss:    mean over the batch of -Σ target · log_softmax(logits / T)
//
//   BatchHardTripletLoss        (embeddings [N, D], labels) → scalar
//     d(a, b)  = sqrt(max(|a|² + |b|² - 2 a·b, 1e-12))
//     anchor:  max(0, margin + max d(a, positive) - min d(a, negative))
//     loss:    mean over anchors that have a negative
//
// Masks and targets are built on the host from the label slice and
// uploaded once per batch.
//
// Reference: Szegedy et al. (2016) label smoothing
//            Hermans et al. (2017) In Defense of the Triplet Loss

use std::collections::BTreeMap;

use burn::{prelude::*, tensor::activation::log_softmax};

use crate::error::{TrainError, TrainResult};

const MIN_SQUARED_DISTANCE: f64 = 1e-12;
/// Pushes non-negatives out of reach of min_dim.
const MASKED_DISTANCE: f32 = 1e6;

#[derive(Debug, Clone)]
pub struct LabelSmoothingCrossEntropy {
    num_classes: usize,
    smoothing:   f64,
    temperature: f64,
}

impl LabelSmoothingCrossEntropy {
    pub fn new(num_classes: usize, smoothing: f64, temperature: f64) -> TrainResult<Self> {
        if num_classes < 2 {
            return Err(TrainError::InvalidConfig(format!(
                "label smoothing needs at least 2 classes, got {num_classes}"
            )));
        }
        if !(0.0..1.0).contains(&smoothing) {
            return Err(TrainError::InvalidConfig(format!(
                "smoothing must be in [0, 1), got {smoothing}"
            )));
        }
        if !(temperature > 0.0) {
            return Err(TrainError::InvalidConfig(format!(
                "temperature must be positive, got {temperature}"
            )));
        }
        Ok(Self { num_classes, smoothing, temperature })
    }

    /// Row-major [N, C] target distribution.
    pub fn smoothed_targets(&self, labels: &[usize]) -> TrainResult<Vec<f32>> {
        let c     = self.num_classes;
        let off   = (self.smoothing / c as f64) as f32;
        let on    = (1.0 - self.smoothing + self.smoothing / c as f64) as f32;

        let mut targets = vec![off; labels.len() * c];
        for (row, &label) in labels.iter().enumerate() {
            if label >= c {
                return Err(TrainError::Dataset(format!(
                    "label {label} out of range for {c} classes"
                )));
            }
            targets[row * c + label] = on;
        }
        Ok(targets)
    }

    pub fn forward<B: Backend>(&self, logits: Tensor<B, 2>, labels: &[usize]) -> TrainResult<Tensor<B, 1>> {
        let [n, c] = logits.dims();
        if n != labels.len() || c != self.num_classes {
            return Err(TrainError::Dataset(format!(
                "logits of shape [{n}, {c}] do not match {} labels over {} classes",
                labels.len(),
                self.num_classes
            )));
        }

        let targets = Tensor::<B, 2>::from_data(
            TensorData::new(self.smoothed_targets(labels)?, [n, c]),
            &logits.device(),
        );
        let log_probs = log_softmax(logits.div_scalar(self.temperature), 1);

        Ok(targets.mul(log_probs).sum_dim(1).neg().mean())
    }
}

#[derive(Debug, Clone)]
pub struct BatchHardTripletLoss {
    margin: f64,
}

impl BatchHardTripletLoss {
    pub fn new(margin: f64) -> TrainResult<Self> {
        if !(margin >= 0.0) {
            return Err(TrainError::InvalidConfig(format!(
                "margin must be non-negative, got {margin}"
            )));
        }
        Ok(Self { margin })
    }

    /// Mean per-anchor loss over the valid anchors, zero if there are none.
    pub fn forward<B: Backend>(&self, embeddings: Tensor<B, 2>, labels: &[usize]) -> TrainResult<Tensor<B, 1>> {
        let device = embeddings.device();
        let (per_anchor, valid) = self.per_anchor(embeddings, labels)?;
        if valid == 0 {
            return Ok(Tensor::zeros([1], &device));
        }
        Ok(per_anchor.sum().div_scalar(valid as f64))
    }

    /// Loss of every anchor (0 for anchors without a negative) and the
    /// number of anchors that have one.
    pub fn per_anchor<B: Backend>(
        &self,
        embeddings: Tensor<B, 2>,
        labels:     &[usize],
    ) -> TrainResult<(Tensor<B, 1>, usize)> {
        let n = embeddings.dims()[0];
        if n != labels.len() {
            return Err(TrainError::Dataset(format!(
                "{n} embeddings but {} labels",
                labels.len()
            )));
        }
        check_composition(labels)?;

        let device = embeddings.device();
        let masks  = AnchorMasks::new(labels);
        let valid  = masks.valid.iter().filter(|&&v| v > 0.0).count();

        let positive = Tensor::<B, 2>::from_data(TensorData::new(masks.positive, [n, n]), &device);
        let negative = Tensor::<B, 2>::from_data(TensorData::new(masks.negative, [n, n]), &device);
        let keep     = Tensor::<B, 1>::from_data(TensorData::new(masks.valid, [n]), &device);

        let distances = pairwise_distances(embeddings);

        // distances are non-negative, so zeroed non-positives never win
        let hardest_positive = distances.clone().mul(positive).max_dim(1);
        let hardest_negative = distances
            .add(negative.neg().add_scalar(1.0).mul_scalar(MASKED_DISTANCE))
            .min_dim(1);

        let per_anchor = hardest_positive
            .sub(hardest_negative)
            .add_scalar(self.margin)
            .clamp_min(0.0)
            .reshape([n])
            .mul(keep);

        Ok((per_anchor, valid))
    }
}

/// Euclidean distance between every pair of rows: [N, D] → [N, N].
pub fn pairwise_distances<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let n = x.dims()[0];
    let squared = x.clone().powf_scalar(2.0).sum_dim(1);
    let dot     = x.clone().matmul(x.transpose());

    squared
        .clone()
        .expand([n, n])
        .add(squared.transpose().expand([n, n]))
        .sub(dot.mul_scalar(2.0))
        .clamp_min(MIN_SQUARED_DISTANCE)
        .sqrt()
}

/// Every label present must occur at least twice.
fn check_composition(labels: &[usize]) -> TrainResult<()> {
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for &label in labels {
        *counts.entry(label).or_insert(0) += 1;
    }
    match counts.into_iter().find(|&(_, count)| count == 1) {
        Some((label, _)) => Err(TrainError::MalformedBatch { label }),
        None => Ok(()),
    }
}

struct AnchorMasks {
    positive: Vec<f32>,
    negative: Vec<f32>,
    valid:    Vec<f32>,
}

impl AnchorMasks {
    fn new(labels: &[usize]) -> Self {
        let n = labels.len();
        let mut positive = vec![0.0; n * n];
        let mut negative = vec![0.0; n * n];
        let mut valid    = vec![0.0; n];

        for (i, &a) in labels.iter().enumerate() {
            for (j, &b) in labels.iter().enumerate() {
                if a != b {
                    negative[i * n + j] = 1.0;
                    valid[i] = 1.0;
                } else if i != j {
                    positive[i * n + j] = 1.0;
                }
            }
        }
        Self { positive, negative, valid }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    fn tensor2(rows: &[[f32; 2]]) -> Tensor<B, 2> {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_data(TensorData::new(flat, [rows.len(), 2]), &Default::default())
    }

    fn scalar(t: Tensor<B, 1>) -> f64 {
        t.into_scalar().elem::<f64>()
    }

    #[test]
    fn test_smoothed_targets_sum_to_one() {
        for &s in &[0.0, 0.1, 0.5, 0.99] {
            let ce      = LabelSmoothingCrossEntropy::new(7, s, 1.0).unwrap();
            let targets = ce.smoothed_targets(&[0, 3, 6]).unwrap();
            for row in targets.chunks(7) {
                let sum: f32 = row.iter().sum();
                assert!((sum - 1.0).abs() < 1e-5, "s={s} sum={sum}");
            }
        }
    }

    #[test]
    fn test_zero_smoothing_matches_cross_entropy() {
        let device = Default::default();
        let logits = Tensor::<B, 2>::from_data(
            TensorData::new(vec![2.0f32, -1.0, 0.5, 0.1, 0.3, 1.7], [2, 3]),
            &device,
        );
        let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(vec![0i64, 2], [2]), &device);

        let ours = LabelSmoothingCrossEntropy::new(3, 0.0, 1.0)
            .unwrap()
            .forward(logits.clone(), &[0, 2])
            .unwrap();
        let reference = burn::nn::loss::CrossEntropyLossConfig::new()
            .init(&device)
            .forward(logits, targets);

        assert!((scalar(ours) - scalar(reference)).abs() < 1e-5);
    }

    #[test]
    fn test_invalid_criteria_rejected() {
        assert!(LabelSmoothingCrossEntropy::new(5, 1.0, 1.0).is_err());
        assert!(LabelSmoothingCrossEntropy::new(5, -0.1, 1.0).is_err());
        assert!(LabelSmoothingCrossEntropy::new(5, 0.1, 0.0).is_err());
        assert!(LabelSmoothingCrossEntropy::new(1, 0.1, 1.0).is_err());
        assert!(BatchHardTripletLoss::new(-1.0).is_err());
    }

    #[test]
    fn test_triplet_zero_when_separated() {
        let emb  = tensor2(&[[1.0, 0.0], [1.0, 0.0], [-1.0, 0.0], [-1.0, 0.0]]);
        let loss = BatchHardTripletLoss::new(0.1).unwrap().forward(emb, &[0, 0, 1, 1]).unwrap();
        assert!(scalar(loss).abs() < 1e-6);
    }

    #[test]
    fn test_triplet_non_negative() {
        let emb  = tensor2(&[[0.3, 0.9], [-0.5, 0.2], [0.8, -0.1], [0.0, 1.0], [0.4, 0.4], [-0.9, -0.2]]);
        let loss = BatchHardTripletLoss::new(0.5)
            .unwrap()
            .forward(emb, &[0, 1, 2, 0, 1, 2])
            .unwrap();
        assert!(scalar(loss) >= 0.0);
    }

    #[test]
    fn test_three_classes_two_each() {
        // A is far from everything; B and C overlap
        let emb = tensor2(&[
            [10.0, 0.0], [10.0, 0.1],
            [0.0, 0.0],  [0.0, 1.0],
            [0.0, 0.5],  [0.0, 1.5],
        ]);
        let (per_anchor, valid) = BatchHardTripletLoss::new(0.1)
            .unwrap()
            .per_anchor(emb, &[0, 0, 1, 1, 2, 2])
            .unwrap();
        let per_anchor = per_anchor.into_data().convert::<f32>().to_vec::<f32>().unwrap();

        assert_eq!(valid, 6);
        assert_eq!(per_anchor[0], 0.0);
        assert_eq!(per_anchor[1], 0.0);
        assert!(per_anchor[2..].iter().any(|&l| l > 0.0));
        // anchor (0, 0): positive at 1.0, negative at 0.5
        assert!((per_anchor[2] - 0.6).abs() < 1e-4);
    }

    #[test]
    fn test_single_occurrence_is_malformed() {
        let emb = tensor2(&[[1.0, 0.0], [0.9, 0.1], [0.0, 1.0]]);
        let err = BatchHardTripletLoss::new(0.1).unwrap().forward(emb, &[0, 0, 1]).unwrap_err();
        assert!(matches!(err, TrainError::MalformedBatch { label: 1 }));
    }

    #[test]
    fn test_single_class_batch_is_zero() {
        let emb  = tensor2(&[[1.0, 0.0], [0.0, 1.0], [0.5, 0.5]]);
        let loss = BatchHardTripletLoss::new(0.2).unwrap().forward(emb, &[4, 4, 4]).unwrap();
        assert_eq!(scalar(loss), 0.0);
    }
}
