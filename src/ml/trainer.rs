// ============================================================
// Layer 5 — Training and Evaluation Steps
// ============================================================
// One epoch of optimisation and one full evaluation pass.
//
//   train_epoch:  autodiff backend
//     per batch → forward → both losses → finite check →
//                 backward → Adam step → accumulate
//
//   evaluate:     inner backend via model.valid()
//     per set   → embed every batch in loader order → bank
//     primary   → recall@K over its bank and labels
//
// Key Burn insight:
//   - argmax(1) returns [batch, 1] so we flatten before .equal()
//   - the optimizer consumes the model and hands back the update
//
// Reference: Burn Book §5, Kingma & Ba (2015) Adam

use std::sync::Arc;

use burn::{
    data::dataloader::DataLoader,
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};

use crate::data::{batcher::ImageBatch, image_reader::ImageReader};
use crate::domain::{
    accumulator::{BatchOutcome, EpochAccumulator, EpochStats},
    embedding::EmbeddingBank,
    recall::{recall, Similarities},
};
use crate::error::{TrainError, TrainResult};
use crate::ml::loss::{BatchHardTripletLoss, LabelSmoothingCrossEntropy};
use crate::ml::model::EmbeddingModel;
use crate::ml::norm::FreezeNormStats;

const LOG_EVERY: usize = 20;

/// Both training criteria; their losses are added without weights.
#[derive(Debug, Clone)]
pub struct Criteria {
    pub classification: LabelSmoothingCrossEntropy,
    pub metric:         BatchHardTripletLoss,
}

/// Run one epoch of optimisation steps at a fixed learning rate.
///
/// Normalisation statistics are frozen before the first batch. The
/// epoch fails on the first undecodable image, malformed batch or
/// non-finite forward output.
pub fn train_epoch<B, M, O, I>(
    model:    M,
    optim:    &mut O,
    batches:  I,
    criteria: &Criteria,
    lr:       f64,
    epoch:    usize,
) -> TrainResult<(M, EpochStats)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + EmbeddingModel<B> + FreezeNormStats,
    O: Optimizer<M, B>,
    I: IntoIterator<Item = ImageBatch<B>>,
{
    let mut model       = model.freeze_norm_stats(true);
    let mut accumulator = EpochAccumulator::default();

    for (i, batch) in batches.into_iter().enumerate() {
        let batch_index = i + 1;
        batch.ensure_decoded()?;

        let output = model.forward(batch.images);
        ensure_finite(&output.embeddings, "embeddings", epoch, batch_index)?;
        ensure_finite(&output.logits, "logits", epoch, batch_index)?;

        let class_loss  = criteria.classification.forward(output.logits.clone(), &batch.labels)?;
        let metric_loss = criteria.metric.forward(output.embeddings, &batch.labels)?;
        let loss        = class_loss.add(metric_loss);

        let loss_value: f64 = loss.clone().into_scalar().elem::<f64>();
        let correct          = count_correct(output.logits, batch.targets);

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &model);
        model = optim.step(lr, model, grads);

        accumulator.observe(BatchOutcome { loss: loss_value, correct, size: batch.labels.len() });

        if batch_index % LOG_EVERY == 0 {
            if let Some(running) = accumulator.running() {
                tracing::debug!(
                    "Train Epoch {} batch {} - Loss:{:.4} - Acc:{:.2}%",
                    epoch, batch_index, running.mean_loss, running.accuracy,
                );
            }
        }
    }

    let stats = accumulator
        .finalize()
        .ok_or_else(|| TrainError::Dataset(format!("epoch {epoch} produced no training batches")))?;
    Ok((model, stats))
}

/// Fails when any element is NaN or ±Inf.
pub fn ensure_finite<B: Backend, const D: usize>(
    tensor: &Tensor<B, D>,
    name:   &'static str,
    epoch:  usize,
    batch:  usize,
) -> TrainResult<()> {
    let values = to_host(tensor.clone())?;
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(TrainError::NumericalInstability { tensor: name, epoch, batch })
    }
}

/// Number of rows whose argmax equals the target.
pub fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let predicted = logits.argmax(1).flatten::<1>(0, 1);
    let correct: i64 = predicted.equal(targets).int().sum().into_scalar().elem::<i64>();
    correct.max(0) as usize
}

fn to_host<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> TrainResult<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| TrainError::TensorData(format!("{e:?}")))
}

// ── Evaluation ───────────────────────────────────────────────────────────────

/// A labelled split evaluated every epoch.
pub struct EvalSet<B: Backend> {
    pub name:   String,
    pub reader: Arc<ImageReader>,
    /// Must yield batches in reader order (single worker, no shuffle)
    pub loader: Arc<dyn DataLoader<ImageBatch<B>>>,
    /// Embeddings from the most recent evaluation
    pub bank:   Option<EmbeddingBank>,
}

impl<B: Backend> EvalSet<B> {
    pub fn new(name: impl Into<String>, reader: Arc<ImageReader>, loader: Arc<dyn DataLoader<ImageBatch<B>>>) -> Self {
        Self { name: name.into(), reader, loader, bank: None }
    }
}

/// Evaluation sets in declared order; recall is reported for the primary one.
pub struct EvalSets<B: Backend> {
    sets:    Vec<EvalSet<B>>,
    primary: usize,
}

impl<B: Backend> EvalSets<B> {
    pub fn new(sets: Vec<EvalSet<B>>, primary: &str) -> TrainResult<Self> {
        let primary = sets
            .iter()
            .position(|s| s.name == primary)
            .ok_or_else(|| TrainError::InvalidConfig(format!("no evaluation set named '{primary}'")))?;
        Ok(Self { sets, primary })
    }

    pub fn primary(&self) -> &EvalSet<B> {
        &self.sets[self.primary]
    }

    pub fn iter(&self) -> impl Iterator<Item = &EvalSet<B>> {
        self.sets.iter()
    }
}

/// Embed every item of `loader`, checking that batches arrive in
/// reader order and cover all `expected` items. Returns the host bank
/// and the same embeddings still on the device, shape [N, D].
pub fn embed<B, M>(
    model:    &M,
    loader:   &dyn DataLoader<ImageBatch<B>>,
    expected: usize,
) -> TrainResult<(EmbeddingBank, Tensor<B, 2>)>
where
    B: Backend,
    M: EmbeddingModel<B>,
{
    let mut bank: Option<EmbeddingBank> = None;
    let mut parts = Vec::new();
    let mut next  = 0usize;

    for batch in loader.iter() {
        batch.ensure_decoded()?;
        if let Some((offset, &index)) = batch
            .indices
            .iter()
            .enumerate()
            .find(|&(offset, &index)| index != next + offset)
        {
            return Err(TrainError::Dataset(format!(
                "evaluation batch out of order: expected item {}, got {index}",
                next + offset
            )));
        }
        next += batch.len();

        let embeddings = model.forward(batch.images).embeddings;
        let dim        = embeddings.dims()[1];
        let values     = to_host(embeddings.clone())?;
        bank.get_or_insert_with(|| EmbeddingBank::new(dim)).push_rows(&values)?;
        parts.push(embeddings);
    }

    match bank {
        Some(bank) if bank.len() == expected => Ok((bank, Tensor::cat(parts, 0))),
        Some(bank) => Err(TrainError::Dataset(format!(
            "embedded {} items, dataset has {expected}",
            bank.len()
        ))),
        None => Err(TrainError::Dataset("evaluation loader yielded no batches".into())),
    }
}

/// All pairwise dot products of `embeddings` [N, D], as one matmul.
pub fn similarity_matrix<B: Backend>(embeddings: Tensor<B, 2>) -> TrainResult<Similarities> {
    let len    = embeddings.dims()[0];
    let values = to_host(embeddings.clone().matmul(embeddings.transpose()))?;
    Similarities::from_row_major(len, values)
}

/// Embed every evaluation set in order, keep the banks on the sets,
/// and return recall@K percentages for the primary set.
pub fn evaluate<B, M>(
    model:     &M,
    eval_sets: &mut EvalSets<B>,
    recall_ks: &[usize],
) -> TrainResult<Vec<f64>>
where
    B: Backend,
    M: EmbeddingModel<B>,
{
    let mut primary_embeddings = None;
    for (index, set) in eval_sets.sets.iter_mut().enumerate() {
        let (bank, embeddings) = embed(model, set.loader.as_ref(), set.reader.labels().len())?;
        tracing::debug!("Embedded {} items of '{}' (dim {})", bank.len(), set.name, bank.dim());
        set.bank = Some(bank);
        if index == eval_sets.primary {
            primary_embeddings = Some(embeddings);
        }
    }

    let primary    = eval_sets.primary();
    let embeddings = primary_embeddings
        .ok_or_else(|| TrainError::Dataset(format!("set '{}' has no embeddings", primary.name)))?;
    recall(&similarity_matrix(embeddings)?, primary.reader.labels(), recall_ks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::{Autodiff, NdArray},
        data::{dataloader::DataLoaderBuilder, dataloader::batcher::Batcher},
        optim::AdamConfig,
    };
    use rand::{rngs::StdRng, SeedableRng};

    use crate::data::{
        batcher::ImageBatcher,
        dataset::{ImageItem, SampledDataset},
        image_reader::tests::write_dataset,
        sampler::ClassBalancedSampler,
    };
    use crate::ml::model::{BackboneKind, CgdModel, CgdModelConfig};

    type Ad = Autodiff<NdArray>;

    const SIDE: u32 = 8;

    fn criteria(num_classes: usize) -> Criteria {
        Criteria {
            classification: LabelSmoothingCrossEntropy::new(num_classes, 0.1, 0.5).unwrap(),
            metric:         BatchHardTripletLoss::new(0.1).unwrap(),
        }
    }

    fn model<B: Backend>(num_classes: usize) -> CgdModel<B> {
        CgdModelConfig::new(BackboneKind::Small, "SG".into(), 8, num_classes)
            .init(&Default::default())
            .unwrap()
    }

    #[test]
    fn test_count_correct() {
        let device  = Default::default();
        let logits  = Tensor::<NdArray, 2>::from_data(
            TensorData::new(vec![0.9f32, 0.1, 0.2, 0.8, 0.6, 0.4], [3, 2]),
            &device,
        );
        let targets = Tensor::<NdArray, 1, Int>::from_data(TensorData::new(vec![0i64, 1, 1], [3]), &device);
        assert_eq!(count_correct(logits, targets), 2);
    }

    #[test]
    fn test_non_finite_values_detected() {
        let device = Default::default();
        let good   = Tensor::<NdArray, 2>::from_data(TensorData::new(vec![1.0f32, 2.0], [1, 2]), &device);
        let bad    = Tensor::<NdArray, 2>::from_data(TensorData::new(vec![1.0f32, f32::NAN], [1, 2]), &device);

        assert!(ensure_finite(&good, "logits", 1, 1).is_ok());
        let err = ensure_finite(&bad, "embeddings", 3, 7).unwrap_err();
        assert!(matches!(
            err,
            TrainError::NumericalInstability { tensor: "embeddings", epoch: 3, batch: 7 }
        ));
    }

    #[test]
    fn test_train_epoch_reports_sample_weighted_stats() {
        let tmp = tempfile::tempdir().unwrap();
        write_dataset(tmp.path(), &[[220, 20, 20], [20, 220, 20], [20, 20, 220]], 4);
        let reader  = Arc::new(ImageReader::open(tmp.path(), SIDE).unwrap());
        let sampler = ClassBalancedSampler::new(reader.labels(), 4, 2).unwrap();
        let plan    = sampler.plan(3, &mut StdRng::seed_from_u64(1));

        let batcher = ImageBatcher::<Ad>::new(Default::default(), SIDE as usize);
        let loader  = DataLoaderBuilder::new(batcher)
            .batch_size(4)
            .num_workers(1)
            .build(SampledDataset::new(reader, plan));

        let mut optim = AdamConfig::new().init();
        let (_, stats) = train_epoch(model::<Ad>(3), &mut optim, loader.iter(), &criteria(3), 1e-3, 1).unwrap();

        assert!(stats.mean_loss.is_finite() && stats.mean_loss > 0.0);
        assert!((0.0..=100.0).contains(&stats.accuracy));
    }

    #[test]
    fn test_train_epoch_rejects_malformed_batch() {
        let batcher = ImageBatcher::<Ad>::new(Default::default(), SIDE as usize);
        let plane   = 3 * (SIDE * SIDE) as usize;
        let items   = [(0, 0), (1, 0), (2, 1)]
            .into_iter()
            .map(|(index, label)| ImageItem { index, label, pixels: Ok(vec![0.1; plane]) })
            .collect();
        let batch = batcher.batch(items);

        let mut optim = AdamConfig::new().init();
        let result = train_epoch(model::<Ad>(2), &mut optim, vec![batch], &criteria(2), 1e-3, 1);
        assert!(matches!(result, Err(TrainError::MalformedBatch { label: 1 })));
    }

    #[test]
    fn test_train_epoch_without_batches_fails() {
        let mut optim = AdamConfig::new().init();
        let result = train_epoch(
            model::<Ad>(2),
            &mut optim,
            Vec::<ImageBatch<Ad>>::new(),
            &criteria(2),
            1e-3,
            1,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_evaluate_fills_banks_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        write_dataset(tmp.path(), &[[200, 0, 0], [0, 200, 0]], 3);
        let reader  = Arc::new(ImageReader::open(tmp.path(), SIDE).unwrap());
        let batcher = ImageBatcher::<NdArray>::new(Default::default(), SIDE as usize);
        let loader  = DataLoaderBuilder::new(batcher)
            .batch_size(4)
            .num_workers(1)
            .build(SampledDataset::sequential(reader.clone()));

        let mut sets = EvalSets::new(vec![EvalSet::new("val", reader, loader)], "val").unwrap();
        let recalls  = evaluate(&model::<NdArray>(2), &mut sets, &[2, 1]).unwrap();

        assert_eq!(recalls.len(), 2);
        assert!(recalls[0] >= recalls[1]);
        let bank = sets.primary().bank.as_ref().unwrap();
        assert_eq!(bank.len(), 6);
        assert_eq!(bank.dim(), 8);
    }

    #[test]
    fn test_similarity_matrix_matches_host_dot_products() {
        let rows = vec![vec![0.6f32, 0.8, 0.0], vec![0.0, 1.0, 0.0], vec![1.0, 0.0, 0.0]];
        let bank = EmbeddingBank::from_rows(&rows).unwrap();
        let flat: Vec<f32> = rows.concat();
        let embeddings = Tensor::<NdArray, 2>::from_data(TensorData::new(flat, [3, 3]), &Default::default());

        let device = similarity_matrix(embeddings).unwrap();
        let host   = Similarities::from_bank(&bank);
        assert_eq!(device.len(), 3);
        for query in 0..3 {
            for (d, h) in device.row(query).iter().zip(host.row(query)) {
                assert!((d - h).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_unknown_primary_set_rejected() {
        assert!(EvalSets::<NdArray>::new(Vec::new(), "val").is_err());
    }
}
