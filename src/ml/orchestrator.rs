// ============================================================
// Layer 5 — Epoch Orchestrator
// ============================================================
// Owns everything a run needs and drives it epoch by epoch:
//
//   for epoch in start..=num_epochs:
//     lr       ← schedule(epoch)
//     plan     ← class-balanced sampler
//     train    → (model, loss, accuracy)         autodiff backend
//     evaluate → recall@K on the primary set      model.valid()
//     results  ← append record
//     statistics.csv   rewritten in full
//     best artifact    only on strict improvement of recall@(min K)
//     checkpoint       model + optimizer + results
//
// A resumed run starts at checkpoint epoch + 1 with the restored
// history, so the schedule and the best-so-far value line up with
// an uninterrupted run.

use std::sync::Arc;

use burn::{
    data::dataloader::DataLoaderBuilder,
    module::AutodiffModule,
    optim::Optimizer,
    tensor::backend::AutodiffBackend,
};
use rand::rngs::StdRng;

use crate::data::{
    batcher::ImageBatcher,
    dataset::SampledDataset,
    image_reader::ImageReader,
    sampler::ClassBalancedSampler,
};
use crate::domain::{
    results::{BestTracker, EpochRecord, TrainingResults},
    schedule::MultiStepLr,
};
use crate::error::{TrainError, TrainResult};
use crate::infra::{
    artifacts::{BestArtifactStore, EmbeddingDatabase},
    checkpoint::CheckpointStore,
    metrics::StatisticsWriter,
};
use crate::ml::{
    model::EmbeddingModel,
    norm::FreezeNormStats,
    trainer::{evaluate, train_epoch, Criteria, EvalSets},
};

/// Where a run stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    /// `completed` epochs are done, more remain
    Running { completed: usize },
    Completed { epochs: usize },
}

/// Training split with its sampler and batcher.
pub struct TrainingData<B: AutodiffBackend> {
    pub reader:      Arc<ImageReader>,
    pub sampler:     ClassBalancedSampler,
    pub batcher:     ImageBatcher<B>,
    pub num_workers: usize,
}

impl<B: AutodiffBackend> TrainingData<B> {
    /// Worker count and batch count for one epoch. Burn splits the
    /// dataset into one contiguous slice per worker, so the worker
    /// count is the largest divisor of the batch count not above
    /// `num_workers`; every sampled batch then sits inside one slice.
    fn epoch_shape(&self) -> (usize, usize) {
        let batches = self.sampler.batches();
        let workers = (1..=self.num_workers.clamp(1, batches.max(1)))
            .rev()
            .find(|w| batches % w == 0)
            .unwrap_or(1);
        (workers, batches)
    }
}

/// Files a run writes after each epoch.
pub struct RunStores {
    pub statistics:  StatisticsWriter,
    pub best:        BestArtifactStore,
    pub checkpoints: CheckpointStore,
}

pub struct EpochOrchestrator<B: AutodiffBackend, M, O> {
    model:       M,
    optim:       O,
    criteria:    Criteria,
    train:       TrainingData<B>,
    eval_sets:   EvalSets<B::InnerBackend>,
    schedule:    MultiStepLr,
    results:     TrainingResults,
    best:        BestTracker,
    stores:      RunStores,
    rng:         StdRng,
    start_epoch: usize,
    num_epochs:  usize,
}

impl<B, M, O> EpochOrchestrator<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + EmbeddingModel<B> + FreezeNormStats,
    M::InnerModule: EmbeddingModel<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    /// `results` is either empty or the history restored from a
    /// checkpoint; training continues after its last epoch.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model:      M,
        optim:      O,
        criteria:   Criteria,
        train:      TrainingData<B>,
        eval_sets:  EvalSets<B::InnerBackend>,
        schedule:   MultiStepLr,
        results:    TrainingResults,
        stores:     RunStores,
        rng:        StdRng,
        num_epochs: usize,
    ) -> Self {
        let best        = BestTracker::from_results(&results);
        let start_epoch = results.last_epoch() + 1;
        Self {
            model,
            optim,
            criteria,
            train,
            eval_sets,
            schedule,
            results,
            best,
            stores,
            rng,
            start_epoch,
            num_epochs,
        }
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn results(&self) -> &TrainingResults {
        &self.results
    }

    pub fn state(&self) -> RunState {
        match self.results.last_epoch() {
            0 => RunState::NotStarted,
            e if e >= self.num_epochs => RunState::Completed { epochs: e },
            e => RunState::Running { completed: e },
        }
    }

    /// Train the remaining epochs; returns the final model and history.
    pub fn run(self) -> TrainResult<(M, TrainingResults)> {
        if self.start_epoch > self.num_epochs {
            tracing::info!(
                "Checkpoint already covers {} of {} epochs, nothing to train",
                self.start_epoch - 1,
                self.num_epochs
            );
        }

        let mut orchestrator = self;
        for epoch in orchestrator.start_epoch..=orchestrator.num_epochs {
            orchestrator = orchestrator.step(epoch)?;
        }

        let results = &orchestrator.results;
        if let Some(k) = results.recall_ks().get(results.primary_index()) {
            tracing::info!("Training complete! Best recall@{}: {:.2}%", k, orchestrator.best.best());
        }
        Ok((orchestrator.model, orchestrator.results))
    }

    fn step(mut self, epoch: usize) -> TrainResult<Self> {
        let lr = self.schedule.lr_at(epoch);

        // ── Training phase ────────────────────────────────────────────────────
        let (workers, batches) = self.train.epoch_shape();
        let plan   = self.train.sampler.plan(batches, &mut self.rng);
        let loader = DataLoaderBuilder::new(self.train.batcher.clone())
            .batch_size(self.train.sampler.batch_size())
            .num_workers(workers)
            .build(SampledDataset::new(self.train.reader.clone(), plan));

        let (model, stats) = train_epoch(
            self.model,
            &mut self.optim,
            loader.iter(),
            &self.criteria,
            lr,
            epoch,
        )?;
        tracing::info!(
            "Train Epoch {}/{} - Loss:{:.4} - Acc:{:.2}% (lr {:.2e})",
            epoch, self.num_epochs, stats.mean_loss, stats.accuracy, lr,
        );

        // ── Evaluation phase ──────────────────────────────────────────────────
        let recall_ks = self.results.recall_ks().to_vec();
        let recalls   = evaluate(&model.valid(), &mut self.eval_sets, &recall_ks)?;
        let summary: Vec<String> = recall_ks
            .iter()
            .zip(&recalls)
            .map(|(k, r)| format!("R@{k}:{r:.2}%"))
            .collect();
        tracing::info!("Test Epoch {}/{} {}", epoch, self.num_epochs, summary.join(" "));

        // ── Persistence ───────────────────────────────────────────────────────
        self.results.push(EpochRecord {
            epoch,
            train_loss:     stats.mean_loss,
            train_accuracy: stats.accuracy,
            recalls:        recalls.clone(),
        })?;
        self.stores.statistics.write(&self.results)?;

        let primary = recalls[self.results.primary_index()];
        if self.best.observe(primary) {
            let set  = self.eval_sets.primary();
            let bank = set
                .bank
                .clone()
                .ok_or_else(|| TrainError::Dataset(format!("set '{}' has no embeddings", set.name)))?;
            let database = EmbeddingDatabase::new(&set.name, epoch, &recall_ks, &recalls, &set.reader, bank)?;
            self.stores.best.save(&model, &database)?;
            tracing::info!("New best recall {:.2}% at epoch {}", primary, epoch);
        }

        self.stores.checkpoints.save(epoch, &model, &self.optim, &self.results)?;

        Ok(Self { model, ..self })
    }
}
