// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates the full training pipeline in order:
//
//   Step 1: Validate the config                 (this layer)
//   Step 2: Prepare the run directory           (Layer 6 - infra)
//   Step 3: Index train / val image folders     (Layer 4 - data)
//   Step 4: Build model, optimizer, criteria    (Layer 5 - ml)
//   Step 5: Restore a checkpoint if requested   (Layer 6 - infra)
//   Step 6: Build loaders and the orchestrator  (Layers 4, 5)
//   Step 7: Run the epoch loop                  (Layer 5 - ml)
//
// Reference: Burn Book §5 (Training)

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use burn::{
    config::Config,
    data::dataloader::DataLoaderBuilder,
    module::Module,
    optim::AdamConfig,
};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::data::{
    batcher::ImageBatcher,
    dataset::SampledDataset,
    image_reader::ImageReader,
    sampler::ClassBalancedSampler,
};
use crate::domain::{results::TrainingResults, schedule::MultiStepLr};
use crate::error::{TrainError, TrainResult};
use crate::infra::{
    artifacts::BestArtifactStore,
    checkpoint::CheckpointStore,
    layout::{write_atomic, RunLayout},
    metrics::StatisticsWriter,
};
use crate::ml::{
    loss::{BatchHardTripletLoss, LabelSmoothingCrossEntropy},
    model::{parse_gd_config, BackboneKind, CgdModel, CgdModelConfig},
    orchestrator::{EpochOrchestrator, RunStores, TrainingData},
    trainer::{Criteria, EvalSet, EvalSets},
    ComputeBackend, ComputeDevice, TrainBackend,
};

/// Name of the evaluation set built from `<data>/val`.
pub const EVAL_SET_NAME: &str = "test";

// ─── Training Configuration ──────────────────────────────────────────────────
// All hyperparameters for a training run.
// Saved as train_config.json in the run directory so the eval
// command can rebuild the same model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Holds `train/` and `val/`, one sub-directory per class
    pub data_path:           String,
    pub name:                String,
    pub backbone:            BackboneKind,
    pub gd_config:           String,
    pub feature_dim:         usize,
    pub smoothing:           f64,
    pub temperature:         f64,
    pub margin:              f64,
    pub recalls:             Vec<usize>,
    pub batch_size:          usize,
    pub instances_per_class: usize,
    pub num_epochs:          usize,
    pub lr:                  f64,
    pub image_size:          u32,
    pub num_workers:         usize,
    pub results_dir:         String,
    /// Checkpoint directory or checkpoint.json to resume from
    pub checkpoint:          Option<String>,
    pub seed:                u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            data_path:           "data".to_string(),
            name:                "run".to_string(),
            backbone:            BackboneKind::Small,
            gd_config:           "SG".to_string(),
            feature_dim:         1536,
            smoothing:           0.1,
            temperature:         0.5,
            margin:              0.1,
            recalls:             vec![1, 2, 4, 8],
            batch_size:          128,
            instances_per_class: 4,
            num_epochs:          20,
            lr:                  1e-4,
            image_size:          224,
            num_workers:         8,
            results_dir:         "results".to_string(),
            checkpoint:          None,
            seed:                42,
        }
    }
}

impl TrainConfig {
    /// Reject configurations the run could only fail on later.
    pub fn validate(&self) -> TrainResult<()> {
        let invalid = |msg: String| Err(TrainError::InvalidConfig(msg));

        if self.instances_per_class < 2 {
            return invalid(format!(
                "instances per class must be at least 2, got {}",
                self.instances_per_class
            ));
        }
        if self.batch_size == 0 || self.batch_size % self.instances_per_class != 0 {
            return invalid(format!(
                "batch size {} must be a positive multiple of {} instances per class",
                self.batch_size, self.instances_per_class
            ));
        }
        if !(0.0..1.0).contains(&self.smoothing) {
            return invalid(format!("smoothing must be in [0, 1), got {}", self.smoothing));
        }
        if !(self.temperature > 0.0) {
            return invalid(format!("temperature must be positive, got {}", self.temperature));
        }
        if !(self.margin >= 0.0) {
            return invalid(format!("margin must be non-negative, got {}", self.margin));
        }
        if self.recalls.is_empty() || self.recalls.contains(&0) {
            return invalid(format!("recall ranks must be positive and non-empty, got {:?}", self.recalls));
        }
        if self.num_epochs == 0 {
            return invalid("number of epochs must be positive".into());
        }
        if !(self.lr > 0.0) {
            return invalid(format!("learning rate must be positive, got {}", self.lr));
        }

        let descriptors = parse_gd_config(&self.gd_config)?.len();
        if self.feature_dim == 0 || self.feature_dim % descriptors != 0 {
            return invalid(format!(
                "feature dim {} must be a positive multiple of {descriptors} descriptors",
                self.feature_dim
            ));
        }
        Ok(())
    }

    /// `{name}_{backbone}_{gd}_{dim}_{smoothing}_{temperature}_{margin}_{batch}`
    pub fn save_name(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}_{}_{}_{}",
            self.name,
            self.backbone.name(),
            self.gd_config,
            self.feature_dim,
            self.smoothing,
            self.temperature,
            self.margin,
            self.batch_size
        )
    }

    pub fn layout(&self) -> RunLayout {
        RunLayout::new(&self.results_dir, &self.save_name())
    }

    pub fn model_config(&self, num_classes: usize) -> CgdModelConfig {
        CgdModelConfig::new(self.backbone, self.gd_config.clone(), self.feature_dim, num_classes)
    }
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
pub struct TrainUseCase {
    config: TrainConfig,
}

impl TrainUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    /// Execute the full training pipeline; returns the run's history.
    pub fn execute(&self) -> Result<TrainingResults> {
        let device = ComputeDevice::default();
        self.execute_on(&device)
    }

    pub fn execute_on(&self, device: &ComputeDevice) -> Result<TrainingResults> {
        let cfg = &self.config;

        // ── Step 1: Validate ─────────────────────────────────────────────────
        cfg.validate().context("Invalid training configuration")?;

        // ── Step 2: Run directory + config ──────────────────────────────────
        let layout = cfg.layout();
        layout
            .ensure_dirs()
            .with_context(|| format!("Cannot create run directory '{}'", layout.root().display()))?;
        write_atomic(&layout.train_config(), &serde_json::to_vec_pretty(cfg)?)
            .with_context(|| format!("Cannot write '{}'", layout.train_config().display()))?;
        tracing::info!("Run directory: {}", layout.root().display());

        // ── Step 3: Index image folders ──────────────────────────────────────
        let data_path    = Path::new(&cfg.data_path);
        let train_reader = Arc::new(
            ImageReader::open(data_path.join("train"), cfg.image_size)
                .with_context(|| format!("Cannot read training split under '{}'", cfg.data_path))?,
        );
        let val_reader = Arc::new(
            ImageReader::open(data_path.join("val"), cfg.image_size)
                .with_context(|| format!("Cannot read validation split under '{}'", cfg.data_path))?,
        );
        let num_classes = train_reader.classes().len();
        tracing::info!(
            "Loaded {} training images in {} classes, {} validation images",
            train_reader.labels().len(),
            num_classes,
            val_reader.labels().len()
        );

        // ── Step 4: Model, optimizer, criteria ───────────────────────────────
        let model_config = cfg.model_config(num_classes);
        model_config
            .save(layout.model_config())
            .with_context(|| format!("Cannot write '{}'", layout.model_config().display()))?;
        let model: CgdModel<TrainBackend> = model_config.init(device)?;
        tracing::info!("# Model Params: {}", model.num_params());

        let optim    = AdamConfig::new().init::<TrainBackend, CgdModel<TrainBackend>>();
        let criteria = Criteria {
            classification: LabelSmoothingCrossEntropy::new(num_classes, cfg.smoothing, cfg.temperature)?,
            metric:         BatchHardTripletLoss::new(cfg.margin)?,
        };

        // ── Step 5: Resume ───────────────────────────────────────────────────
        let (model, optim, results) = match &cfg.checkpoint {
            Some(path) => {
                let restored = CheckpointStore::load::<TrainBackend, _, _>(Path::new(path), model, optim, device)
                    .with_context(|| format!("Cannot resume from checkpoint '{path}'"))?;
                restored.results.ensure_same_ranks(&cfg.recalls)?;
                (restored.model, restored.optim, restored.results)
            }
            None => (model, optim, TrainingResults::new(cfg.recalls.clone())),
        };

        // ── Step 6: Loaders + orchestrator ───────────────────────────────────
        let sampler = ClassBalancedSampler::new(train_reader.labels(), cfg.batch_size, cfg.instances_per_class)?;
        let train = TrainingData {
            reader:      train_reader,
            sampler,
            batcher:     ImageBatcher::<TrainBackend>::new(device.clone(), cfg.image_size as usize),
            num_workers: cfg.num_workers,
        };

        // evaluation keeps loader order: a single worker, no shuffle
        let val_batcher = ImageBatcher::<ComputeBackend>::new(device.clone(), cfg.image_size as usize);
        let val_loader  = DataLoaderBuilder::new(val_batcher)
            .batch_size(cfg.batch_size)
            .num_workers(1)
            .build(SampledDataset::sequential(val_reader.clone()));
        let eval_sets = EvalSets::new(vec![EvalSet::new(EVAL_SET_NAME, val_reader, val_loader)], EVAL_SET_NAME)?;

        let stores = RunStores {
            statistics:  StatisticsWriter::new(layout.statistics()),
            best:        BestArtifactStore::new(layout.clone()),
            checkpoints: CheckpointStore::new(layout.checkpoint_dir()),
        };

        // the epoch count keeps sampling plans distinct after a resume
        let rng = StdRng::seed_from_u64(cfg.seed.wrapping_add(results.last_epoch() as u64));

        let orchestrator = EpochOrchestrator::new(
            model,
            optim,
            criteria,
            train,
            eval_sets,
            MultiStepLr::for_epochs(cfg.lr, cfg.num_epochs),
            results,
            stores,
            rng,
            cfg.num_epochs,
        );
        tracing::info!(
            "Training epochs {}..={} with batch size {}",
            orchestrator.start_epoch(),
            cfg.num_epochs,
            cfg.batch_size
        );

        // ── Step 7: Run the epoch loop ───────────────────────────────────────
        let (_, results) = orchestrator.run()?;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::data::image_reader::tests::write_dataset;

    #[test]
    fn test_save_name_lists_hyperparameters() {
        let cfg = TrainConfig { name: "cars".into(), ..TrainConfig::default() };
        assert_eq!(cfg.save_name(), "cars_small_SG_1536_0.1_0.5_0.1_128");
    }

    #[test]
    fn test_validation() {
        assert!(TrainConfig::default().validate().is_ok());

        let bad = [
            TrainConfig { batch_size: 130, ..TrainConfig::default() },
            TrainConfig { instances_per_class: 1, batch_size: 4, ..TrainConfig::default() },
            TrainConfig { smoothing: 1.0, ..TrainConfig::default() },
            TrainConfig { temperature: 0.0, ..TrainConfig::default() },
            TrainConfig { recalls: vec![], ..TrainConfig::default() },
            TrainConfig { recalls: vec![1, 0], ..TrainConfig::default() },
            TrainConfig { gd_config: "SGX".into(), ..TrainConfig::default() },
            TrainConfig { gd_config: "SMG".into(), feature_dim: 1000, ..TrainConfig::default() },
        ];
        for cfg in bad {
            assert!(cfg.validate().is_err(), "{cfg:?}");
        }
    }

    fn tiny_config(data: &Path, results: &Path) -> TrainConfig {
        TrainConfig {
            data_path:           data.display().to_string(),
            results_dir:         results.display().to_string(),
            feature_dim:         8,
            recalls:             vec![1, 2],
            batch_size:          4,
            instances_per_class: 2,
            num_epochs:          2,
            lr:                  1e-3,
            image_size:          8,
            num_workers:         1,
            ..TrainConfig::default()
        }
    }

    #[test]
    fn test_execute_then_resume() {
        let data    = TempDir::new().unwrap();
        let results = TempDir::new().unwrap();
        let colours = [[230, 30, 30], [30, 230, 30], [30, 30, 230]];
        write_dataset(&data.path().join("train"), &colours, 4);
        write_dataset(&data.path().join("val"), &colours, 2);

        let cfg     = tiny_config(data.path(), results.path());
        let history = TrainUseCase::new(cfg.clone()).execute().unwrap();
        assert_eq!(history.last_epoch(), 2);

        let layout = cfg.layout();
        let saved: TrainConfig =
            serde_json::from_slice(&std::fs::read(layout.train_config()).unwrap()).unwrap();
        assert_eq!(saved, cfg);

        let resumed = TrainConfig {
            num_epochs: 3,
            checkpoint: Some(layout.checkpoint_dir().display().to_string()),
            ..cfg
        };
        let history = TrainUseCase::new(resumed).execute().unwrap();
        assert_eq!(history.last_epoch(), 3);
    }

    #[test]
    fn test_missing_checkpoint_is_fatal() {
        let data    = TempDir::new().unwrap();
        let results = TempDir::new().unwrap();
        write_dataset(&data.path().join("train"), &[[200, 0, 0], [0, 200, 0]], 2);
        write_dataset(&data.path().join("val"), &[[200, 0, 0], [0, 200, 0]], 1);

        let cfg = TrainConfig {
            checkpoint: Some(results.path().join("nowhere").display().to_string()),
            ..tiny_config(data.path(), results.path())
        };
        assert!(TrainUseCase::new(cfg).execute().is_err());
    }
}
