// ============================================================
// Layer 2 — EvalUseCase
// ============================================================
// Re-evaluates the best model of a finished (or running) run:
//
//   1. Read train_config.json and model_config.json from the run
//   2. Rebuild the model and load best_model.mpk.gz
//   3. Embed a dataset split in order
//   4. Report recall@K

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use burn::{config::Config, data::dataloader::DataLoaderBuilder};

use crate::application::train_use_case::TrainConfig;
use crate::data::{batcher::ImageBatcher, dataset::SampledDataset, image_reader::ImageReader};
use crate::domain::recall::recall;
use crate::infra::{artifacts::BestArtifactStore, layout::RunLayout};
use crate::ml::{
    model::{CgdModel, CgdModelConfig},
    trainer::{embed, similarity_matrix},
    ComputeBackend, ComputeDevice,
};

#[derive(Debug, Clone)]
pub struct EvalConfig {
    /// `<results_dir>/<save_name>` of a training run
    pub run_dir:    String,
    /// Defaults to the run's dataset path
    pub data_path:  Option<String>,
    pub split:      String,
    /// Defaults to the run's recall list
    pub recalls:    Option<Vec<usize>>,
    pub batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct EvalReport {
    pub split:     String,
    pub images:    usize,
    pub recall_ks: Vec<usize>,
    pub recalls:   Vec<f64>,
}

pub struct EvalUseCase {
    config: EvalConfig,
}

impl EvalUseCase {
    pub fn new(config: EvalConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> Result<EvalReport> {
        let cfg    = &self.config;
        let device = ComputeDevice::default();
        let layout = RunLayout::at(&cfg.run_dir);

        // ── Run configuration ────────────────────────────────────────────────
        let train_json = std::fs::read(layout.train_config()).with_context(|| {
            format!(
                "Cannot read '{}'. Has this run been trained?",
                layout.train_config().display()
            )
        })?;
        let train_cfg: TrainConfig = serde_json::from_slice(&train_json)?;
        let model_cfg = CgdModelConfig::load(layout.model_config())
            .map_err(|e| anyhow!("Cannot read '{}': {e:?}", layout.model_config().display()))?;

        // ── Model ────────────────────────────────────────────────────────────
        let model: CgdModel<ComputeBackend> = model_cfg.init(&device)?;
        let model = BestArtifactStore::new(layout.clone())
            .load_model::<ComputeBackend, _>(model, &device)
            .context("No best model in this run yet")?;

        // ── Data ─────────────────────────────────────────────────────────────
        let data_path = cfg.data_path.as_deref().unwrap_or(&train_cfg.data_path);
        let reader    = std::sync::Arc::new(
            ImageReader::open(Path::new(data_path).join(&cfg.split), train_cfg.image_size)
                .with_context(|| format!("Cannot read split '{}' under '{data_path}'", cfg.split))?,
        );
        let batcher = ImageBatcher::<ComputeBackend>::new(device, train_cfg.image_size as usize);
        let loader  = DataLoaderBuilder::new(batcher)
            .batch_size(cfg.batch_size.max(1))
            .num_workers(1)
            .build(SampledDataset::sequential(reader.clone()));

        // ── Recall ───────────────────────────────────────────────────────────
        let recall_ks = cfg.recalls.clone().unwrap_or(train_cfg.recalls);
        let (bank, embeddings) = embed(&model, loader.as_ref(), reader.labels().len())?;
        let recalls   = recall(&similarity_matrix(embeddings)?, reader.labels(), &recall_ks)?;
        tracing::info!("Evaluated {} images of '{}'", bank.len(), cfg.split);

        Ok(EvalReport {
            split:  cfg.split.clone(),
            images: bank.len(),
            recall_ks,
            recalls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::application::train_use_case::TrainUseCase;
    use crate::data::image_reader::tests::write_dataset;

    #[test]
    fn test_evaluates_trained_run() {
        let data    = TempDir::new().unwrap();
        let results = TempDir::new().unwrap();
        let colours = [[230, 30, 30], [30, 230, 30], [30, 30, 230]];
        write_dataset(&data.path().join("train"), &colours, 4);
        // each class holds one image twice, so its partner is an exact match
        let val = data.path().join("val");
        write_dataset(&val, &colours, 1);
        for class in std::fs::read_dir(&val).unwrap() {
            let dir = class.unwrap().path();
            std::fs::copy(dir.join("img_000.png"), dir.join("img_001.png")).unwrap();
        }

        let train_cfg = TrainConfig {
            data_path:           data.path().display().to_string(),
            results_dir:         results.path().display().to_string(),
            feature_dim:         8,
            recalls:             vec![1, 2],
            batch_size:          4,
            instances_per_class: 2,
            num_epochs:          1,
            lr:                  1e-3,
            image_size:          8,
            num_workers:         1,
            ..TrainConfig::default()
        };
        let history = TrainUseCase::new(train_cfg.clone()).execute().unwrap();
        let run_dir = train_cfg.layout().root().display().to_string();
        let best    = history.best_primary_recall();

        let report = EvalUseCase::new(EvalConfig {
            run_dir,
            data_path:  None,
            split:      "val".into(),
            recalls:    Some(vec![1]),
            batch_size: 4,
        })
        .execute();

        assert!(best > 0.0);
        let report = report.unwrap();
        assert_eq!(report.images, 6);
        assert_eq!(report.recall_ks, vec![1]);
        assert!((report.recalls[0] - best).abs() < 1e-9);
    }

    #[test]
    fn test_missing_run_is_an_error() {
        let temp = TempDir::new().unwrap();
        let cfg  = EvalConfig {
            run_dir:    temp.path().join("absent").display().to_string(),
            data_path:  None,
            split:      "val".into(),
            recalls:    None,
            batch_size: 8,
        };
        assert!(EvalUseCase::new(cfg).execute().is_err());
    }
}
