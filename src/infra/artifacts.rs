// ============================================================
// Layer 6 — Best Artifact Store
// ============================================================
// Written only when an epoch strictly improves the primary
// recall. Two files, each replaced by rename:
//
//   best_model.mpk.gz     — model weights (staged, then renamed)
//   best_database.json    — the evaluation set's embeddings with
//                           labels, image paths and class names,
//                           usable for retrieval without rerunning
//                           the model
//
// The eval subcommand reads both back.

use std::fs;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::image_reader::ImageReader;
use crate::domain::embedding::EmbeddingBank;
use crate::error::{TrainError, TrainResult};
use crate::infra::{
    checkpoint::{RunRecorder, RECORD_EXTENSION},
    layout::{write_atomic, RunLayout},
};

/// Embeddings of one evaluation set, row-aligned with its items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingDatabase {
    pub set_name:   String,
    /// Epoch whose model produced the embeddings
    pub epoch:      usize,
    pub recall_ks:  Vec<usize>,
    pub recalls:    Vec<f64>,
    pub classes:    Vec<String>,
    pub images:     Vec<String>,
    pub labels:     Vec<usize>,
    pub embeddings: EmbeddingBank,
}

impl EmbeddingDatabase {
    pub fn new(
        set_name:   &str,
        epoch:      usize,
        recall_ks:  &[usize],
        recalls:    &[f64],
        reader:     &ImageReader,
        embeddings: EmbeddingBank,
    ) -> TrainResult<Self> {
        if embeddings.len() != reader.labels().len() {
            return Err(TrainError::Dataset(format!(
                "{} embeddings for {} images of '{set_name}'",
                embeddings.len(),
                reader.labels().len()
            )));
        }
        Ok(Self {
            set_name:  set_name.to_string(),
            epoch,
            recall_ks: recall_ks.to_vec(),
            recalls:   recalls.to_vec(),
            classes:   reader.classes().to_vec(),
            images:    reader.images().iter().map(|p| p.display().to_string()).collect(),
            labels:    reader.labels().to_vec(),
            embeddings,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BestArtifactStore {
    layout: RunLayout,
}

impl BestArtifactStore {
    pub fn new(layout: RunLayout) -> Self {
        Self { layout }
    }

    pub fn save<B: Backend, M: Module<B>>(&self, model: &M, database: &EmbeddingDatabase) -> TrainResult<()> {
        let recorder = RunRecorder::new();
        let staging  = self.layout.root().join("best_model_staging");

        model
            .clone()
            .save_file(&staging, &recorder)
            .map_err(|e| TrainError::Checkpoint(format!("cannot save best model: {e}")))?;
        fs::rename(
            staging.with_extension(RECORD_EXTENSION),
            self.layout.best_model().with_extension(RECORD_EXTENSION),
        )?;
        write_atomic(&self.layout.best_database(), &serde_json::to_vec(database)?)?;

        tracing::debug!(
            "Saved best artifact of epoch {} to '{}'",
            database.epoch,
            self.layout.root().display()
        );
        Ok(())
    }

    pub fn load_model<B: Backend, M: Module<B>>(&self, model: M, device: &B::Device) -> TrainResult<M> {
        let path = self.layout.best_model();
        model
            .load_file(&path, &RunRecorder::new(), device)
            .map_err(|e| TrainError::Checkpoint(format!(
                "cannot load best model '{}': {e}",
                path.display()
            )))
    }

    pub fn load_database(&self) -> TrainResult<EmbeddingDatabase> {
        let json = fs::read_to_string(self.layout.best_database())?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use tempfile::TempDir;

    use crate::data::image_reader::tests::write_dataset;
    use crate::ml::model::{BackboneKind, CgdModel, CgdModelConfig};

    fn model() -> CgdModel<NdArray> {
        CgdModelConfig::new(BackboneKind::Small, "G".into(), 4, 2)
            .init(&Default::default())
            .unwrap()
    }

    #[test]
    fn test_save_then_load() {
        let temp = TempDir::new().unwrap();
        write_dataset(&temp.path().join("val"), &[[250, 0, 0], [0, 0, 250]], 1);
        let reader = ImageReader::open(temp.path().join("val"), 4).unwrap();

        let layout = RunLayout::new(temp.path(), "run");
        layout.ensure_dirs().unwrap();
        let store = BestArtifactStore::new(layout.clone());

        let bank     = EmbeddingBank::from_rows(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let database = EmbeddingDatabase::new("val", 2, &[1], &[100.0], &reader, bank).unwrap();
        let original = model();
        store.save::<NdArray, _>(&original, &database).unwrap();

        assert!(layout.best_model().with_extension(RECORD_EXTENSION).is_file());
        assert!(!layout.root().join("best_model_staging.mpk.gz").exists());
        assert_eq!(store.load_database().unwrap(), database);

        let loaded = store.load_model::<NdArray, _>(model(), &Default::default()).unwrap();
        let w = |m: &CgdModel<NdArray>| {
            m.classifier.weight.val().into_data().convert::<f32>().to_vec::<f32>().unwrap()
        };
        assert_eq!(w(&loaded), w(&original));
    }

    #[test]
    fn test_database_must_cover_every_image() {
        let temp = TempDir::new().unwrap();
        write_dataset(temp.path(), &[[250, 0, 0], [0, 0, 250]], 2);
        let reader = ImageReader::open(temp.path(), 4).unwrap();
        let bank   = EmbeddingBank::from_rows(&[vec![1.0, 0.0]]).unwrap();
        assert!(EmbeddingDatabase::new("val", 1, &[1], &[0.0], &reader, bank).is_err());
    }
}
