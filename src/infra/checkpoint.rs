// ============================================================
// Layer 6 — Checkpoint Store
// ============================================================
// Saves and restores the full training state after every epoch
// with Burn's NamedMpkGzFileRecorder at full precision, so a
// resumed run continues from bit-identical weights.
//
// What gets saved per checkpoint:
//   1. Model weights      (model_epoch_N.mpk.gz)
//   2. Optimizer state    (optimizer_epoch_N.mpk.gz) — Adam moments
//   3. checkpoint.json    — epoch, record stems, results series
//
// Commit order: both records first, then checkpoint.json through
// a temp file and rename. The pointer therefore always names a
// complete pair; records of older epochs are pruned afterwards.
//
// Reference: Burn Book §5 (Records and Checkpointing)

use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{
    module::AutodiffModule,
    optim::Optimizer,
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkGzFileRecorder, Recorder},
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};

use crate::domain::results::TrainingResults;
use crate::error::{TrainError, TrainResult};
use crate::infra::layout::write_atomic;

/// Recorder used for every model and optimizer record of a run.
pub type RunRecorder = NamedMpkGzFileRecorder<FullPrecisionSettings>;

/// Extension the recorder appends to record stems.
pub const RECORD_EXTENSION: &str = "mpk.gz";

const MANIFEST_FILE: &str = "checkpoint.json";

/// Contents of checkpoint.json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub epoch:            usize,
    /// Record stems relative to the checkpoint directory
    pub model_record:     String,
    pub optimizer_record: String,
    pub results:          TrainingResults,
}

/// Training state read back from a checkpoint.
pub struct Restored<M, O> {
    pub epoch:   usize,
    pub model:   M,
    pub optim:   O,
    pub results: TrainingResults,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    /// Persist model, optimizer and results for `epoch`.
    pub fn save<B, M, O>(
        &self,
        epoch:   usize,
        model:   &M,
        optim:   &O,
        results: &TrainingResults,
    ) -> TrainResult<()>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        fs::create_dir_all(&self.dir)?;
        let recorder = RunRecorder::new();

        let model_record     = format!("model_epoch_{epoch}");
        let optimizer_record = format!("optimizer_epoch_{epoch}");

        model
            .clone()
            .save_file(self.dir.join(&model_record), &recorder)
            .map_err(|e| TrainError::Checkpoint(format!("cannot save model for epoch {epoch}: {e}")))?;
        <RunRecorder as Recorder<B>>::record(&recorder, optim.to_record(), self.dir.join(&optimizer_record))
            .map_err(|e| TrainError::Checkpoint(format!("cannot save optimizer for epoch {epoch}: {e}")))?;

        let manifest = CheckpointManifest {
            epoch,
            model_record,
            optimizer_record,
            results: results.clone(),
        };
        write_atomic(&self.manifest_path(), &serde_json::to_vec_pretty(&manifest)?)?;
        self.prune(&manifest)?;

        tracing::debug!("Saved checkpoint: epoch {}", epoch);
        Ok(())
    }

    /// Restore a checkpoint into freshly built `model` and `optim`.
    ///
    /// `path` is either a checkpoint directory or its checkpoint.json.
    /// A missing or unreadable checkpoint is an error.
    pub fn load<B, M, O>(
        path:   &Path,
        model:  M,
        optim:  O,
        device: &B::Device,
    ) -> TrainResult<Restored<M, O>>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let (dir, manifest) = read_manifest(path)?;
        let recorder = RunRecorder::new();

        let model = model
            .load_file(dir.join(&manifest.model_record), &recorder, device)
            .map_err(|e| TrainError::Checkpoint(format!(
                "cannot load model record '{}': {e}",
                manifest.model_record
            )))?;
        let optim_record = <RunRecorder as Recorder<B>>::load::<O::Record>(
            &recorder,
            dir.join(&manifest.optimizer_record),
            device,
        )
        .map_err(|e| TrainError::Checkpoint(format!(
            "cannot load optimizer record '{}': {e}",
            manifest.optimizer_record
        )))?;

        tracing::info!("Restored checkpoint from epoch {}", manifest.epoch);
        Ok(Restored {
            epoch:   manifest.epoch,
            model,
            optim:   optim.load_record(optim_record),
            results: manifest.results,
        })
    }

    /// Delete records of every epoch except the one `manifest` names.
    fn prune(&self, manifest: &CheckpointManifest) -> TrainResult<()> {
        let keep = [
            format!("{}.{RECORD_EXTENSION}", manifest.model_record),
            format!("{}.{RECORD_EXTENSION}", manifest.optimizer_record),
        ];
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name  = entry.file_name().to_string_lossy().into_owned();
            let stale = (name.starts_with("model_epoch_") || name.starts_with("optimizer_epoch_"))
                && !keep.contains(&name);
            if stale {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

/// Locate and parse checkpoint.json; returns the directory holding it.
pub fn read_manifest(path: &Path) -> TrainResult<(PathBuf, CheckpointManifest)> {
    let manifest_path = if path.is_dir() { path.join(MANIFEST_FILE) } else { path.to_path_buf() };

    let json = fs::read_to_string(&manifest_path).map_err(|e| {
        TrainError::Checkpoint(format!("cannot read '{}': {e}", manifest_path.display()))
    })?;
    let manifest: CheckpointManifest = serde_json::from_str(&json).map_err(|e| {
        TrainError::Checkpoint(format!("corrupt checkpoint '{}': {e}", manifest_path.display()))
    })?;
    if manifest.results.last_epoch() != manifest.epoch {
        return Err(TrainError::Checkpoint(format!(
            "checkpoint epoch {} does not match its results ({} epochs)",
            manifest.epoch,
            manifest.results.last_epoch()
        )));
    }

    let dir = manifest_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    Ok((dir, manifest))
}
