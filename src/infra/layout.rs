// ============================================================
// Layer 6 — Run Layout
// ============================================================
// Where one training run keeps its files:
//
//   <results_dir>/<save_name>/
//     train_config.json      ← run configuration
//     model_config.json      ← architecture, for rebuilding the model
//     statistics.csv         ← one row per completed epoch
//     best_model.mpk.gz      ← weights of the best epoch
//     best_database.json     ← embeddings + labels of the best epoch
//     checkpoint/
//       checkpoint.json      ← pointer to the latest epoch's records
//       model_epoch_N.mpk.gz
//       optimizer_epoch_N.mpk.gz
//
// Burn's file recorders replace the path extension, so record
// paths are handed over as stems without dots.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::error::TrainResult;

#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(results_dir: impl AsRef<Path>, save_name: &str) -> Self {
        Self { root: results_dir.as_ref().join(save_name) }
    }

    /// A layout for an existing run directory.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn train_config(&self) -> PathBuf {
        self.root.join("train_config.json")
    }

    /// burn Config of the model architecture.
    pub fn model_config(&self) -> PathBuf {
        self.root.join("model_config.json")
    }

    pub fn statistics(&self) -> PathBuf {
        self.root.join("statistics.csv")
    }

    /// Stem of the best model record.
    pub fn best_model(&self) -> PathBuf {
        self.root.join("best_model")
    }

    pub fn best_database(&self) -> PathBuf {
        self.root.join("best_database.json")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.root.join("checkpoint")
    }

    pub fn ensure_dirs(&self) -> TrainResult<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.checkpoint_dir())?;
        Ok(())
    }
}

/// Write `contents` to a sibling temp file, then rename over `path`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> TrainResult<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{file_name}.tmp"));

    fs::write(&temp_path, contents)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let temp   = TempDir::new().unwrap();
        let layout = RunLayout::new(temp.path(), "cars_small_SG_1536");

        assert!(layout.root().ends_with("cars_small_SG_1536"));
        assert!(layout.checkpoint_dir().starts_with(layout.root()));
        assert_eq!(layout.best_model().extension(), None);

        layout.ensure_dirs().unwrap();
        assert!(layout.checkpoint_dir().is_dir());
    }

    #[test]
    fn test_atomic_write_replaces_contents() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("statistics.csv");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }
}
