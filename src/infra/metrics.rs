// ============================================================
// Layer 6 — Statistics Writer
// ============================================================
// Rewrites the run's statistics.csv in full after every epoch,
// through a temp file and rename, so a crash never leaves a
// half-written table behind.
//
// Example CSV output (recall list 1,2,4,8):
//   epoch,train_loss,train_accuracy,recall@1,recall@2,recall@4,recall@8
//   1,4.812301,3.125000,41.230000,53.870000,65.010000,75.440000
//   2,4.201877,11.718750,46.910000,58.320000,69.120000,78.800000
//
// Reference: Rust Book §12 (I/O and File Handling)

use std::path::PathBuf;

use crate::domain::results::TrainingResults;
use crate::error::{TrainError, TrainResult};
use crate::infra::layout::write_atomic;

#[derive(Debug, Clone)]
pub struct StatisticsWriter {
    path: PathBuf,
}

impl StatisticsWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Replace the file with every record in `results`.
    pub fn write(&self, results: &TrainingResults) -> TrainResult<()> {
        write_atomic(&self.path, &render(results)?)?;
        tracing::debug!(
            "Wrote {} epochs to '{}'",
            results.records().len(),
            self.path.display()
        );
        Ok(())
    }
}

fn render(results: &TrainingResults) -> TrainResult<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(true)
        .from_writer(Vec::new());

    let mut header = vec!["epoch".to_string(), "train_loss".into(), "train_accuracy".into()];
    header.extend(results.recall_ks().iter().map(|k| format!("recall@{k}")));
    writer.write_record(&header)?;

    for record in results.records() {
        let mut row = vec![
            record.epoch.to_string(),
            format!("{:.6}", record.train_loss),
            format!("{:.6}", record.train_accuracy),
        ];
        row.extend(record.recalls.iter().map(|r| format!("{r:.6}")));
        writer.write_record(&row)?;
    }

    writer.flush()?;
    writer.into_inner().map_err(|e| TrainError::from(e.into_error()))
}
