// ============================================================
// Layer 3 — Training Results
// ============================================================
// The per-epoch results series. Logically append-only: records
// are pushed once per completed epoch and never edited. The
// whole series travels inside every checkpoint so a resumed run
// continues the same history.

use serde::{Deserialize, Serialize};

use crate::error::{TrainError, TrainResult};

/// One completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch:          usize,
    pub train_loss:     f64,
    /// Percentage in [0, 100]
    pub train_accuracy: f64,
    /// recall@K percentages, aligned with `TrainingResults::recall_ks`
    pub recalls:        Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingResults {
    recall_ks: Vec<usize>,
    records:   Vec<EpochRecord>,
}

impl TrainingResults {
    pub fn new(recall_ks: Vec<usize>) -> Self {
        Self { recall_ks, records: Vec::new() }
    }

    /// Append the next epoch. Epochs must be consecutive, starting at 1.
    pub fn push(&mut self, record: EpochRecord) -> TrainResult<()> {
        let expected = self.last_epoch() + 1;
        if record.epoch != expected {
            return Err(TrainError::InvalidConfig(format!(
                "results expect epoch {expected}, got {}",
                record.epoch
            )));
        }
        if record.recalls.len() != self.recall_ks.len() {
            return Err(TrainError::InvalidConfig(format!(
                "epoch {} has {} recall values for {} ranks",
                record.epoch,
                record.recalls.len(),
                self.recall_ks.len()
            )));
        }
        self.records.push(record);
        Ok(())
    }

    pub fn recall_ks(&self) -> &[usize] {
        &self.recall_ks
    }

    pub fn records(&self) -> &[EpochRecord] {
        &self.records
    }

    /// Last completed epoch, 0 when nothing has run yet.
    pub fn last_epoch(&self) -> usize {
        self.records.last().map_or(0, |r| r.epoch)
    }

    /// Position of the primary rank (smallest K) inside `recall_ks`.
    pub fn primary_index(&self) -> usize {
        primary_index(&self.recall_ks)
    }

    /// Best primary recall over the whole history, 0.0 when empty.
    pub fn best_primary_recall(&self) -> f64 {
        let idx = self.primary_index();
        self.records
            .iter()
            .filter_map(|r| r.recalls.get(idx).copied())
            .fold(0.0, f64::max)
    }

    /// A restored series can only continue a run with the same ranks.
    pub fn ensure_same_ranks(&self, recall_ks: &[usize]) -> TrainResult<()> {
        if self.recall_ks != recall_ks {
            return Err(TrainError::Checkpoint(format!(
                "checkpoint was recorded with recall ranks {:?}, run requests {:?}",
                self.recall_ks, recall_ks
            )));
        }
        Ok(())
    }
}

/// Index of the smallest K; the first one wins if it is repeated.
pub fn primary_index(recall_ks: &[usize]) -> usize {
    recall_ks
        .iter()
        .enumerate()
        .min_by_key(|&(i, &k)| (k, i))
        .map_or(0, |(i, _)| i)
}

/// Tracks the best primary recall seen so far.
#[derive(Debug, Clone, Copy)]
pub struct BestTracker {
    best: f64,
}

impl BestTracker {
    pub fn new(initial: f64) -> Self {
        Self { best: initial }
    }

    /// Resume from a restored history.
    pub fn from_results(results: &TrainingResults) -> Self {
        Self::new(results.best_primary_recall())
    }

    /// Records `value` and returns true only on strict improvement.
    pub fn observe(&mut self, value: f64) -> bool {
        if value > self.best {
            self.best = value;
            true
        } else {
            false
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(epoch: usize, recalls: Vec<f64>) -> EpochRecord {
        EpochRecord { epoch, train_loss: 1.0, train_accuracy: 50.0, recalls }
    }

    #[test]
    fn test_best_written_only_on_strict_improvement() {
        let mut tracker = BestTracker::new(0.0);
        let written: Vec<usize> = [10.0, 15.0, 15.0, 20.0, 18.0]
            .iter()
            .enumerate()
            .filter(|&(_, &r)| tracker.observe(r))
            .map(|(i, _)| i + 1)
            .collect();
        assert_eq!(written, vec![1, 2, 4]);
        assert_eq!(tracker.best(), 20.0);
    }

    #[test]
    fn test_push_requires_consecutive_epochs() {
        let mut results = TrainingResults::new(vec![1, 2]);
        results.push(record(1, vec![10.0, 20.0])).unwrap();
        assert!(results.push(record(3, vec![10.0, 20.0])).is_err());
        assert!(results.push(record(2, vec![10.0])).is_err());
        results.push(record(2, vec![12.0, 22.0])).unwrap();
        assert_eq!(results.last_epoch(), 2);
    }

    #[test]
    fn test_best_restored_from_history_uses_smallest_k() {
        let mut results = TrainingResults::new(vec![4, 1]);
        results.push(record(1, vec![90.0, 30.0])).unwrap();
        results.push(record(2, vec![95.0, 25.0])).unwrap();
        assert_eq!(results.primary_index(), 1);

        let mut tracker = BestTracker::from_results(&results);
        assert_eq!(tracker.best(), 30.0);
        assert!(!tracker.observe(30.0));
        assert!(tracker.observe(31.0));
    }

    #[test]
    fn test_rank_mismatch_detected() {
        let results = TrainingResults::new(vec![1, 2, 4]);
        assert!(results.ensure_same_ranks(&[1, 2, 4]).is_ok());
        assert!(results.ensure_same_ranks(&[1, 2]).is_err());
    }
}
