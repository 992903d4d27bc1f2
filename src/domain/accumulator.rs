// ============================================================
// Layer 3 — Epoch Accumulator
// ============================================================
// Folds per-batch training outcomes into epoch means.
// Loss is weighted by batch size so the mean is per sample,
// matching how accuracy is counted.

/// What one optimisation step reports back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchOutcome {
    /// Batch-mean combined loss
    pub loss:    f64,
    /// Samples whose argmax logit equals the label
    pub correct: usize,
    pub size:    usize,
}

/// Epoch-level means.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub mean_loss: f64,
    /// Percentage in [0, 100]
    pub accuracy:  f64,
}

#[derive(Debug, Clone, Default)]
pub struct EpochAccumulator {
    loss_sum: f64,
    correct:  usize,
    seen:     usize,
}

impl EpochAccumulator {
    pub fn observe(&mut self, outcome: BatchOutcome) {
        self.loss_sum += outcome.loss * outcome.size as f64;
        self.correct  += outcome.correct;
        self.seen     += outcome.size;
    }

    /// Running means so far, for progress logging.
    pub fn running(&self) -> Option<EpochStats> {
        self.finalize()
    }

    /// `None` if nothing was observed.
    pub fn finalize(&self) -> Option<EpochStats> {
        if self.seen == 0 {
            return None;
        }
        let seen = self.seen as f64;
        Some(EpochStats {
            mean_loss: self.loss_sum / seen,
            accuracy:  self.correct as f64 / seen * 100.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_means_are_sample_weighted() {
        let mut acc = EpochAccumulator::default();
        acc.observe(BatchOutcome { loss: 2.0, correct: 1, size: 2 });
        acc.observe(BatchOutcome { loss: 0.5, correct: 5, size: 6 });
        let stats = acc.finalize().unwrap();
        // (2.0*2 + 0.5*6) / 8
        assert!((stats.mean_loss - 0.875).abs() < 1e-12);
        assert!((stats.accuracy - 75.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_epoch_has_no_stats() {
        assert!(EpochAccumulator::default().finalize().is_none());
    }
}
