// ============================================================
// Layer 3 — Learning-Rate Schedule
// ============================================================
// Piecewise-constant decay: the rate is multiplied by `gamma`
// once per milestone already passed. It is a pure function of
// the epoch number, so a resumed run trains at exactly the rate
// an uninterrupted run would have used.
//
//   lr(e) = base * gamma ^ |{ m : 1 <= m <= e - 1 }|     (e is 1-based)
//
// A milestone of 0 never fires (one scheduler step happens after
// each epoch, so the first possible decay is after epoch 1).

use serde::{Deserialize, Serialize};

/// Fractions of the total epoch count at which the rate decays.
pub const MILESTONE_FRACTIONS: [f64; 2] = [0.6, 0.8];
pub const DEFAULT_GAMMA: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiStepLr {
    base_lr:    f64,
    milestones: Vec<usize>,
    gamma:      f64,
}

impl MultiStepLr {
    pub fn new(base_lr: f64, milestones: Vec<usize>, gamma: f64) -> Self {
        Self { base_lr, milestones, gamma }
    }

    /// Decay by 0.1 at 60% and 80% of `num_epochs` (floored).
    pub fn for_epochs(base_lr: f64, num_epochs: usize) -> Self {
        let milestones = MILESTONE_FRACTIONS
            .iter()
            .map(|f| (f * num_epochs as f64).floor() as usize)
            .collect();
        Self::new(base_lr, milestones, DEFAULT_GAMMA)
    }

    pub fn milestones(&self) -> &[usize] {
        &self.milestones
    }

    /// Rate used while training epoch `epoch` (1-based).
    pub fn lr_at(&self, epoch: usize) -> f64 {
        let steps_taken = epoch.saturating_sub(1);
        let passed = self
            .milestones
            .iter()
            .filter(|&&m| m >= 1 && m <= steps_taken)
            .count();
        self.base_lr * self.gamma.powi(passed as i32)
    }
}
