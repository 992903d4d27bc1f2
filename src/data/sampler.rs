// ============================================================
// Layer 4 — Class-Balanced Sampler
// ============================================================
// Produces the epoch plan for training: a flat list of item
// indices whose consecutive `batch_size` chunks are batches.
//
// Every batch holds `batch_size / per_class` distinct classes and
// exactly `per_class` items of each, so each label in a batch
// occurs at least twice. The batch-hard triplet loss needs a
// positive for every anchor. Classes with fewer images than
// `per_class` are sampled with replacement.
//
// One epoch is `len / batch_size` batches (the remainder of the
// dataset is not visited that epoch).

use rand::{seq::SliceRandom, Rng};

use crate::error::{TrainError, TrainResult};

#[derive(Debug, Clone)]
pub struct ClassBalancedSampler {
    by_class:   Vec<Vec<usize>>,
    batch_size: usize,
    per_class:  usize,
    batches:    usize,
}

impl ClassBalancedSampler {
    pub fn new(labels: &[usize], batch_size: usize, per_class: usize) -> TrainResult<Self> {
        if per_class < 2 {
            return Err(TrainError::InvalidConfig(format!(
                "instances per class must be at least 2, got {per_class}"
            )));
        }
        if batch_size == 0 || batch_size % per_class != 0 {
            return Err(TrainError::InvalidConfig(format!(
                "batch size {batch_size} must be a positive multiple of {per_class} instances per class"
            )));
        }

        let num_classes = labels.iter().max().map_or(0, |&m| m + 1);
        let mut by_class = vec![Vec::new(); num_classes];
        for (index, &label) in labels.iter().enumerate() {
            by_class[label].push(index);
        }
        by_class.retain(|items: &Vec<usize>| !items.is_empty());

        let classes_per_batch = batch_size / per_class;
        if by_class.len() < classes_per_batch {
            return Err(TrainError::InvalidConfig(format!(
                "a batch of {batch_size} needs {classes_per_batch} classes, dataset has {}",
                by_class.len()
            )));
        }

        let batches = labels.len() / batch_size;
        if batches == 0 {
            return Err(TrainError::InvalidConfig(format!(
                "dataset of {} items is smaller than one batch of {batch_size}",
                labels.len()
            )));
        }

        Ok(Self { by_class, batch_size, per_class, batches })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches per epoch.
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Draw the index plan for `batches` batches.
    pub fn plan<R: Rng + ?Sized>(&self, batches: usize, rng: &mut R) -> Vec<usize> {
        let mut plan = Vec::with_capacity(batches * self.batch_size);
        for _ in 0..batches {
            plan.extend(self.sample_batch(rng));
        }
        plan
    }

    fn sample_batch<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<usize> {
        let classes_per_batch = self.batch_size / self.per_class;
        let mut batch = Vec::with_capacity(self.batch_size);

        for members in self.by_class.choose_multiple(rng, classes_per_batch) {
            if members.len() >= self.per_class {
                batch.extend(members.choose_multiple(rng, self.per_class).copied());
            } else {
                batch.extend((0..self.per_class).map(|_| members[rng.gen_range(0..members.len())]));
            }
        }

        batch.shuffle(rng);
        batch
    }
}
