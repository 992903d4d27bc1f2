use serde::{Deserialize, Serialize};

use crate::error::{TrainError, TrainResult};

/// Embeddings for a whole evaluation set, stored row-major.
///
/// Rows are appended batch by batch in loader order, so row `i`
/// always belongs to the dataset item at index `i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingBank {
    dim:  usize,
    data: Vec<f32>,
}

impl EmbeddingBank {
    pub fn new(dim: usize) -> Self {
        Self { dim, data: Vec::new() }
    }

    /// Build a bank from explicit rows. All rows must share one length.
    pub fn from_rows(rows: &[Vec<f32>]) -> TrainResult<Self> {
        let dim      = rows.first().map_or(0, Vec::len);
        let mut bank = Self::new(dim);
        for row in rows {
            bank.push_rows(row)?;
        }
        Ok(bank)
    }

    /// Append one or more rows given as a flat slice.
    pub fn push_rows(&mut self, flat: &[f32]) -> TrainResult<()> {
        if self.dim == 0 || flat.len() % self.dim != 0 {
            return Err(TrainError::RecallInput(format!(
                "cannot append {} values to a bank of dimension {}",
                flat.len(),
                self.dim
            )));
        }
        self.data.extend_from_slice(flat);
        Ok(())
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        if self.dim == 0 { 0 } else { self.data.len() / self.dim }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.dim..(index + 1) * self.dim]
    }

    /// Dot-product similarity between two rows.
    pub fn similarity(&self, a: usize, b: usize) -> f32 {
        self.row(a)
            .iter()
            .zip(self.row(b))
            .map(|(x, y)| x * y)
            .sum()
    }
}
