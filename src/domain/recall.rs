// ============================================================
// Layer 3 — Ranking Evaluator (recall@K)
// ============================================================
// For every query in the bank, all *other* items are ranked by
// dot-product similarity (cosine, since embeddings are
// L2-normalised). A query is a hit at K when one of its K nearest
// neighbours carries the same label.
//
// Similarities arrive as one N×N matrix: training computes it with
// a single matmul on the device, tests build it on the host from an
// `EmbeddingBank`.
//
// Ranking is a stable sort on descending similarity, so equal
// similarities keep ascending index order: the first-encountered
// item wins the tie and results are identical across runs.
//
// Cost is O(N² log N); evaluation sets are small enough for that.

use std::cmp::Ordering;

use crate::domain::embedding::EmbeddingBank;
use crate::error::{TrainError, TrainResult};

/// Square matrix of pairwise similarities, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Similarities {
    len:    usize,
    values: Vec<f32>,
}

impl Similarities {
    /// Dot products of every pair of rows, computed on the host.
    pub fn from_bank(bank: &EmbeddingBank) -> Self {
        let len        = bank.len();
        let mut values = vec![0.0; len * len];
        for a in 0..len {
            for b in a..len {
                let s = bank.similarity(a, b);
                values[a * len + b] = s;
                values[b * len + a] = s;
            }
        }
        Self { len, values }
    }

    /// Wrap a `len × len` matrix computed elsewhere.
    pub fn from_row_major(len: usize, values: Vec<f32>) -> TrainResult<Self> {
        if values.len() != len * len {
            return Err(TrainError::RecallInput(format!(
                "{} similarity values for {len} items",
                values.len()
            )));
        }
        Ok(Self { len, values })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn row(&self, query: usize) -> &[f32] {
        &self.values[query * self.len..(query + 1) * self.len]
    }
}

/// Indices of every item except `query`, most similar first.
pub fn rank_neighbors(sims: &Similarities, query: usize) -> Vec<usize> {
    let mut scored: Vec<(usize, f32)> = sims
        .row(query)
        .iter()
        .copied()
        .enumerate()
        .filter(|&(i, _)| i != query)
        .collect();

    // sort_by is stable; ties stay in index order
    scored.sort_by(|a, b| descending(a.1, b.1));
    scored.into_iter().map(|(i, _)| i).collect()
}

/// Per-query hit/miss decisions at a single K.
pub fn query_hits(sims: &Similarities, labels: &[usize], k: usize) -> TrainResult<Vec<bool>> {
    validate(sims, labels, &[k])?;
    Ok(first_hit_ranks(sims, labels)
        .into_iter()
        .map(|rank| rank.is_some_and(|r| r < k))
        .collect())
}

/// recall@K as a percentage, one value per entry of `ks`, in the
/// order given. `ks` does not need to be sorted.
pub fn recall(sims: &Similarities, labels: &[usize], ks: &[usize]) -> TrainResult<Vec<f64>> {
    validate(sims, labels, ks)?;

    let first_hits = first_hit_ranks(sims, labels);
    let total      = first_hits.len() as f64;

    Ok(ks
        .iter()
        .map(|&k| {
            let hits = first_hits
                .iter()
                .filter(|rank| rank.is_some_and(|r| r < k))
                .count();
            hits as f64 / total * 100.0
        })
        .collect())
}

/// Zero-based position of the first same-label neighbour for each
/// query, or `None` when the query's label occurs nowhere else.
fn first_hit_ranks(sims: &Similarities, labels: &[usize]) -> Vec<Option<usize>> {
    (0..sims.len())
        .map(|query| {
            rank_neighbors(sims, query)
                .iter()
                .position(|&n| labels[n] == labels[query])
        })
        .collect()
}

fn validate(sims: &Similarities, labels: &[usize], ks: &[usize]) -> TrainResult<()> {
    if sims.is_empty() {
        return Err(TrainError::RecallInput("embedding bank is empty".into()));
    }
    if sims.len() != labels.len() {
        return Err(TrainError::RecallInput(format!(
            "{} embeddings but {} labels",
            sims.len(),
            labels.len()
        )));
    }
    if ks.is_empty() || ks.contains(&0) {
        return Err(TrainError::RecallInput(format!(
            "recall ranks must be non-empty and positive, got {ks:?}"
        )));
    }
    Ok(())
}

fn descending(a: f32, b: f32) -> Ordering {
    b.total_cmp(&a)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank(rows: &[[f32; 2]]) -> Similarities {
        let rows: Vec<Vec<f32>> = rows.iter().map(|r| r.to_vec()).collect();
        Similarities::from_bank(&EmbeddingBank::from_rows(&rows).unwrap())
    }

    #[test]
    fn test_perfect_neighbours_give_full_recall() {
        let b = bank(&[[1.0, 0.0], [0.99, 0.1], [0.0, 1.0], [0.1, 0.99]]);
        let labels = [0, 0, 1, 1];
        assert_eq!(recall(&b, &labels, &[1]).unwrap(), vec![100.0]);
    }

    #[test]
    fn test_query_excludes_itself() {
        // Item 0's only same-label partner is far away; without self
        // exclusion it would always hit at K=1.
        let b = bank(&[[1.0, 0.0], [0.9, 0.1], [-1.0, 0.0]]);
        let labels = [0, 1, 0];
        let hits = query_hits(&b, &labels, 1).unwrap();
        assert_eq!(hits, vec![false, false, false]);
    }

    #[test]
    fn test_recall_is_monotone_in_k() {
        let b = bank(&[
            [1.0, 0.0], [0.8, 0.6], [0.6, 0.8], [0.0, 1.0],
            [-0.6, 0.8], [-1.0, 0.0],
        ]);
        let labels = [0, 1, 0, 2, 1, 2];
        let r = recall(&b, &labels, &[1, 2, 4, 5]).unwrap();
        for pair in r.windows(2) {
            assert!(pair[0] <= pair[1], "recall decreased: {r:?}");
        }
        assert_eq!(r[3], 100.0);
    }

    #[test]
    fn test_unsorted_ks_evaluated_independently() {
        let b = bank(&[[1.0, 0.0], [0.8, 0.6], [0.6, 0.8], [0.0, 1.0]]);
        let labels = [0, 1, 0, 1];
        let sorted   = recall(&b, &labels, &[1, 3]).unwrap();
        let unsorted = recall(&b, &labels, &[3, 1]).unwrap();
        assert_eq!(sorted[0], unsorted[1]);
        assert_eq!(sorted[1], unsorted[0]);
    }

    #[test]
    fn test_ties_break_by_first_encountered_index() {
        // Items 1 and 2 are equally similar to item 0; index 1 must win.
        let b = bank(&[[1.0, 0.0], [0.0, 1.0], [0.0, 1.0], [-1.0, 0.0]]);
        assert_eq!(rank_neighbors(&b, 0), vec![1, 2, 3]);

        let labels_hit  = [7, 7, 8, 9];
        let labels_miss = [7, 8, 7, 9];
        assert!(query_hits(&b, &labels_hit, 1).unwrap()[0]);
        assert!(!query_hits(&b, &labels_miss, 1).unwrap()[0]);
    }

    #[test]
    fn test_repeated_runs_identical() {
        let b = bank(&[[1.0, 0.0], [1.0, 0.0], [1.0, 0.0], [1.0, 0.0]]);
        let labels = [0, 1, 0, 1];
        let first  = (recall(&b, &labels, &[1, 2]).unwrap(), query_hits(&b, &labels, 1).unwrap());
        let second = (recall(&b, &labels, &[1, 2]).unwrap(), query_hits(&b, &labels, 1).unwrap());
        assert_eq!(first, second);
        // all similarities tie, so every query ranks by index: only item 2
        // finds a same-label item (0) in first place
        assert_eq!(first.1, vec![false, false, true, false]);
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let b = bank(&[[1.0, 0.0], [0.0, 1.0]]);
        assert!(recall(&b, &[0], &[1]).is_err());
        assert!(recall(&b, &[0, 1], &[0]).is_err());
        assert!(recall(&b, &[0, 1], &[]).is_err());
        assert!(recall(&Similarities::from_bank(&EmbeddingBank::new(2)), &[], &[1]).is_err());
    }

    #[test]
    fn test_matrix_size_checked() {
        assert!(Similarities::from_row_major(2, vec![1.0, 0.0, 0.0]).is_err());
        let sims = Similarities::from_row_major(2, vec![1.0, 0.3, 0.3, 1.0]).unwrap();
        assert_eq!(sims.row(1), [0.3f32, 1.0].as_slice());
        assert_eq!(rank_neighbors(&sims, 1), vec![0]);
    }
}
