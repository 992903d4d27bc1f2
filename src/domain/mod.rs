// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust types and algorithms that describe a training run:
// embedding banks, the recall@K ranking evaluator, the per-epoch
// results series, the epoch accumulator and the learning-rate
// schedule.
//
// Rules for this layer:
//   - NO Burn framework types allowed here
//   - NO file I/O
//
// Everything here is unit-testable without a device.

/// Row-major bank of fixed-dimension embedding vectors
pub mod embedding;

/// recall@K over an embedding bank with deterministic ranking
pub mod recall;

/// Append-only per-epoch results and best-recall tracking
pub mod results;

/// Reducer for per-batch training outcomes
pub mod accumulator;

/// Epoch-indexed multi-step learning-rate decay
pub mod schedule;
