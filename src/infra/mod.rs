// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Everything a run writes to disk:
//
//   layout.rs      — Paths inside <results_dir>/<save_name>/ and
//                    the temp-file-then-rename writer every
//                    persistent file goes through
//
//   metrics.rs     — statistics.csv, rewritten in full each epoch
//
//   checkpoint.rs  — Model + optimizer records and the
//                    checkpoint.json pointer used for resuming
//
//   artifacts.rs   — Best model weights and the embedding
//                    database of the best epoch
//
// Reference: Burn Book §5 (Records and Checkpointing)
//            Rust Book §9 (Error Handling)

/// Run directory layout and atomic writes
pub mod layout;

/// Per-epoch statistics CSV
pub mod metrics;

/// Resumable training checkpoints
pub mod checkpoint;

/// Best-epoch model and embedding database
pub mod artifacts;
