// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// All tensor code lives here and in the batcher (Layer 4).
//
// What's in this layer:
//
//   norm.rs         — Batch normalisation with a frozen-statistics
//                     flag and the FreezeNormStats traversal
//
//   model.rs        — Combination-of-global-descriptors model
//                     • strided conv backbone
//                     • S / M / G global descriptors
//                     • auxiliary classifier on the first one
//
//   loss.rs         — Label-smoothed cross-entropy and
//                     batch-hard triplet loss
//
//   trainer.rs      — One training epoch, one evaluation pass
//
//   orchestrator.rs — The epoch loop: schedule, train, evaluate,
//                     persist statistics / best artifact / checkpoint
//
// Backends:
//   default           NdArray (CPU)
//   --features wgpu   Wgpu
//   Training always runs on Autodiff<ComputeBackend>; evaluation
//   runs on ComputeBackend through model.valid().
//
// Reference: Burn Book §3 (Building Blocks)
//            Burn Book §5 (Training)
//            Jun et al. (2019) Combination of Multiple Global Descriptors

/// Batch normalisation with frozen running statistics
pub mod norm;

/// CGD embedding model
pub mod model;

/// Classification and metric losses
pub mod loss;

/// Training and evaluation steps
pub mod trainer;

/// Epoch loop with resumable state
pub mod orchestrator;

#[cfg(not(feature = "wgpu"))]
pub type ComputeBackend = burn::backend::NdArray;

#[cfg(feature = "wgpu")]
pub type ComputeBackend = burn::backend::Wgpu;

pub type TrainBackend = burn::backend::Autodiff<ComputeBackend>;

pub type ComputeDevice = <ComputeBackend as burn::tensor::backend::Backend>::Device;
