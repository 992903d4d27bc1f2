// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// From image folders on disk to device-ready tensor batches:
//
//   <root>/<class>/<image>
//       │
//       ▼
//   ImageReader           → indexes classes/images, decodes lazily
//       │
//       ├──► ClassBalancedSampler → per-epoch plan of indices (train)
//       │         │
//       │         ▼
//       │    SampledDataset       → reader seen through the plan
//       ▼
//   ImageBatcher          → stacks items into an ImageBatch
//       │
//       ▼
//   DataLoader (burn)     → worker threads feed batches in order
//
// Reference: Burn Book §4 (Datasets and Dataloaders)

/// Folder-per-class image index and decoder
pub mod image_reader;

/// Dataset items and the sampled epoch view
pub mod dataset;

/// Batches of at least two images per class
pub mod sampler;

/// Implements Burn's Batcher trait for image batches
pub mod batcher;
