// ============================================================
// Error Taxonomy
// ============================================================
// Typed failures raised below the application layer.
// The application and CLI layers wrap these in anyhow with
// context; nothing here is ever swallowed or defaulted.

use thiserror::Error;

pub type TrainResult<T> = std::result::Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum TrainError {
    /// NaN or ±Inf in a forward pass during training. Aborts the run.
    #[error("non-finite values in {tensor} at epoch {epoch}, batch {batch}")]
    NumericalInstability {
        tensor: &'static str,
        epoch:  usize,
        batch:  usize,
    },

    /// A label occurs only once in a training batch, so it has no positive.
    #[error("malformed batch: label {label} occurs once, every label needs at least two samples")]
    MalformedBatch { label: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("invalid recall input: {0}")]
    RecallInput(String),

    /// Tensor contents could not be read back to the host.
    #[error("tensor data error: {0}")]
    TensorData(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}
