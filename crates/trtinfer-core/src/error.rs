use thiserror::Error;

/// Top-level error type for trtinfer.
///
/// Build and load failures abort session creation. The per-call variants
/// (`DimensionMismatch`, `CopySizeMismatch`, `InvalidBinding`) reject a single
/// call and leave the session usable.
#[derive(Debug, Error)]
pub enum InferError {
    #[error("CUDA error: {0}")]
    Cuda(String),

    #[error("TensorRT error: {0}")]
    TensorRt(String),

    #[error("failed to parse model {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("input '{input}' has unbound dimensions but no optimization profile was registered")]
    ProfileMissing { input: String },

    #[error("invalid optimization profile for '{input}': {reason}")]
    InvalidProfile { input: String, reason: String },

    #[error("engine compilation failed: {0}")]
    Compilation(String),

    #[error("serialized engine references an unregistered plugin: {0}")]
    PluginMissing(String),

    #[error("serialized engine is incompatible with this TensorRT build or GPU: {0}")]
    EngineIncompatible(String),

    #[error("device memory allocation failed: requested {requested} bytes")]
    OutOfDeviceMemory { requested: usize },

    #[error("dimensions {dims:?} for binding '{binding}' are outside [{min:?}, {max:?}]")]
    DimensionMismatch {
        binding: String,
        dims: Vec<i64>,
        min: Vec<i64>,
        max: Vec<i64>,
    },

    #[error("copy of {actual} bytes does not fit binding {index} ({capacity} bytes)")]
    CopySizeMismatch {
        index: usize,
        actual: usize,
        capacity: usize,
    },

    #[error("invalid binding: {0}")]
    InvalidBinding(String),

    #[error("calibration error: {0}")]
    Calibration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, InferError>;
