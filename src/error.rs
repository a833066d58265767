//! Error kinds for the engine: configuration errors are fatal before
//! dispatch, per-image errors are recorded and the pipeline continues,
//! worker errors trigger a respawn, and output errors are fatal.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("geometry has no panels")]
    EmptyGeometry,

    #[error("panel '{panel}' has a degenerate (zero-length) basis vector")]
    DegenerateBasis { panel: String },

    #[error("failed to parse geometry description: {0}")]
    GeometryParse(String),

    #[error("unparseable unit cell: {0}")]
    CellParse(String),

    #[error("invalid tolerance value: {0}")]
    InvalidTolerance(String),

    #[error("metadata key '{key}' required to resolve {what} was not present on this image")]
    MissingMetadataKey { what: String, key: String },

    #[error("no indexing backends configured")]
    NoBackends,
}

/// Reasons an image failed to load, recorded per-image rather than fatal.
#[derive(Debug, Error)]
pub enum ImageLoadError {
    #[error("image file not found after {retries} retries: {path}")]
    NotFound { path: String, retries: u32 },

    #[error("corrupt image payload: {0}")]
    CorruptPayload(String),
}

/// Reasons per-image processing failed, recorded in the resulting chunk.
#[derive(Debug, Error)]
pub enum ImageProcessError {
    #[error("peak search method '{method}' failed: {reason}")]
    PeakSearchFailed { method: String, reason: String },

    #[error("indexing backend '{backend}' timed out")]
    BackendTimeout { backend: String },

    #[error("integration infeasible for reflection ({h} {k} {l}): {reason}")]
    IntegrationInfeasible { h: i32, k: i32, l: i32, reason: String },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("image load error: {0}")]
    ImageLoad(#[from] ImageLoadError),

    #[error("image processing error: {0}")]
    ImageProcess(#[from] ImageProcessError),

    #[error("worker {worker} crashed or hung while processing serial {serial}")]
    WorkerFailed { worker: usize, serial: u64 },

    #[error("output sink write failed: {0}")]
    Output(String),

    #[error("panel '{panel}' access out of bounds at ({fs}, {ss})")]
    PanelOutOfBounds { panel: String, fs: usize, ss: usize },
}
