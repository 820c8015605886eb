//! Error types for the engine.
//!
//! Per-tile inference failures are not represented here; they are logged
//! and the affected tile is skipped. Everything below invalidates either an
//! `init` or a whole `process`/shader-chain request.

use std::path::PathBuf;

use thiserror::Error;

/// Host-facing status code for a successful call.
pub const STATUS_OK: i32 = 0;
/// Host-facing status code for any failure.
pub const STATUS_FAILURE: i32 = -1;

/// Model resolution error.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// One of the weight files does not exist on disk.
    #[error("model files not found: {param} / {bin}")]
    ModelNotFound { param: PathBuf, bin: PathBuf },

    /// The requested scale is not provided by this model family.
    #[error("scale {scale} is not supported by {family} (supported: {supported:?})")]
    UnsupportedScale {
        family: &'static str,
        scale: u32,
        supported: &'static [u32],
    },
}

/// Error reported by an inference backend implementation.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to load weights from {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    /// The backend could not run a forward pass or a resize.
    #[error("inference failed: {0}")]
    Inference(String),

    /// GPU instance or device creation failed.
    #[error("backend is unavailable: {0}")]
    Unavailable(String),
}

/// Failure of `Engine::init`.
#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("failed to load model")]
    ModelLoad(#[source] BackendError),

    #[error("backend failure")]
    Backend(#[from] BackendError),
}

/// Failure of `Engine::process`.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// No model is loaded; the host should hand back the original image.
    #[error("no model is initialized")]
    NotInitialized,

    /// The input is not packed RGBA8.
    #[error("unsupported pixel format")]
    UnsupportedPixelFormat,

    /// Input or output buffer geometry does not match the declared dimensions.
    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),

    /// The abort flag was observed during the tile loop.
    #[error("request aborted")]
    Aborted,

    /// A backend error other than a skippable per-tile failure.
    #[error("inference backend failed")]
    Backend(#[from] BackendError),
}

/// Failure of the shader-chain post-processor.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("no shader chain is initialized")]
    NotInitialized,

    #[error("no suitable GPU adapter is available")]
    NoAdapter,

    #[error("gpu error: {0}")]
    Gpu(String),

    #[error("shader pass {name:?} failed to compile: {reason}")]
    Compile { name: String, reason: String },

    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),
}

/// Collapses a call result into the host status-code contract.
pub fn status_code<T, E>(result: &Result<T, E>) -> i32 {
    if result.is_ok() {
        STATUS_OK
    } else {
        STATUS_FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_mapping() {
        let ok: Result<(), ProcessError> = Ok(());
        let err: Result<(), ProcessError> = Err(ProcessError::NotInitialized);
        assert_eq!(status_code(&ok), STATUS_OK);
        assert_eq!(status_code(&err), STATUS_FAILURE);
    }

    #[test]
    fn errors_format_without_panicking() {
        let e = CatalogError::ModelNotFound {
            param: PathBuf::from("a.param"),
            bin: PathBuf::from("a.bin"),
        };
        assert!(e.to_string().contains("a.param"));

        let e = ProcessError::Backend(BackendError::Inference("extract failed".into()));
        assert!(!e.to_string().is_empty());
    }
}
