//! Error taxonomy for the capture pipeline.
//!
//! Every failure mode a capture action can hit is enumerated here. The
//! orchestrator converts each one into a user-facing notice at the point of
//! occurrence; none of these escape the pipeline as an uncaught fault.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// Camera or location access was refused by the platform.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The location provider produced no fix.
    #[error("location not available")]
    LocationUnavailable,

    /// The capture engine reported a sensor or hardware error.
    #[error("capture failed: {0}")]
    CaptureFailed(String),

    /// Reverse geocoding failed. Non-fatal: the annotator substitutes a
    /// placeholder instead of aborting the pipeline.
    #[error("reverse geocoding unavailable: {0}")]
    GeocodeUnavailable(String),

    /// The local metadata insert failed.
    #[error("local persist failed: {0}")]
    LocalPersistFailed(String),

    /// The remote object store rejected or never acknowledged the upload.
    #[error("remote upload failed: {0}")]
    RemoteUploadFailed(String),

    /// The finished image could not be staged as a plain file for upload.
    #[error("could not stage image for upload: {0}")]
    UriConversionFailed(String),
}

impl PipelineError {
    /// Map an I/O error from the capture adapter, distinguishing refused
    /// device access from other sensor failures.
    pub fn from_capture_io(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            PipelineError::PermissionDenied(err.to_string())
        } else {
            PipelineError::CaptureFailed(err.to_string())
        }
    }
}
