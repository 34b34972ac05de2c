//! Central error types for glpip.
//!
//! Only the cold paths (context bootstrap, resource creation) surface typed
//! errors. Per-frame failures degrade to pass-through behaviour at the call
//! site and are reported as `Option`/bool returns, never as panics.

use thiserror::Error;

/// Main error type for glpip operations.
#[derive(Error, Debug)]
pub enum GlPipError {
    /// Creating a worker GL context failed
    #[error("Context creation failed: {0}")]
    ContextCreation(String),

    /// A worker context was created but object sharing with the host could
    /// not be verified
    #[error("Share verification failed: {0}")]
    ShareVerification(String),

    /// Offscreen drawable/surface creation failed
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Texture or framebuffer creation failed
    #[error("Render target creation failed: {0}")]
    RenderTarget(String),

    /// Referenced mode id is not present in the live configuration snapshot
    #[error("Unknown mode: {0}")]
    UnknownMode(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl From<String> for GlPipError {
    fn from(msg: String) -> Self {
        GlPipError::Other(msg)
    }
}

impl From<&str> for GlPipError {
    fn from(msg: &str) -> Self {
        GlPipError::Other(msg.to_string())
    }
}

/// Type alias for Results using GlPipError.
pub type GlPipResult<T> = Result<T, GlPipError>;
