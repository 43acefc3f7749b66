//! Error types for playbench-core.

use thiserror::Error;

use crate::config::ConfigError;
use crate::store::StoreError;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for playbench-core.
///
/// Every variant is fatal to the unit of work that raised it (one version's
/// build, or one version's sample run). Build recovery happens through the
/// persisted stage state, not through retries: re-running the pipeline
/// re-enters at the last completed stage.
#[derive(Error, Debug)]
pub enum Error {
    /// Jail bootstrap (debootstrap or account provisioning) failed.
    #[error("environment creation failed: {0}")]
    EnvironmentCreation(String),

    /// An external command exited with a non-zero code.
    #[error("command execution failed: {0}")]
    CommandExecution(String),

    /// The source archive download failed.
    #[error("download failed: {0}")]
    Download(String),

    /// The monitored player exited with a non-zero code.
    #[error("playback failed: {0}")]
    Playback(String),

    /// Configuration errors
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Persistence store errors
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
