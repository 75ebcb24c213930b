//! Error types for skerry-vm.

use thiserror::Error;

/// Result type alias for skerry-vm operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors that can occur while launching or controlling a hypervisor process.
#[derive(Debug, Error)]
pub enum VmError {
    /// The launcher process could not be spawned
    #[error("failed to spawn hypervisor: {0}")]
    Spawn(String),

    /// The Firecracker API rejected a request or was unreachable
    #[error("hypervisor API error: {0}")]
    Api(String),

    /// Process is not in expected state
    #[error("invalid VM state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Signal delivery failed
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::Error,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout waiting for operation
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}
