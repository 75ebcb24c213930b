//! Error types for skerry-core.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for skerry-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur during sandbox operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Error from skerry-vm
    #[error("VM error: {0}")]
    Vm(#[from] skerry_vm::VmError),

    /// Bad identity, slot index, address range or configuration value
    #[error("invalid input: {0}")]
    Validation(String),

    /// No free network slot (or other bounded host resource)
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Sandbox id already registered
    #[error("sandbox already exists: {0}")]
    AlreadyExists(String),

    /// Sandbox (or orphan process) not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Orphan discovery matched more than one process
    #[error("{count} processes match sandbox {sandbox_id}, refusing to guess")]
    Ambiguous {
        /// Sandbox id that was searched for
        sandbox_id: String,
        /// Number of matching processes
        count: usize,
    },

    /// One or more independent cleanup steps failed
    #[error("partial failure: {0}")]
    PartialFailure(Failures),

    /// Host command exited unsuccessfully
    #[error("`{command}` failed ({status}): {stderr}")]
    Command {
        /// Rendered command line
        command: String,
        /// Exit status description
        status: String,
        /// Trimmed standard error
        stderr: String,
    },

    /// I/O error on a specific path
    #[error("{op} {}: {source}", path.display())]
    Path {
        /// What was being done
        op: &'static str,
        /// Path involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Operation exceeded its deadline
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Caller went away before the operation finished
    #[error("operation cancelled")]
    Cancelled,

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Wrap an I/O error with the operation and path it came from.
    pub fn path(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Path {
            op,
            path: path.into(),
            source,
        }
    }

    /// True when the error only says "this was already gone".
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Path { source, .. } | Self::Io(source) => {
                source.kind() == std::io::ErrorKind::NotFound
            }
            _ => false,
        }
    }
}

/// The joined causes of a [`CoreError::PartialFailure`].
#[derive(Debug, Default)]
pub struct Failures(pub Vec<CoreError>);

impl Failures {
    /// Number of failed steps.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when nothing failed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the individual causes.
    pub fn iter(&self) -> impl Iterator<Item = &CoreError> {
        self.0.iter()
    }
}

impl fmt::Display for Failures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}
