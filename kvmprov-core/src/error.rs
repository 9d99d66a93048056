//! Error types for kvmprov.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for kvmprov operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Coarse classification of a failure, independent of which component raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Instance, domain, catalog entry or file is absent.
    NotFound,
    /// Missing prerequisite file, malformed spec or bad configuration.
    InvalidInput,
    /// The disk image utility exited non-zero.
    ExternalTool,
    /// The hypervisor rejected a description or could not be reached.
    Hypervisor,
    /// One resource's step succeeded and another's failed after the point of no return.
    PartialFailure,
    /// Persistence layer failure.
    Database,
    /// Serialization, image writing or I/O failure.
    Internal,
}

/// Main error type for kvmprov.
#[derive(Error, Debug)]
pub enum ProvisionError {
    // Lookup errors
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    // Disk image utility errors
    #[error("{tool} exited with status {status}: {stderr}")]
    ExternalTool { tool: String, status: i32, stderr: String },

    // Hypervisor errors
    #[error("Hypervisor rejected {operation}: {reason}")]
    HypervisorRejected { operation: String, reason: String },

    #[error("Failed to connect to hypervisor at {uri}: {reason}")]
    HypervisorConnection { uri: String, reason: String },

    // Orchestration errors
    #[error("Instance {instance_id} partially processed: {reason}")]
    PartialFailure { instance_id: String, reason: String },

    #[error("Step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: Box<ProvisionError>,
    },

    // Cloud-init image errors
    #[error("Failed to serialize {document}: {reason}")]
    Serialization { document: &'static str, reason: String },

    #[error("Failed to write ISO image: {reason}")]
    IsoWrite { reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Database errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database migration failed: {reason}")]
    MigrationFailed { reason: String },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProvisionError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound { kind, id: id.to_string() }
    }

    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput { reason: reason.into() }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Wrap `source` as the failure of the named saga step.
    pub fn step(step: impl Into<String>, source: ProvisionError) -> Self {
        Self::StepFailed { step: step.into(), source: Box::new(source) }
    }

    /// Classify this error, looking through step wrappers to the root cause.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidInput { .. } | Self::InvalidConfig { .. } => ErrorKind::InvalidInput,
            Self::ExternalTool { .. } => ErrorKind::ExternalTool,
            Self::HypervisorRejected { .. } | Self::HypervisorConnection { .. } => {
                ErrorKind::Hypervisor
            }
            Self::PartialFailure { .. } => ErrorKind::PartialFailure,
            Self::StepFailed { source, .. } => source.kind(),
            Self::Database(_) | Self::MigrationFailed { .. } => ErrorKind::Database,
            Self::Serialization { .. }
            | Self::IsoWrite { .. }
            | Self::Io { .. }
            | Self::Internal(_)
            | Self::Other(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Name of the saga step that failed, if this error came out of a saga.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            Self::StepFailed { step, .. } => Some(step),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for ProvisionError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}
