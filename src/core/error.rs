//! Error types and taxonomy.
//!
//! Every kernel operation reports failures through [`KeelError`]. Each variant
//! belongs to one [`ErrorKind`], which is what callers branch on when deciding
//! whether to retry, re-acquire, or surface the failure.

use thiserror::Error;

/// Common keel error conditions.
#[derive(Debug, Clone, Error)]
pub enum KeelError {
    /// The store could not be reached or the call timed out.
    ///
    /// The remote mutation may or may not have been applied.
    #[error("connectivity: {message}")]
    Connectivity { message: String },

    /// The addressed node does not exist.
    #[error("node does not exist: {path}")]
    NodeAbsent { path: String },

    /// A node already exists at the path being created.
    #[error("node already exists: {path}")]
    NodeExists { path: String },

    /// The node still has children and cannot be deleted.
    #[error("node has children: {path}")]
    NotEmpty { path: String },

    /// Ephemeral nodes may not have children.
    #[error("ephemeral node cannot have children: {path}")]
    NoChildrenForEphemerals { path: String },

    /// An optimistic write lost against a concurrent writer.
    #[error("version conflict on {path}: expected {expected}, actual {actual}")]
    VersionConflict {
        path: String,
        expected: i32,
        actual: i32,
    },

    /// The store declared the client session invalid.
    #[error("session expired")]
    SessionExpired,

    /// Bytes could not be encoded or decoded.
    #[error("serialization failed: {message}")]
    Serialization { message: String },

    /// No codec is registered under the requested key.
    #[error("no codec registered under '{key}'")]
    CodecNotFound { key: String },

    /// The path is not a valid absolute path.
    #[error("invalid path: '{path}'")]
    InvalidPath { path: String },

    /// Invalid request.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// The kernel has not been started yet.
    #[error("kernel not started")]
    NotStarted,

    /// The kernel has been shut down.
    #[error("kernel shut down")]
    ShutDown,

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Error taxonomy used to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Store unreachable or timed out. Retryable by the caller.
    Connectivity,
    /// Expected absence of a node; re-arm the watch.
    NodeAbsent,
    /// Lost optimistic write. Never silently retried.
    VersionConflict,
    /// Fatal to every ephemeral-backed primitive held by the session.
    SessionExpired,
    /// Encoding or decoding failure.
    Serialization,
    /// Caller error: bad path, wrong lifecycle state, structural violation.
    Usage,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connectivity => write!(f, "CONNECTIVITY"),
            Self::NodeAbsent => write!(f, "NODE_ABSENT"),
            Self::VersionConflict => write!(f, "VERSION_CONFLICT"),
            Self::SessionExpired => write!(f, "SESSION_EXPIRED"),
            Self::Serialization => write!(f, "SERIALIZATION"),
            Self::Usage => write!(f, "USAGE"),
        }
    }
}

impl KeelError {
    /// Create a Connectivity error.
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity {
            message: message.into(),
        }
    }

    /// Create a NodeAbsent error.
    pub fn node_absent(path: impl Into<String>) -> Self {
        Self::NodeAbsent { path: path.into() }
    }

    /// Create a NodeExists error.
    pub fn node_exists(path: impl Into<String>) -> Self {
        Self::NodeExists { path: path.into() }
    }

    /// Create a Serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath { path: path.into() }
    }

    /// Create an InvalidRequest error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connectivity { .. } => ErrorKind::Connectivity,
            Self::NodeAbsent { .. } => ErrorKind::NodeAbsent,
            Self::VersionConflict { .. } => ErrorKind::VersionConflict,
            Self::SessionExpired => ErrorKind::SessionExpired,
            Self::Serialization { .. } | Self::CodecNotFound { .. } => ErrorKind::Serialization,
            Self::NodeExists { .. }
            | Self::NotEmpty { .. }
            | Self::NoChildrenForEphemerals { .. }
            | Self::InvalidPath { .. }
            | Self::InvalidRequest { .. }
            | Self::NotStarted
            | Self::ShutDown
            | Self::Internal { .. } => ErrorKind::Usage,
        }
    }

    /// Check if the caller may retry the operation.
    ///
    /// The kernel never retries on its own.
    pub fn is_retriable(&self) -> bool {
        self.kind() == ErrorKind::Connectivity
    }

    /// Check if this error invalidates every ephemeral-backed primitive.
    pub fn is_session_fatal(&self) -> bool {
        self.kind() == ErrorKind::SessionExpired
    }

    /// Check if this error reports a missing node.
    pub fn is_node_absent(&self) -> bool {
        matches!(self, Self::NodeAbsent { .. })
    }
}

/// Result type using KeelError.
pub type KeelResult<T> = Result<T, KeelError>;
