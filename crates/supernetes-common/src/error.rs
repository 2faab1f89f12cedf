//! Error types shared by the Supernetes controller and agent
//!
//! Errors carry contextual fields to aid debugging in production. Each layer
//! wraps a failure with a one-line message while preserving the cause.

use thiserror::Error;

/// Main error type for Supernetes operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// RPC error returned by the other side of the tunnel
    #[error("rpc error: {source}")]
    Rpc {
        /// The gRPC status
        #[from]
        source: tonic::Status,
    },

    /// gRPC transport error
    #[error("transport error: {source}")]
    Transport {
        /// The underlying tonic transport error
        #[from]
        source: tonic::transport::Error,
    },

    /// I/O error
    #[error("i/o error: {source}")]
    Io {
        /// The underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Validation error, not retryable
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// Configuration error, fatal at startup
    #[error("configuration error: {message}")]
    Config {
        /// Description of what failed
        message: String,
    },

    /// HPC scheduler interaction error
    #[error("scheduler error [{command}]: {message}")]
    Scheduler {
        /// The scheduler utility that failed (e.g. "sbatch")
        command: String,
        /// Description of what failed
        message: String,
    },

    /// TLS setup error
    #[error("tls error: {message}")]
    Tls {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Requested object is not known
    #[error("not found: {what}")]
    NotFound {
        /// Identity of the missing object
        what: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "endpoint", "instance")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a scheduler error for the given utility
    pub fn scheduler(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Scheduler {
            command: command.into(),
            message: msg.into(),
        }
    }

    /// Create a TLS error with the given message
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a not-found error for the given object identity
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error stems from cooperative cancellation.
    ///
    /// Cancellation surfaces either as a local I/O interruption or as the
    /// gRPC `CANCELLED` status relayed by the peer. The two cases are not
    /// distinguishable in general, so this check is only meant for callers
    /// that treat both the same way: silently stopping their work.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Error::Rpc { source } => source.code() == tonic::Code::Cancelled,
            Error::Io { source } => source.kind() == std::io::ErrorKind::Interrupted,
            _ => false,
        }
    }
}
