//! Error types for kubelan
//!
//! Kernel failures keep the underlying errno inside a [`std::io::Error`] so
//! callers can tell "already exists" and "not found" apart from real failures.

use std::io;
use thiserror::Error;

/// Errors that can occur in kubelan
#[derive(Debug, Error)]
pub enum KubelanError {
    /// A netlink request was rejected by the kernel or could not be sent
    #[error("Netlink {operation} failed: {source}")]
    Netlink {
        /// The operation that failed (e.g. "add link", "append fdb").
        operation: &'static str,
        /// The kernel error, carrying the errno when one was reported.
        #[source]
        source: io::Error,
    },

    /// A netlink reply could not be decoded
    #[error("Malformed netlink reply: {0}")]
    NetlinkDecode(String),

    /// Interface lookup failed after it should exist
    #[error("Interface '{0}' not found")]
    InterfaceNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The hook runner scope was cancelled
    #[error("Hook runner stopped")]
    HookRunnerStopped,

    /// Watch source failure
    #[error("Watch error: {0}")]
    Watch(String),

    /// Kubernetes client error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl KubelanError {
    /// Creates a netlink error from an operation name and kernel error.
    pub fn netlink(operation: &'static str, source: io::Error) -> Self {
        Self::Netlink { operation, source }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns the kernel errno carried by this error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Netlink { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// Returns true if the kernel reported that the object already exists.
    pub fn is_already_exists(&self) -> bool {
        self.errno() == Some(libc::EEXIST)
    }

    /// Returns true if the kernel reported that the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self.errno(), Some(libc::ENOENT) | Some(libc::ENODEV))
    }
}

/// Result type alias for kubelan operations
pub type Result<T> = std::result::Result<T, KubelanError>;
