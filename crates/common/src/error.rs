//! Common error types for the VIP controller components.

use std::fmt;

/// A specialized Result type for controller operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for controller operations.
///
/// Variants follow the failure categories the controller distinguishes when
/// deciding whether to retry locally, re-enqueue a pass, or exit.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Netlink error: {0}")]
    Netlink(String),

    /// The kernel rejected a request with an errno.
    #[error("Kernel rejected {op}: errno {errno}")]
    Kernel { op: String, errno: i32 },

    #[error("IPVS error: {0}")]
    IPVS(String),

    #[error("Keepalived error: {0}")]
    Keepalived(String),

    /// One or more kernel mutations failed during a synchronization pass.
    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Supervision error: {0}")]
    Supervision(String),

    #[error("Host precondition error: {0}")]
    Host(String),

    #[error("Kubernetes error: {0}")]
    Kube(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new netlink error.
    pub fn netlink(msg: impl fmt::Display) -> Self {
        Error::Netlink(msg.to_string())
    }

    /// Create a new kernel errno error for the named operation.
    pub fn kernel(op: impl fmt::Display, errno: i32) -> Self {
        Error::Kernel {
            op: op.to_string(),
            errno: errno.abs(),
        }
    }

    /// Create a new IPVS error.
    pub fn ipvs(msg: impl fmt::Display) -> Self {
        Error::IPVS(msg.to_string())
    }

    /// Create a new keepalived error.
    pub fn keepalived(msg: impl fmt::Display) -> Self {
        Error::Keepalived(msg.to_string())
    }

    /// Create a new sync error.
    pub fn sync(msg: impl fmt::Display) -> Self {
        Error::Sync(msg.to_string())
    }

    /// Create a new supervision error.
    pub fn supervision(msg: impl fmt::Display) -> Self {
        Error::Supervision(msg.to_string())
    }

    /// Create a new host precondition error.
    pub fn host(msg: impl fmt::Display) -> Self {
        Error::Host(msg.to_string())
    }

    /// Create a new Kubernetes error.
    pub fn kube(msg: impl fmt::Display) -> Self {
        Error::Kube(msg.to_string())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new other error.
    pub fn other(msg: impl fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }

    /// Returns the kernel errno carried by this error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Kernel { errno, .. } => Some(*errno),
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// Whether this error is fatal to the process rather than to one pass.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Host(_) | Error::Supervision(_))
    }
}
