//! Error types for defaultconf

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// An errno returned by the kernel in a netlink error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelError {
    /// Positive errno value (e.g. `libc::EEXIST`).
    pub code: i32,
}

impl KernelError {
    pub fn new(code: i32) -> Self {
        // netlink carries negated errno values
        Self { code: code.abs() }
    }

    /// Errors that only mean the kernel table diverged from our model: the
    /// route we tried to add is already there, or the one we tried to remove
    /// is already gone.
    pub fn is_transient(&self) -> bool {
        matches!(self.code, libc::EEXIST | libc::ESRCH | libc::ENOENT)
    }

    pub fn as_io(&self) -> std::io::Error {
        std::io::Error::from_raw_os_error(self.code)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (errno {})", self.as_io(), self.code)
    }
}

/// Errors that can occur in defaultconf
#[derive(Debug, Error)]
pub enum DefaultconfError {
    /// Netlink socket error (create, bind, send, receive, decode)
    #[error("Netlink error: {0}")]
    Netlink(String),

    /// The kernel rejected a request
    #[error("Kernel rejected {operation}: {error}")]
    Kernel {
        operation: &'static str,
        error: KernelError,
    },

    /// No reply arrived for a request within the configured timeout
    #[error("Timed out after {0:?} waiting for netlink reply")]
    Timeout(Duration),

    /// The notification reader stopped delivering events
    #[error("Netlink notification channel closed")]
    ChannelClosed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Registration rejected by the registration interface
    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    /// A handle no longer refers to a live registration
    #[error("Unknown registration: {0}")]
    UnknownRegistration(String),

    /// Registration store read/write/lock failure
    #[error("Registration store error: {0}")]
    Store(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (registration store) error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (configuration) error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl DefaultconfError {
    /// Returns the kernel errno if the kernel rejected a request.
    pub fn kernel_error(&self) -> Option<KernelError> {
        match self {
            DefaultconfError::Kernel { error, .. } => Some(*error),
            _ => None,
        }
    }

    /// Transport failures make the current channel unusable: it must be
    /// reopened and the state resynchronised, since events may have been lost.
    /// Local file errors (store, config, pid file) are not transport failures.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            DefaultconfError::Netlink(_) | DefaultconfError::Timeout(_) | DefaultconfError::ChannelClosed
        )
    }
}

/// Result type alias for defaultconf operations
pub type Result<T> = std::result::Result<T, DefaultconfError>;
