#![forbid(unsafe_code)]
//! Error types for the Kiln engine.
//!
//! Defines `KilnError` and a `Result<T>` alias used throughout the
//! workspace. Fatal kinds indicate caller bugs or on-disk corruption and
//! must be propagated to a process-level abort path rather than retried.

use thiserror::Error;

/// Unified error type for all Kiln operations.
#[derive(Debug, Error)]
pub enum KilnError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A collaborator module was not initialized (or already torn down)
    /// in the required order.
    #[error("dependent module not ready: {0}")]
    DependencyNotReady(&'static str),

    /// The page pool has no free pages. Recoverable backpressure, not a bug.
    #[error("no free pages left in the page pool")]
    NoFreePages,

    /// A release would overfill the free list; a double-free is the only
    /// way to get here. The pool is desynced and cannot recover.
    #[error("page released into a full free-list; duplicate release suspected")]
    DuplicatePage,

    /// An engine invariant was violated.
    #[error("inconsistent engine state: {0}")]
    Inconsistent(String),

    /// Cooperative stop observed during a snapshot run. Early termination,
    /// not corruption.
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("snapshot metadata error: {0}")]
    Metadata(String),
}

impl KilnError {
    /// Whether this error indicates unrecoverable corruption.
    ///
    /// Fatal errors must reach a process-level coerce-and-abort; continuing
    /// past them risks silently corrupting on-disk state.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DuplicatePage | Self::Inconsistent(_))
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result alias used across the workspace.
pub type Result<T, E = KilnError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_classification() {
        assert!(KilnError::DuplicatePage.is_fatal());
        assert!(KilnError::Inconsistent("bad".to_owned()).is_fatal());
        assert!(!KilnError::NoFreePages.is_fatal());
        assert!(!KilnError::Cancelled.is_fatal());
        assert!(KilnError::Cancelled.is_cancelled());
    }
}
