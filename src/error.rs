use thiserror::Error;

/// The error type for transferio operations.
///
/// Errors returned from engine calls carry the name of the engine operation
/// that failed. Errors delivered to completion callbacks are either
/// [`Error::Transfer`] (the engine finished the transfer with a non-zero
/// result code) or [`Error::Aborted`] (the transfer was cancelled).
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // Reactor and Socket Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ============================================================================
    // Engine Errors
    // ============================================================================

    /// A call into the transfer engine returned a non-success result.
    #[error("Transfer engine call '{op}' failed: {source}")]
    Engine {
        /// The engine operation that failed (`add`, `remove`, `assign`, ...).
        op: &'static str,
        /// The result reported by the engine.
        source: EngineError,
    },

    /// The engine finished a transfer with a non-zero result code.
    #[error("Transfer failed: {0}")]
    Transfer(EngineError),

    // ============================================================================
    // Lifecycle Errors
    // ============================================================================

    /// The operation was cancelled before it completed.
    ///
    /// Delivered to completion callbacks of cancelled transfers, including
    /// transfers that were still registered when their handle or coordinator
    /// was dropped.
    #[error("Operation aborted")]
    Aborted,

    /// A transfer handle was used in a mode it is not configured for.
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Returns true if this error signals cancellation rather than a failure.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted)
    }

    /// Returns the engine result code, if this error originated in the engine.
    pub fn engine_code(&self) -> Option<i32> {
        match self {
            Error::Engine { source, .. } | Error::Transfer(source) => Some(source.code),
            _ => None,
        }
    }
}

/// A non-success result code reported by the transfer engine.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[error("engine result code {code}")]
pub struct EngineError {
    /// The raw engine result code. Never zero.
    pub code: i32,
}

impl EngineError {
    /// Wraps a raw engine result code.
    pub fn new(code: i32) -> Self {
        Self { code }
    }

    /// Converts a raw result code into a `Result`, treating zero as success.
    pub fn check(code: i32) -> Result<(), EngineError> {
        if code == 0 {
            Ok(())
        } else {
            Err(Self { code })
        }
    }
}
