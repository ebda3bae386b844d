//! Error types for the live journey engine.

use thiserror::Error;

/// A wait ended because its source went away (clock stopped, observable
/// dropped, task torn down) rather than because its condition was met.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cancelled")]
pub struct Cancelled;

/// Errors produced by the live journey engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("API error: {0}")]
    Api(#[from] journey_api::Error),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl Error {
    /// Whether the failed operation may succeed if retried unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Api(err) => err.is_transient(),
            Error::Protocol(_) | Error::Invariant(_) | Error::Cancelled(_) => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
