//! Error kinds for the repository seam.
//!
//! Error disposition hinges on distinguishing transient connectivity
//! failures (the supervisor just treats the tick as empty and continues)
//! from permanent/schema errors (fatal, propagated to the caller).
//! `RepositoryError` carries that distinction explicitly rather than
//! relying on string matching or error downcasting.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Connectivity blip, timeout, or similar; safe to retry next tick.
    #[error("transient repository error: {0}")]
    Transient(#[source] anyhow::Error),

    /// Schema mismatch, constraint violation, or similar; not safe to
    /// retry. The caller should treat this as fatal.
    #[error("permanent repository error: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl RepositoryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Transient(_))
    }
}
