//! Domain-specific error types following panic-free policy.
//!
//! Nothing in this engine is fatal: decode anomalies recover with defaults,
//! backpressure resolves by dropping, and collaborator failures degrade to an
//! empty response stream. These types exist for the few seams that do report
//! errors (the analysis service, lookups by callers that care).

use crate::SessionKey;
use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone)]
pub enum DomainError {
    /// Session not found in a registry or monitor table.
    #[error("session not found: {key}")]
    SessionNotFound { key: SessionKey },

    /// The engine has been stopped and no longer accepts work.
    #[error("engine stopped")]
    Stopped,
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

/// Errors surfaced by the external analysis service.
///
/// These never propagate to the interactive session: a failing stream just
/// produces no further chunks for that job.
#[derive(Error, Debug, Clone)]
pub enum AnalysisError {
    /// The analysis backend is unreachable.
    #[error("analysis service unavailable: {0}")]
    Unavailable(String),

    /// The response stream failed mid-flight.
    #[error("analysis stream error: {0}")]
    Stream(String),
}
