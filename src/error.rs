//! Error types for the docfields library.
//!
//! Three distinct error types reflect three distinct failure modes:
//!
//! * [`PipelineError`] — **Fatal setup**: the run cannot be configured at all
//!   (builder validation failed, HTTP provider without an endpoint). Returned
//!   as `Err` before any tier executes.
//!
//! * [`RunError`] — **Per-run taxonomy**: everything that can go wrong while
//!   tiers execute. Stored inside [`crate::model::ExtractionOutput::errors`]
//!   so the caller always receives a result, never an unexplained crash.
//!   Tier-2 entries are group-scoped and recovered; Tier-1/Tier-3 entries
//!   mark the run failed.
//!
//! * [`ProviderError`] — **Transport**: raised inside a
//!   [`crate::provider::ValidationProvider`] implementation and translated
//!   into `RunError` variants at the tier boundary. Carries a transient
//!   classification so the retry loop knows what is worth retrying.

use crate::fields::SemanticGroup;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal configuration/setup errors raised before a run starts.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The HTTP validation provider was requested without an endpoint.
    #[error(
        "Validation endpoint is not configured.\n\
         Set DOCFIELDS_ENDPOINT or pass an endpoint explicitly."
    )]
    EndpointNotConfigured,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Everything that can go wrong during a run, in the shape the caller sees.
///
/// Serialisable so it survives inside the stored `ExtractionOutput`.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunError {
    /// Tier-1 local extraction failed. Fatal to the run.
    #[error("Local extraction failed: {detail}")]
    Extraction { detail: String },

    /// A Tier-2 group call failed after all retries. The group keeps its
    /// Tier-1 values; the run continues.
    #[error("Validation call for group '{group}' failed after {retries} retries: {detail}")]
    ValidationCall {
        group: SemanticGroup,
        retries: u32,
        detail: String,
    },

    /// The validation service answered but the response could not be parsed.
    /// Scoped to one group; the run continues.
    #[error("Unusable validation response for group '{group}': {detail}")]
    ValidationParse {
        group: SemanticGroup,
        detail: String,
    },

    /// Tier-3 full re-extraction failed. Fatal — there is no further
    /// fallback.
    #[error("Full re-extraction failed: {detail}")]
    FullExtraction { detail: String },

    /// Cooperative cancellation observed at a tier boundary. The run ends
    /// with whatever the last completed tier produced.
    #[error("Run cancelled before {stage}")]
    Cancelled { stage: String },
}

impl RunError {
    /// Whether this error marks the whole run as failed (as opposed to a
    /// recovered, group-scoped degradation).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RunError::Extraction { .. } | RunError::FullExtraction { .. }
        )
    }
}

/// Transport-level failure inside a provider implementation.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Non-success HTTP status from the validation service.
    #[error("Validation service returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Connection/serialisation failure before a response arrived.
    #[error("Validation service request failed: {0}")]
    Transport(String),

    /// HTTP 429 — caller should back off before retrying.
    #[error("Rate limited by validation service")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The service answered 2xx but the body was not the expected shape.
    #[error("Malformed response from validation service: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Transient errors are worth retrying with backoff; permanent ones
    /// (4xx other than 429, malformed bodies) are not.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Transport(_) | ProviderError::RateLimited { .. } => true,
            ProviderError::Http { status, .. } => *status >= 500,
            ProviderError::Malformed(_) => false,
        }
    }
}

/// Failure of the persistence collaborator. Logged and recorded but never
/// allowed to fail the run itself.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to persist extraction result: {0}")]
    Write(String),
}
