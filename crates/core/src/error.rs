//! Error types for the Reflector domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Provider failures are transient and recovered inside the loop; the
//! top-level [`Error`] is what escapes a run and gets folded into its outcome.

use thiserror::Error;

/// The top-level error type for all Reflector operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Run-level failures ---
    #[error("Run timed out after {timeout_secs}s")]
    RunTimedOut { timeout_secs: u64 },

    #[error("Run aborted by panic: {0}")]
    Panicked(String),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures signalled by a model backend.
///
/// `Clone` so scripted test providers can hand out the same failure repeatedly.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider returned an empty response")]
    EmptyResponse,
}
