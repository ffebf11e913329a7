//! Error types for the AI crate.
//!
//! Messages may carry provider text; callers that surface failures to an
//! organization normalize them first.

use std::fmt;

/// Errors from LLM backend operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// The provider could not be reached or answered with a server error.
    ProviderUnavailable { provider: String, reason: String },
    /// The provider refused the request (bad prompt, unknown model, auth).
    Rejected { reason: String },
    /// The provider answered with something that is not a completion.
    MalformedResponse { reason: String },
    /// No response within the call timeout.
    Timeout,
    /// The provider throttled the caller.
    RateLimited { retry_after_secs: Option<u64> },
    /// The backend is missing or misconfigured.
    InvalidConfig { reason: String },
}

impl LlmError {
    /// Returns true if another attempt could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable { .. }
                | Self::MalformedResponse { .. }
                | Self::Timeout
                | Self::RateLimited { .. }
        )
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderUnavailable { provider, reason } => {
                write!(f, "{provider} unavailable: {reason}")
            }
            Self::Rejected { reason } => write!(f, "generation rejected: {reason}"),
            Self::MalformedResponse { reason } => write!(f, "unusable completion: {reason}"),
            Self::Timeout => f.write_str("generation timed out"),
            Self::RateLimited {
                retry_after_secs: Some(secs),
            } => write!(f, "rate limited, retry after {secs}s"),
            Self::RateLimited {
                retry_after_secs: None,
            } => f.write_str("rate limited"),
            Self::InvalidConfig { reason } => write!(f, "LLM backend misconfigured: {reason}"),
        }
    }
}

impl std::error::Error for LlmError {}
