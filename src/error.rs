use std::time::Duration;

use thiserror::Error;

/// Errors raised while crawling, indexing or querying documentation.
///
/// Every message names the tool or operation it concerns so it can be shown
/// to an MCP client verbatim.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DocsError {
    /// Upstream could not be reached after the provider's retries.
    #[error("{tool}: source unavailable: {reason}")]
    SourceUnavailable { tool: String, reason: String },

    /// Upstream throttled us; back off before trying again.
    #[error("{tool}: rate limited, retry after {}s", .retry_after.as_secs())]
    RateLimited { tool: String, retry_after: Duration },

    /// The requested location or document does not exist.
    #[error("{tool}: not found: {target}")]
    NotFound { tool: String, target: String },

    /// Fetched content could not be turned into a document.
    #[error("{tool}: malformed content at {location}: {reason}")]
    MalformedContent {
        tool: String,
        location: String,
        reason: String,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A capability the provider declares but does not implement yet.
    #[error("{tool}: {capability} is not implemented for this provider")]
    NotImplementedCapability { tool: String, capability: String },

    /// The document store could not be read or written.
    #[error("document store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The operation was cancelled before it could finish.
    #[error("{0}: cancelled")]
    Cancelled(String),
}

impl DocsError {
    pub fn source_unavailable(tool: &str, reason: impl ToString) -> Self {
        Self::SourceUnavailable {
            tool: tool.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn not_found(tool: &str, target: impl ToString) -> Self {
        Self::NotFound {
            tool: tool.to_string(),
            target: target.to_string(),
        }
    }

    pub fn malformed(tool: &str, location: &str, reason: impl ToString) -> Self {
        Self::MalformedContent {
            tool: tool.to_string(),
            location: location.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn not_implemented(tool: &str, capability: &str) -> Self {
        Self::NotImplementedCapability {
            tool: tool.to_string(),
            capability: capability.to_string(),
        }
    }

    /// Transient errors may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable { .. } | Self::RateLimited { .. }
        )
    }

    /// The tool an error concerns, when it concerns one.
    pub fn tool(&self) -> Option<&str> {
        match self {
            Self::SourceUnavailable { tool, .. }
            | Self::RateLimited { tool, .. }
            | Self::NotFound { tool, .. }
            | Self::MalformedContent { tool, .. }
            | Self::NotImplementedCapability { tool, .. } => Some(tool),
            Self::InvalidArgument(_) | Self::Store(_) | Self::Config(_) | Self::Cancelled(_) => None,
        }
    }
}

impl From<std::io::Error> for DocsError {
    fn from(err: std::io::Error) -> Self {
        Self::Store(err.to_string())
    }
}

pub type Result<T, E = DocsError> = std::result::Result<T, E>;
