use std::time::Duration;

/// Shared error type used across all agentgate crates.
///
/// Variants map one-to-one onto the runtime's error taxonomy: the HTTP layer
/// turns each kind into a status code, the scheduler consults
/// [`Error::is_retriable`], and the turn engine renders
/// [`Error::user_message`] when a failure must be surfaced to the end user.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Absent resources and cross-tenant access are indistinguishable.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        /// Upstream `Retry-After`, when the provider sent one.
        retry_after: Option<Duration>,
    },

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("tool denied: {0}")]
    ToolDenied(String),

    #[error("tool timeout: {0}")]
    ToolTimeout(String),

    #[error("tool runtime error: {message}")]
    ToolRuntime { message: String, retriable: bool },

    #[error("tool loop limit reached after {0} hops")]
    ToolLoopLimit(u32),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable kind, used in logs and `conversation.error`
    /// payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Unauthorized(_) => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::NotFound(_) => "not_found",
            Error::Busy(_) => "busy",
            Error::RateLimited { .. } => "rate_limited",
            Error::UpstreamUnavailable(_) => "upstream_unavailable",
            Error::InvalidArguments(_) => "invalid_arguments",
            Error::Provider { .. } => "provider",
            Error::ToolDenied(_) => "tool_denied",
            Error::ToolTimeout(_) => "tool_timeout",
            Error::ToolRuntime { .. } => "tool_runtime",
            Error::ToolLoopLimit(_) => "tool_loop_limit",
            Error::Cancelled(_) => "cancelled",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Config(_) => "config",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether the scheduler may retry the work item that failed with this
    /// error. Retries are bounded and backed off; everything else terminates
    /// the turn on first occurrence.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::RateLimited { .. } | Error::UpstreamUnavailable(_) => true,
            Error::ToolRuntime { retriable, .. } => *retriable,
            _ => false,
        }
    }

    /// Short human-readable text shown to the end user in place of an
    /// assistant reply. Never includes internals or stack traces.
    pub fn user_message(&self) -> String {
        match self {
            Error::RateLimited { .. } => {
                "The model is receiving too many requests right now. Please try again shortly."
                    .into()
            }
            Error::UpstreamUnavailable(_) => {
                "The model service is temporarily unavailable. Please try again shortly.".into()
            }
            Error::Provider { .. } => {
                "The model request was refused. Check the provider configuration.".into()
            }
            Error::ToolLoopLimit(_) => {
                "The assistant invoked too many tools in one turn and was stopped.".into()
            }
            Error::ToolTimeout(name) => format!("The tool `{name}` timed out."),
            Error::Busy(_) => "The session is busy. Please wait for the current reply.".into(),
            Error::Cancelled(_) => "The request was cancelled.".into(),
            _ => "Something went wrong while answering. Please try again.".into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_kinds() {
        assert!(Error::RateLimited {
            message: "429".into(),
            retry_after: None
        }
        .is_retriable());
        assert!(Error::UpstreamUnavailable("503".into()).is_retriable());
        assert!(Error::ToolRuntime {
            message: "flaky".into(),
            retriable: true
        }
        .is_retriable());
        assert!(!Error::NotFound("s1".into()).is_retriable());
        assert!(!Error::ToolDenied("shell.exec".into()).is_retriable());
        assert!(!Error::Cancelled("shutdown".into()).is_retriable());
    }

    #[test]
    fn user_messages_contain_no_internals() {
        let err = Error::UpstreamUnavailable("connect ECONNREFUSED 10.0.0.3:443".into());
        assert!(!err.user_message().contains("ECONNREFUSED"));
    }

    #[test]
    fn kind_is_stable() {
        assert_eq!(Error::ToolLoopLimit(6).kind(), "tool_loop_limit");
        assert_eq!(Error::NotFound("x".into()).kind(), "not_found");
    }
}
