//! Caller-facing error taxonomy for dispatch and execution.
//!
//! Every failure the engine reports falls into one of two categories:
//!
//! - **Client-class**: the requester supplied something wrong, such as a
//!   malformed payload or an unknown handler name. The `Display` output is
//!   safe to relay to the original requester verbatim.
//! - **System-class**: the engine or a handler broke. The `Display` output is
//!   a fixed opaque message; the underlying cause is available to operators
//!   through [`Error::detail`] and `Debug` formatting, never through
//!   `Display`.
//!
//! Terminal conditions the engine itself produces (unknown handler, deadline
//! expiry, draining registry, rejected stream) are dedicated variants so
//! callers can match on them directly. Client-class errors may wrap one of
//! those variants as their cause; the `is_*` helpers see through that
//! wrapping.

/// Convenience alias for results produced by the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse category of an [`Error`], deciding whether its `Display` output
/// may be relayed to the original requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The requester's fault; the message is safe to relay.
    Client,
    /// The engine's or a handler's fault; only the opaque message escapes.
    System,
}

/// Errors produced by handler construction, dispatch, and execution.
///
/// This enum covers the full failure surface of the engine: invalid
/// requester input, internal execution faults, and the terminal conditions
/// the registry itself raises. It uses `#[non_exhaustive]` to allow adding
/// new variants without breaking existing code.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The requester supplied invalid input.
    ///
    /// `reason` is written for the requester and appears in `Display`.
    /// `retryable` hints that the same request may succeed if resubmitted
    /// (for example after a transient downstream hiccup surfaced during
    /// validation). `cause` optionally carries the underlying variant, such
    /// as [`Error::ValidationFailed`].
    #[error("invalid handler input: {reason}")]
    Client {
        /// Requester-facing description of what was wrong.
        reason: String,
        /// Whether resubmitting the identical request may succeed.
        retryable: bool,
        /// Underlying condition, if one applies.
        cause: Option<Box<Error>>,
    },

    /// Execution failed for reasons internal to the engine or the handler.
    ///
    /// `Display` is intentionally fixed; `detail` holds the rendered cause
    /// chain for operators and logs.
    #[error("internal system error during handler execution")]
    System {
        /// Rendered cause chain; never shown to the requester.
        detail: String,
    },

    /// No handler is registered under the requested name.
    #[error("handler not found: {name}")]
    NotFound {
        /// The name the requester asked for.
        name: String,
    },

    /// The call exceeded its effective deadline.
    #[error("handler execution timed out")]
    Timeout,

    /// Business-rule validation rejected an input that was structurally
    /// sound. Usually wrapped inside [`Error::Client`].
    #[error("input validation failed")]
    ValidationFailed,

    /// The registry is draining and no longer admits calls.
    #[error("registry is shutting down")]
    ShuttingDown,

    /// The sink refused a fragment, aborting the stream.
    ///
    /// `detail` is the sink's own rejection text, which originates with the
    /// caller and is safe to show.
    #[error("execution aborted by sink: {detail}")]
    StreamAborted {
        /// The sink's rejection text.
        detail: String,
    },
}

impl Error {
    /// Builds a client-class error with the given requester-facing reason.
    pub fn client(reason: impl Into<String>) -> Self {
        Self::Client {
            reason: reason.into(),
            retryable: false,
            cause: None,
        }
    }

    /// Builds a client-class error the requester is encouraged to retry.
    pub fn client_retryable(reason: impl Into<String>) -> Self {
        Self::Client {
            reason: reason.into(),
            retryable: true,
            cause: None,
        }
    }

    /// Builds a system-class error from an arbitrary cause.
    ///
    /// The cause chain is rendered into [`Error::detail`]; `Display` stays
    /// opaque.
    pub fn system(cause: impl Into<anyhow::Error>) -> Self {
        let cause = cause.into();
        Self::System {
            detail: format!("{cause:#}"),
        }
    }

    /// Builds a client-class error for a business-rule rejection, wrapping
    /// [`Error::ValidationFailed`] as its cause.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Client {
            reason: reason.into(),
            retryable: false,
            cause: Some(Box::new(Self::ValidationFailed)),
        }
    }

    /// Returns the category this error belongs to.
    ///
    /// Every variant is covered: requester-fault conditions (including the
    /// not-found and validation-failed terminals) are [`ErrorClass::Client`];
    /// everything else is [`ErrorClass::System`].
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Client { .. } | Self::NotFound { .. } | Self::ValidationFailed => {
                ErrorClass::Client
            }
            Self::System { .. }
            | Self::Timeout
            | Self::ShuttingDown
            | Self::StreamAborted { .. } => ErrorClass::System,
        }
    }

    /// Whether this error is the requester's fault.
    #[must_use]
    pub fn is_client(&self) -> bool {
        self.class() == ErrorClass::Client
    }

    /// Whether this error is internal to the engine or handler.
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.class() == ErrorClass::System
    }

    /// Whether the requester is encouraged to resubmit the same request.
    ///
    /// Only client-class errors carry the hint; everything else is `false`.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Client { retryable: true, .. })
    }

    /// Whether this error is, or wraps, a business-rule validation failure.
    #[must_use]
    pub fn is_validation_failed(&self) -> bool {
        match self {
            Self::ValidationFailed => true,
            Self::Client {
                cause: Some(cause), ..
            } => cause.is_validation_failed(),
            _ => false,
        }
    }

    /// Whether this error is, or wraps, a sink-aborted stream.
    #[must_use]
    pub fn is_stream_aborted(&self) -> bool {
        match self {
            Self::StreamAborted { .. } => true,
            Self::Client {
                cause: Some(cause), ..
            } => cause.is_stream_aborted(),
            _ => false,
        }
    }

    /// Operator-facing detail for system-class failures, if any.
    #[must_use]
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::System { detail } | Self::StreamAborted { detail } => Some(detail),
            _ => None,
        }
    }

    /// The wrapped underlying error of a client-class failure, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&Error> {
        match self {
            Self::Client {
                cause: Some(cause), ..
            } => Some(cause),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        assert_eq!(
            Error::client("missing field `x`").to_string(),
            "invalid handler input: missing field `x`"
        );
        assert_eq!(
            Error::system(anyhow::anyhow!("connection reset")).to_string(),
            "internal system error during handler execution"
        );
        assert_eq!(
            Error::NotFound {
                name: "echo".to_string()
            }
            .to_string(),
            "handler not found: echo"
        );
        assert_eq!(Error::Timeout.to_string(), "handler execution timed out");
        assert_eq!(
            Error::ValidationFailed.to_string(),
            "input validation failed"
        );
        assert_eq!(
            Error::ShuttingDown.to_string(),
            "registry is shutting down"
        );
        assert_eq!(
            Error::StreamAborted {
                detail: "receiver closed".to_string()
            }
            .to_string(),
            "execution aborted by sink: receiver closed"
        );
    }

    #[test]
    fn test_system_display_is_opaque() {
        let err = Error::system(anyhow::anyhow!("credentials for db-prod rejected"));
        assert_eq!(
            err.to_string(),
            "internal system error during handler execution"
        );
        assert!(err.detail().unwrap().contains("db-prod"));
    }

    #[test]
    fn test_system_detail_renders_cause_chain() {
        let root = anyhow::anyhow!("socket closed");
        let err = Error::system(root.context("flushing results"));
        let detail = err.detail().unwrap();
        assert!(detail.contains("flushing results"));
        assert!(detail.contains("socket closed"));
    }

    #[test]
    fn test_classification_covers_every_variant() {
        assert_eq!(Error::client("bad").class(), ErrorClass::Client);
        assert_eq!(
            Error::NotFound {
                name: "x".to_string()
            }
            .class(),
            ErrorClass::Client
        );
        assert_eq!(Error::ValidationFailed.class(), ErrorClass::Client);
        assert_eq!(
            Error::system(anyhow::anyhow!("boom")).class(),
            ErrorClass::System
        );
        assert_eq!(Error::Timeout.class(), ErrorClass::System);
        assert_eq!(Error::ShuttingDown.class(), ErrorClass::System);
        assert_eq!(
            Error::StreamAborted {
                detail: String::new()
            }
            .class(),
            ErrorClass::System
        );

        assert!(Error::client("bad").is_client());
        assert!(!Error::client("bad").is_system());
        assert!(Error::Timeout.is_system());
    }

    #[test]
    fn test_validation_wraps_sentinel() {
        let err = Error::validation("age must be positive");
        assert!(err.is_client());
        assert!(err.is_validation_failed());
        assert_eq!(
            err.to_string(),
            "invalid handler input: age must be positive"
        );
        assert!(matches!(err.cause(), Some(Error::ValidationFailed)));
    }

    #[test]
    fn test_retryable_is_false_outside_client_errors() {
        assert!(Error::client_retryable("upstream busy").retryable());
        assert!(!Error::client("bad").retryable());
        assert!(!Error::Timeout.retryable());
        assert!(!Error::system(anyhow::anyhow!("boom")).retryable());
    }

    #[test]
    fn test_identity_checks_see_through_wrapping() {
        let wrapped = Error::Client {
            reason: "stream closed early".to_string(),
            retryable: false,
            cause: Some(Box::new(Error::StreamAborted {
                detail: "refused".to_string(),
            })),
        };
        assert!(wrapped.is_stream_aborted());
        assert!(!wrapped.is_validation_failed());
    }
}
