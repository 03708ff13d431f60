use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Failure of a single downstream call.
///
/// The variant is the only signal the orchestrator uses to choose between
/// retrying a step and compensating it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Timeouts, connection failures, 5xx, 408 and 429.
    #[error("transient {service} error: {message}")]
    Transient {
        service: &'static str,
        message: String,
    },

    /// Downstream rejected the request; retrying will not help.
    #[error("permanent {service} error: {message}")]
    Permanent {
        service: &'static str,
        message: String,
    },

    /// The resource does not exist. Permanent for creates, success for deletes.
    #[error("{service} resource not found: {message}")]
    NotFound {
        service: &'static str,
        message: String,
    },

    /// The client could not be configured (bad base URL, TLS init, ...).
    #[error("{service} client configuration error: {message}")]
    Config {
        service: &'static str,
        message: String,
    },
}

impl ClientError {
    pub fn transient(service: &'static str, message: impl Into<String>) -> Self {
        ClientError::Transient {
            service,
            message: message.into(),
        }
    }

    pub fn permanent(service: &'static str, message: impl Into<String>) -> Self {
        ClientError::Permanent {
            service,
            message: message.into(),
        }
    }

    pub fn not_found(service: &'static str, message: impl Into<String>) -> Self {
        ClientError::NotFound {
            service,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound { .. })
    }

    pub fn service(&self) -> &'static str {
        match self {
            ClientError::Transient { service, .. }
            | ClientError::Permanent { service, .. }
            | ClientError::NotFound { service, .. }
            | ClientError::Config { service, .. } => service,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ClientError::Transient { message, .. }
            | ClientError::Permanent { message, .. }
            | ClientError::NotFound { message, .. }
            | ClientError::Config { message, .. } => message,
        }
    }
}
