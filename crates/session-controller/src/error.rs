//! Error types for the session controller
//!
//! Every fallible operation in this crate returns [`SessionResult`]. The
//! variants follow the lifecycle of a session: configuration and engine
//! creation failures happen at construction, identity and credential failures
//! happen when the session is started, and timeouts or cancellations happen
//! during shutdown.

use std::fmt;
use thiserror::Error;

use crate::engine::EngineError;

/// Result type for session controller operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur while driving a SIP session
#[derive(Debug, Error)]
pub enum SessionError {
    /// Factory template or user configuration could not be resolved or parsed
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The secret store could not be read or is missing a key
    #[error("Credential store error: {message}")]
    Credentials { message: String },

    /// The identity built from the credential record is not a valid SIP URI
    #[error("Invalid SIP identity '{identity}': {reason}")]
    InvalidIdentity { identity: String, reason: String },

    /// The engine handle could not be created
    #[error("Engine creation failed: {reason}")]
    EngineCreation { reason: String },

    /// An engine operation failed
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// The registrar rejected the registration
    #[error("Registration failed: {reason}")]
    RegistrationFailed { reason: String },

    /// De-registration was not confirmed before the shutdown deadline
    #[error("Shutdown timed out after {elapsed_ms} ms waiting for de-registration")]
    ShutdownTimeout { elapsed_ms: u64 },

    /// The shutdown wait was cancelled before de-registration completed
    #[error("Shutdown cancelled before de-registration completed")]
    Cancelled,

    /// The operation is not valid in the controller's current state
    #[error("Cannot {operation} while session is {state}")]
    InvalidState { operation: String, state: String },

    /// The background session task is no longer running
    #[error("Session service has stopped")]
    ServiceStopped,
}

/// Error category used for logging and event classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Configuration and credential problems
    Configuration,
    /// Identity resolution problems
    Identity,
    /// Engine creation or operation problems
    Engine,
    /// Registration with the SIP server
    Registration,
    /// Lifecycle violations and shutdown problems
    Lifecycle,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Identity => "identity",
            ErrorCategory::Engine => "engine",
            ErrorCategory::Registration => "registration",
            ErrorCategory::Lifecycle => "lifecycle",
        };
        f.write_str(name)
    }
}

impl SessionError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a credential store error
    pub fn credentials(message: impl Into<String>) -> Self {
        Self::Credentials {
            message: message.into(),
        }
    }

    /// Create an invalid identity error
    pub fn invalid_identity(identity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidIdentity {
            identity: identity.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(operation: impl Into<String>, state: impl fmt::Display) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            state: state.to_string(),
        }
    }

    /// Whether retrying the failed operation may succeed
    ///
    /// Registration failures and engine hiccups are transient; configuration,
    /// identity and lifecycle errors need operator intervention.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::RegistrationFailed { .. } | Self::Engine(_) => true,

            Self::Configuration { .. }
            | Self::Credentials { .. }
            | Self::InvalidIdentity { .. }
            | Self::EngineCreation { .. }
            | Self::ShutdownTimeout { .. }
            | Self::Cancelled
            | Self::InvalidState { .. }
            | Self::ServiceStopped => false,
        }
    }

    /// Get the category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } | Self::Credentials { .. } => ErrorCategory::Configuration,
            Self::InvalidIdentity { .. } => ErrorCategory::Identity,
            Self::EngineCreation { .. } | Self::Engine(_) => ErrorCategory::Engine,
            Self::RegistrationFailed { .. } => ErrorCategory::Registration,
            Self::ShutdownTimeout { .. }
            | Self::Cancelled
            | Self::InvalidState { .. }
            | Self::ServiceStopped => ErrorCategory::Lifecycle,
        }
    }
}
