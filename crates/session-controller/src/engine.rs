//! Typed interface to the embedded SIP engine
//!
//! The engine is an opaque native stack that performs no threading of its own:
//! all of its work, including the delivery of state notifications, happens
//! inside [`SipEngine::iterate`]. The controller owns exactly one engine and
//! talks to it only through the traits in this module.
//!
//! # Key Components
//!
//! - **EngineFactory** - creates an engine from a configuration and a callback table
//! - **SipEngine** - the capabilities the controller consumes
//! - **EngineListener** - the callback table the engine invokes during `iterate()`
//! - **ProxyConfig / AuthInfo** - the records handed to the engine at start-up
//!
//! State notifications carry the engine's native integer codes (see [`native`]);
//! mapping them to typed states is the event dispatcher's job.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;

use crate::config::EngineConfig;

/// Native state constants reported by the engine
pub mod native {
    /// Initial state for registrations
    pub const REGISTRATION_NONE: i32 = 0;
    /// Registration is in progress
    pub const REGISTRATION_PROGRESS: i32 = 1;
    /// Registration is successful
    pub const REGISTRATION_OK: i32 = 2;
    /// Unregistration succeeded
    pub const REGISTRATION_CLEARED: i32 = 3;
    /// Registration failed
    pub const REGISTRATION_FAILED: i32 = 4;

    pub const CALL_IDLE: i32 = 0;
    pub const CALL_INCOMING_RECEIVED: i32 = 1;
    pub const CALL_OUTGOING_INIT: i32 = 2;
    pub const CALL_OUTGOING_PROGRESS: i32 = 3;
    pub const CALL_OUTGOING_RINGING: i32 = 4;
    pub const CALL_OUTGOING_EARLY_MEDIA: i32 = 5;
    pub const CALL_CONNECTED: i32 = 6;
    pub const CALL_STREAMS_RUNNING: i32 = 7;
    pub const CALL_PAUSING: i32 = 8;
    pub const CALL_PAUSED: i32 = 9;
    pub const CALL_RESUMING: i32 = 10;
    pub const CALL_REFERRED: i32 = 11;
    pub const CALL_ERROR: i32 = 12;
    pub const CALL_END: i32 = 13;
    pub const CALL_PAUSED_BY_REMOTE: i32 = 14;
    pub const CALL_UPDATED_BY_REMOTE: i32 = 15;
    pub const CALL_INCOMING_EARLY_MEDIA: i32 = 16;
    pub const CALL_UPDATING: i32 = 17;
    pub const CALL_RELEASED: i32 = 18;
}

/// Handle to a proxy configuration owned by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProxyId(pub u32);

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proxy#{}", self.0)
    }
}

/// Handle to a call owned by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub u32);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call#{}", self.0)
    }
}

/// Proxy configuration handed to the engine
///
/// Binds an identity to a registrar. The registrar address is always the
/// domain of the identity; there is no separate outbound proxy setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Full identity, e.g. `sip:alice@sip.example.com`
    pub identity: String,
    /// Registrar address (the identity's domain)
    pub server_addr: String,
    /// Whether REGISTER requests are sent for this proxy
    pub register_enabled: bool,
    /// Requested registration lifetime in seconds
    pub expires: u32,
}

/// Authentication record handed to the engine
///
/// Only `username` and `password` are populated by identity resolution; the
/// engine learns realm and domain from the server's challenge.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub username: String,
    pub userid: Option<String>,
    pub password: String,
    pub ha1: Option<String>,
    pub realm: Option<String>,
    pub domain: Option<String>,
}

impl AuthInfo {
    /// Create an authentication record from a username and password
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            userid: None,
            password: password.into(),
            ha1: None,
            realm: None,
            domain: None,
        }
    }
}

impl fmt::Debug for AuthInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthInfo")
            .field("username", &self.username)
            .field("userid", &self.userid)
            .field("password", &"<redacted>")
            .field("ha1", &self.ha1.as_ref().map(|_| "<redacted>"))
            .field("realm", &self.realm)
            .field("domain", &self.domain)
            .finish()
    }
}

/// Errors reported by engine operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The engine could not be brought up
    #[error("engine unavailable: {reason}")]
    Unavailable { reason: String },

    /// The proxy handle does not belong to this engine
    #[error("unknown proxy configuration {proxy}")]
    UnknownProxy { proxy: ProxyId },

    /// The call handle does not belong to this engine
    #[error("unknown call {call}")]
    UnknownCall { call: CallId },

    /// The engine refused the request
    #[error("request rejected: {reason}")]
    Rejected { reason: String },
}

/// Callback table invoked by the engine
///
/// Callbacks fire synchronously from within [`SipEngine::iterate`], on the
/// task that called it, never from another thread.
pub trait EngineListener: Send {
    /// A proxy's registration state changed
    fn on_registration_state_changed(&mut self, proxy: ProxyId, state: i32, message: &str);

    /// A call's state changed
    fn on_call_state_changed(&mut self, call: CallId, state: i32, message: &str);
}

/// Capabilities of the embedded SIP engine
///
/// Dropping the engine releases the native handle.
pub trait SipEngine: Send {
    /// Set the verbosity of the engine's own diagnostics
    fn set_log_level(&mut self, level: Level);

    /// Set the tone played to the caller while the remote party is ringing
    fn set_ringback(&mut self, path: &Path);

    /// Set the tone played locally on incoming calls
    fn set_ring(&mut self, path: &Path);

    /// Register credentials used to answer authentication challenges
    fn add_auth_info(&mut self, info: AuthInfo);

    /// Drop the credentials registered for `username`
    fn remove_auth_info(&mut self, username: &str);

    /// Add a proxy configuration and return its handle
    fn add_proxy_config(&mut self, config: ProxyConfig) -> Result<ProxyId, EngineError>;

    /// Remove a proxy configuration without de-registering it
    fn remove_proxy_config(&mut self, proxy: ProxyId);

    /// Mark a proxy configuration as the default one
    fn set_default_proxy(&mut self, proxy: ProxyId) -> Result<(), EngineError>;

    /// The current default proxy configuration, if any
    fn default_proxy(&self) -> Option<ProxyId>;

    /// Enable or disable registration for a proxy
    ///
    /// Disabling an active registration starts a REGISTER with `expires=0`.
    fn set_register_enabled(&mut self, proxy: ProxyId, enabled: bool) -> Result<(), EngineError>;

    /// Send a fresh REGISTER for a proxy whose registration is enabled
    fn refresh_registration(&mut self, proxy: ProxyId) -> Result<(), EngineError>;

    /// Native registration state code of a proxy
    fn registration_state(&self, proxy: ProxyId) -> Option<i32>;

    /// Process pending network events, timers and callbacks
    fn iterate(&mut self);

    /// Place an outgoing call
    fn invite(&mut self, destination: &str) -> Result<CallId, EngineError>;

    /// Answer an incoming call
    fn accept_call(&mut self, call: CallId) -> Result<(), EngineError>;

    /// Hang up a call
    fn terminate_call(&mut self, call: CallId) -> Result<(), EngineError>;
}

/// Creates engine handles
pub trait EngineFactory {
    /// Create an engine bound to `config` and the `listener` callback table
    fn create(
        &self,
        config: EngineConfig,
        listener: Box<dyn EngineListener>,
    ) -> Result<Box<dyn SipEngine>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_info_debug_redacts_password() {
        let info = AuthInfo::new("alice", "hunter2");
        let rendered = format!("{:?}", info);
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(ProxyId(3).to_string(), "proxy#3");
        assert_eq!(CallId(7).to_string(), "call#7");
    }
}
