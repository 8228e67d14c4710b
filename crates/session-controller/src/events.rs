//! Event dispatching for engine notifications
//!
//! The engine reports registration and call progress through two callbacks
//! carrying native integer codes. The [`EventDispatcher`] is the callback table
//! handed to the engine: it maps each code to a typed state, logs the
//! transition and forwards a [`SessionEvent`] to every subscriber.
//!
//! Subscribers come in two flavours:
//!
//! - **SessionEventHandler** - synchronous trait objects called in
//!   subscription order from inside `iterate()`
//! - **broadcast receivers** - for async consumers, obtained from
//!   [`EventEmitter::receiver`]
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use sipline_session_controller::events::{
//!     EventEmitter, RegistrationStatusInfo, SessionEventHandler,
//! };
//!
//! struct PrintHandler;
//!
//! impl SessionEventHandler for PrintHandler {
//!     fn on_registration_state_changed(&self, info: &RegistrationStatusInfo) {
//!         println!("{} is now {}", info.proxy, info.state);
//!     }
//! }
//!
//! let emitter = EventEmitter::new();
//! let id = emitter.subscribe(Arc::new(PrintHandler));
//! assert_eq!(emitter.subscription_count(), 1);
//! assert!(emitter.unsubscribe(id));
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::controller::ControllerState;
use crate::engine::{native, CallId, EngineListener, ProxyId};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Registration state of a proxy configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationState {
    /// Initial state, nothing sent yet
    None,
    /// REGISTER sent, waiting for the final response
    Progress,
    /// Registered with the server
    Ok,
    /// De-registration confirmed
    Cleared,
    /// The server rejected the registration or could not be reached
    Failed,
    /// A code this library does not know
    Unknown(i32),
}

impl RegistrationState {
    /// Map a native engine code
    pub fn from_native(code: i32) -> Self {
        match code {
            native::REGISTRATION_NONE => Self::None,
            native::REGISTRATION_PROGRESS => Self::Progress,
            native::REGISTRATION_OK => Self::Ok,
            native::REGISTRATION_CLEARED => Self::Cleared,
            native::REGISTRATION_FAILED => Self::Failed,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Progress => write!(f, "Progress"),
            Self::Ok => write!(f, "Ok"),
            Self::Cleared => write!(f, "Cleared"),
            Self::Failed => write!(f, "Failed"),
            Self::Unknown(code) => write!(f, "Unknown({})", code),
        }
    }
}

/// State of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    Idle,
    /// A new incoming call
    IncomingReceived,
    OutgoingInit,
    OutgoingProgress,
    OutgoingRinging,
    OutgoingEarlyMedia,
    Connected,
    /// Media streams are established and running
    StreamsRunning,
    Pausing,
    Paused,
    Resuming,
    Referred,
    /// The call encountered an error
    Error,
    End,
    PausedByRemote,
    UpdatedByRemote,
    IncomingEarlyMedia,
    Updating,
    Released,
    /// A code this library does not know
    Other(i32),
}

impl CallState {
    /// Map a native engine code
    pub fn from_native(code: i32) -> Self {
        match code {
            native::CALL_IDLE => Self::Idle,
            native::CALL_INCOMING_RECEIVED => Self::IncomingReceived,
            native::CALL_OUTGOING_INIT => Self::OutgoingInit,
            native::CALL_OUTGOING_PROGRESS => Self::OutgoingProgress,
            native::CALL_OUTGOING_RINGING => Self::OutgoingRinging,
            native::CALL_OUTGOING_EARLY_MEDIA => Self::OutgoingEarlyMedia,
            native::CALL_CONNECTED => Self::Connected,
            native::CALL_STREAMS_RUNNING => Self::StreamsRunning,
            native::CALL_PAUSING => Self::Pausing,
            native::CALL_PAUSED => Self::Paused,
            native::CALL_RESUMING => Self::Resuming,
            native::CALL_REFERRED => Self::Referred,
            native::CALL_ERROR => Self::Error,
            native::CALL_END => Self::End,
            native::CALL_PAUSED_BY_REMOTE => Self::PausedByRemote,
            native::CALL_UPDATED_BY_REMOTE => Self::UpdatedByRemote,
            native::CALL_INCOMING_EARLY_MEDIA => Self::IncomingEarlyMedia,
            native::CALL_UPDATING => Self::Updating,
            native::CALL_RELEASED => Self::Released,
            other => Self::Other(other),
        }
    }

    /// Whether the call is over
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error | Self::End | Self::Released)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "Other({})", code),
            state => write!(f, "{:?}", state),
        }
    }
}

/// A registration state change
#[derive(Debug, Clone)]
pub struct RegistrationStatusInfo {
    pub proxy: ProxyId,
    pub state: RegistrationState,
    /// Engine-provided detail, e.g. the server's reason phrase
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A call state change
#[derive(Debug, Clone)]
pub struct CallStatusInfo {
    pub call: CallId,
    pub state: CallState,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Events published by a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Registration state of a proxy changed
    RegistrationStateChanged(RegistrationStatusInfo),
    /// State of a call changed
    CallStateChanged(CallStatusInfo),
    /// A failed registration will be retried after `delay`
    RegistrationRetryScheduled {
        proxy: ProxyId,
        attempt: u32,
        delay: Duration,
    },
    /// The retry budget is spent; registration stays failed
    RegistrationGaveUp {
        proxy: ProxyId,
        attempts: u32,
        reason: String,
    },
    /// The controller moved to a new lifecycle state
    LifecycleChanged {
        from: ControllerState,
        to: ControllerState,
    },
}

/// Synchronous subscriber to session events
///
/// Handlers run on the task that pumps the engine, so they must return
/// quickly. Every method has an empty default.
pub trait SessionEventHandler: Send + Sync {
    fn on_registration_state_changed(&self, _info: &RegistrationStatusInfo) {}

    fn on_call_state_changed(&self, _info: &CallStatusInfo) {}

    /// Called for every event; dispatches to the specific methods above
    fn on_session_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::RegistrationStateChanged(info) => self.on_registration_state_changed(info),
            SessionEvent::CallStateChanged(info) => self.on_call_state_changed(info),
            _ => {}
        }
    }
}

/// Fan-out of session events to handlers and broadcast receivers
pub struct EventEmitter {
    subscriptions: RwLock<Vec<(Uuid, Arc<dyn SessionEventHandler>)>>,
    sender: broadcast::Sender<SessionEvent>,
}

impl EventEmitter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            subscriptions: RwLock::new(Vec::new()),
            sender,
        }
    }

    /// Add a handler; returns the id used to remove it
    pub fn subscribe(&self, handler: Arc<dyn SessionEventHandler>) -> Uuid {
        let id = Uuid::new_v4();
        self.subscriptions.write().push((id, handler));
        id
    }

    pub fn unsubscribe(&self, subscription_id: Uuid) -> bool {
        let mut subscriptions = self.subscriptions.write();
        if let Some(pos) = subscriptions.iter().position(|(id, _)| *id == subscription_id) {
            subscriptions.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// A receiver for events emitted from now on
    pub fn receiver(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Deliver an event to every handler, then to broadcast receivers
    pub fn emit(&self, event: SessionEvent) {
        let handlers: Vec<_> = self
            .subscriptions
            .read()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler.on_session_event(&event);
        }
        // No receivers is fine
        let _ = self.sender.send(event);
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

/// A registration state change, as seen by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationUpdate {
    pub proxy: ProxyId,
    pub state: RegistrationState,
    pub message: String,
}

/// Callback table handed to the engine
///
/// Besides publishing events, it queues every registration update for the
/// controller, which drains the queue after each `iterate()`.
pub struct EventDispatcher {
    emitter: Arc<EventEmitter>,
    updates: mpsc::UnboundedSender<RegistrationUpdate>,
}

impl EventDispatcher {
    pub fn new(emitter: Arc<EventEmitter>, updates: mpsc::UnboundedSender<RegistrationUpdate>) -> Self {
        Self { emitter, updates }
    }
}

impl EngineListener for EventDispatcher {
    fn on_registration_state_changed(&mut self, proxy: ProxyId, state: i32, message: &str) {
        let state = RegistrationState::from_native(state);
        match state {
            RegistrationState::None | RegistrationState::Progress => {
                debug!(%proxy, %state, detail = message, "Registration state changed")
            }
            RegistrationState::Ok | RegistrationState::Cleared => {
                info!(%proxy, %state, detail = message, "Registration state changed")
            }
            RegistrationState::Failed => warn!(%proxy, detail = message, "Registration failed"),
            RegistrationState::Unknown(code) => {
                warn!(%proxy, code, detail = message, "Unknown registration state")
            }
        }

        let _ = self.updates.send(RegistrationUpdate {
            proxy,
            state,
            message: message.to_string(),
        });
        self.emitter.emit(SessionEvent::RegistrationStateChanged(RegistrationStatusInfo {
            proxy,
            state,
            message: message.to_string(),
            timestamp: Utc::now(),
        }));
    }

    fn on_call_state_changed(&mut self, call: CallId, state: i32, message: &str) {
        let state = CallState::from_native(state);
        match state {
            CallState::Error => warn!(%call, detail = message, "Call encountered an error"),
            CallState::Other(code) => warn!(%call, code, detail = message, "Unknown call state"),
            CallState::IncomingReceived | CallState::StreamsRunning | CallState::End => {
                info!(%call, %state, detail = message, "Call state changed")
            }
            _ => debug!(%call, %state, detail = message, "Call state changed"),
        }

        self.emitter.emit(SessionEvent::CallStateChanged(CallStatusInfo {
            call,
            state,
            message: message.to_string(),
            timestamp: Utc::now(),
        }));
    }
}
