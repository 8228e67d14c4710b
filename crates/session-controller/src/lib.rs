//! # SIP Session Controller
//!
//! Owns an embedded SIP engine handle and drives its registration lifecycle:
//!
//! - **config**: merges the factory template and the per-install configuration
//! - **identity**: turns stored credentials into a proxy and auth record
//! - **controller**: construction, start, event pump and bounded shutdown
//! - **events**: typed registration and call state notifications
//! - **service**: runs a controller and its event pump on a tokio task
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sipline_session_controller::prelude::*;
//! use sipline_session_controller::sim::{RegistrarBehavior, SimulatedEngineFactory};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dirs = AppDirs::new("/var/lib/sipline", "/usr/share/sipline");
//!     let assets = AudioAssets::from_bundle(&dirs, "ringback.wav", "toy-mono.wav")?;
//!     let options = ControllerOptions::new(dirs, "/usr/share/sipline/Secret.toml", assets);
//!
//!     let factory = SimulatedEngineFactory::new(RegistrarBehavior::Accept);
//!     let controller = SessionController::new(options, &factory)?;
//!
//!     let session = SessionService::spawn(controller);
//!     session.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     session.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Threading
//!
//! The engine does no threading of its own. Every engine call, including the
//! periodic `iterate()` that delivers callbacks, happens on the one task that
//! owns the controller, so the engine needs no locking.

pub mod address;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod logging;
pub mod recovery;
pub mod service;
pub mod sim;

pub use config::{AppDirs, AudioAssets, ConfigLoader, EngineConfig, SessionSettings};
pub use controller::{ControllerOptions, ControllerState, SessionController, ShutdownOutcome, ShutdownPoll};
pub use engine::{CallId, EngineError, EngineFactory, EngineListener, ProxyId, SipEngine};
pub use error::{SessionError, SessionResult};
pub use events::{CallState, EventEmitter, RegistrationState, SessionEvent, SessionEventHandler};
pub use identity::{CredentialRecord, IdentityResolver};
pub use service::{SessionHandle, SessionService};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        AppDirs, AudioAssets, CallState, ControllerOptions, ControllerState, RegistrationState,
        SessionController, SessionError, SessionEvent, SessionEventHandler, SessionHandle,
        SessionResult, SessionService, ShutdownOutcome,
    };
}
