//! Session controller
//!
//! The [`SessionController`] owns the engine handle for the lifetime of a
//! session and drives it through a fixed lifecycle:
//!
//! ```text
//! Uninitialized ──new()──► Constructed ──start()──► Started ──shutdown()──► ShuttingDown ──► Terminated
//!                               │                                                              ▲
//!                               └───────────────────────shutdown()─────────────────────────────┘
//! ```
//!
//! All engine work, including callback delivery, happens inside
//! [`SessionController::iterate`]. Something has to call it periodically;
//! [`crate::service::SessionService`] does that on a tokio task, or the owner
//! can pump it by hand.
//!
//! Shutdown de-registers the default proxy and waits for the registrar to
//! confirm with `Cleared` before releasing the engine. The wait is bounded by
//! `shutdown_timeout_ms` and can be cancelled; either way the engine is
//! released when the wait ends.
//!
//! # Example
//!
//! ```rust,no_run
//! use sipline_session_controller::prelude::*;
//! use sipline_session_controller::sim::{RegistrarBehavior, SimulatedEngineFactory};
//!
//! # async fn example() -> SessionResult<()> {
//! let dirs = AppDirs::new("/var/lib/sipline", "/usr/share/sipline");
//! let assets = AudioAssets::from_bundle(&dirs, "ringback.wav", "toy-mono.wav")?;
//! let options = ControllerOptions::new(dirs, "/usr/share/sipline/Secret.toml", assets);
//!
//! let factory = SimulatedEngineFactory::new(RegistrarBehavior::Accept);
//! let mut controller = SessionController::new(options, &factory)?;
//! controller.start()?;
//! controller.iterate()?;
//!
//! let outcome = controller.shutdown().await?;
//! println!("shutdown finished: {:?}", outcome);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{AppDirs, AudioAssets, ConfigLoader, SessionSettings};
use crate::engine::{CallId, EngineFactory, ProxyId, SipEngine};
use crate::error::{SessionError, SessionResult};
use crate::events::{
    EventDispatcher, EventEmitter, RegistrationState, RegistrationUpdate, SessionEvent,
    SessionEventHandler,
};
use crate::identity::{CredentialRecord, IdentityResolver};
use crate::recovery::{RegistrationRetry, RetryDecision};

/// Default name of the writable per-install configuration
pub const DEFAULT_USER_CONFIG: &str = "linphonerc";

/// Default name of the bundled factory template
pub const DEFAULT_FACTORY_CONFIG: &str = "linphonerc-factory";

/// Lifecycle state of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerState {
    Uninitialized,
    /// Engine created, nothing registered
    Constructed,
    /// Identity registered, event pump expected to run
    Started,
    /// Waiting for the registrar to confirm de-registration
    ShuttingDown,
    /// Engine released
    Terminated,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Uninitialized => "Uninitialized",
            ControllerState::Constructed => "Constructed",
            ControllerState::Started => "Started",
            ControllerState::ShuttingDown => "ShuttingDown",
            ControllerState::Terminated => "Terminated",
        };
        f.write_str(name)
    }
}

/// Inputs needed to construct a controller
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub dirs: AppDirs,
    /// File name of the user configuration inside the document directory
    pub user_config: String,
    /// File name of the factory template inside the bundle directory
    pub factory_config: String,
    /// Secret store holding the account credentials
    pub credentials: PathBuf,
    pub assets: AudioAssets,
}

impl ControllerOptions {
    pub fn new(dirs: AppDirs, credentials: impl Into<PathBuf>, assets: AudioAssets) -> Self {
        Self {
            dirs,
            user_config: DEFAULT_USER_CONFIG.to_string(),
            factory_config: DEFAULT_FACTORY_CONFIG.to_string(),
            credentials: credentials.into(),
            assets,
        }
    }

    pub fn with_user_config(mut self, name: impl Into<String>) -> Self {
        self.user_config = name.into();
        self
    }

    pub fn with_factory_config(mut self, name: impl Into<String>) -> Self {
        self.factory_config = name.into();
        self
    }
}

/// How a completed shutdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The registrar confirmed de-registration after `iterations` pump cycles
    Cleared { iterations: u32 },
    /// The session was never started; nothing to de-register
    NotRegistered,
}

/// Result of one shutdown poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPoll {
    /// Still waiting for `Cleared`
    Pending,
    /// De-registration confirmed, engine released
    Complete,
}

/// Owner of the engine handle and driver of the session lifecycle
pub struct SessionController {
    state: ControllerState,
    engine: Option<Box<dyn SipEngine>>,
    settings: SessionSettings,
    credentials: PathBuf,
    resolver: IdentityResolver,
    default_proxy: Option<ProxyId>,
    emitter: Arc<EventEmitter>,
    updates: mpsc::UnboundedReceiver<RegistrationUpdate>,
    retry: RegistrationRetry,
    shutdown_iterations: u32,
}

impl SessionController {
    /// Load configuration and create the engine
    ///
    /// Fails with `Configuration` when the configuration cannot be loaded and
    /// with `EngineCreation` when the factory refuses to create an engine.
    pub fn new(options: ControllerOptions, factory: &dyn EngineFactory) -> SessionResult<Self> {
        let config = ConfigLoader::new(options.dirs.clone())
            .load(&options.user_config, &options.factory_config)?;
        let settings = config.settings()?;
        let log_level = settings.engine_log_level()?;

        let emitter = Arc::new(EventEmitter::new());
        let (update_tx, updates) = mpsc::unbounded_channel();
        let dispatcher = EventDispatcher::new(emitter.clone(), update_tx);

        let mut engine = factory.create(config, Box::new(dispatcher)).map_err(|e| {
            error!(error = %e, "Failed to create SIP engine");
            SessionError::EngineCreation {
                reason: e.to_string(),
            }
        })?;
        engine.set_log_level(log_level);
        engine.set_ringback(&options.assets.ringback);
        engine.set_ring(&options.assets.ring);

        let mut controller = Self {
            state: ControllerState::Uninitialized,
            engine: Some(engine),
            resolver: IdentityResolver::new(settings.registration_expires),
            retry: RegistrationRetry::new(settings.retry_policy()),
            settings,
            credentials: options.credentials,
            default_proxy: None,
            emitter,
            updates,
            shutdown_iterations: 0,
        };
        controller.transition(ControllerState::Constructed);
        info!(
            ringback = %options.assets.ringback.display(),
            ring = %options.assets.ring.display(),
            "SIP engine created"
        );
        Ok(controller)
    }

    /// Register the identity from the secret store
    ///
    /// On any failure the controller stays `Constructed` and the engine holds
    /// none of the records added here, so `start` may be called again.
    pub fn start(&mut self) -> SessionResult<()> {
        if self.state != ControllerState::Constructed {
            return Err(SessionError::invalid_state("start", self.state));
        }

        let record = CredentialRecord::load(&self.credentials)?;
        let resolved = self.resolver.resolve(&record)?;
        let identity = resolved.proxy.identity.clone();
        let username = resolved.auth.username.clone();

        let engine = self.engine_mut("start")?;
        engine.add_auth_info(resolved.auth);
        let proxy = match engine.add_proxy_config(resolved.proxy) {
            Ok(proxy) => proxy,
            Err(e) => {
                engine.remove_auth_info(&username);
                return Err(e.into());
            }
        };
        let enabled = engine
            .set_default_proxy(proxy)
            .and_then(|()| engine.set_register_enabled(proxy, true));
        if let Err(e) = enabled {
            warn!(%identity, %proxy, error = %e, "Registration setup failed, rolling back");
            engine.remove_proxy_config(proxy);
            engine.remove_auth_info(&username);
            return Err(e.into());
        }

        self.default_proxy = Some(proxy);
        info!(%identity, %proxy, "Registration enabled");
        self.transition(ControllerState::Started);
        Ok(())
    }

    /// Run one pass of the engine's event routine
    ///
    /// Callbacks fire synchronously from inside this call.
    pub fn iterate(&mut self) -> SessionResult<()> {
        match self.state {
            ControllerState::Constructed | ControllerState::Started | ControllerState::ShuttingDown => {}
            state => return Err(SessionError::invalid_state("iterate", state)),
        }

        self.engine_mut("iterate")?.iterate();
        self.process_updates();

        if self.state == ControllerState::Started && self.retry.take_due(Instant::now()) {
            if let Some(proxy) = self.default_proxy {
                info!(%proxy, attempt = self.retry.attempts(), "Retrying registration");
                self.engine_mut("retry registration")?.refresh_registration(proxy)?;
            }
        }
        Ok(())
    }

    /// De-register and release the engine, waiting at most `shutdown_timeout_ms`
    pub async fn shutdown(&mut self) -> SessionResult<ShutdownOutcome> {
        self.shutdown_with(&CancellationToken::new()).await
    }

    /// Like [`shutdown`](Self::shutdown), but `cancel` can end the wait early
    ///
    /// Whether the wait completes, times out or is cancelled, the engine is
    /// released by the time this returns.
    pub async fn shutdown_with(&mut self, cancel: &CancellationToken) -> SessionResult<ShutdownOutcome> {
        let registered = match self.begin_shutdown() {
            Ok(registered) => registered,
            Err(e @ SessionError::Engine(_)) => {
                self.force_release();
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        if !registered {
            return Ok(ShutdownOutcome::NotRegistered);
        }

        let deadline = self.settings.shutdown_timeout();
        let poll_interval = self.settings.shutdown_poll_interval();
        let started = Instant::now();

        let waited = tokio::select! {
            result = timeout(deadline, self.wait_for_cleared(poll_interval)) => Some(result),
            _ = cancel.cancelled() => None,
        };

        match waited {
            Some(Ok(Ok(iterations))) => {
                info!(iterations, "Session shut down");
                Ok(ShutdownOutcome::Cleared { iterations })
            }
            Some(Ok(Err(e))) => {
                self.force_release();
                Err(e)
            }
            Some(Err(_)) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                warn!(elapsed_ms, "De-registration not confirmed before the deadline");
                self.force_release();
                Err(SessionError::ShutdownTimeout { elapsed_ms })
            }
            None => {
                warn!("Shutdown wait cancelled");
                self.force_release();
                Err(SessionError::Cancelled)
            }
        }
    }

    async fn wait_for_cleared(&mut self, poll_interval: Duration) -> SessionResult<u32> {
        loop {
            if self.poll_shutdown()? == ShutdownPoll::Complete {
                return Ok(self.shutdown_iterations);
            }
            sleep(poll_interval).await;
        }
    }

    /// First step of a shutdown: stop retries and disable registration
    ///
    /// Returns `false` when there was nothing to de-register; the engine has
    /// then already been released.
    pub fn begin_shutdown(&mut self) -> SessionResult<bool> {
        match self.state {
            ControllerState::Constructed => {
                info!("Shutdown before start, releasing engine");
                self.release();
                Ok(false)
            }
            ControllerState::Started => {
                self.retry.suspend();
                if let Some(proxy) = self.default_proxy {
                    self.engine_mut("shut down")?.set_register_enabled(proxy, false)?;
                    info!(%proxy, "Registration disabled, waiting for de-registration");
                }
                self.shutdown_iterations = 0;
                self.transition(ControllerState::ShuttingDown);
                Ok(true)
            }
            ControllerState::ShuttingDown => Ok(true),
            state => Err(SessionError::invalid_state("shut down", state)),
        }
    }

    /// Check for `Cleared`; iterate once if it has not arrived yet
    ///
    /// Releases the engine and returns `Complete` once the default proxy
    /// reports `Cleared`.
    pub fn poll_shutdown(&mut self) -> SessionResult<ShutdownPoll> {
        if self.state != ControllerState::ShuttingDown {
            return Err(SessionError::invalid_state("poll shutdown", self.state));
        }

        let cleared = match self.default_proxy {
            Some(_) => self.registration_state() == Some(RegistrationState::Cleared),
            None => true,
        };
        if cleared {
            debug!(iterations = self.shutdown_iterations, "De-registration confirmed");
            self.release();
            return Ok(ShutdownPoll::Complete);
        }

        self.iterate()?;
        self.shutdown_iterations += 1;
        Ok(ShutdownPoll::Pending)
    }

    /// Release the engine without waiting for de-registration
    pub fn force_release(&mut self) {
        if self.engine.is_some() {
            warn!(state = %self.state, "Releasing SIP engine without confirmed de-registration");
        }
        self.release();
    }

    /// Place an outgoing call through the default proxy
    pub fn place_call(&mut self, destination: &str) -> SessionResult<CallId> {
        self.require_started("place a call")?;
        let call = self.engine_mut("place a call")?.invite(destination)?;
        info!(%call, destination, "Outgoing call placed");
        Ok(call)
    }

    pub fn accept_call(&mut self, call: CallId) -> SessionResult<()> {
        self.require_started("accept a call")?;
        self.engine_mut("accept a call")?.accept_call(call)?;
        Ok(())
    }

    pub fn terminate_call(&mut self, call: CallId) -> SessionResult<()> {
        self.require_started("terminate a call")?;
        self.engine_mut("terminate a call")?.terminate_call(call)?;
        Ok(())
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Handle of the default proxy, once started
    pub fn default_proxy(&self) -> Option<ProxyId> {
        self.default_proxy
    }

    /// Current registration state of the default proxy
    pub fn registration_state(&self) -> Option<RegistrationState> {
        let proxy = self.default_proxy?;
        let code = self.engine.as_ref()?.registration_state(proxy)?;
        Some(RegistrationState::from_native(code))
    }

    /// Whether the engine handle is still held
    pub fn holds_engine(&self) -> bool {
        self.engine.is_some()
    }

    pub fn emitter(&self) -> &Arc<EventEmitter> {
        &self.emitter
    }

    /// Add an event handler; see [`EventEmitter::subscribe`]
    pub fn subscribe(&self, handler: Arc<dyn SessionEventHandler>) -> Uuid {
        self.emitter.subscribe(handler)
    }

    pub fn unsubscribe(&self, subscription_id: Uuid) -> bool {
        self.emitter.unsubscribe(subscription_id)
    }

    /// Broadcast receiver for events emitted from now on
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.emitter.receiver()
    }

    fn engine_mut(&mut self, operation: &str) -> SessionResult<&mut (dyn SipEngine + 'static)> {
        let state = self.state;
        self.engine
            .as_deref_mut()
            .ok_or_else(|| SessionError::invalid_state(operation, state))
    }

    fn require_started(&self, operation: &str) -> SessionResult<()> {
        if self.state == ControllerState::Started {
            Ok(())
        } else {
            Err(SessionError::invalid_state(operation, self.state))
        }
    }

    fn process_updates(&mut self) {
        while let Ok(update) = self.updates.try_recv() {
            if Some(update.proxy) != self.default_proxy {
                continue;
            }
            match update.state {
                RegistrationState::Ok => self.retry.on_registered(),
                RegistrationState::Failed => match self.retry.on_failed(Instant::now()) {
                    RetryDecision::Scheduled { attempt, delay } => {
                        self.emitter.emit(SessionEvent::RegistrationRetryScheduled {
                            proxy: update.proxy,
                            attempt,
                            delay,
                        });
                    }
                    RetryDecision::GaveUp { attempts } => {
                        let reason = SessionError::RegistrationFailed {
                            reason: update.message,
                        };
                        error!(proxy = %update.proxy, attempts, error = %reason, "Giving up on registration");
                        self.emitter.emit(SessionEvent::RegistrationGaveUp {
                            proxy: update.proxy,
                            attempts,
                            reason: reason.to_string(),
                        });
                    }
                    RetryDecision::Ignored => {}
                },
                _ => {}
            }
        }
    }

    fn release(&mut self) {
        if let Some(engine) = self.engine.take() {
            drop(engine);
            debug!("SIP engine released");
        }
        if self.state != ControllerState::Terminated {
            self.transition(ControllerState::Terminated);
        }
    }

    fn transition(&mut self, to: ControllerState) {
        let from = self.state;
        self.state = to;
        debug!(%from, %to, "Session state changed");
        self.emitter.emit(SessionEvent::LifecycleChanged { from, to });
    }
}

impl fmt::Debug for SessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &self.state)
            .field("holds_engine", &self.engine.is_some())
            .field("default_proxy", &self.default_proxy)
            .field("settings", &self.settings)
            .finish()
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if self.engine.take().is_some() {
            warn!(state = %self.state, "Session controller dropped while holding the SIP engine");
        }
    }
}
