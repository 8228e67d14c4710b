//! Session service
//!
//! Runs a [`SessionController`] on its own tokio task. The task owns the
//! controller exclusively; callers talk to it through a cloneable
//! [`SessionHandle`] that sends commands over a channel and awaits the reply.
//!
//! While the session is started the task also runs the event pump: a
//! `tokio::time::interval` of `iterate_interval_ms` that calls
//! `iterate()`. Missed ticks are delayed rather than bursted.
//!
//! A shutdown request stops the pump first, then runs the bounded shutdown on
//! the same task and ends it. The engine is therefore never iterated after it
//! has been released. Dropping every handle also ends the task, and the
//! controller's `Drop` releases the engine.
//!
//! ```rust,no_run
//! use sipline_session_controller::prelude::*;
//! use sipline_session_controller::service::SessionService;
//!
//! # async fn example(controller: SessionController) -> SessionResult<()> {
//! let handle = SessionService::spawn(controller);
//! handle.start().await?;
//!
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//!     # break;
//! }
//!
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::controller::{ControllerState, SessionController, ShutdownOutcome};
use crate::engine::CallId;
use crate::error::{SessionError, SessionResult};
use crate::events::{EventEmitter, RegistrationState, SessionEvent, SessionEventHandler};

const COMMAND_CHANNEL_CAPACITY: usize = 32;

enum Command {
    Start {
        reply: oneshot::Sender<SessionResult<()>>,
    },
    State {
        reply: oneshot::Sender<ControllerState>,
    },
    RegistrationState {
        reply: oneshot::Sender<Option<RegistrationState>>,
    },
    PlaceCall {
        destination: String,
        reply: oneshot::Sender<SessionResult<CallId>>,
    },
    AcceptCall {
        call: CallId,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    TerminateCall {
        call: CallId,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    Shutdown {
        cancel: CancellationToken,
        reply: oneshot::Sender<SessionResult<ShutdownOutcome>>,
    },
}

/// Spawns session tasks
pub struct SessionService;

impl SessionService {
    /// Move `controller` onto a new task and return a handle to it
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(controller: SessionController) -> SessionHandle {
        let (commands, receiver) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let emitter = controller.emitter().clone();
        tokio::spawn(run(controller, receiver));
        SessionHandle { commands, emitter }
    }
}

async fn run(mut controller: SessionController, mut commands: mpsc::Receiver<Command>) {
    let mut pump = interval(controller.settings().iterate_interval());
    pump.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(
        interval_ms = controller.settings().iterate_interval_ms,
        "Session task running"
    );

    loop {
        let pumping = controller.state() == ControllerState::Started;
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => {
                    if handle_command(&mut controller, command).await {
                        break;
                    }
                }
                None => {
                    debug!("All session handles dropped");
                    break;
                }
            },
            _ = pump.tick(), if pumping => {
                if let Err(e) = controller.iterate() {
                    warn!(error = %e, "Event pump iteration failed");
                }
            }
        }
    }

    debug!(state = %controller.state(), "Session task finished");
}

/// Returns `true` once the task should stop
async fn handle_command(controller: &mut SessionController, command: Command) -> bool {
    match command {
        Command::Start { reply } => {
            let _ = reply.send(controller.start());
        }
        Command::State { reply } => {
            let _ = reply.send(controller.state());
        }
        Command::RegistrationState { reply } => {
            let _ = reply.send(controller.registration_state());
        }
        Command::PlaceCall { destination, reply } => {
            let _ = reply.send(controller.place_call(&destination));
        }
        Command::AcceptCall { call, reply } => {
            let _ = reply.send(controller.accept_call(call));
        }
        Command::TerminateCall { call, reply } => {
            let _ = reply.send(controller.terminate_call(call));
        }
        Command::Shutdown { cancel, reply } => {
            info!("Stopping event pump for shutdown");
            let _ = reply.send(controller.shutdown_with(&cancel).await);
            return true;
        }
    }
    false
}

/// Cloneable handle to a running session task
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    emitter: Arc<EventEmitter>,
}

impl SessionHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> SessionResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SessionError::ServiceStopped)?;
        response.await.map_err(|_| SessionError::ServiceStopped)
    }

    /// Register the identity; the event pump starts on success
    pub async fn start(&self) -> SessionResult<()> {
        self.request(|reply| Command::Start { reply }).await?
    }

    pub async fn state(&self) -> SessionResult<ControllerState> {
        self.request(|reply| Command::State { reply }).await
    }

    pub async fn registration_state(&self) -> SessionResult<Option<RegistrationState>> {
        self.request(|reply| Command::RegistrationState { reply }).await
    }

    pub async fn place_call(&self, destination: impl Into<String>) -> SessionResult<CallId> {
        let destination = destination.into();
        self.request(|reply| Command::PlaceCall { destination, reply })
            .await?
    }

    pub async fn accept_call(&self, call: CallId) -> SessionResult<()> {
        self.request(|reply| Command::AcceptCall { call, reply }).await?
    }

    pub async fn terminate_call(&self, call: CallId) -> SessionResult<()> {
        self.request(|reply| Command::TerminateCall { call, reply }).await?
    }

    /// Stop the pump, shut the session down and end the task
    pub async fn shutdown(&self) -> SessionResult<ShutdownOutcome> {
        self.shutdown_with(CancellationToken::new()).await
    }

    /// Like [`shutdown`](Self::shutdown), but `cancel` can end the wait early
    pub async fn shutdown_with(&self, cancel: CancellationToken) -> SessionResult<ShutdownOutcome> {
        self.request(|reply| Command::Shutdown { cancel, reply }).await?
    }

    /// Whether the session task is still accepting commands
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

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
}
