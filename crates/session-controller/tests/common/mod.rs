//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::fs;
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use sipline_session_controller::events::{RegistrationStatusInfo, SessionEvent, SessionEventHandler};
use sipline_session_controller::sim::{RegistrarBehavior, SimulatedEngineFactory, SimulatedMonitor};
use sipline_session_controller::{
    AppDirs, AudioAssets, ControllerOptions, RegistrationState, SessionController,
};

/// Application directories populated with a factory template, secrets and assets
pub struct SessionFixture {
    pub documents: TempDir,
    pub bundle: TempDir,
}

impl SessionFixture {
    /// Fixture with the given `[session]` settings and an `alice` account
    pub fn new(session_settings: &str) -> Self {
        Self::with_account(session_settings, "alice", "sip.example.com")
    }

    /// Retry jitter is off unless `session_settings` turns it on, so retry
    /// delays are exact.
    pub fn with_account(session_settings: &str, account: &str, domain: &str) -> Self {
        let jitter = if session_settings.contains("retry_jitter") {
            ""
        } else {
            "retry_jitter=false\n"
        };
        let documents = TempDir::new().unwrap();
        let bundle = TempDir::new().unwrap();

        fs::write(
            bundle.path().join("linphonerc-factory"),
            format!("[sip]\nsip_port=5060\n\n[session]\n{}{}\n", jitter, session_settings),
        )
        .unwrap();
        fs::write(
            bundle.path().join("Secret.toml"),
            format!(
                "account = \"{}\"\npassword = \"secret\"\ndomain = \"{}\"\n",
                account, domain
            ),
        )
        .unwrap();
        fs::write(bundle.path().join("ringback.wav"), b"RIFF").unwrap();
        fs::write(bundle.path().join("toy-mono.wav"), b"RIFF").unwrap();

        Self { documents, bundle }
    }

    pub fn options(&self) -> ControllerOptions {
        let dirs = AppDirs::new(self.documents.path(), self.bundle.path());
        let assets = AudioAssets::from_bundle(&dirs, "ringback.wav", "toy-mono.wav").unwrap();
        ControllerOptions::new(dirs, self.bundle.path().join("Secret.toml"), assets)
    }

    /// Controller over a simulated engine with the given behaviour and latency
    pub fn controller(&self, behavior: RegistrarBehavior, latency: u32) -> (SessionController, SimulatedMonitor) {
        let factory = SimulatedEngineFactory::new(behavior).with_latency(latency);
        let monitor = factory.monitor();
        let controller = SessionController::new(self.options(), &factory).unwrap();
        (controller, monitor)
    }
}

/// Handler recording every event it sees
#[derive(Default)]
pub struct EventRecorder {
    pub events: Mutex<Vec<SessionEvent>>,
}

impl EventRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn registration_states(&self) -> Vec<RegistrationState> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SessionEvent::RegistrationStateChanged(RegistrationStatusInfo { state, .. }) => Some(*state),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&SessionEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }
}

impl SessionEventHandler for EventRecorder {
    fn on_session_event(&self, event: &SessionEvent) {
        self.events.lock().push(event.clone());
    }
}
