//! In-process simulated SIP engine
//!
//! A scripted stand-in for the native engine. It speaks the same native state
//! codes and honours the same threading contract: nothing happens until
//! `iterate()` is called, and every callback fires from inside it.
//!
//! The registrar's answer is chosen with [`RegistrarBehavior`]; `latency`
//! is the number of extra `iterate()` calls before a REGISTER or
//! de-REGISTER completes. A [`SimulatedMonitor`] shared with the factory lets
//! tests observe the engine and inject incoming calls.
//!
//! ```rust
//! use sipline_session_controller::sim::{RegistrarBehavior, SimulatedEngineFactory};
//!
//! let factory = SimulatedEngineFactory::new(RegistrarBehavior::Accept).with_latency(2);
//! let monitor = factory.monitor();
//! assert_eq!(monitor.iterations(), 0);
//! assert!(!monitor.is_released());
//! ```

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, Level};

use crate::address::SipAddress;
use crate::config::EngineConfig;
use crate::engine::{
    native, AuthInfo, CallId, EngineError, EngineFactory, EngineListener, ProxyConfig, ProxyId,
    SipEngine,
};

/// How the simulated registrar answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrarBehavior {
    /// Accept every REGISTER
    Accept,
    /// Reject every REGISTER with the given reason phrase
    Reject(String),
    /// Never answer; every REGISTER times out
    Unreachable,
    /// Accept registrations but never confirm de-registration
    NeverClear,
    /// Fail the first `failures` REGISTER attempts, then accept
    Flaky { failures: u32 },
}

#[derive(Debug, Default)]
struct MonitorState {
    iterations: AtomicU64,
    released: AtomicBool,
    register_attempts: AtomicU32,
    unregister_requests: AtomicU32,
    log_level: Mutex<Option<Level>>,
    ringback: Mutex<Option<PathBuf>>,
    ring: Mutex<Option<PathBuf>>,
    user_config: Mutex<Option<PathBuf>>,
    auth_infos: Mutex<Vec<AuthInfo>>,
    proxies: Mutex<Vec<ProxyConfig>>,
    incoming: Mutex<VecDeque<String>>,
}

/// Shared view into a simulated engine
#[derive(Debug, Clone, Default)]
pub struct SimulatedMonitor {
    inner: Arc<MonitorState>,
}

impl SimulatedMonitor {
    /// Number of `iterate()` calls so far
    pub fn iterations(&self) -> u64 {
        self.inner.iterations.load(Ordering::SeqCst)
    }

    /// Whether the engine handle has been released
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// REGISTER requests sent, refreshes included
    pub fn register_attempts(&self) -> u32 {
        self.inner.register_attempts.load(Ordering::SeqCst)
    }

    pub fn unregister_requests(&self) -> u32 {
        self.inner.unregister_requests.load(Ordering::SeqCst)
    }

    pub fn log_level(&self) -> Option<Level> {
        *self.inner.log_level.lock()
    }

    pub fn ringback(&self) -> Option<PathBuf> {
        self.inner.ringback.lock().clone()
    }

    pub fn ring(&self) -> Option<PathBuf> {
        self.inner.ring.lock().clone()
    }

    /// User configuration path the engine was created with
    pub fn user_config(&self) -> Option<PathBuf> {
        self.inner.user_config.lock().clone()
    }

    pub fn auth_infos(&self) -> Vec<AuthInfo> {
        self.inner.auth_infos.lock().clone()
    }

    /// Installed proxy configurations, in the order they were added
    pub fn proxies(&self) -> Vec<ProxyConfig> {
        self.inner.proxies.lock().clone()
    }

    /// Queue an incoming call; it arrives on the next `iterate()`
    pub fn inject_incoming_call(&self, from: impl Into<String>) {
        self.inner.incoming.lock().push_back(from.into());
    }
}

/// Factory producing [`SimulatedEngine`]s
#[derive(Debug, Clone)]
pub struct SimulatedEngineFactory {
    behavior: RegistrarBehavior,
    latency: u32,
    failure: Option<String>,
    proxy_limit: Option<usize>,
    monitor: SimulatedMonitor,
}

impl SimulatedEngineFactory {
    pub fn new(behavior: RegistrarBehavior) -> Self {
        Self {
            behavior,
            latency: 0,
            failure: None,
            proxy_limit: None,
            monitor: SimulatedMonitor::default(),
        }
    }

    /// Extra iterations before a REGISTER or de-REGISTER completes
    pub fn with_latency(mut self, iterations: u32) -> Self {
        self.latency = iterations;
        self
    }

    /// Make engine creation fail with `reason`
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    /// Refuse proxy configurations once `limit` are installed
    pub fn with_proxy_limit(mut self, limit: usize) -> Self {
        self.proxy_limit = Some(limit);
        self
    }

    pub fn monitor(&self) -> SimulatedMonitor {
        self.monitor.clone()
    }
}

impl EngineFactory for SimulatedEngineFactory {
    fn create(
        &self,
        config: EngineConfig,
        listener: Box<dyn EngineListener>,
    ) -> Result<Box<dyn SipEngine>, EngineError> {
        if let Some(reason) = &self.failure {
            return Err(EngineError::Unavailable {
                reason: reason.clone(),
            });
        }

        *self.monitor.inner.user_config.lock() = Some(config.user_config_path().to_path_buf());
        debug!(
            behavior = ?self.behavior,
            latency = self.latency,
            factory = %config.factory_config_path().display(),
            "Created simulated SIP engine"
        );

        Ok(Box::new(SimulatedEngine {
            listener,
            behavior: self.behavior.clone(),
            latency: self.latency,
            proxy_limit: self.proxy_limit,
            monitor: self.monitor.clone(),
            proxies: Vec::new(),
            next_proxy: 1,
            default_proxy: None,
            calls: Vec::new(),
            next_call: 1,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transaction {
    Register { remaining: u32, announced: bool },
    Unregister { remaining: u32 },
}

#[derive(Debug)]
struct SimulatedProxy {
    id: ProxyId,
    register_enabled: bool,
    state: i32,
    pending: Option<Transaction>,
}

#[derive(Debug)]
struct SimulatedCall {
    id: CallId,
    incoming: bool,
    state: i32,
    script: VecDeque<(i32, &'static str)>,
}

/// Scripted engine; see the module documentation
pub struct SimulatedEngine {
    listener: Box<dyn EngineListener>,
    behavior: RegistrarBehavior,
    latency: u32,
    proxy_limit: Option<usize>,
    monitor: SimulatedMonitor,
    proxies: Vec<SimulatedProxy>,
    next_proxy: u32,
    default_proxy: Option<ProxyId>,
    calls: Vec<SimulatedCall>,
    next_call: u32,
}

impl SimulatedEngine {
    fn proxy_mut(&mut self, proxy: ProxyId) -> Result<&mut SimulatedProxy, EngineError> {
        self.proxies
            .iter_mut()
            .find(|p| p.id == proxy)
            .ok_or(EngineError::UnknownProxy { proxy })
    }

    fn call_mut(&mut self, call: CallId) -> Result<&mut SimulatedCall, EngineError> {
        self.calls
            .iter_mut()
            .find(|c| c.id == call)
            .ok_or(EngineError::UnknownCall { call })
    }

    fn new_call(&mut self, incoming: bool, state: i32, script: &[(i32, &'static str)]) -> CallId {
        let id = CallId(self.next_call);
        self.next_call += 1;
        self.calls.push(SimulatedCall {
            id,
            incoming,
            state,
            script: script.iter().copied().collect(),
        });
        id
    }

    fn start_register(&mut self, proxy: ProxyId) -> Result<(), EngineError> {
        let latency = self.latency;
        let sim = self.proxy_mut(proxy)?;
        sim.pending = Some(Transaction::Register {
            remaining: latency,
            announced: false,
        });
        self.monitor.inner.register_attempts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Final answer for the REGISTER numbered `attempt`
    fn registrar_answer(behavior: &RegistrarBehavior, attempt: u32) -> (i32, String) {
        match behavior {
            RegistrarBehavior::Accept | RegistrarBehavior::NeverClear => {
                (native::REGISTRATION_OK, "Registration successful".to_string())
            }
            RegistrarBehavior::Reject(reason) => (native::REGISTRATION_FAILED, reason.clone()),
            RegistrarBehavior::Unreachable => (native::REGISTRATION_FAILED, "Request Timeout".to_string()),
            RegistrarBehavior::Flaky { failures } if attempt <= *failures => {
                (native::REGISTRATION_FAILED, "Service Unavailable".to_string())
            }
            RegistrarBehavior::Flaky { .. } => {
                (native::REGISTRATION_OK, "Registration successful".to_string())
            }
        }
    }

    fn pump_registrations(&mut self) {
        let attempt = self.monitor.register_attempts();
        for proxy in self.proxies.iter_mut() {
            let Some(transaction) = proxy.pending else {
                continue;
            };
            match transaction {
                Transaction::Register { remaining, announced } => {
                    if !announced {
                        proxy.state = native::REGISTRATION_PROGRESS;
                        self.listener
                            .on_registration_state_changed(proxy.id, proxy.state, "Registration in progress");
                    }
                    if remaining > 0 {
                        proxy.pending = Some(Transaction::Register {
                            remaining: remaining - 1,
                            announced: true,
                        });
                        continue;
                    }
                    let (state, message) = Self::registrar_answer(&self.behavior, attempt);
                    proxy.state = state;
                    proxy.pending = None;
                    self.listener.on_registration_state_changed(proxy.id, state, &message);
                }
                Transaction::Unregister { remaining } => {
                    if remaining > 0 {
                        proxy.pending = Some(Transaction::Unregister {
                            remaining: remaining - 1,
                        });
                        continue;
                    }
                    if self.behavior == RegistrarBehavior::NeverClear {
                        continue;
                    }
                    proxy.state = native::REGISTRATION_CLEARED;
                    proxy.pending = None;
                    self.listener
                        .on_registration_state_changed(proxy.id, proxy.state, "Unregistration done");
                }
            }
        }
    }

    fn pump_calls(&mut self) {
        for call in self.calls.iter_mut() {
            if let Some((state, message)) = call.script.pop_front() {
                call.state = state;
                self.listener.on_call_state_changed(call.id, state, message);
            }
        }
        self.calls.retain(|call| call.state != native::CALL_RELEASED);
    }
}

const OUTGOING_SCRIPT: &[(i32, &str)] = &[
    (native::CALL_OUTGOING_INIT, "Starting outgoing call"),
    (native::CALL_OUTGOING_PROGRESS, "Outgoing call in progress"),
    (native::CALL_OUTGOING_RINGING, "Remote ringing"),
    (native::CALL_CONNECTED, "Connected"),
    (native::CALL_STREAMS_RUNNING, "Streams running"),
];

const ANSWER_SCRIPT: &[(i32, &str)] = &[
    (native::CALL_CONNECTED, "Connected"),
    (native::CALL_STREAMS_RUNNING, "Streams running"),
];

const HANGUP_SCRIPT: &[(i32, &str)] = &[
    (native::CALL_END, "Call ended"),
    (native::CALL_RELEASED, "Call released"),
];

impl SipEngine for SimulatedEngine {
    fn set_log_level(&mut self, level: Level) {
        *self.monitor.inner.log_level.lock() = Some(level);
    }

    fn set_ringback(&mut self, path: &Path) {
        *self.monitor.inner.ringback.lock() = Some(path.to_path_buf());
    }

    fn set_ring(&mut self, path: &Path) {
        *self.monitor.inner.ring.lock() = Some(path.to_path_buf());
    }

    fn add_auth_info(&mut self, info: AuthInfo) {
        self.monitor.inner.auth_infos.lock().push(info);
    }

    fn remove_auth_info(&mut self, username: &str) {
        self.monitor.inner.auth_infos.lock().retain(|info| info.username != username);
    }

    fn add_proxy_config(&mut self, config: ProxyConfig) -> Result<ProxyId, EngineError> {
        if self.proxy_limit.is_some_and(|limit| self.proxies.len() >= limit) {
            return Err(EngineError::Rejected {
                reason: "too many proxy configurations".to_string(),
            });
        }
        let id = ProxyId(self.next_proxy);
        self.next_proxy += 1;
        let register_enabled = config.register_enabled;
        self.monitor.inner.proxies.lock().push(config);
        self.proxies.push(SimulatedProxy {
            id,
            register_enabled: false,
            state: native::REGISTRATION_NONE,
            pending: None,
        });
        if register_enabled {
            self.set_register_enabled(id, true)?;
        }
        Ok(id)
    }

    fn remove_proxy_config(&mut self, proxy: ProxyId) {
        // Monitor entries are pushed in step with `proxies`
        if let Some(index) = self.proxies.iter().position(|p| p.id == proxy) {
            self.proxies.remove(index);
            self.monitor.inner.proxies.lock().remove(index);
        }
        if self.default_proxy == Some(proxy) {
            self.default_proxy = None;
        }
    }

    fn set_default_proxy(&mut self, proxy: ProxyId) -> Result<(), EngineError> {
        self.proxy_mut(proxy)?;
        self.default_proxy = Some(proxy);
        Ok(())
    }

    fn default_proxy(&self) -> Option<ProxyId> {
        self.default_proxy
    }

    fn set_register_enabled(&mut self, proxy: ProxyId, enabled: bool) -> Result<(), EngineError> {
        let latency = self.latency;
        let sim = self.proxy_mut(proxy)?;
        if sim.register_enabled == enabled {
            return Ok(());
        }
        sim.register_enabled = enabled;

        if enabled {
            self.start_register(proxy)
        } else {
            sim.pending = Some(Transaction::Unregister { remaining: latency });
            self.monitor.inner.unregister_requests.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn refresh_registration(&mut self, proxy: ProxyId) -> Result<(), EngineError> {
        if !self.proxy_mut(proxy)?.register_enabled {
            return Err(EngineError::Rejected {
                reason: format!("registration is disabled on {}", proxy),
            });
        }
        self.start_register(proxy)
    }

    fn registration_state(&self, proxy: ProxyId) -> Option<i32> {
        self.proxies.iter().find(|p| p.id == proxy).map(|p| p.state)
    }

    fn iterate(&mut self) {
        let iteration = self.monitor.inner.iterations.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(iteration, "Simulated engine iterate");

        let incoming: Vec<String> = self.monitor.inner.incoming.lock().drain(..).collect();
        for from in incoming {
            let call = self.new_call(true, native::CALL_INCOMING_RECEIVED, &[]);
            self.listener
                .on_call_state_changed(call, native::CALL_INCOMING_RECEIVED, &format!("Incoming call from {}", from));
        }

        self.pump_registrations();
        self.pump_calls();
    }

    fn invite(&mut self, destination: &str) -> Result<CallId, EngineError> {
        destination
            .parse::<SipAddress>()
            .map_err(|e| EngineError::Rejected { reason: e.to_string() })?;
        Ok(self.new_call(false, native::CALL_IDLE, OUTGOING_SCRIPT))
    }

    fn accept_call(&mut self, call: CallId) -> Result<(), EngineError> {
        let sim = self.call_mut(call)?;
        if !sim.incoming || sim.state != native::CALL_INCOMING_RECEIVED || !sim.script.is_empty() {
            return Err(EngineError::Rejected {
                reason: format!("{} is not waiting to be answered", call),
            });
        }
        sim.script.extend(ANSWER_SCRIPT.iter().copied());
        Ok(())
    }

    fn terminate_call(&mut self, call: CallId) -> Result<(), EngineError> {
        let sim = self.call_mut(call)?;
        sim.script.clear();
        sim.script.extend(HANGUP_SCRIPT.iter().copied());
        Ok(())
    }
}

impl Drop for SimulatedEngine {
    fn drop(&mut self) {
        self.monitor.inner.released.store(true, Ordering::SeqCst);
        debug!(iterations = self.monitor.iterations(), "Simulated SIP engine released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Clone)]
    struct Log {
        registrations: Arc<Mutex<Vec<(ProxyId, i32, String)>>>,
        calls: Arc<Mutex<Vec<(CallId, i32)>>>,
    }

    impl EngineListener for Log {
        fn on_registration_state_changed(&mut self, proxy: ProxyId, state: i32, message: &str) {
            self.registrations.lock().push((proxy, state, message.to_string()));
        }

        fn on_call_state_changed(&mut self, call: CallId, state: i32, _message: &str) {
            self.calls.lock().push((call, state));
        }
    }

    fn engine(behavior: RegistrarBehavior, latency: u32) -> (SimulatedEngine, Log, SimulatedMonitor) {
        let log = Log::default();
        let monitor = SimulatedMonitor::default();
        let engine = SimulatedEngine {
            listener: Box::new(log.clone()),
            behavior,
            latency,
            proxy_limit: None,
            monitor: monitor.clone(),
            proxies: Vec::new(),
            next_proxy: 1,
            default_proxy: None,
            calls: Vec::new(),
            next_call: 1,
        };
        (engine, log, monitor)
    }

    fn proxy_config() -> ProxyConfig {
        ProxyConfig {
            identity: "sip:alice@sip.example.com".to_string(),
            server_addr: "sip.example.com".to_string(),
            register_enabled: false,
            expires: 3600,
        }
    }

    fn registration_codes(log: &Log) -> Vec<i32> {
        log.registrations.lock().iter().map(|(_, state, _)| *state).collect()
    }

    #[test]
    fn test_nothing_happens_without_iterate() {
        let (mut engine, log, _monitor) = engine(RegistrarBehavior::Accept, 0);
        let proxy = engine.add_proxy_config(proxy_config()).unwrap();
        engine.set_register_enabled(proxy, true).unwrap();
        assert!(log.registrations.lock().is_empty());

        engine.iterate();
        assert_eq!(
            registration_codes(&log),
            vec![native::REGISTRATION_PROGRESS, native::REGISTRATION_OK]
        );
    }

    #[test]
    fn test_removed_records_leave_engine() {
        let (mut engine, _log, monitor) = engine(RegistrarBehavior::Accept, 0);
        engine.add_auth_info(AuthInfo::new("alice", "secret"));
        let first = engine.add_proxy_config(proxy_config()).unwrap();
        engine.set_default_proxy(first).unwrap();

        engine.remove_proxy_config(first);
        engine.remove_auth_info("alice");
        assert!(monitor.proxies().is_empty());
        assert!(monitor.auth_infos().is_empty());
        assert_eq!(engine.default_proxy(), None);
        assert!(engine.registration_state(first).is_none());

        let second = engine.add_proxy_config(proxy_config()).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_latency_delays_final_answer() {
        let (mut engine, log, monitor) = engine(RegistrarBehavior::Reject("Forbidden".to_string()), 2);
        let proxy = engine.add_proxy_config(proxy_config()).unwrap();
        engine.set_register_enabled(proxy, true).unwrap();

        engine.iterate();
        engine.iterate();
        assert_eq!(registration_codes(&log), vec![native::REGISTRATION_PROGRESS]);
        engine.iterate();
        assert_eq!(engine.registration_state(proxy), Some(native::REGISTRATION_FAILED));
        assert_eq!(log.registrations.lock()[1].2, "Forbidden");
        assert_eq!(monitor.iterations(), 3);
    }

    #[test]
    fn test_unregister_clears_unless_never_clear() {
        let (mut engine, log, monitor) = engine(RegistrarBehavior::Accept, 0);
        let proxy = engine.add_proxy_config(proxy_config()).unwrap();
        engine.set_register_enabled(proxy, true).unwrap();
        engine.iterate();
        engine.set_register_enabled(proxy, false).unwrap();
        engine.iterate();
        assert_eq!(engine.registration_state(proxy), Some(native::REGISTRATION_CLEARED));
        assert_eq!(registration_codes(&log).last(), Some(&native::REGISTRATION_CLEARED));
        assert_eq!(monitor.unregister_requests(), 1);

        let (mut engine, _log, _monitor) = engine_never_clear();
        let proxy = engine.add_proxy_config(proxy_config()).unwrap();
        engine.set_register_enabled(proxy, true).unwrap();
        engine.iterate();
        engine.set_register_enabled(proxy, false).unwrap();
        for _ in 0..10 {
            engine.iterate();
        }
        assert_eq!(engine.registration_state(proxy), Some(native::REGISTRATION_OK));
    }

    fn engine_never_clear() -> (SimulatedEngine, Log, SimulatedMonitor) {
        engine(RegistrarBehavior::NeverClear, 0)
    }

    #[test]
    fn test_flaky_registrar_accepts_after_failures() {
        let (mut engine, _log, monitor) = engine(RegistrarBehavior::Flaky { failures: 1 }, 0);
        let proxy = engine.add_proxy_config(proxy_config()).unwrap();
        engine.set_register_enabled(proxy, true).unwrap();
        engine.iterate();
        assert_eq!(engine.registration_state(proxy), Some(native::REGISTRATION_FAILED));

        engine.refresh_registration(proxy).unwrap();
        engine.iterate();
        assert_eq!(engine.registration_state(proxy), Some(native::REGISTRATION_OK));
        assert_eq!(monitor.register_attempts(), 2);
    }

    #[test]
    fn test_outgoing_call_script() {
        let (mut engine, log, _monitor) = engine(RegistrarBehavior::Accept, 0);
        let call = engine.invite("sip:bob@example.org").unwrap();
        for _ in 0..5 {
            engine.iterate();
        }
        let states: Vec<i32> = log.calls.lock().iter().map(|(_, s)| *s).collect();
        assert_eq!(
            states,
            vec![
                native::CALL_OUTGOING_INIT,
                native::CALL_OUTGOING_PROGRESS,
                native::CALL_OUTGOING_RINGING,
                native::CALL_CONNECTED,
                native::CALL_STREAMS_RUNNING,
            ]
        );

        engine.terminate_call(call).unwrap();
        engine.iterate();
        engine.iterate();
        assert_eq!(log.calls.lock().last(), Some(&(call, native::CALL_RELEASED)));
        assert_eq!(
            engine.terminate_call(call),
            Err(EngineError::UnknownCall { call })
        );
    }

    #[test]
    fn test_invite_rejects_malformed_destination() {
        let (mut engine, _log, _monitor) = engine(RegistrarBehavior::Accept, 0);
        assert!(matches!(engine.invite("bob"), Err(EngineError::Rejected { .. })));
    }

    #[test]
    fn test_incoming_call_can_be_answered() {
        let (mut engine, log, monitor) = engine(RegistrarBehavior::Accept, 0);
        monitor.inject_incoming_call("sip:carol@example.org");
        engine.iterate();

        let (call, state) = log.calls.lock()[0];
        assert_eq!(state, native::CALL_INCOMING_RECEIVED);
        engine.accept_call(call).unwrap();
        assert!(engine.accept_call(call).is_err());

        engine.iterate();
        engine.iterate();
        assert_eq!(log.calls.lock().last(), Some(&(call, native::CALL_STREAMS_RUNNING)));
    }

    #[test]
    fn test_drop_marks_released() {
        let (engine, _log, monitor) = engine(RegistrarBehavior::Accept, 0);
        drop(engine);
        assert!(monitor.is_released());
    }
}
