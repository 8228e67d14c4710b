//! Configuration loading
//!
//! The engine is configured from two files: a read-only factory template that
//! ships with the application and a writable per-install file that lives in
//! the application's private document directory. The factory template is
//! mandatory. The user file may not exist yet; the engine creates it on first
//! write.
//!
//! Both files are merged into one [`EngineConfig`], user values overriding
//! factory values. The format is chosen by extension: `.toml`, `.json`, and
//! anything else is read as an INI-style rc file.
//!
//! ```text
//!   bundle_dir/linphonerc-factory ──┐
//!                                   ├──► EngineConfig ──► SessionSettings ([session])
//!   documents_dir/linphonerc ───────┘          │
//!                                              └──► engine keys (sip.*, rtp.*, ...)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use sipline_session_controller::config::{AppDirs, ConfigLoader};
//!
//! let dirs = AppDirs::new("/var/lib/sipline", "/usr/share/sipline");
//! let config = ConfigLoader::new(dirs).load("linphonerc", "linphonerc-factory")?;
//! let settings = config.settings()?;
//! assert!(settings.shutdown_timeout().as_millis() > 0);
//! # Ok::<(), sipline_session_controller::SessionError>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::{debug, Level};

use crate::error::{SessionError, SessionResult};
use crate::logging::parse_log_level;
use crate::recovery::RetryPolicy;

/// Application directories used to resolve configuration and assets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDirs {
    /// Private, writable document directory
    pub documents_dir: PathBuf,
    /// Read-only bundled resources
    pub bundle_dir: PathBuf,
}

impl AppDirs {
    pub fn new(documents_dir: impl Into<PathBuf>, bundle_dir: impl Into<PathBuf>) -> Self {
        Self {
            documents_dir: documents_dir.into(),
            bundle_dir: bundle_dir.into(),
        }
    }

    /// Path of a file in the document directory
    pub fn document_file(&self, name: &str) -> PathBuf {
        self.documents_dir.join(name)
    }

    /// Path of a file in the bundled resources
    pub fn bundle_file(&self, name: &str) -> PathBuf {
        self.bundle_dir.join(name)
    }
}

/// Resolved locations of the two configuration layers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    pub user_config: PathBuf,
    pub factory_config: PathBuf,
}

/// Merged engine configuration
///
/// Created once by the [`ConfigLoader`] and moved into the engine when the
/// controller is constructed.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    paths: ConfigPaths,
    merged: Config,
}

impl EngineConfig {
    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    pub fn user_config_path(&self) -> &Path {
        &self.paths.user_config
    }

    pub fn factory_config_path(&self) -> &Path {
        &self.paths.factory_config
    }

    /// Raw engine setting, e.g. `sip.sip_port`
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.merged.get_string(key).ok()
    }

    /// Session settings from the `[session]` section
    ///
    /// Missing keys, or a missing section, fall back to defaults.
    pub fn settings(&self) -> SessionResult<SessionSettings> {
        match self.merged.get::<SessionSettings>("session") {
            Ok(settings) => settings.validated(),
            Err(ConfigError::NotFound(_)) => Ok(SessionSettings::default()),
            Err(e) => Err(SessionError::config(format!("invalid [session] section: {}", e))),
        }
    }
}

/// Timing and policy settings of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Interval of the periodic event pump
    pub iterate_interval_ms: u64,
    /// Sleep between polls while waiting for de-registration
    pub shutdown_poll_interval_ms: u64,
    /// Upper bound on the de-registration wait
    pub shutdown_timeout_ms: u64,
    /// Requested registration lifetime in seconds
    pub registration_expires: u32,
    /// Re-registration attempts after a failure before giving up
    pub retry_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_backoff_multiplier: f64,
    /// Spread retry delays by up to 10% either way
    pub retry_jitter: bool,
    /// Verbosity of the engine's own diagnostics
    pub log_level: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            iterate_interval_ms: 20,
            shutdown_poll_interval_ms: 50,
            shutdown_timeout_ms: 5_000,
            registration_expires: 3600,
            retry_max_attempts: 3,
            retry_initial_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            retry_backoff_multiplier: 2.0,
            retry_jitter: true,
            log_level: "info".to_string(),
        }
    }
}

impl SessionSettings {
    pub fn iterate_interval(&self) -> Duration {
        Duration::from_millis(self.iterate_interval_ms)
    }

    pub fn shutdown_poll_interval(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Retry policy for failed registrations
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            backoff_multiplier: self.retry_backoff_multiplier,
            use_jitter: self.retry_jitter,
        }
    }

    /// Parse `log_level` into a tracing level
    pub fn engine_log_level(&self) -> SessionResult<Level> {
        parse_log_level(&self.log_level)
    }

    fn validated(self) -> SessionResult<Self> {
        if self.iterate_interval_ms == 0 {
            return Err(SessionError::config("iterate_interval_ms must be greater than zero"));
        }
        if self.shutdown_poll_interval_ms == 0 {
            return Err(SessionError::config(
                "shutdown_poll_interval_ms must be greater than zero",
            ));
        }
        if self.retry_backoff_multiplier < 1.0 {
            return Err(SessionError::config("retry_backoff_multiplier must be at least 1.0"));
        }
        self.engine_log_level()?;
        Ok(self)
    }
}

/// Resolves and merges the factory template and the user configuration
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    dirs: AppDirs,
}

impl ConfigLoader {
    pub fn new(dirs: AppDirs) -> Self {
        Self { dirs }
    }

    /// Resolve both configuration paths without reading them
    ///
    /// The factory template must be a readable file. The user configuration
    /// only needs a document directory to live in.
    pub fn resolve(&self, user_config_name: &str, factory_config_name: &str) -> SessionResult<ConfigPaths> {
        let factory_config = self.dirs.bundle_file(factory_config_name);
        if !factory_config.is_file() {
            return Err(SessionError::config(format!(
                "factory configuration not found: {}",
                factory_config.display()
            )));
        }
        std::fs::File::open(&factory_config).map_err(|e| {
            SessionError::config(format!(
                "factory configuration {} is not readable: {}",
                factory_config.display(),
                e
            ))
        })?;

        if !self.dirs.documents_dir.is_dir() {
            return Err(SessionError::config(format!(
                "document directory does not exist: {}",
                self.dirs.documents_dir.display()
            )));
        }
        let user_config = self.dirs.document_file(user_config_name);
        if user_config.exists() && !user_config.is_file() {
            return Err(SessionError::config(format!(
                "user configuration {} is not a file",
                user_config.display()
            )));
        }

        Ok(ConfigPaths {
            user_config,
            factory_config,
        })
    }

    /// Resolve and merge both configuration layers
    pub fn load(&self, user_config_name: &str, factory_config_name: &str) -> SessionResult<EngineConfig> {
        let paths = self.resolve(user_config_name, factory_config_name)?;
        Self::load_paths(paths)
    }

    /// Merge already resolved configuration layers
    pub fn load_paths(paths: ConfigPaths) -> SessionResult<EngineConfig> {
        debug!(
            factory = %paths.factory_config.display(),
            user = %paths.user_config.display(),
            user_exists = paths.user_config.exists(),
            "Loading engine configuration"
        );

        let merged = Config::builder()
            .add_source(File::from(paths.factory_config.as_path()).format(file_format(&paths.factory_config)))
            .add_source(
                File::from(paths.user_config.as_path())
                    .format(file_format(&paths.user_config))
                    .required(false),
            )
            .build()
            .map_err(|e| SessionError::config(format!("failed to load configuration: {}", e)))?;

        Ok(EngineConfig { paths, merged })
    }
}

/// Bundled audio assets handed to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioAssets {
    /// Tone played while the remote party is ringing
    pub ringback: PathBuf,
    /// Tone played locally on incoming calls
    pub ring: PathBuf,
}

impl AudioAssets {
    /// Resolve both assets in the bundle directory
    pub fn from_bundle(dirs: &AppDirs, ringback_name: &str, ring_name: &str) -> SessionResult<Self> {
        let ringback = dirs.bundle_file(ringback_name);
        let ring = dirs.bundle_file(ring_name);
        for asset in [&ringback, &ring] {
            if !asset.is_file() {
                return Err(SessionError::config(format!(
                    "audio asset not found: {}",
                    asset.display()
                )));
            }
        }
        Ok(Self { ringback, ring })
    }
}

fn file_format(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => FileFormat::Toml,
        Some("json") => FileFormat::Json,
        _ => FileFormat::Ini,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn dirs() -> (TempDir, TempDir, AppDirs) {
        let documents = TempDir::new().unwrap();
        let bundle = TempDir::new().unwrap();
        let dirs = AppDirs::new(documents.path(), bundle.path());
        (documents, bundle, dirs)
    }

    #[test]
    fn test_missing_factory_template_is_fatal() {
        let (_d, _b, dirs) = dirs();
        let err = ConfigLoader::new(dirs).load("linphonerc", "linphonerc-factory").unwrap_err();
        assert!(matches!(err, SessionError::Configuration { .. }));
        assert!(err.to_string().contains("factory configuration not found"));
    }

    #[test]
    fn test_missing_user_config_is_allowed() {
        let (_d, bundle, dirs) = dirs();
        fs::write(bundle.path().join("linphonerc-factory"), "[sip]\nsip_port=5060\n").unwrap();

        let config = ConfigLoader::new(dirs.clone()).load("linphonerc", "linphonerc-factory").unwrap();
        assert_eq!(config.user_config_path(), dirs.document_file("linphonerc"));
        assert_eq!(config.get_string("sip.sip_port").as_deref(), Some("5060"));
        assert_eq!(config.settings().unwrap(), SessionSettings::default());
    }

    #[test]
    fn test_missing_documents_dir_is_fatal() {
        let bundle = TempDir::new().unwrap();
        fs::write(bundle.path().join("linphonerc-factory"), "[sip]\n").unwrap();
        let dirs = AppDirs::new(bundle.path().join("no-such-dir"), bundle.path());

        let err = ConfigLoader::new(dirs).load("linphonerc", "linphonerc-factory").unwrap_err();
        assert!(err.to_string().contains("document directory does not exist"));
    }

    #[test]
    fn test_user_config_overrides_factory() {
        let (documents, bundle, dirs) = dirs();
        fs::write(
            bundle.path().join("linphonerc-factory"),
            "[sip]\nsip_port=5060\n\n[session]\nshutdown_timeout_ms=8000\niterate_interval_ms=20\n",
        )
        .unwrap();
        fs::write(
            documents.path().join("linphonerc"),
            "[sip]\nsip_port=5070\n\n[session]\nshutdown_timeout_ms=1500\n",
        )
        .unwrap();

        let config = ConfigLoader::new(dirs).load("linphonerc", "linphonerc-factory").unwrap();
        assert_eq!(config.get_string("sip.sip_port").as_deref(), Some("5070"));

        let settings = config.settings().unwrap();
        assert_eq!(settings.shutdown_timeout(), Duration::from_millis(1500));
        assert_eq!(settings.iterate_interval(), Duration::from_millis(20));
        assert_eq!(settings.shutdown_poll_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_toml_factory_template() {
        let (_d, bundle, dirs) = dirs();
        fs::write(
            bundle.path().join("factory.toml"),
            "[session]\nretry_max_attempts = 5\nlog_level = \"debug\"\n",
        )
        .unwrap();

        let config = ConfigLoader::new(dirs).load("user.toml", "factory.toml").unwrap();
        let settings = config.settings().unwrap();
        assert_eq!(settings.retry_max_attempts, 5);
        assert_eq!(settings.engine_log_level().unwrap(), Level::DEBUG);
        assert_eq!(settings.retry_policy().max_attempts, 5);
        assert!(settings.retry_policy().use_jitter);
    }

    #[test]
    fn test_retry_jitter_setting() {
        let (_d, bundle, dirs) = dirs();
        fs::write(
            bundle.path().join("linphonerc-factory"),
            "[session]\nretry_jitter=false\nretry_initial_delay_ms=250\n",
        )
        .unwrap();

        let config = ConfigLoader::new(dirs).load("linphonerc", "linphonerc-factory").unwrap();
        let policy = config.settings().unwrap().retry_policy();
        assert!(!policy.use_jitter);
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
        assert!(SessionSettings::default().retry_policy().use_jitter);
    }

    #[test]
    fn test_invalid_session_settings_rejected() {
        let (_d, bundle, dirs) = dirs();
        fs::write(
            bundle.path().join("factory.toml"),
            "[session]\nshutdown_poll_interval_ms = 0\n",
        )
        .unwrap();

        let config = ConfigLoader::new(dirs).load("user.toml", "factory.toml").unwrap();
        assert!(config.settings().is_err());
    }

    #[test]
    fn test_audio_assets_must_exist() {
        let (_d, bundle, dirs) = dirs();
        fs::write(bundle.path().join("ringback.wav"), b"RIFF").unwrap();

        let err = AudioAssets::from_bundle(&dirs, "ringback.wav", "toy-mono.wav").unwrap_err();
        assert!(err.to_string().contains("toy-mono.wav"));

        fs::write(bundle.path().join("toy-mono.wav"), b"RIFF").unwrap();
        let assets = AudioAssets::from_bundle(&dirs, "ringback.wav", "toy-mono.wav").unwrap();
        assert_eq!(assets.ring, bundle.path().join("toy-mono.wav"));
    }
}
