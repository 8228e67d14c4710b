//! Identity resolution
//!
//! Turns the credential record from the secret store into the two records the
//! engine needs before it can register: an [`AuthInfo`] that answers digest
//! challenges and a [`ProxyConfig`] that binds the identity to a registrar.
//!
//! The registrar address is taken from the identity's domain. There is no
//! separate proxy setting; deployments whose registrar differs from their SIP
//! domain are not supported.
//!
//! # Example
//!
//! ```rust
//! use sipline_session_controller::identity::{CredentialRecord, IdentityResolver};
//!
//! let record = CredentialRecord::new("alice", "secret", "sip.example.com");
//! let resolved = IdentityResolver::new(3600).resolve(&record).unwrap();
//!
//! assert_eq!(resolved.proxy.identity, "sip:alice@sip.example.com");
//! assert_eq!(resolved.proxy.server_addr, "sip.example.com");
//! assert!(!resolved.proxy.register_enabled);
//! assert_eq!(resolved.auth.username, "alice");
//! ```

use std::fmt;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, error};

use crate::address::SipAddress;
use crate::engine::{AuthInfo, ProxyConfig};
use crate::error::{SessionError, SessionResult};

/// Account credentials read from the secret store
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct CredentialRecord {
    pub account: String,
    pub password: String,
    pub domain: String,
}

impl CredentialRecord {
    pub fn new(
        account: impl Into<String>,
        password: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            password: password.into(),
            domain: domain.into(),
        }
    }

    /// Read the record from a secret store file
    ///
    /// `.json` files are read as JSON, everything else as TOML. The file must
    /// contain the keys `account`, `password` and `domain`.
    pub fn load(path: &Path) -> SessionResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SessionError::credentials(format!("cannot read {}: {}", path.display(), e))
        })?;

        let is_json = path.extension().and_then(|ext| ext.to_str()) == Some("json");
        let record: CredentialRecord = if is_json {
            serde_json::from_str(&contents).map_err(|e| {
                SessionError::credentials(format!("invalid secret store {}: {}", path.display(), e))
            })?
        } else {
            toml::from_str(&contents).map_err(|e| {
                SessionError::credentials(format!("invalid secret store {}: {}", path.display(), e))
            })?
        };

        debug!(path = %path.display(), account = %record.account, "Loaded credential record");
        Ok(record)
    }

    /// The identity URI this record stands for
    pub fn identity(&self) -> String {
        format!("sip:{}@{}", self.account, self.domain)
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("account", &self.account)
            .field("password", &"<redacted>")
            .field("domain", &self.domain)
            .finish()
    }
}

/// Records produced by identity resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub proxy: ProxyConfig,
    pub auth: AuthInfo,
}

/// Builds proxy and authentication records from a credential record
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    expires: u32,
}

impl IdentityResolver {
    /// Create a resolver whose proxy configurations request `expires` seconds
    pub fn new(expires: u32) -> Self {
        Self { expires }
    }

    /// Resolve a credential record
    ///
    /// Registration is left disabled on the returned proxy configuration;
    /// the caller enables it once the proxy has been added to the engine.
    pub fn resolve(&self, record: &CredentialRecord) -> SessionResult<ResolvedIdentity> {
        let identity = record.identity();

        let address: SipAddress = identity.parse().map_err(|e: crate::address::AddressError| {
            error!(
                identity = %identity,
                reason = e.reason,
                "{} not a valid sip uri, must be like sip:user@domain",
                identity
            );
            SessionError::invalid_identity(&identity, e.reason)
        })?;

        let username = address.username().to_string();
        let server_addr = address.hostport().to_string();
        drop(address);

        debug!(identity = %identity, server = %server_addr, "Resolved SIP identity");

        Ok(ResolvedIdentity {
            proxy: ProxyConfig {
                identity,
                server_addr,
                register_enabled: false,
                expires: self.expires,
            },
            auth: AuthInfo::new(username, record.password.clone()),
        })
    }
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new(3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_valid_identity() {
        let record = CredentialRecord::new("alice", "secret", "sip.example.com");
        let resolved = IdentityResolver::default().resolve(&record).unwrap();

        assert_eq!(resolved.proxy.identity, "sip:alice@sip.example.com");
        assert_eq!(resolved.proxy.server_addr, "sip.example.com");
        assert_eq!(resolved.proxy.expires, 3600);
        assert!(!resolved.proxy.register_enabled);
        assert_eq!(resolved.auth, AuthInfo::new("alice", "secret"));
        assert!(resolved.auth.realm.is_none());
    }

    #[test]
    fn test_resolve_keeps_domain_as_registrar() {
        let pairs = [
            ("0702552520", "sip.example.com"),
            ("alice", "192.168.1.10"),
            ("carol", "[2001:db8::1]"),
            ("bob.smith", "pbx-01.voip.example-corp.net"),
            ("alice", "sip.example.com:5070"),
            ("dave", "[2001:db8::1]:5062"),
            ("erin", "example.org:05060"),
        ];

        for (account, domain) in pairs {
            let record = CredentialRecord::new(account, "secret", domain);
            let resolved = IdentityResolver::default().resolve(&record).unwrap();

            assert_eq!(resolved.proxy.identity, format!("sip:{}@{}", account, domain));
            assert_eq!(resolved.proxy.server_addr, domain);
            assert_eq!(resolved.auth.username, account);
        }
    }

    #[test]
    fn test_resolve_rejects_empty_account() {
        let record = CredentialRecord::new("", "secret", "sip.example.com");
        match IdentityResolver::default().resolve(&record) {
            Err(SessionError::InvalidIdentity { identity, .. }) => {
                assert_eq!(identity, "sip:@sip.example.com");
            }
            other => panic!("expected InvalidIdentity, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_rejects_bad_domain() {
        for domain in ["exa mple.com", "example.com/path", "", "under_score.net"] {
            let record = CredentialRecord::new("alice", "secret", domain);
            assert!(
                matches!(
                    IdentityResolver::default().resolve(&record),
                    Err(SessionError::InvalidIdentity { .. })
                ),
                "domain {:?} should be rejected",
                domain
            );
        }
    }

    #[test]
    fn test_load_toml_and_json_records() {
        let dir = TempDir::new().unwrap();
        let toml_path = dir.path().join("Secret.toml");
        fs::write(
            &toml_path,
            "account = \"alice\"\npassword = \"secret\"\ndomain = \"sip.example.com\"\n",
        )
        .unwrap();
        let json_path = dir.path().join("Secret.json");
        fs::write(
            &json_path,
            r#"{"account": "bob", "password": "pw", "domain": "example.org"}"#,
        )
        .unwrap();

        let alice = CredentialRecord::load(&toml_path).unwrap();
        assert_eq!(alice, CredentialRecord::new("alice", "secret", "sip.example.com"));
        let bob = CredentialRecord::load(&json_path).unwrap();
        assert_eq!(bob.identity(), "sip:bob@example.org");
    }

    #[test]
    fn test_load_incomplete_record_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Secret.toml");
        fs::write(&path, "account = \"alice\"\n").unwrap();

        let err = CredentialRecord::load(&path).unwrap_err();
        assert!(matches!(err, SessionError::Credentials { .. }));
        assert!(matches!(
            CredentialRecord::load(&dir.path().join("missing.toml")),
            Err(SessionError::Credentials { .. })
        ));
    }

    #[test]
    fn test_debug_redacts_password() {
        let record = CredentialRecord::new("alice", "hunter2", "example.com");
        assert!(!format!("{:?}", record).contains("hunter2"));
    }
}
