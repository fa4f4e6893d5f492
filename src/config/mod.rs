//! Configuration
//!
//! Settings are read from a TOML file with `FIXIP__`-prefixed environment
//! overrides (e.g. `FIXIP__INTERCEPT__PORT=8442`, or a comma-separated
//! `FIXIP__INTERCEPT__TRUSTED=10.0.0.0/8,127.0.0.1`) and validated into
//! immutable runtime values before any connection is accepted.
//!
//! ```toml
//! [intercept]
//! port = 442
//! trusted = ["192.168.0.0/16", "127.0.0.1"]
//!
//! [[listener]]
//! bind = "0.0.0.0:442"
//! scrub_fallback_header = true
//! ```

mod intercept;

pub use intercept::InterceptConfig;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use hyper::header::HeaderName;
use serde::Deserialize;

use crate::policy::InterceptPolicy;
use crate::trust::{InvalidSubnet, TrustStore};

/// Top-level settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub intercept: InterceptConfig,

    #[serde(rename = "listener")]
    pub listeners: Vec<ListenerConfig>,
}

/// One `[[listener]]` entry, a logical server scope
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub bind: SocketAddr,

    /// Overrides `intercept.scrub_fallback_header` for this listener
    #[serde(default)]
    pub scrub_fallback_header: Option<bool>,
}

/// A validated listener ready to be bound
#[derive(Debug, Clone)]
pub struct ListenerScope {
    pub bind: SocketAddr,
    pub policy: Arc<InterceptPolicy>,
}

/// Errors that can occur while loading or validating settings
#[derive(Debug)]
pub enum SettingsError {
    /// Configuration file or environment could not be read
    Load(config::ConfigError),
    /// TOML text could not be parsed
    Parse(toml::de::Error),
    /// Trusted subnet literal is not an address or network
    InvalidSubnet(InvalidSubnet),
    /// Intercept port outside 1..=65535
    InvalidPort(u16),
    /// Intercept read timeout of zero seconds
    InvalidTimeout(u64),
    /// Fallback header is not a valid header name
    InvalidHeaderName(String),
    /// Nothing to listen on
    NoListeners,
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::Load(e) => write!(f, "failed to load configuration: {}", e),
            SettingsError::Parse(e) => write!(f, "failed to parse configuration: {}", e),
            SettingsError::InvalidSubnet(e) => write!(f, "invalid trusted subnet: {}", e),
            SettingsError::InvalidPort(port) => {
                write!(f, "invalid intercept port {}: expected 1-65535", port)
            }
            SettingsError::InvalidTimeout(secs) => {
                write!(f, "invalid intercept timeout {}: expected at least 1 second", secs)
            }
            SettingsError::InvalidHeaderName(name) => {
                write!(f, "invalid fallback header name {:?}", name)
            }
            SettingsError::NoListeners => write!(f, "no listeners configured"),
        }
    }
}

impl std::error::Error for SettingsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SettingsError::Load(e) => Some(e),
            SettingsError::Parse(e) => Some(e),
            SettingsError::InvalidSubnet(e) => Some(e),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for SettingsError {
    fn from(e: config::ConfigError) -> Self {
        SettingsError::Load(e)
    }
}

impl From<toml::de::Error> for SettingsError {
    fn from(e: toml::de::Error) -> Self {
        SettingsError::Parse(e)
    }
}

impl From<InvalidSubnet> for SettingsError {
    fn from(e: InvalidSubnet) -> Self {
        SettingsError::InvalidSubnet(e)
    }
}

impl Settings {
    /// Load settings from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        Self::load_with(path, Self::environment())
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix("FIXIP")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("intercept.trusted")
    }

    fn load_with(path: &Path, env: config::Environment) -> Result<Self, SettingsError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(env)
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Parse settings from TOML text without environment overrides.
    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        Ok(toml::from_str(text)?)
    }

    /// Build the shared trust store.
    pub fn trust_store(&self) -> Result<TrustStore, SettingsError> {
        Ok(TrustStore::from_literals(&self.intercept.trusted)?)
    }

    /// Build the policy for a scope. Only header scrubbing may differ
    /// between scopes.
    pub fn policy(
        &self,
        trust: Arc<TrustStore>,
        scrub_override: Option<bool>,
    ) -> Result<InterceptPolicy, SettingsError> {
        let intercept = &self.intercept;
        if intercept.port == 0 {
            return Err(SettingsError::InvalidPort(intercept.port));
        }
        if intercept.timeout == 0 {
            return Err(SettingsError::InvalidTimeout(intercept.timeout));
        }

        let header = HeaderName::from_bytes(intercept.fallback_header.as_bytes())
            .map_err(|_| SettingsError::InvalidHeaderName(intercept.fallback_header.clone()))?;

        Ok(InterceptPolicy::new(trust, intercept.port)
            .with_fallback_header(header)
            .with_scrub_fallback_header(scrub_override.unwrap_or(intercept.scrub_fallback_header))
            .with_read_timeout(intercept.timeout_duration()))
    }

    /// Validate everything and produce one scope per listener.
    pub fn scopes(&self) -> Result<Vec<ListenerScope>, SettingsError> {
        if self.listeners.is_empty() {
            return Err(SettingsError::NoListeners);
        }

        let trust = Arc::new(self.trust_store()?);
        self.listeners
            .iter()
            .map(|listener| {
                let policy = self.policy(trust.clone(), listener.scrub_fallback_header)?;
                Ok(ListenerScope {
                    bind: listener.bind,
                    policy: Arc::new(policy),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SAMPLE: &str = r#"
        [intercept]
        port = 442
        trusted = ["192.168.0.0/16", "127.0.0.1", "10.0.0.0/255.0.0.0"]
        timeout = 2

        [[listener]]
        bind = "0.0.0.0:442"
        scrub_fallback_header = true

        [[listener]]
        bind = "0.0.0.0:80"
    "#;

    #[test]
    fn test_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings.intercept.port, 442);
        assert_eq!(settings.intercept.fallback_header, "x-cluster-client-ip");
        assert!(!settings.intercept.scrub_fallback_header);
        assert_eq!(settings.intercept.timeout_duration(), Duration::from_secs(5));
        assert!(settings.listeners.is_empty());
    }

    #[test]
    fn test_scopes() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        let scopes = settings.scopes().unwrap();
        assert_eq!(scopes.len(), 2);

        let ssl = &scopes[0].policy;
        assert_eq!(scopes[0].bind, "0.0.0.0:442".parse().unwrap());
        assert!(ssl.scrub_fallback_header());
        assert_eq!(ssl.intercept_port(), 442);
        assert_eq!(ssl.read_timeout(), Duration::from_secs(2));
        assert_eq!(ssl.trust().len(), 3);

        let plain = &scopes[1].policy;
        assert!(!plain.scrub_fallback_header());
        assert_eq!(plain.intercept_port(), 442);
    }

    #[test]
    fn test_scopes_share_trust_store() {
        let scopes = Settings::from_toml_str(SAMPLE).unwrap().scopes().unwrap();
        assert!(std::ptr::eq(scopes[0].policy.trust(), scopes[1].policy.trust()));
    }

    #[test]
    fn test_header_name_is_case_insensitive() {
        let settings = Settings::from_toml_str(
            "[intercept]\nfallback_header = \"X-Cluster-Client-Ip\"\n[[listener]]\nbind = \"127.0.0.1:80\"\n",
        )
        .unwrap();
        let scopes = settings.scopes().unwrap();
        assert_eq!(scopes[0].policy.fallback_header().as_str(), "x-cluster-client-ip");
    }

    #[test]
    fn test_invalid_subnet() {
        let settings = Settings::from_toml_str(
            "[intercept]\ntrusted = [\"lb.example.com\"]\n[[listener]]\nbind = \"127.0.0.1:80\"\n",
        )
        .unwrap();
        assert!(matches!(settings.scopes(), Err(SettingsError::InvalidSubnet(_))));
    }

    #[test]
    fn test_port_zero_rejected() {
        let settings =
            Settings::from_toml_str("[intercept]\nport = 0\n[[listener]]\nbind = \"127.0.0.1:80\"\n")
                .unwrap();
        assert!(matches!(settings.scopes(), Err(SettingsError::InvalidPort(0))));
    }

    #[test]
    fn test_timeout_zero_rejected() {
        let settings = Settings::from_toml_str(
            "[intercept]\ntimeout = 0\n[[listener]]\nbind = \"127.0.0.1:80\"\n",
        )
        .unwrap();
        let err = settings.scopes().unwrap_err();
        assert!(matches!(err, SettingsError::InvalidTimeout(0)));
        assert!(err.to_string().contains("at least 1 second"));
    }

    #[test]
    fn test_port_out_of_range_rejected() {
        assert!(matches!(
            Settings::from_toml_str("[intercept]\nport = 70000\n"),
            Err(SettingsError::Parse(_))
        ));
    }

    #[test]
    fn test_invalid_header_name() {
        let settings = Settings::from_toml_str(
            "[intercept]\nfallback_header = \"bad header\"\n[[listener]]\nbind = \"127.0.0.1:80\"\n",
        )
        .unwrap();
        assert!(matches!(settings.scopes(), Err(SettingsError::InvalidHeaderName(_))));
    }

    #[test]
    fn test_no_listeners() {
        let settings = Settings::from_toml_str("[intercept]\nport = 442\n").unwrap();
        assert!(matches!(settings.scopes(), Err(SettingsError::NoListeners)));
    }

    #[test]
    fn test_load_file() {
        let path = std::env::temp_dir().join(format!("fixip-settings-{}.toml", std::process::id()));
        std::fs::write(&path, SAMPLE).unwrap();

        let settings = Settings::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(settings.listeners.len(), 2);
        assert_eq!(settings.intercept.trusted.len(), 3);
    }

    #[test]
    fn test_load_env_override() {
        let path = std::env::temp_dir().join(format!("fixip-env-{}.toml", std::process::id()));
        std::fs::write(&path, SAMPLE).unwrap();

        let vars = [
            ("FIXIP__INTERCEPT__TRUSTED", "10.0.0.0/8,fd00::/8"),
            ("FIXIP__INTERCEPT__PORT", "8442"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let settings = Settings::load_with(&path, Settings::environment().source(Some(vars)));
        std::fs::remove_file(&path).unwrap();

        let settings = settings.unwrap();
        assert_eq!(settings.intercept.trusted, ["10.0.0.0/8", "fd00::/8"]);
        assert_eq!(settings.intercept.port, 8442);

        let scopes = settings.scopes().unwrap();
        assert!(scopes[0].policy.trust().is_trusted("10.9.8.7".parse().unwrap()));
        assert!(!scopes[0].policy.trust().is_trusted("192.168.1.1".parse().unwrap()));
    }
}
