//! Interception Configuration
//!
//! Process-wide settings for preamble interception and header fallback.

use serde::Deserialize;
use std::time::Duration;

use crate::policy::{DEFAULT_FALLBACK_HEADER, DEFAULT_INTERCEPT_PORT};

/// `[intercept]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
    /// Local port on which connection preambles are intercepted
    pub port: u16,

    /// Trusted load balancer networks: CIDR, netmask form, or bare address
    pub trusted: Vec<String>,

    /// Request header carrying the client address
    pub fallback_header: String,

    /// Remove the fallback header before the application sees it.
    /// Listeners may override this.
    pub scrub_fallback_header: bool,

    /// Timeout for the first read on the intercept port in seconds.
    /// Default: 5 seconds
    pub timeout: u64,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_INTERCEPT_PORT,
            trusted: Vec::new(),
            fallback_header: DEFAULT_FALLBACK_HEADER.to_string(),
            scrub_fallback_header: false,
            timeout: 5,
        }
    }
}

impl InterceptConfig {
    /// Get timeout as Duration
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}
