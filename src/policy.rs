//! Interception Policy
//!
//! Runtime form of the configuration for one server scope. The intercept
//! port, trust store, fallback header name and read timeout are shared by
//! every scope; only header scrubbing varies.

use std::sync::Arc;
use std::time::Duration;

use hyper::header::HeaderName;

use crate::connection::ConnectionState;
use crate::trust::TrustStore;

/// Conventional name of the client address header
pub const DEFAULT_FALLBACK_HEADER: &str = "x-cluster-client-ip";

/// Port the preamble is intercepted on unless configured otherwise
pub const DEFAULT_INTERCEPT_PORT: u16 = 442;

#[derive(Debug, Clone)]
pub struct InterceptPolicy {
    intercept_port: u16,
    scrub_fallback_header: bool,
    fallback_header: HeaderName,
    read_timeout: Duration,
    trust: Arc<TrustStore>,
}

impl InterceptPolicy {
    pub fn new(trust: Arc<TrustStore>, intercept_port: u16) -> Self {
        Self {
            intercept_port,
            scrub_fallback_header: false,
            fallback_header: HeaderName::from_static(DEFAULT_FALLBACK_HEADER),
            read_timeout: Duration::from_secs(5),
            trust,
        }
    }

    pub fn with_scrub_fallback_header(mut self, scrub: bool) -> Self {
        self.scrub_fallback_header = scrub;
        self
    }

    pub fn with_fallback_header(mut self, header: HeaderName) -> Self {
        self.fallback_header = header;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Whether preamble interception should run for this connection
    pub fn applies_to(&self, state: &ConnectionState) -> bool {
        state.is_trusted()
            && state.local_addr().port() == self.intercept_port
            && !state.preamble_consumed()
    }

    pub fn intercept_port(&self) -> u16 {
        self.intercept_port
    }

    pub fn scrub_fallback_header(&self) -> bool {
        self.scrub_fallback_header
    }

    pub fn fallback_header(&self) -> &HeaderName {
        &self.fallback_header
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn trust(&self) -> &TrustStore {
        &self.trust
    }
}
