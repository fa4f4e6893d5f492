//! fixip: recover the real client address of connections that arrive
//! through a trusted load balancer.
//!
//! Three signals are understood, all honored only when the immediate TCP
//! peer belongs to a configured trusted network:
//!
//! - a binary `HELO` handshake carrying an IPv4 address
//! - a PROXY protocol v1 text header
//! - a client address request header (`X-Cluster-Client-Ip` by default)
//!
//! The first two are read from the front of the byte stream on the intercept
//! port before HTTP parsing starts. Load balancers may also send `TEST` to
//! get an `OK\n` liveness reply.

pub mod config;
pub mod connection;
pub mod fallback;
pub mod policy;
pub mod preamble;
pub mod server;
pub mod stream;
pub mod trust;

pub use config::{ListenerScope, Settings, SettingsError};
pub use connection::{ClientAddrs, ConnectionState, RewriteOutcome, TrustVerdict};
pub use fallback::{FallbackOutcome, HeaderFallback};
pub use policy::InterceptPolicy;
pub use preamble::{intercept, process_chunk, InterceptOutcome, Preamble, PreambleAction, PreambleError};
pub use stream::PrefixedStream;
pub use trust::{Subnet, TrustStore};
