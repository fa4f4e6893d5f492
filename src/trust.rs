//! Trusted Intermediaries
//!
//! The set of networks whose connections may assert a different client
//! address. Built once from configuration and shared read-only by every
//! connection afterwards.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use ipnet::{IpNet, Ipv4Net};

/// A trusted network: base address plus prefix length, IPv4 or IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet(IpNet);

/// Error returned when a subnet literal cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidSubnet(pub String);

impl fmt::Display for InvalidSubnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "an IP address was expected, got {:?}", self.0)
    }
}

impl std::error::Error for InvalidSubnet {}

impl Subnet {
    /// Check whether `addr` falls inside this network.
    pub fn contains(&self, addr: IpAddr) -> bool {
        self.0.contains(&addr)
    }

    pub fn prefix_len(&self) -> u8 {
        self.0.prefix_len()
    }
}

impl FromStr for Subnet {
    type Err = InvalidSubnet;

    /// Accepts `addr/len`, `a.b.c.d/m.m.m.m`, or a bare address (host route).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || InvalidSubnet(s.to_string());

        let Some((addr, mask)) = s.split_once('/') else {
            let addr: IpAddr = s.parse().map_err(|_| invalid())?;
            return Ok(Subnet(IpNet::from(addr)));
        };

        if let Ok(mask) = mask.parse::<Ipv4Addr>() {
            let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
            let prefix = ipnet::ipv4_mask_to_prefix(mask).map_err(|_| invalid())?;
            let net = Ipv4Net::new(addr, prefix).map_err(|_| invalid())?;
            return Ok(Subnet(IpNet::V4(net)));
        }

        s.parse::<IpNet>().map(Subnet).map_err(|_| invalid())
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Immutable collection of trusted subnets.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    subnets: Vec<Subnet>,
}

impl TrustStore {
    /// Parse every literal, failing on the first invalid one.
    pub fn from_literals<I, S>(literals: I) -> Result<Self, InvalidSubnet>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let subnets = literals
            .into_iter()
            .map(|lit| lit.as_ref().parse())
            .collect::<Result<Vec<Subnet>, _>>()?;
        Ok(Self { subnets })
    }

    /// Membership test over all configured subnets.
    ///
    /// IPv4-mapped IPv6 peers (`::ffff:a.b.c.d`) are also matched against
    /// IPv4 subnets.
    pub fn is_trusted(&self, addr: IpAddr) -> bool {
        let mapped = match addr {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4),
            IpAddr::V4(_) => None,
        };

        self.subnets.iter().any(|net| {
            net.contains(addr) || mapped.is_some_and(|v4| net.contains(v4))
        })
    }

    pub fn len(&self) -> usize {
        self.subnets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subnets.is_empty()
    }

    pub fn subnets(&self) -> &[Subnet] {
        &self.subnets
    }
}
