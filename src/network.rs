//! Network addresses reported by provisioned instances.
//!
//! Addresses are plain values: once observed they never change, and the
//! address race keys its bookkeeping on them, so equality and hashing cover
//! every field.

use std::{fmt, net::IpAddr};

use serde::{Deserialize, Serialize};

/// Port used when connecting to a candidate address over SSH.
pub const SSH_PORT: u16 = 22;

/// The syntactic kind of an address value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    /// A dotted-quad IPv4 literal.
    Ipv4,
    /// An IPv6 literal.
    Ipv6,
    /// A DNS name.
    Hostname,
}

/// How widely an address is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressScope {
    /// Reachability is not known.
    #[default]
    Unknown,
    /// Reachable from the public internet.
    Public,
    /// Reachable only inside the provider's network.
    CloudLocal,
    /// Reachable only from the machine itself.
    MachineLocal,
    /// Reachable only on the local link.
    LinkLocal,
}

impl fmt::Display for AddressScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Unknown => "unknown",
            Self::Public => "public",
            Self::CloudLocal => "local-cloud",
            Self::MachineLocal => "local-machine",
            Self::LinkLocal => "link-local",
        };
        f.write_str(text)
    }
}

/// A candidate network endpoint for an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// The textual address, without a port.
    pub value: String,
    /// Whether the value is an IPv4, IPv6, or host name.
    pub kind: AddressKind,
    /// Reachability scope reported by the provider.
    pub scope: AddressScope,
}

impl Address {
    /// Build an address, deriving its kind from the value.
    ///
    /// # Examples
    ///
    /// ```
    /// use clusterboot::network::{Address, AddressKind, AddressScope};
    ///
    /// let addr = Address::new("10.0.0.5", AddressScope::CloudLocal);
    /// assert_eq!(addr.kind, AddressKind::Ipv4);
    /// ```
    #[must_use]
    pub fn new(value: impl Into<String>, scope: AddressScope) -> Self {
        let value = value.into();
        let kind = match value.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => AddressKind::Ipv4,
            Ok(IpAddr::V6(_)) => AddressKind::Ipv6,
            Err(_) => AddressKind::Hostname,
        };
        Self { value, kind, scope }
    }

    /// Build an address for an IP, classifying its scope from the IP itself.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::net::IpAddr;
    ///
    /// use clusterboot::network::{Address, AddressScope};
    ///
    /// let ip: IpAddr = "192.168.1.4".parse().expect("literal ip");
    /// assert_eq!(Address::from_ip(ip).scope, AddressScope::CloudLocal);
    /// ```
    #[must_use]
    pub fn from_ip(ip: IpAddr) -> Self {
        let kind = if ip.is_ipv4() {
            AddressKind::Ipv4
        } else {
            AddressKind::Ipv6
        };
        Self {
            value: ip.to_string(),
            kind,
            scope: derive_scope(ip),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.value) }
}

fn derive_scope(ip: IpAddr) -> AddressScope {
    if ip.is_loopback() {
        return AddressScope::MachineLocal;
    }
    match ip {
        IpAddr::V4(v4) if v4.is_link_local() => AddressScope::LinkLocal,
        IpAddr::V4(v4) if v4.is_private() => AddressScope::CloudLocal,
        IpAddr::V4(_) => AddressScope::Public,
        IpAddr::V6(v6) => {
            let [first, ..] = v6.segments();
            // fe80::/10 is link-local, fc00::/7 is unique-local.
            if first & 0xffc0 == 0xfe80 {
                AddressScope::LinkLocal
            } else if first & 0xfe00 == 0xfc00 {
                AddressScope::CloudLocal
            } else {
                AddressScope::Public
            }
        }
    }
}
