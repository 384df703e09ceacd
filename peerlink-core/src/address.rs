//! Layered peer addresses: `/ip4/127.0.0.1/tcp/4001/p2p/<peer id>`.
//!
//! An address is an ordered list of typed components. It is a plain value:
//! every mutating helper returns a new address.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Component type, used for lookup and replacement.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Kind {
    Ip4,
    Ip6,
    Dns,
    Tcp,
    Udp,
    Memory,
    P2p,
}

impl Kind {
    pub fn name(self) -> &'static str {
        match self {
            Kind::Ip4 => "ip4",
            Kind::Ip6 => "ip6",
            Kind::Dns => "dns",
            Kind::Tcp => "tcp",
            Kind::Udp => "udp",
            Kind::Memory => "memory",
            Kind::P2p => "p2p",
        }
    }

    pub fn from_name(name: &str) -> Option<Kind> {
        Some(match name {
            "ip4" => Kind::Ip4,
            "ip6" => Kind::Ip6,
            "dns" => Kind::Dns,
            "tcp" => Kind::Tcp,
            "udp" => Kind::Udp,
            "memory" => Kind::Memory,
            "p2p" => Kind::P2p,
            _ => return None,
        })
    }
}

/// One typed address component with its value.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Protocol {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Dns(String),
    Tcp(u16),
    Udp(u16),
    Memory(u64),
    P2p(PeerId),
}

impl Protocol {
    pub fn kind(&self) -> Kind {
        match self {
            Protocol::Ip4(_) => Kind::Ip4,
            Protocol::Ip6(_) => Kind::Ip6,
            Protocol::Dns(_) => Kind::Dns,
            Protocol::Tcp(_) => Kind::Tcp,
            Protocol::Udp(_) => Kind::Udp,
            Protocol::Memory(_) => Kind::Memory,
            Protocol::P2p(_) => Kind::P2p,
        }
    }

    fn parse(kind: Kind, value: &str) -> Result<Protocol, AddressError> {
        let invalid = || AddressError::InvalidValue {
            kind: kind.name(),
            value: value.to_string(),
        };
        Ok(match kind {
            Kind::Ip4 => Protocol::Ip4(value.parse().map_err(|_| invalid())?),
            Kind::Ip6 => Protocol::Ip6(value.parse().map_err(|_| invalid())?),
            Kind::Dns if !value.is_empty() => Protocol::Dns(value.to_string()),
            Kind::Dns => return Err(invalid()),
            Kind::Tcp => Protocol::Tcp(value.parse().map_err(|_| invalid())?),
            Kind::Udp => Protocol::Udp(value.parse().map_err(|_| invalid())?),
            Kind::Memory => Protocol::Memory(value.parse().map_err(|_| invalid())?),
            Kind::P2p => Protocol::P2p(value.parse().map_err(|_| invalid())?),
        })
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/", self.kind().name())?;
        match self {
            Protocol::Ip4(ip) => write!(f, "{}", ip),
            Protocol::Ip6(ip) => write!(f, "{}", ip),
            Protocol::Dns(host) => f.write_str(host),
            Protocol::Tcp(port) | Protocol::Udp(port) => write!(f, "{}", port),
            Protocol::Memory(port) => write!(f, "{}", port),
            Protocol::P2p(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AddressError {
    #[error("empty address")]
    Empty,
    #[error("address must start with '/'")]
    NoLeadingSlash,
    #[error("unknown address component: {0}")]
    UnknownProtocol(String),
    #[error("missing value for {0}")]
    MissingValue(&'static str),
    #[error("invalid {kind} value: {value}")]
    InvalidValue { kind: &'static str, value: String },
}

/// Ordered sequence of address components.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Multiaddr(Vec<Protocol>);

impl Multiaddr {
    pub fn empty() -> Self {
        Multiaddr(Vec::new())
    }

    /// `/ip4|ip6/<ip>/tcp/<port>`.
    pub fn tcp(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(ip) => Protocol::Ip4(ip),
            IpAddr::V6(ip) => Protocol::Ip6(ip),
        };
        Multiaddr(vec![ip, Protocol::Tcp(addr.port())])
    }

    /// `/memory/<port>`.
    pub fn memory(port: u64) -> Self {
        Multiaddr(vec![Protocol::Memory(port)])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Protocol> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has(&self, kind: Kind) -> bool {
        self.get(kind).is_some()
    }

    /// First component of the given kind.
    pub fn get(&self, kind: Kind) -> Option<&Protocol> {
        self.0.iter().find(|p| p.kind() == kind)
    }

    /// Text value of the first component of the given kind.
    pub fn value_of(&self, kind: Kind) -> Option<String> {
        self.get(kind).map(|p| {
            let text = p.to_string();
            text[kind.name().len() + 2..].to_string()
        })
    }

    /// Returns a copy with `component` appended.
    pub fn with(&self, component: Protocol) -> Multiaddr {
        let mut parts = self.0.clone();
        parts.push(component);
        Multiaddr(parts)
    }

    /// Returns a copy where the first component of the same kind is replaced.
    /// Without such a component the copy is unchanged.
    pub fn replace(&self, component: Protocol) -> Multiaddr {
        let kind = component.kind();
        let mut parts = self.0.clone();
        if let Some(slot) = parts.iter_mut().find(|p| p.kind() == kind) {
            *slot = component;
        }
        Multiaddr(parts)
    }

    /// Returns a copy whose first `ip4`/`ip6` component is swapped for `ip`,
    /// switching the component kind when the IP family differs.
    pub fn with_ip(&self, ip: IpAddr) -> Multiaddr {
        let mut parts = self.0.clone();
        if let Some(slot) = parts
            .iter_mut()
            .find(|p| matches!(p, Protocol::Ip4(_) | Protocol::Ip6(_)))
        {
            *slot = match ip {
                IpAddr::V4(ip) => Protocol::Ip4(ip),
                IpAddr::V6(ip) => Protocol::Ip6(ip),
            };
        }
        Multiaddr(parts)
    }

    /// Returns a copy with every component of `kind` removed.
    pub fn without(&self, kind: Kind) -> Multiaddr {
        Multiaddr(self.0.iter().filter(|p| p.kind() != kind).cloned().collect())
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        match self.get(Kind::P2p) {
            Some(Protocol::P2p(id)) => Some(*id),
            _ => None,
        }
    }

    /// Annotates the address with `id` unless it already carries a peer id.
    /// An existing peer id is kept as is.
    pub fn with_peer_id(&self, id: PeerId) -> Multiaddr {
        if self.has(Kind::P2p) {
            self.clone()
        } else {
            self.with(Protocol::P2p(id))
        }
    }

    /// Socket address for `ip4|ip6` + `tcp|udp` addresses.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip = self.0.iter().find_map(|p| match p {
            Protocol::Ip4(ip) => Some(IpAddr::V4(*ip)),
            Protocol::Ip6(ip) => Some(IpAddr::V6(*ip)),
            _ => None,
        })?;
        let port = self.0.iter().find_map(|p| match p {
            Protocol::Tcp(port) | Protocol::Udp(port) => Some(*port),
            _ => None,
        })?;
        Some(SocketAddr::new(ip, port))
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for part in &self.0 {
            write!(f, "{}", part)?;
        }
        Ok(())
    }
}

impl FromStr for Multiaddr {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AddressError::Empty);
        }
        let rest = s.strip_prefix('/').ok_or(AddressError::NoLeadingSlash)?;
        let mut parts = Vec::new();
        let mut segments = rest.split('/').filter(|seg| !seg.is_empty());
        while let Some(name) = segments.next() {
            let kind =
                Kind::from_name(name).ok_or_else(|| AddressError::UnknownProtocol(name.into()))?;
            let value = segments
                .next()
                .ok_or(AddressError::MissingValue(kind.name()))?;
            parts.push(Protocol::parse(kind, value)?);
        }
        if parts.is_empty() {
            return Err(AddressError::Empty);
        }
        Ok(Multiaddr(parts))
    }
}

impl TryFrom<String> for Multiaddr {
    type Error = AddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Multiaddr> for String {
    fn from(addr: Multiaddr) -> String {
        addr.to_string()
    }
}

impl From<Vec<Protocol>> for Multiaddr {
    fn from(parts: Vec<Protocol>) -> Self {
        Multiaddr(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[test]
    fn parse_and_display() {
        let text = "/ip4/127.0.0.1/tcp/4001";
        let addr: Multiaddr = text.parse().unwrap();
        assert_eq!(addr.to_string(), text);
        assert_eq!(addr.value_of(Kind::Tcp).as_deref(), Some("4001"));
        assert!(addr.has(Kind::Ip4));
        assert!(!addr.has(Kind::P2p));
    }

    #[test]
    fn add_peer_id_then_lookup() {
        let id = Identity::generate().peer_id();
        let addr: Multiaddr = "/ip6/::1/tcp/0".parse().unwrap();
        let annotated = addr.with_peer_id(id);
        assert_eq!(annotated.peer_id(), Some(id));
        assert_eq!(annotated.value_of(Kind::P2p), Some(id.to_string()));
        // source address untouched
        assert!(!addr.has(Kind::P2p));
    }

    #[test]
    fn adding_existing_peer_id_is_noop() {
        let first = Identity::generate().peer_id();
        let second = Identity::generate().peer_id();
        let addr = Multiaddr::memory(7).with_peer_id(first);
        let again = addr.with_peer_id(second);
        assert_eq!(again, addr);
        assert_eq!(again.peer_id(), Some(first));
    }

    #[test]
    fn peer_id_survives_text_form() {
        let id = Identity::generate().peer_id();
        let addr = Multiaddr::memory(3).with_peer_id(id);
        let parsed: Multiaddr = addr.to_string().parse().unwrap();
        assert_eq!(parsed.peer_id(), Some(id));
    }

    #[test]
    fn replace_and_without() {
        let addr: Multiaddr = "/ip4/0.0.0.0/tcp/0".parse().unwrap();
        let bound = addr.replace(Protocol::Tcp(5000));
        assert_eq!(bound.to_string(), "/ip4/0.0.0.0/tcp/5000");
        let absent = addr.replace(Protocol::Memory(1));
        assert_eq!(absent, addr);
        assert_eq!(bound.without(Kind::Tcp).to_string(), "/ip4/0.0.0.0");
    }

    #[test]
    fn with_ip_swaps_family() {
        let addr: Multiaddr = "/ip4/0.0.0.0/tcp/9".parse().unwrap();
        let v6 = addr.with_ip("fe80::1".parse().unwrap());
        assert_eq!(v6.to_string(), "/ip6/fe80::1/tcp/9");
        assert_eq!(v6.socket_addr(), Some("[fe80::1]:9".parse().unwrap()));
        let v4 = addr.with_ip("10.0.0.3".parse().unwrap());
        assert_eq!(v4.to_string(), "/ip4/10.0.0.3/tcp/9");
        assert_eq!(Multiaddr::memory(2).with_ip("10.0.0.3".parse().unwrap()), Multiaddr::memory(2));
    }

    #[test]
    fn socket_addr() {
        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/80".parse().unwrap();
        assert_eq!(addr.socket_addr(), Some("10.0.0.1:80".parse().unwrap()));
        assert_eq!(Multiaddr::tcp("10.0.0.1:80".parse().unwrap()), addr);
        assert_eq!(Multiaddr::memory(1).socket_addr(), None);
    }

    #[test]
    fn parse_errors() {
        assert_eq!("".parse::<Multiaddr>(), Err(AddressError::Empty));
        assert_eq!("/".parse::<Multiaddr>(), Err(AddressError::Empty));
        assert_eq!(
            "ip4/1.2.3.4".parse::<Multiaddr>(),
            Err(AddressError::NoLeadingSlash)
        );
        assert!(matches!(
            "/quic/1".parse::<Multiaddr>(),
            Err(AddressError::UnknownProtocol(_))
        ));
        assert_eq!(
            "/ip4/1.2.3.4/tcp".parse::<Multiaddr>(),
            Err(AddressError::MissingValue("tcp"))
        );
        assert!(matches!(
            "/ip4/1.2.3.400".parse::<Multiaddr>(),
            Err(AddressError::InvalidValue { kind: "ip4", .. })
        ));
        assert!(matches!(
            "/p2p/nothex".parse::<Multiaddr>(),
            Err(AddressError::InvalidValue { kind: "p2p", .. })
        ));
    }
}
