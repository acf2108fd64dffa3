//! Root server hints.
//!
//! The built-in table is the IANA root server set; tests and private
//! deployments substitute their own.

use skein_proto::Name;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// One root server hint.
#[derive(Debug, Clone)]
pub struct RootServer {
    /// Server hostname.
    pub name: &'static str,
    /// IPv4 address.
    pub ipv4: &'static str,
    /// IPv6 address, if assigned.
    pub ipv6: Option<&'static str>,
}

/// IANA root servers.
pub static ROOT_SERVERS: &[RootServer] = &[
    RootServer {
        name: "a.root-servers.net",
        ipv4: "198.41.0.4",
        ipv6: Some("2001:503:ba3e::2:30"),
    },
    RootServer {
        name: "b.root-servers.net",
        ipv4: "199.9.14.201",
        ipv6: Some("2001:500:200::b"),
    },
    RootServer {
        name: "c.root-servers.net",
        ipv4: "192.33.4.12",
        ipv6: Some("2001:500:2::c"),
    },
    RootServer {
        name: "d.root-servers.net",
        ipv4: "199.7.91.13",
        ipv6: Some("2001:500:2d::d"),
    },
    RootServer {
        name: "e.root-servers.net",
        ipv4: "192.203.230.10",
        ipv6: Some("2001:500:a8::e"),
    },
    RootServer {
        name: "f.root-servers.net",
        ipv4: "192.5.5.241",
        ipv6: Some("2001:500:2f::f"),
    },
    RootServer {
        name: "g.root-servers.net",
        ipv4: "192.112.36.4",
        ipv6: Some("2001:500:12::d0d"),
    },
    RootServer {
        name: "h.root-servers.net",
        ipv4: "198.97.190.53",
        ipv6: Some("2001:500:1::53"),
    },
    RootServer {
        name: "i.root-servers.net",
        ipv4: "192.36.148.17",
        ipv6: Some("2001:7fe::53"),
    },
    RootServer {
        name: "j.root-servers.net",
        ipv4: "192.58.128.30",
        ipv6: Some("2001:503:c27::2:30"),
    },
    RootServer {
        name: "k.root-servers.net",
        ipv4: "193.0.14.129",
        ipv6: Some("2001:7fd::1"),
    },
    RootServer {
        name: "l.root-servers.net",
        ipv4: "199.7.83.42",
        ipv6: Some("2001:500:9f::42"),
    },
    RootServer {
        name: "m.root-servers.net",
        ipv4: "202.12.27.33",
        ipv6: Some("2001:dc3::35"),
    },
];

/// The hint zone: the nameserver set iteration starts from when nothing
/// deeper is cached.
#[derive(Debug, Clone)]
pub struct Hints {
    /// The zone these hints serve (the root, for the built-in set).
    pub zone: Name,
    /// Server host names and their addresses.
    pub servers: Vec<(Name, Vec<SocketAddr>)>,
}

impl Hints {
    /// Builds the IANA root hints.
    pub fn iana() -> Self {
        let servers = ROOT_SERVERS
            .iter()
            .map(|rs| {
                let name = Name::from_str(rs.name).unwrap_or_else(|_| Name::root());
                let mut addrs = Vec::with_capacity(2);
                if let Ok(ip) = rs.ipv4.parse::<IpAddr>() {
                    addrs.push(SocketAddr::new(ip, 53));
                }
                if let Some(v6) = rs.ipv6 {
                    if let Ok(ip) = v6.parse::<IpAddr>() {
                        addrs.push(SocketAddr::new(ip, 53));
                    }
                }
                (name, addrs)
            })
            .collect();
        Self {
            zone: Name::root(),
            servers,
        }
    }

    /// Hints for a custom zone and server set (tests, closed networks).
    pub fn custom(zone: Name, servers: Vec<(Name, Vec<SocketAddr>)>) -> Self {
        Self { zone, servers }
    }
}

impl Default for Hints {
    fn default() -> Self {
        Self::iana()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iana_set_is_complete() {
        let hints = Hints::iana();
        assert_eq!(hints.servers.len(), 13);
        assert!(hints.zone.is_root());
        assert!(hints
            .servers
            .iter()
            .all(|(name, addrs)| !name.is_root() && !addrs.is_empty()));
    }
}
