//! The resolver's view of the world: cache, address database, hints, and
//! security roots.

use crate::addrdb::AddrDb;
use crate::hints::Hints;
use parking_lot::RwLock;
use skein_cache::{CacheConfig, CacheDb};
use skein_proto::{Name, RData, RecordType, Rrset, Trust};
use std::sync::Arc;
use std::time::Instant;

/// Shared lookup context for one resolver.
pub struct View {
    /// The record cache.
    pub cache: Arc<CacheDb>,
    /// The nameserver address database.
    pub adb: Arc<AddrDb>,
    hint_zone: Name,
    hint_ns: Rrset,
    secroots: RwLock<Vec<Name>>,
}

impl View {
    /// Builds a view over fresh cache and address databases, seeded from
    /// `hints`.
    pub fn new(hints: Hints) -> Arc<Self> {
        let cache = Arc::new(CacheDb::new(CacheConfig::default()));
        Self::with_cache(cache, hints)
    }

    /// Builds a view over an existing cache, seeded from `hints`.
    pub fn with_cache(cache: Arc<CacheDb>, hints: Hints) -> Arc<Self> {
        let adb = Arc::new(AddrDb::new(cache.clone()));
        let mut hint_ns = Rrset::new(RecordType::NS, 3_600_000);
        hint_ns.trust = Trust::Additional;
        for (name, addrs) in &hints.servers {
            hint_ns.rdatas.push(RData::Ns(name.clone()));
            adb.add_seed(name.clone(), addrs.clone());
        }
        Arc::new(Self {
            cache,
            adb,
            hint_zone: hints.zone,
            hint_ns,
            secroots: RwLock::new(Vec::new()),
        })
    }

    /// The nameserver set of the hint zone.
    pub fn hint_nameservers(&self) -> (Name, Rrset) {
        (self.hint_zone.clone(), self.hint_ns.clone())
    }

    /// Finds the deepest known zone cut at or above `name`.
    ///
    /// Walks the cache from `name` towards the root looking for an
    /// unexpired NS rdataset, falling back to the hint zone.
    pub fn find_zonecut(&self, name: &Name, now: Instant) -> (Name, Rrset) {
        let mut walk = Some(name.clone());
        while let Some(cut) = walk {
            if let Some(stored) = self.cache.find_rrset(&cut, RecordType::NS, now) {
                let mut rrset = Rrset::new(RecordType::NS, stored.ttl);
                rrset.trust = stored.trust;
                rrset.rdatas = stored.rdatas.clone();
                return (cut, rrset);
            }
            walk = cut.parent();
        }
        self.hint_nameservers()
    }

    /// Registers a security root; names at or below it require validation
    /// before caching.
    pub fn add_security_root(&self, root: Name) {
        self.secroots.write().push(root);
    }

    /// Returns true when `name` sits at or below a security root.
    pub fn security_covers(&self, name: &Name) -> bool {
        self.secroots
            .read()
            .iter()
            .any(|root| name.is_subdomain_of(root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn test_hints() -> Hints {
        Hints::custom(
            Name::root(),
            vec![(name("ns.test"), vec!["192.0.2.1:53".parse().unwrap()])],
        )
    }

    #[test]
    fn zone_cut_falls_back_to_hints() {
        let view = View::new(test_hints());
        let (cut, ns) = view.find_zonecut(&name("www.isc.org"), Instant::now());
        assert!(cut.is_root());
        assert_eq!(ns.rdatas.len(), 1);
    }

    #[test]
    fn zone_cut_prefers_deepest_cached_ns() {
        let view = View::new(test_hints());
        let now = Instant::now();

        for zone in ["org", "isc.org"] {
            let node = view.cache.find_node(&name(zone), true).unwrap();
            let mut rrset = Rrset::new(RecordType::NS, 3600);
            rrset.trust = Trust::Glue;
            rrset
                .rdatas
                .push(RData::Ns(name(&format!("ns.{zone}"))));
            view.cache.add_rrset(&node, &rrset, now);
        }

        let (cut, ns) = view.find_zonecut(&name("www.isc.org"), now);
        assert_eq!(cut, name("isc.org"));
        assert_eq!(ns.rdatas[0], RData::Ns(name("ns.isc.org")));

        // A name outside the cached cuts still reaches the hints.
        let (cut, _) = view.find_zonecut(&name("example.net"), now);
        assert!(cut.is_root());
    }

    #[test]
    fn security_roots_cover_subtrees() {
        let view = View::new(test_hints());
        assert!(!view.security_covers(&name("signed.example")));
        view.add_security_root(name("example"));
        assert!(view.security_covers(&name("signed.example")));
        assert!(view.security_covers(&name("example")));
        assert!(!view.security_covers(&name("example.org")));
    }

    #[test]
    fn ignores_unrelated_cache_rrsets() {
        let view = View::new(test_hints());
        let now = Instant::now();
        let node = view.cache.find_node(&name("isc.org"), true).unwrap();
        let mut a = Rrset::new(RecordType::A, 300);
        a.trust = Trust::Answer;
        a.rdatas.push(RData::A(Ipv4Addr::new(192, 0, 2, 1)));
        view.cache.add_rrset(&node, &a, now);

        let (cut, _) = view.find_zonecut(&name("isc.org"), now);
        assert!(cut.is_root());
    }
}
