//! The address database: nameserver names to addresses, with smoothed
//! round-trip times, per-server flags, and lameness markings.
//!
//! Address knowledge comes from three places: seeded hints, address
//! records already in the cache, and (for names nobody knows) an injected
//! [`AddressFetcher`] that resolves the nameserver's own address records
//! out of band and reports back with an event.

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use skein_proto::{Name, RData, RecordType};
use skein_cache::CacheDb;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// Per-server flag: this server does not understand EDNS0.
pub const ADDR_FLAG_NOEDNS0: u32 = 0x0001;

/// How a measured RTT folds into the smoothed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RttAdjust {
    /// Exponential moving average (7/8 old, 1/8 new).
    Average,
    /// Overwrite the smoothed value.
    Replace,
}

/// Shared per-address state, deduplicated across finds.
#[derive(Debug)]
pub struct AddrEntry {
    /// The server's socket address.
    pub sockaddr: SocketAddr,
    srtt: AtomicU32,
    flags: AtomicU32,
}

impl AddrEntry {
    fn new(sockaddr: SocketAddr) -> Self {
        Self {
            sockaddr,
            srtt: AtomicU32::new(0),
            flags: AtomicU32::new(0),
        }
    }

    /// Smoothed round-trip time in microseconds.
    #[inline]
    pub fn srtt(&self) -> u32 {
        self.srtt.load(Ordering::Relaxed)
    }

    /// Current flag bits.
    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Relaxed)
    }
}

/// One address inside a find; marking is find-local, the entry is shared.
#[derive(Debug, Clone)]
pub struct FoundAddr {
    /// The shared address entry.
    pub entry: Arc<AddrEntry>,
    /// Came from a forwarder list rather than NS discovery.
    pub forwarder: bool,
    /// Tried this round.
    pub marked: bool,
}

/// The address list produced for one nameserver name.
#[derive(Debug, Default)]
pub struct Find {
    /// Addresses, sorted by smoothed RTT.
    pub addrs: Vec<FoundAddr>,
}

/// What [`AddrDb::create_find`] produced.
pub enum FindOutcome {
    /// Addresses were known immediately.
    Found(Find),
    /// Nothing known yet; the notify callback will fire later with `true`
    /// when addresses appeared, `false` when the lookout came up empty.
    Pending,
    /// Nothing known and no way to learn more.
    NoAddresses,
}

/// Options for one find.
#[derive(Debug, Clone, Copy)]
pub struct FindOptions {
    /// Allow a deferred lookout with a completion event.
    pub want_event: bool,
    /// The nameserver sits beneath the current zone cut; its address must
    /// be re-learned from the top so stale glue cannot strand the fetch.
    pub start_at_root: bool,
    /// Accept IPv4 addresses.
    pub v4: bool,
    /// Accept IPv6 addresses.
    pub v6: bool,
}

/// Resolves a nameserver's own address records when the database and the
/// cache know nothing. Implementations populate the cache as a side
/// effect; the database rechecks it afterwards.
#[async_trait]
pub trait AddressFetcher: Send + Sync {
    /// Fetches address records for `name`, starting from the root when
    /// `start_at_root` is set.
    async fn fetch(&self, name: &Name, start_at_root: bool);
}

/// The address database.
pub struct AddrDb {
    cache: Arc<CacheDb>,
    entries: DashMap<SocketAddr, Arc<AddrEntry>>,
    seeds: DashMap<Name, Vec<SocketAddr>>,
    lame: DashMap<(SocketAddr, Name), Instant>,
    fetcher: OnceCell<Arc<dyn AddressFetcher>>,
    /// Port used for addresses learned from cached records.
    port: AtomicU16,
}

impl AddrDb {
    /// Creates an address database over the given cache.
    pub fn new(cache: Arc<CacheDb>) -> Self {
        Self {
            cache,
            entries: DashMap::new(),
            seeds: DashMap::new(),
            lame: DashMap::new(),
            fetcher: OnceCell::new(),
            port: AtomicU16::new(53),
        }
    }

    /// Seeds addresses for a name (hints).
    pub fn add_seed(&self, name: Name, addrs: Vec<SocketAddr>) {
        self.seeds.entry(name).or_default().extend(addrs);
    }

    /// Sets the port applied to cache-derived addresses.
    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::Relaxed);
    }

    /// Installs the out-of-band address fetcher. Later calls are ignored.
    pub fn set_fetcher(&self, fetcher: Arc<dyn AddressFetcher>) {
        let _ = self.fetcher.set(fetcher);
    }

    /// Returns the shared entry for a socket address, creating it if new.
    pub fn entry(&self, sockaddr: SocketAddr) -> Arc<AddrEntry> {
        self.entries
            .entry(sockaddr)
            .or_insert_with(|| Arc::new(AddrEntry::new(sockaddr)))
            .clone()
    }

    /// Builds a find-style address for an explicitly known socket address
    /// (forwarders).
    pub fn find_addrinfo(&self, sockaddr: SocketAddr) -> FoundAddr {
        FoundAddr {
            entry: self.entry(sockaddr),
            forwarder: false,
            marked: false,
        }
    }

    /// Produces the addresses known for `name`, usable against `zone`.
    ///
    /// Returns [`FindOutcome::Pending`] when nothing is known but an
    /// address fetcher can go looking; `notify` then fires on the caller's
    /// side once the lookout finishes.
    pub fn create_find(
        self: &Arc<Self>,
        name: &Name,
        zone: &Name,
        options: FindOptions,
        now: Instant,
        notify: impl FnOnce(bool) + Send + 'static,
    ) -> FindOutcome {
        let addrs = self.known_addresses(name, zone, options, now);
        if !addrs.is_empty() {
            trace!(name = %name, count = addrs.len(), "addresses known");
            return FindOutcome::Found(Find { addrs });
        }

        let fetcher = match (options.want_event, self.fetcher.get()) {
            (true, Some(f)) => f.clone(),
            _ => return FindOutcome::NoAddresses,
        };

        debug!(name = %name, start_at_root = options.start_at_root, "no addresses, starting lookout");
        let db = self.clone();
        let name = name.clone();
        let zone = zone.clone();
        tokio::spawn(async move {
            fetcher.fetch(&name, options.start_at_root).await;
            let more = !db
                .known_addresses(&name, &zone, options, Instant::now())
                .is_empty();
            notify(more);
        });
        FindOutcome::Pending
    }

    fn known_addresses(
        &self,
        name: &Name,
        zone: &Name,
        options: FindOptions,
        now: Instant,
    ) -> Vec<FoundAddr> {
        let port = self.port.load(Ordering::Relaxed);
        let mut sockaddrs: Vec<SocketAddr> = Vec::new();

        if let Some(seeded) = self.seeds.get(name) {
            sockaddrs.extend(seeded.iter().copied());
        }
        if let Some(stored) = self.cache.find_rrset(name, RecordType::A, now) {
            for rdata in &stored.rdatas {
                if let RData::A(ip) = rdata {
                    sockaddrs.push(SocketAddr::new((*ip).into(), port));
                }
            }
        }
        if let Some(stored) = self.cache.find_rrset(name, RecordType::AAAA, now) {
            for rdata in &stored.rdatas {
                if let RData::Aaaa(ip) = rdata {
                    sockaddrs.push(SocketAddr::new((*ip).into(), port));
                }
            }
        }

        sockaddrs.retain(|sa| match sa {
            SocketAddr::V4(_) => options.v4,
            SocketAddr::V6(_) => options.v6,
        });
        let mut seen: Vec<SocketAddr> = Vec::with_capacity(sockaddrs.len());
        sockaddrs.retain(|sa| {
            if seen.contains(sa) {
                false
            } else {
                seen.push(*sa);
                true
            }
        });
        sockaddrs.retain(|sa| !self.is_lame(*sa, zone, now));

        let mut addrs: Vec<FoundAddr> = sockaddrs
            .into_iter()
            .map(|sa| FoundAddr {
                entry: self.entry(sa),
                forwarder: false,
                marked: false,
            })
            .collect();
        addrs.sort_by_key(|a| a.entry.srtt());
        addrs
    }

    /// Folds a measured RTT (microseconds) into an entry.
    pub fn adjust_srtt(&self, entry: &AddrEntry, rtt_us: u32, how: RttAdjust) {
        let new = match how {
            RttAdjust::Replace => rtt_us,
            RttAdjust::Average => {
                let current = entry.srtt.load(Ordering::Relaxed);
                if current == 0 {
                    rtt_us
                } else {
                    ((current as u64 * 7 + rtt_us as u64) / 8) as u32
                }
            }
        };
        entry.srtt.store(new, Ordering::Relaxed);
    }

    /// Sets the flag bits in `mask` to `bits`.
    pub fn change_flags(&self, entry: &AddrEntry, bits: u32, mask: u32) {
        let mut current = entry.flags.load(Ordering::Relaxed);
        loop {
            let next = (current & !mask) | (bits & mask);
            match entry.flags.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Marks a server lame for a zone until the given instant.
    pub fn mark_lame(&self, sockaddr: SocketAddr, zone: &Name, until: Instant) {
        debug!(server = %sockaddr, zone = %zone, "marking lame");
        self.lame.insert((sockaddr, zone.clone()), until);
    }

    fn is_lame(&self, sockaddr: SocketAddr, zone: &Name, now: Instant) -> bool {
        let key = (sockaddr, zone.clone());
        if let Some(until) = self.lame.get(&key) {
            if *until > now {
                return true;
            }
        }
        self.lame.remove(&key);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_cache::CacheConfig;
    use skein_proto::{Rrset, Trust};
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::time::Duration;

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn db() -> Arc<AddrDb> {
        Arc::new(AddrDb::new(Arc::new(CacheDb::new(CacheConfig::default()))))
    }

    const OPTS: FindOptions = FindOptions {
        want_event: false,
        start_at_root: false,
        v4: true,
        v6: true,
    };

    #[test]
    fn srtt_average_and_replace() {
        let db = db();
        let entry = db.entry("192.0.2.1:53".parse().unwrap());
        db.adjust_srtt(&entry, 8000, RttAdjust::Average);
        assert_eq!(entry.srtt(), 8000);
        db.adjust_srtt(&entry, 16_000, RttAdjust::Average);
        assert_eq!(entry.srtt(), 9000);
        db.adjust_srtt(&entry, 123, RttAdjust::Replace);
        assert_eq!(entry.srtt(), 123);
    }

    #[test]
    fn seeded_addresses_are_found_and_sorted() {
        let db = db();
        let fast: SocketAddr = "192.0.2.1:53".parse().unwrap();
        let slow: SocketAddr = "192.0.2.2:53".parse().unwrap();
        db.add_seed(name("ns.example"), vec![slow, fast]);
        db.adjust_srtt(&db.entry(slow), 90_000, RttAdjust::Replace);
        db.adjust_srtt(&db.entry(fast), 1_000, RttAdjust::Replace);

        let now = Instant::now();
        match db.create_find(&name("ns.example"), &Name::root(), OPTS, now, |_| {}) {
            FindOutcome::Found(find) => {
                assert_eq!(find.addrs.len(), 2);
                assert_eq!(find.addrs[0].entry.sockaddr, fast);
            }
            _ => panic!("expected immediate find"),
        }
    }

    #[test]
    fn cached_glue_is_found_with_configured_port() {
        let cache = Arc::new(CacheDb::new(CacheConfig::default()));
        let db = Arc::new(AddrDb::new(cache.clone()));
        db.set_port(5300);
        let now = Instant::now();
        let node = cache.find_node(&name("ns1.org"), true).unwrap();
        let mut rrset = Rrset::new(RecordType::A, 300);
        rrset.trust = Trust::Glue;
        rrset.rdatas.push(RData::A(Ipv4Addr::new(192, 0, 2, 7)));
        cache.add_rrset(&node, &rrset, now);

        match db.create_find(&name("ns1.org"), &name("org"), OPTS, now, |_| {}) {
            FindOutcome::Found(find) => {
                assert_eq!(find.addrs[0].entry.sockaddr, "192.0.2.7:5300".parse().unwrap());
            }
            _ => panic!("expected cached glue"),
        }
    }

    #[test]
    fn lame_servers_are_filtered_until_expiry() {
        let db = db();
        let sa: SocketAddr = "192.0.2.9:53".parse().unwrap();
        db.add_seed(name("ns.example"), vec![sa]);
        let now = Instant::now();
        db.mark_lame(sa, &name("example"), now + Duration::from_secs(600));

        assert!(matches!(
            db.create_find(&name("ns.example"), &name("example"), OPTS, now, |_| {}),
            FindOutcome::NoAddresses
        ));
        // A different zone is unaffected.
        assert!(matches!(
            db.create_find(&name("ns.example"), &name("other"), OPTS, now, |_| {}),
            FindOutcome::Found(_)
        ));
        // And the marking expires.
        let later = now + Duration::from_secs(601);
        assert!(matches!(
            db.create_find(&name("ns.example"), &name("example"), OPTS, later, |_| {}),
            FindOutcome::Found(_)
        ));
    }

    #[test]
    fn noedns0_flag_round_trip() {
        let db = db();
        let entry = db.entry("192.0.2.1:53".parse().unwrap());
        assert_eq!(entry.flags() & ADDR_FLAG_NOEDNS0, 0);
        db.change_flags(&entry, ADDR_FLAG_NOEDNS0, ADDR_FLAG_NOEDNS0);
        assert_ne!(entry.flags() & ADDR_FLAG_NOEDNS0, 0);
    }
}
