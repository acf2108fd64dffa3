//! # skein-cache
//!
//! The resolver's record cache: owner-name-keyed nodes holding rdatasets
//! with a TTL and a trust level, plus negative entries keyed by the type
//! they deny. Insertion refuses trust downgrades; the caller learns via
//! [`AddOutcome::Unchanged`] that the cache already knew better, which the
//! resolver uses to sharpen results against stored negative entries.

use dashmap::DashMap;
use parking_lot::Mutex;
use skein_proto::{Name, RData, RecordType, Rrset, Trust};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Ceiling applied to record TTLs.
    pub max_ttl: Duration,
    /// Ceiling applied to negative-entry TTLs.
    pub max_negative_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_ttl: Duration::from_secs(86_400 * 7),
            max_negative_ttl: Duration::from_secs(3_600 * 3),
        }
    }
}

/// An immutable cached rdataset (or negative entry).
///
/// Handles are shared: every waiter of a fetch receives clones of the same
/// `Arc`, so the canonical answer is aliased, never copied.
#[derive(Debug)]
pub struct StoredRrset {
    /// Owner name.
    pub name: Name,
    /// Record type; [`RecordType::NONE`] marks a negative entry.
    pub rtype: RecordType,
    /// Covered type: the signed type for SIG sets, the denied type (or
    /// [`RecordType::ANY`] for nonexistent names) for negative entries.
    pub covers: RecordType,
    /// Time to live as inserted, after clamping.
    pub ttl: u32,
    /// Provenance trust.
    pub trust: Trust,
    /// Record data; empty for negative entries.
    pub rdatas: Vec<RData>,
    /// SOA evidence accompanying a negative entry.
    pub soa: Option<RData>,
    expires_at: Instant,
}

impl StoredRrset {
    /// Returns true for negative-cache entries.
    #[inline]
    pub fn is_negative(&self) -> bool {
        self.rtype == RecordType::NONE
    }

    /// Returns true once the entry's TTL has run out.
    #[inline]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn matches(&self, rtype: RecordType, covers: RecordType) -> bool {
        self.rtype == rtype && self.covers == covers
    }

    /// Whether this negative entry denies the existence of `rtype`.
    fn denies(&self, rtype: RecordType) -> bool {
        self.is_negative() && (self.covers == RecordType::ANY || self.covers == rtype)
    }
}

/// Outcome of an insertion attempt.
#[derive(Debug, Clone)]
pub enum AddOutcome {
    /// The data was stored; the handle is the stored copy.
    Added(Arc<StoredRrset>),
    /// The cache already holds data of equal or higher trust; the handle
    /// is the prevailing entry.
    Unchanged(Arc<StoredRrset>),
}

impl AddOutcome {
    /// The stored or prevailing entry.
    pub fn entry(&self) -> &Arc<StoredRrset> {
        match self {
            AddOutcome::Added(e) | AddOutcome::Unchanged(e) => e,
        }
    }
}

/// One owner name's slot list.
#[derive(Debug)]
pub struct CacheNode {
    /// The owner name.
    pub name: Name,
    slots: Mutex<Vec<Arc<StoredRrset>>>,
}

impl CacheNode {
    fn new(name: Name) -> Self {
        Self {
            name,
            slots: Mutex::new(Vec::new()),
        }
    }
}

/// The cache database.
pub struct CacheDb {
    config: CacheConfig,
    nodes: DashMap<Name, Arc<CacheNode>>,
}

impl CacheDb {
    /// Creates an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            nodes: DashMap::new(),
        }
    }

    /// Looks up (or creates) the node for `name`.
    pub fn find_node(&self, name: &Name, create: bool) -> Option<Arc<CacheNode>> {
        if let Some(node) = self.nodes.get(name) {
            return Some(node.clone());
        }
        if !create {
            return None;
        }
        Some(
            self.nodes
                .entry(name.clone())
                .or_insert_with(|| Arc::new(CacheNode::new(name.clone())))
                .clone(),
        )
    }

    /// Inserts a positive rdataset at `node`.
    ///
    /// Refuses downgrades: if an unexpired entry of the same (type, covers),
    /// or a negative entry denying this type, holds equal or higher trust,
    /// the existing entry prevails and is returned as `Unchanged`.
    pub fn add_rrset(&self, node: &CacheNode, rrset: &Rrset, now: Instant) -> AddOutcome {
        let ttl = rrset
            .ttl
            .min(self.config.max_ttl.as_secs().min(u32::MAX as u64) as u32);
        let mut slots = node.slots.lock();
        slots.retain(|s| !s.is_expired(now));

        if let Some(existing) = slots
            .iter()
            .find(|s| s.matches(rrset.rtype, rrset.covers) || s.denies(rrset.rtype))
        {
            if existing.trust >= rrset.trust {
                trace!(name = %node.name, rtype = %rrset.rtype, "cache keeps higher-trust entry");
                return AddOutcome::Unchanged(existing.clone());
            }
        }

        // The newcomer wins: displace the matching slot and any negative
        // entry it disproves.
        slots.retain(|s| !s.matches(rrset.rtype, rrset.covers) && !s.denies(rrset.rtype));
        let stored = Arc::new(StoredRrset {
            name: node.name.clone(),
            rtype: rrset.rtype,
            covers: rrset.covers,
            ttl,
            trust: rrset.trust,
            rdatas: rrset.rdatas.clone(),
            soa: None,
            expires_at: now + Duration::from_secs(ttl as u64),
        });
        slots.push(stored.clone());
        trace!(name = %node.name, rtype = %rrset.rtype, ttl, trust = ?rrset.trust, "cached");
        AddOutcome::Added(stored)
    }

    /// Inserts a negative entry at `node` denying `covers`.
    ///
    /// `covers` is [`RecordType::ANY`] when the whole name is denied
    /// (NXDOMAIN) and the queried type for a no-data denial. The same
    /// trust rules apply against both positive data and prior negatives.
    pub fn add_negative(
        &self,
        node: &CacheNode,
        covers: RecordType,
        trust: Trust,
        ttl: u32,
        soa: Option<RData>,
        now: Instant,
    ) -> AddOutcome {
        let ttl = ttl.min(
            self.config
                .max_negative_ttl
                .as_secs()
                .min(u32::MAX as u64) as u32,
        );
        let mut slots = node.slots.lock();
        slots.retain(|s| !s.is_expired(now));

        let conflicts = |s: &Arc<StoredRrset>| {
            if s.is_negative() {
                s.covers == covers || s.covers == RecordType::ANY || covers == RecordType::ANY
            } else {
                covers == RecordType::ANY || s.rtype == covers
            }
        };

        if let Some(existing) = slots.iter().find(|s| conflicts(s)) {
            if existing.trust >= trust {
                trace!(name = %node.name, covers = %covers, "cache keeps higher-trust entry over negative");
                return AddOutcome::Unchanged(existing.clone());
            }
        }

        slots.retain(|s| !conflicts(s));
        let stored = Arc::new(StoredRrset {
            name: node.name.clone(),
            rtype: RecordType::NONE,
            covers,
            ttl,
            trust,
            rdatas: Vec::new(),
            soa,
            expires_at: now + Duration::from_secs(ttl as u64),
        });
        slots.push(stored.clone());
        trace!(name = %node.name, covers = %covers, ttl, trust = ?trust, "negative cached");
        AddOutcome::Added(stored)
    }

    /// Expiry-checked positive lookup.
    pub fn find_rrset(
        &self,
        name: &Name,
        rtype: RecordType,
        now: Instant,
    ) -> Option<Arc<StoredRrset>> {
        let node = self.nodes.get(name)?.clone();
        let slots = node.slots.lock();
        slots
            .iter()
            .find(|s| s.matches(rtype, RecordType::NONE) && !s.is_expired(now))
            .cloned()
    }

    /// Number of nodes currently held.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true when no nodes are held.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for CacheDb {
    fn default() -> Self {
        Self::new(CacheConfig::default())
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

    fn a_rrset(ttl: u32, trust: Trust, octet: u8) -> Rrset {
        let mut rrset = Rrset::new(RecordType::A, ttl);
        rrset.trust = trust;
        rrset.rdatas.push(RData::A(Ipv4Addr::new(192, 0, 2, octet)));
        rrset
    }

    #[test]
    fn refuses_trust_downgrade() {
        let cache = CacheDb::default();
        let now = Instant::now();
        let node = cache.find_node(&name("isc.org"), true).unwrap();

        let high = cache.add_rrset(&node, &a_rrset(300, Trust::AuthAnswer, 1), now);
        assert!(matches!(high, AddOutcome::Added(_)));

        let low = cache.add_rrset(&node, &a_rrset(300, Trust::Additional, 2), now);
        match low {
            AddOutcome::Unchanged(entry) => {
                assert_eq!(entry.rdatas, vec![RData::A(Ipv4Addr::new(192, 0, 2, 1))]);
            }
            AddOutcome::Added(_) => panic!("downgrade accepted"),
        }
    }

    #[test]
    fn upgrade_replaces() {
        let cache = CacheDb::default();
        let now = Instant::now();
        let node = cache.find_node(&name("isc.org"), true).unwrap();
        cache.add_rrset(&node, &a_rrset(300, Trust::Glue, 1), now);
        let up = cache.add_rrset(&node, &a_rrset(300, Trust::AuthAnswer, 2), now);
        assert!(matches!(up, AddOutcome::Added(_)));
        let found = cache.find_rrset(&name("isc.org"), RecordType::A, now).unwrap();
        assert_eq!(found.rdatas, vec![RData::A(Ipv4Addr::new(192, 0, 2, 2))]);
    }

    #[test]
    fn negative_entry_sharpens_later_positives() {
        let cache = CacheDb::default();
        let now = Instant::now();
        let node = cache.find_node(&name("gone.isc.org"), true).unwrap();

        let neg = cache.add_negative(&node, RecordType::ANY, Trust::AuthAuthority, 900, None, now);
        assert!(matches!(neg, AddOutcome::Added(_)));

        // A weaker positive answer runs into the negative entry.
        let outcome = cache.add_rrset(&node, &a_rrset(300, Trust::Answer, 1), now);
        match outcome {
            AddOutcome::Unchanged(entry) => {
                assert!(entry.is_negative());
                assert_eq!(entry.covers, RecordType::ANY);
            }
            AddOutcome::Added(_) => panic!("negative entry should prevail"),
        }
    }

    #[test]
    fn positive_beats_weaker_negative() {
        let cache = CacheDb::default();
        let now = Instant::now();
        let node = cache.find_node(&name("flaky.isc.org"), true).unwrap();
        cache.add_negative(&node, RecordType::A, Trust::Additional, 900, None, now);
        let outcome = cache.add_rrset(&node, &a_rrset(300, Trust::AuthAnswer, 1), now);
        assert!(matches!(outcome, AddOutcome::Added(_)));
        assert!(cache
            .find_rrset(&name("flaky.isc.org"), RecordType::A, now)
            .is_some());
    }

    #[test]
    fn expiry_hides_entries() {
        let cache = CacheDb::default();
        let now = Instant::now();
        let node = cache.find_node(&name("short.isc.org"), true).unwrap();
        cache.add_rrset(&node, &a_rrset(1, Trust::Answer, 1), now);
        assert!(cache
            .find_rrset(&name("short.isc.org"), RecordType::A, now)
            .is_some());
        let later = now + Duration::from_secs(2);
        assert!(cache
            .find_rrset(&name("short.isc.org"), RecordType::A, later)
            .is_none());
    }

    #[test]
    fn nodata_negative_only_covers_its_type() {
        let cache = CacheDb::default();
        let now = Instant::now();
        let node = cache.find_node(&name("v4only.isc.org"), true).unwrap();
        cache.add_negative(&node, RecordType::AAAA, Trust::AuthAuthority, 900, None, now);

        // A records are unaffected by the AAAA denial.
        let outcome = cache.add_rrset(&node, &a_rrset(300, Trust::Answer, 1), now);
        assert!(matches!(outcome, AddOutcome::Added(_)));
    }
}
