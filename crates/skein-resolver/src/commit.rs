//! Committing classified responses to the cache.
//!
//! After classification has marked a message's names and rdatasets, these
//! routines walk the marks, store what is cacheable, and bind the
//! canonical answer for the fetch's waiters. Conflicts with existing
//! cache data of higher trust sharpen the delivered result instead of
//! overwriting the cache.

use crate::fetch::{AnswerKind, FetchAnswer};
use crate::resolution::{Resolution, ATTR_HAVEANSWER, ATTR_WANTCACHE, ATTR_WANTNCACHE};
use crate::resolver::{SharedFetchState, ResolverInner};
use crate::FetchError;
use skein_cache::AddOutcome;
use skein_proto::{Message, OwnerEntry, RData, RecordType, Rrset, Section, Trust};
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

impl Resolution {
    /// Caches every marked rdataset in the answer and additional sections,
    /// binding the answer for the waiters along the way.
    pub(crate) fn cache_message(
        &mut self,
        inner: &Arc<ResolverInner>,
        msg: &Message,
        now: Instant,
    ) -> Result<(), FetchError> {
        trace!(rid = self.rid, "caching response");
        self.clear_attr(ATTR_WANTCACHE);

        let shard = &inner.shards[self.shard];
        let mut st = shard.state.lock();
        let Some(sh) = st.fetches.get_mut(&self.rid) else {
            return Ok(());
        };
        for section in [Section::Answer, Section::Authority, Section::Additional] {
            for entry in msg.section(section) {
                if !entry.has_attr(OwnerEntry::CACHE) {
                    continue;
                }
                self.cache_owner(inner, sh, entry, now)?;
            }
        }
        Ok(())
    }

    /// Caches one marked owner name's rdatasets.
    fn cache_owner(
        &mut self,
        inner: &Arc<ResolverInner>,
        sh: &mut SharedFetchState,
        entry: &OwnerEntry,
        now: Instant,
    ) -> Result<(), FetchError> {
        let need_validation =
            inner.view.security_covers(&entry.name) && !self.options.novalidate;
        let is_answer_owner = entry.has_attr(OwnerEntry::ANSWER);
        // Meta-type questions get a result but no bound rdataset.
        let bind_slots = self.rtype != RecordType::ANY && self.rtype != RecordType::SIG;

        let Some(node) = inner.view.cache.find_node(&entry.name, true) else {
            return Ok(());
        };

        let mut kind = AnswerKind::Positive;
        let mut answer_rrset = None;
        let mut answer_sig = None;

        for rrset in &entry.rrsets {
            if !rrset.has_attr(Rrset::CACHE) {
                continue;
            }

            let mut validated = false;
            if need_validation && rrset.trust != Trust::Glue {
                // Signatures are judged with the data they cover.
                if rrset.is_sig() {
                    continue;
                }
                let sig = entry
                    .rrsets
                    .iter()
                    .find(|s| s.is_sig() && s.covers == rrset.rtype);
                inner
                    .validator()
                    .validate(rrset, sig, rrset.has_attr(Rrset::ANSWER))?;
                validated = true;
            }

            if !validated && rrset.has_attr(Rrset::EXTERNAL) {
                // Outside the query domain; cacheable only once validated.
                continue;
            }

            if rrset.has_attr(Rrset::CHAINING) {
                kind = if rrset.rtype == RecordType::CNAME {
                    AnswerKind::Cname
                } else {
                    AnswerKind::Dname
                };
            }

            let outcome = inner.view.cache.add_rrset(&node, rrset, now);
            if rrset.has_attr(Rrset::ANSWER) && bind_slots {
                match &outcome {
                    AddOutcome::Added(stored) => answer_rrset = Some(stored.clone()),
                    AddOutcome::Unchanged(existing) => {
                        if existing.is_negative() {
                            // The cache's negative entry outranks this
                            // answer; the waiters learn the denial.
                            kind = if existing.covers == RecordType::ANY {
                                AnswerKind::NegativeName
                            } else {
                                AnswerKind::NegativeType
                            };
                        }
                        answer_rrset = Some(existing.clone());
                    }
                }
            } else if rrset.has_attr(Rrset::ANSWERSIG) && bind_slots {
                answer_sig = Some(outcome.entry().clone());
            }
        }

        if is_answer_owner {
            self.set_attr(ATTR_HAVEANSWER);
            sh.answer = Some(FetchAnswer {
                kind,
                name: entry.name.clone(),
                rdataset: answer_rrset,
                sig_rdataset: answer_sig,
            });
        }
        Ok(())
    }

    /// Adds one negative entry for the fetch's own name.
    ///
    /// `covers` is ANY for a nonexistent name, the queried type for a
    /// no-data response.
    pub(crate) fn ncache_message(
        &mut self,
        inner: &Arc<ResolverInner>,
        msg: &Message,
        covers: RecordType,
        now: Instant,
    ) -> Result<(), FetchError> {
        trace!(rid = self.rid, covers = %covers, "negative caching response");
        self.clear_attr(ATTR_WANTNCACHE);

        if inner.view.security_covers(&self.name) && !self.options.novalidate {
            // Validation of denials is with the validator hook, which
            // isn't wired in; record the denial unvalidated.
            trace!(rid = self.rid, "negative entry under a security root");
        }

        // Distill TTL, trust, and SOA evidence from the marked authority
        // rdatasets.
        let mut ttl = 0u32;
        let mut trust = Trust::Additional;
        let mut soa: Option<RData> = None;
        let mut found = false;
        for entry in msg.section(Section::Authority) {
            if !entry.has_attr(OwnerEntry::NCACHE) {
                continue;
            }
            for rrset in &entry.rrsets {
                if !rrset.has_attr(Rrset::NCACHE) {
                    continue;
                }
                let mut set_ttl = rrset.ttl;
                if rrset.rtype == RecordType::SOA {
                    if let Some(rdata @ RData::Soa { minimum, .. }) = rrset.first() {
                        set_ttl = set_ttl.min(*minimum);
                        soa = Some(rdata.clone());
                    }
                }
                ttl = if found { ttl.min(set_ttl) } else { set_ttl };
                trust = trust.max(rrset.trust);
                found = true;
            }
        }

        let shard = &inner.shards[self.shard];
        let mut st = shard.state.lock();
        let Some(sh) = st.fetches.get_mut(&self.rid) else {
            return Ok(());
        };

        let Some(node) = inner.view.cache.find_node(&self.name, true) else {
            return Ok(());
        };
        let outcome = inner
            .view
            .cache
            .add_negative(&node, covers, trust, ttl, soa, now);

        let (kind, handle) = match outcome {
            AddOutcome::Added(stored) => (
                if covers == RecordType::ANY {
                    AnswerKind::NegativeName
                } else {
                    AnswerKind::NegativeType
                },
                stored,
            ),
            AddOutcome::Unchanged(existing) => {
                if existing.is_negative() {
                    // The stored denial is at least as strong; sharpen to
                    // its shape.
                    (
                        if existing.covers == RecordType::ANY {
                            AnswerKind::NegativeName
                        } else {
                            AnswerKind::NegativeType
                        },
                        existing,
                    )
                } else {
                    // The cache holds positive data it trusts more than
                    // this denial.
                    (AnswerKind::Positive, existing)
                }
            }
        };

        if !self.has_attr(ATTR_HAVEANSWER) {
            self.set_attr(ATTR_HAVEANSWER);
            sh.answer = Some(FetchAnswer {
                kind,
                name: self.name.clone(),
                rdataset: Some(handle),
                sig_rdataset: None,
            });
        }
        Ok(())
    }
}
