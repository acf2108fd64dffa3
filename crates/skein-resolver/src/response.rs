//! Response classification.
//!
//! One pass over a parsed response decides what it was: an answer
//! (possibly through a CNAME/DNAME chain), a referral, a negative
//! response, or evidence of a broken server. Classification annotates the
//! message's names and rdatasets in place; the commit module walks the
//! marks afterwards.

use crate::resolution::{
    Resolution, ATTR_GLUING, ATTR_HAVEANSWER, ATTR_WANTCACHE, ATTR_WANTNCACHE,
};
use crate::resolver::ResolverInner;
use crate::{FetchError, LAME_TTL};
use crate::addrdb::ADDR_FLAG_NOEDNS0;
use bytes::Bytes;
use skein_proto::{
    Error as WireError, Header, Message, Name, Opcode, OwnerEntry, Rcode, RecordType, Rrset,
    Section, Trust,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// Classification found the message malformed; the sender is suspect.
pub(crate) struct FormErr;

/// What the authority section of a non-answer said.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NoAnswer {
    /// Negative response; negative caching wanted.
    Negative,
    /// Referral; the query domain has moved down.
    Delegation,
    /// Nothing useful, but nothing fatal either (chained responses).
    Nothing,
}

impl Resolution {
    /// Checks that the response's question matches ours exactly.
    fn same_question(&self, msg: &Message) -> bool {
        if msg.questions.len() != 1 {
            return false;
        }
        let q = &msg.questions[0];
        q.rtype == self.rtype && q.class == self.class && q.name == self.name
    }

    /// Marks address rdatasets (and their signatures) in the additional
    /// section for the given related names.
    fn check_related(&mut self, msg: &mut Message, names: &[Name]) {
        let gluing = self.has_attr(ATTR_GLUING);
        let domain = self.domain.clone();
        for name in names {
            let Some(entry) = msg.find_owner_mut(Section::Additional, name) else {
                continue;
            };
            let external = !entry.name.is_subdomain_of(&domain);
            let mut any = false;
            for rrset in entry.rrsets.iter_mut() {
                if rrset.effective_type().is_address() {
                    rrset.set_attr(Rrset::CACHE);
                    rrset.trust = if gluing { Trust::Glue } else { Trust::Additional };
                    if external {
                        rrset.set_attr(Rrset::EXTERNAL);
                    }
                    any = true;
                }
            }
            if any {
                entry.set_attr(OwnerEntry::CACHE);
            }
        }
    }

    /// Walks the answer section: direct answers, their signatures, and
    /// CNAME/DNAME chains. Unfinished chains hand their tail to
    /// [`Resolution::noanswer_response`].
    pub(crate) fn answer_response(&mut self, msg: &mut Message) -> Result<(), FormErr> {
        let aa = msg.header.aa;
        let qtype = self.rtype;
        let domain = self.domain.clone();
        let mut qname = self.name.clone();

        let mut chaining = false;
        let mut have_answer = false;
        let mut finished = false;
        let mut related: Vec<Name> = Vec::new();

        let answers = msg.section_mut(Section::Answer);
        'names: for entry in answers.iter_mut() {
            let external = !entry.name.is_subdomain_of(&domain);
            if entry.name == qname {
                let mut name_cache = false;
                let mut name_answer = false;
                for rrset in entry.rrsets.iter_mut() {
                    let mut found = false;
                    let mut want_chaining = false;
                    let mut aflag = 0u8;
                    let mut chain_to: Option<Name> = None;

                    if rrset.rtype == qtype || qtype == RecordType::ANY {
                        found = true;
                        finished = true;
                        aflag = Rrset::ANSWER;
                    } else if rrset.is_sig() && rrset.covers == qtype {
                        found = true;
                        aflag = Rrset::ANSWERSIG;
                    } else if rrset.rtype == RecordType::CNAME {
                        // An alias where these types were asked for means
                        // the server is confused.
                        if qtype == RecordType::SIG
                            || qtype == RecordType::KEY
                            || qtype == RecordType::NXT
                        {
                            return Err(FormErr);
                        }
                        found = true;
                        want_chaining = true;
                        aflag = Rrset::ANSWER;
                        chain_to = match rrset.first().and_then(|r| r.target_name()) {
                            Some(target) => Some(target.clone()),
                            None => return Err(FormErr),
                        };
                    } else if rrset.is_sig() && rrset.covers == RecordType::CNAME {
                        found = true;
                        aflag = Rrset::ANSWERSIG;
                    }

                    if found {
                        name_cache = true;
                        rrset.set_attr(Rrset::CACHE);
                        rrset.trust = Trust::Answer;
                        if !chaining {
                            if aflag == Rrset::ANSWER {
                                have_answer = true;
                            }
                            name_answer = true;
                            rrset.set_attr(aflag);
                            if aa {
                                rrset.trust = Trust::AuthAnswer;
                            }
                        } else if external {
                            // Chained data outside the query domain is
                            // cacheable only after validation.
                            rrset.set_attr(Rrset::EXTERNAL);
                        }
                        related.extend(rrset.additional_names().cloned());

                        if want_chaining {
                            chaining = true;
                            rrset.set_attr(Rrset::CHAINING);
                            if let Some(target) = chain_to {
                                qname = target;
                            }
                        }
                    }
                }
                if name_cache {
                    entry.set_attr(OwnerEntry::CACHE);
                }
                if name_answer {
                    entry.set_attr(OwnerEntry::ANSWER);
                }
                if finished {
                    // The final answer ends the walk, after the rest of
                    // this owner (its signatures) has been marked.
                    break 'names;
                }
            } else {
                // Some other owner: only a DNAME (or its signature) is
                // interesting.
                let mut name_cache = false;
                let mut name_answer = false;
                for rrset in entry.rrsets.iter_mut() {
                    let mut found = false;
                    let mut want_chaining = false;
                    let mut aflag = 0u8;
                    let mut chain_to: Option<Name> = None;

                    if rrset.rtype == RecordType::DNAME {
                        if !chaining && external {
                            return Err(FormErr);
                        }
                        found = true;
                        want_chaining = true;
                        aflag = Rrset::ANSWER;
                        let target = match rrset.first().and_then(|r| r.target_name()) {
                            Some(target) => target.clone(),
                            None => return Err(FormErr),
                        };
                        match qname.rebase(&entry.name, &target) {
                            Ok(synthesized) => chain_to = Some(synthesized),
                            Err(WireError::NoSpace(_)) => {
                                // The substitution does not fit; stop
                                // chaining quietly.
                                want_chaining = false;
                            }
                            Err(_) => return Err(FormErr),
                        }
                    } else if rrset.is_sig() && rrset.covers == RecordType::DNAME {
                        found = true;
                        aflag = Rrset::ANSWERSIG;
                    }

                    if found {
                        name_cache = true;
                        rrset.set_attr(Rrset::CACHE);
                        rrset.trust = Trust::Answer;
                        if !chaining {
                            name_answer = true;
                            rrset.set_attr(aflag);
                            if aa {
                                rrset.trust = Trust::AuthAnswer;
                            }
                        } else if external {
                            rrset.set_attr(Rrset::EXTERNAL);
                        }
                        if want_chaining {
                            chaining = true;
                            rrset.set_attr(Rrset::CHAINING);
                            if let Some(target) = chain_to {
                                qname = target;
                            }
                        }
                    }
                }
                if name_cache {
                    entry.set_attr(OwnerEntry::CACHE);
                }
                if name_answer {
                    entry.set_attr(OwnerEntry::ANSWER);
                }
            }
        }

        if !have_answer {
            return Err(FormErr);
        }
        self.set_attr(ATTR_WANTCACHE);
        self.check_related(msg, &related);

        if chaining && !finished {
            // The chain ran past the answer section; the tail may be a
            // negative response.
            return self.noanswer_response(msg, Some(&qname)).map(|_| ());
        }

        if msg.header.rcode != Rcode::NOERROR {
            return Err(FormErr);
        }

        // One look at the authority section: NS (and SIG NS) at the first
        // non-external owner name.
        let mut related: Vec<Name> = Vec::new();
        let auth = msg.section_mut(Section::Authority);
        for entry in auth.iter_mut() {
            let external = !entry.name.is_subdomain_of(&domain);
            if external {
                continue;
            }
            let mut any = false;
            for rrset in entry.rrsets.iter_mut() {
                if rrset.rtype == RecordType::NS
                    || (rrset.is_sig() && rrset.covers == RecordType::NS)
                {
                    any = true;
                    rrset.set_attr(Rrset::CACHE);
                    rrset.trust = if aa && !chaining {
                        Trust::AuthAuthority
                    } else {
                        Trust::Additional
                    };
                    related.extend(rrset.additional_names().cloned());
                }
            }
            if any {
                entry.set_attr(OwnerEntry::CACHE);
            }
            // The first non-external owner ends the look, found or not.
            break;
        }
        self.check_related(msg, &related);
        Ok(())
    }

    /// Walks the authority section of an answerless (or chained-out)
    /// response: referral, negative response, or nothing.
    pub(crate) fn noanswer_response(
        &mut self,
        msg: &mut Message,
        oqname: Option<&Name>,
    ) -> Result<NoAnswer, FormErr> {
        let aa;
        match oqname {
            None => {
                aa = msg.header.aa;
            }
            Some(chained) => {
                // A chain tail outside the query domain can't be judged
                // without validation; call it good enough.
                aa = false;
                if !chained.is_subdomain_of(&self.domain) {
                    return Ok(NoAnswer::Nothing);
                }
            }
        }

        let mut negative = msg.header.rcode == Rcode::NXDOMAIN
            || (msg.record_count(Section::Answer) == 0
                && msg.record_count(Section::Authority) == 0);

        let domain = self.domain.clone();
        let mut ns_owner: Option<usize> = None;
        let mut soa_owner: Option<usize> = None;

        let auth = msg.section_mut(Section::Authority);
        for (index, entry) in auth.iter_mut().enumerate() {
            if !entry.name.is_subdomain_of(&domain) {
                continue;
            }
            for rrset in entry.rrsets.iter_mut() {
                if rrset.rtype == RecordType::NS {
                    // Only one NS owner is allowed.
                    if ns_owner.is_some_and(|prev| prev != index) {
                        return Err(FormErr);
                    }
                    ns_owner = Some(index);
                    rrset.set_attr(Rrset::CACHE);
                    rrset.trust = Trust::Glue;
                    entry.attributes |= OwnerEntry::CACHE;
                } else if rrset.rtype == RecordType::SOA || rrset.rtype == RecordType::NXT {
                    // Only one SOA owner is allowed.
                    if soa_owner.is_some_and(|prev| prev != index) {
                        return Err(FormErr);
                    }
                    soa_owner = Some(index);
                    negative = true;
                    rrset.set_attr(Rrset::NCACHE);
                    rrset.trust = if aa {
                        Trust::AuthAuthority
                    } else {
                        Trust::Additional
                    };
                    entry.attributes |= OwnerEntry::NCACHE;
                }
            }
        }

        if !negative && ns_owner.is_none() {
            return if oqname.is_some() {
                // A partial chain with nothing useful here; no answer, but
                // no error either.
                Ok(NoAnswer::Nothing)
            } else {
                Err(FormErr)
            };
        }

        if let (Some(ns), Some(soa)) = (ns_owner, soa_owner) {
            if ns != soa {
                return Err(FormErr);
            }
        }

        if !negative && oqname.is_none() {
            if let Some(index) = ns_owner {
                // A referral. Mark its glue before the query domain moves.
                let (referral, related) = {
                    let entry = &msg.section(Section::Authority)[index];
                    let related: Vec<Name> = entry
                        .find(RecordType::NS, RecordType::NONE)
                        .map(|rrset| rrset.additional_names().cloned().collect())
                        .unwrap_or_default();
                    (entry.name.clone(), related)
                };
                self.set_attr(ATTR_GLUING);
                self.check_related(msg, &related);
                self.clear_attr(ATTR_GLUING);

                trace!(rid = self.rid, from = %self.domain, to = %referral, "referral");
                self.domain = referral;
                self.nameservers = Rrset::new(RecordType::NS, 0);
                self.set_attr(ATTR_WANTCACHE);
                return Ok(NoAnswer::Delegation);
            }
        }

        // Not following a referral, so any NS found must not be cached.
        if let Some(index) = ns_owner {
            msg.section_mut(Section::Authority)[index].clear_attr(OwnerEntry::CACHE);
        }

        if negative {
            self.set_attr(ATTR_WANTNCACHE);
            Ok(NoAnswer::Negative)
        } else {
            Ok(NoAnswer::Nothing)
        }
    }
}

// ===========================================================================
// Response event handling
// ===========================================================================

/// Transport and parse failures the EDNS0-disable retry applies to.
fn is_unexpected_end(err: &WireError) -> bool {
    matches!(err, WireError::UnexpectedEnd { .. })
}

/// Handles a response (or transport failure) for an outstanding query.
pub(crate) fn on_response(
    map: &mut HashMap<u64, Resolution>,
    rid: u64,
    qid: u64,
    payload: std::io::Result<(Bytes, Instant)>,
    inner: &Arc<ResolverInner>,
) {
    let Some(r) = map.get_mut(&rid) else {
        return;
    };
    if !r.queries.contains_key(&qid) {
        return; // canceled before the response arrived
    }
    r.touch_timer(inner);

    let mut keep_trying = false;
    let mut broken_server = false;
    let mut get_nameservers = false;
    let mut resend = false;
    let mut finish = None;
    let mut result: Result<(), FetchError> = Ok(());
    let now = Instant::now();

    let (entry, mut options) = {
        let query = &r.queries[&qid];
        (query.target.entry.clone(), query.options)
    };

    'classify: {
        let bytes = match payload {
            Ok((bytes, received)) => {
                finish = Some(received);
                bytes
            }
            Err(err) => {
                // Transport failure on the private TCP exchange.
                debug!(rid, qid, error = %err, "tcp exchange failed");
                if !options.noedns0 {
                    options.noedns0 = true;
                    resend = true;
                    inner
                        .view
                        .adb
                        .change_flags(&entry, ADDR_FLAG_NOEDNS0, ADDR_FLAG_NOEDNS0);
                } else {
                    broken_server = true;
                    keep_trying = true;
                }
                break 'classify;
            }
        };

        let mut truncated = false;
        let parsed = match Message::parse(&bytes) {
            Ok(msg) => Some(msg),
            Err(err) if is_unexpected_end(&err) => {
                let tc = Header::parse(&bytes).map(|h| h.tc).unwrap_or(false);
                let question_ok = Message::parse_questions(&bytes).is_ok();
                if !question_ok || !tc || options.tcp {
                    // A short message that isn't a legitimate truncation.
                    if !options.noedns0 {
                        options.noedns0 = true;
                        resend = true;
                        inner
                            .view
                            .adb
                            .change_flags(&entry, ADDR_FLAG_NOEDNS0, ADDR_FLAG_NOEDNS0);
                    } else {
                        broken_server = true;
                        keep_trying = true;
                    }
                    break 'classify;
                }
                truncated = true;
                None
            }
            Err(err) => {
                // Malformed response; EDNS0 confusion is the usual cause.
                debug!(rid, qid, error = %err, "unparseable response");
                if !options.noedns0 {
                    options.noedns0 = true;
                    resend = true;
                    inner
                        .view
                        .adb
                        .change_flags(&entry, ADDR_FLAG_NOEDNS0, ADDR_FLAG_NOEDNS0);
                } else {
                    broken_server = true;
                    keep_trying = true;
                }
                break 'classify;
            }
        };

        if let Some(msg) = &parsed {
            if msg.header.tc {
                truncated = true;
            }
        }
        if truncated {
            if options.tcp {
                broken_server = true;
                keep_trying = true;
            } else {
                options.tcp = true;
                resend = true;
            }
            break 'classify;
        }

        let Some(mut msg) = parsed else {
            broken_server = true;
            keep_trying = true;
            break 'classify;
        };

        if msg.header.opcode != Opcode::QUERY {
            broken_server = true;
            keep_trying = true;
            break 'classify;
        }

        let rcode = msg.header.rcode;
        if rcode != Rcode::NOERROR && rcode != Rcode::NXDOMAIN {
            if !options.noedns0 && rcode == Rcode::FORMERR {
                // Very likely an EDNS0 allergy.
                options.noedns0 = true;
                resend = true;
                inner
                    .view
                    .adb
                    .change_flags(&entry, ADDR_FLAG_NOEDNS0, ADDR_FLAG_NOEDNS0);
            } else {
                debug!(rid, rcode = %rcode, "unhelpful rcode");
                broken_server = true;
                keep_trying = true;
            }
            break 'classify;
        }

        if !r.same_question(&msg) {
            debug!(rid, "response question mismatch");
            broken_server = true;
            keep_trying = true;
            break 'classify;
        }

        if msg.record_count(Section::Answer) > 0
            && (rcode == Rcode::NOERROR || rcode == Rcode::NXDOMAIN)
        {
            match r.answer_response(&mut msg) {
                Ok(()) => {}
                Err(FormErr) => {
                    broken_server = true;
                    keep_trying = true;
                    break 'classify;
                }
            }
        } else if msg.record_count(Section::Authority) > 0
            || rcode == Rcode::NOERROR
            || rcode == Rcode::NXDOMAIN
        {
            match r.noanswer_response(&mut msg, None) {
                Ok(NoAnswer::Delegation) => {
                    get_nameservers = true;
                    keep_trying = true;
                }
                Ok(_) => {}
                Err(FormErr) => {
                    broken_server = true;
                    keep_trying = true;
                    break 'classify;
                }
            }
        } else {
            broken_server = true;
            keep_trying = true;
            break 'classify;
        }

        if r.has_attr(ATTR_WANTCACHE) {
            if let Err(err) = r.cache_message(inner, &msg, now) {
                result = Err(err);
                break 'classify;
            }
        }
        if r.has_attr(ATTR_WANTNCACHE) {
            let covers = if rcode == Rcode::NXDOMAIN {
                RecordType::ANY
            } else {
                r.rtype
            };
            if let Err(err) = r.ncache_message(inner, &msg, covers, now) {
                result = Err(err);
            }
        }
    }

    // The query's fate is decided; account for it and move on.
    let target = r.queries[&qid].target.clone();
    r.cancel_query(inner, qid, finish, false);

    if keep_trying {
        if broken_server {
            // Lame or broken; steer away from it for a while. Failures to
            // record this are of no consequence.
            inner
                .view
                .adb
                .mark_lame(target.entry.sockaddr, &r.domain, now + LAME_TTL);
        }
        if get_nameservers {
            // Refresh the nameserver set for the new query domain; the
            // cut must be at or below it.
            let (cut, nameservers) = inner.view.find_zonecut(&r.domain, now);
            if !cut.is_subdomain_of(&r.domain) {
                debug!(rid, domain = %r.domain, cut = %cut, "nameservers now above the query domain");
                r.done(inner, Err(FetchError::ServFail));
                return;
            }
            r.domain = cut;
            r.nameservers = nameservers;
            r.cancel_queries(inner, true);
            r.cleanup_finds();
            r.cleanup_forwaddrs();
        }
        r.try_next(inner);
    } else if resend {
        if let Err(err) = r.issue_query(inner, target, options) {
            r.done(inner, Err(err));
        }
    } else if result.is_ok() && !r.has_attr(ATTR_HAVEANSWER) {
        // All good so far but the answer is with the validator.
        r.cancel_queries(inner, true);
        r.stop_idle_timer(inner);
    } else {
        r.done(inner, result);
    }
}
