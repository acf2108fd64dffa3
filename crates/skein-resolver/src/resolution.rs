//! The per-question resolution state machine.
//!
//! Each resolution is owned by exactly one shard task; everything in
//! [`Resolution`] is task-serialized state, mutated only while that task
//! handles an event. Shared bookkeeping (waiters, references, fetch
//! state) lives in the shard's lock over in the resolver module.

use crate::addrdb::{FindOptions, FoundAddr, RttAdjust};
use crate::dispatch::Route;
use crate::events::{ShardEvent, ShardReceiver};
use crate::query::{self, retry_interval, NsQuery, QueryTarget, UDP_SEND_LIMIT};
use crate::resolver::{self, FetchState, ResolverInner};
use crate::{FetchArgs, FetchError, FetchOptions, ForwardPolicy, ADVERTISED_UDP_SIZE, FETCH_LIFETIME, MAX_RESTARTS};
use skein_proto::{Edns, Message, Name, Question, RData, RecordClass, RecordType, Rrset};
use crate::addrdb::{Find, ADDR_FLAG_NOEDNS0};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// An answer has been bound for the waiters.
pub(crate) const ATTR_HAVEANSWER: u8 = 0x01;
/// Currently marking referral glue; related data gets glue trust.
pub(crate) const ATTR_GLUING: u8 = 0x02;
/// Waiting for the address database to report back.
pub(crate) const ATTR_ADDRWAIT: u8 = 0x04;
/// Shutdown has begun.
pub(crate) const ATTR_SHUTTINGDOWN: u8 = 0x08;
/// The classified response has cacheable data.
pub(crate) const ATTR_WANTCACHE: u8 = 0x10;
/// The classified response has negative-cacheable data.
pub(crate) const ATTR_WANTNCACHE: u8 = 0x20;

/// One-shot timer bound to a resolution.
#[derive(Default)]
pub(crate) struct TimerHandle {
    epoch: u64,
    task: Option<JoinHandle<()>>,
}

impl TimerHandle {
    fn disarm(&mut self) -> u64 {
        self.epoch += 1;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.epoch
    }
}

/// Task-serialized state of one in-flight question.
pub(crate) struct Resolution {
    pub rid: u64,
    pub name: Name,
    pub rtype: RecordType,
    pub class: RecordClass,
    pub options: FetchOptions,
    pub shard: usize,
    /// Current zone cut queries are attempted from.
    pub domain: Name,
    /// The zone cut's NS rdataset.
    pub nameservers: Rrset,
    pub attributes: u8,
    /// Absolute end of this fetch's life.
    pub expires: Instant,
    /// Current idle retry interval.
    pub interval: Duration,
    pub timer: TimerHandle,
    pub queries: HashMap<u64, NsQuery>,
    next_qid: u64,
    /// Address lists per nameserver, sorted across by head SRTT.
    pub finds: Vec<Find>,
    /// Round-robin position in `finds`.
    pub cursor: Option<usize>,
    /// Forwarder addresses for this round.
    pub forwaddrs: Vec<FoundAddr>,
    /// Fetch-local forwarders.
    pub forwarders: Vec<SocketAddr>,
    /// Outstanding address lookouts.
    pub pending: u32,
    /// Outstanding validations.
    pub validating: u32,
    /// Rounds through the address list.
    pub restarts: u32,
}

/// What an address-gathering round produced.
enum GatherOutcome {
    Found,
    Wait,
    Fail(FetchError),
}

impl Resolution {
    pub(crate) fn new(
        inner: &Arc<ResolverInner>,
        rid: u64,
        shard: usize,
        name: Name,
        rtype: RecordType,
        args: &FetchArgs,
        now: Instant,
    ) -> Self {
        let (domain, nameservers) = match &args.domain {
            Some((domain, ns)) => (domain.clone(), ns.clone()),
            None => {
                if inner.forward_policy() == ForwardPolicy::Only {
                    (Name::root(), Rrset::new(RecordType::NS, 0))
                } else {
                    inner.view.find_zonecut(&name, now)
                }
            }
        };
        Self {
            rid,
            name,
            rtype,
            class: inner.class,
            options: args.options,
            shard,
            domain,
            nameservers,
            attributes: 0,
            expires: now + FETCH_LIFETIME,
            interval: Duration::from_secs(2),
            timer: TimerHandle::default(),
            queries: HashMap::new(),
            next_qid: 0,
            finds: Vec::new(),
            cursor: None,
            forwaddrs: Vec::new(),
            forwarders: args.forwarders.clone(),
            pending: 0,
            validating: 0,
            restarts: 0,
        }
    }

    #[inline]
    pub(crate) fn has_attr(&self, mask: u8) -> bool {
        self.attributes & mask != 0
    }

    #[inline]
    pub(crate) fn set_attr(&mut self, mask: u8) {
        self.attributes |= mask;
    }

    #[inline]
    pub(crate) fn clear_attr(&mut self, mask: u8) {
        self.attributes &= !mask;
    }

    // =======================================================================
    // Timers
    // =======================================================================

    fn arm_timer(&mut self, inner: &Arc<ResolverInner>, deadline: Instant) {
        let epoch = self.timer.disarm();
        let lifetime = deadline >= self.expires;
        let tx = inner.shards[self.shard].tx.clone();
        let rid = self.rid;
        self.timer.task = Some(tokio::spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            let _ = tx.send(ShardEvent::Timeout {
                rid,
                epoch,
                lifetime,
            });
        }));
    }

    /// Arms both the idle interval and the absolute lifetime.
    pub(crate) fn start_timer(&mut self, inner: &Arc<ResolverInner>) {
        let deadline = self.expires.min(Instant::now() + self.interval);
        self.arm_timer(inner, deadline);
    }

    /// Keeps only the absolute lifetime running.
    pub(crate) fn stop_idle_timer(&mut self, inner: &Arc<ResolverInner>) {
        let deadline = self.expires;
        self.arm_timer(inner, deadline);
    }

    /// Restarts the idle countdown (a response arrived).
    pub(crate) fn touch_timer(&mut self, inner: &Arc<ResolverInner>) {
        self.start_timer(inner);
    }

    pub(crate) fn stop_timer(&mut self) {
        self.timer.disarm();
    }

    pub(crate) fn timer_epoch(&self) -> u64 {
        self.timer.epoch
    }

    // =======================================================================
    // Address acquisition
    // =======================================================================

    /// Gathers a fresh candidate address set: forwarders first, then the
    /// current zone cut's nameservers through the address database.
    fn gather_addresses(&mut self, inner: &Arc<ResolverInner>) -> GatherOutcome {
        self.restarts += 1;
        if self.restarts > MAX_RESTARTS {
            debug!(rid = self.rid, "too many restarts");
            return GatherOutcome::Fail(FetchError::ServFail);
        }

        let (default_forwarders, policy) = inner.forward_config();
        let forwarders = if self.forwarders.is_empty() {
            default_forwarders
        } else {
            self.forwarders.clone()
        };
        for sockaddr in forwarders {
            let mut addr = inner.view.adb.find_addrinfo(sockaddr);
            addr.forwarder = true;
            self.forwaddrs.push(addr);
        }

        if policy != ForwardPolicy::Only {
            let now = Instant::now();
            let ns_names: Vec<Name> = self
                .nameservers
                .rdatas
                .iter()
                .filter_map(|rdata| match rdata {
                    RData::Ns(name) => Some(name.clone()),
                    _ => None,
                })
                .collect();
            for ns_name in ns_names {
                // A nameserver beneath its own zone cut whose glue expired
                // must be re-learned from the top.
                let start_at_root = ns_name.is_subdomain_of(&self.domain);
                let options = FindOptions {
                    want_event: true,
                    start_at_root,
                    v4: inner.dispatch4.is_some(),
                    v6: inner.dispatch6.is_some(),
                };
                let tx = inner.shards[self.shard].tx.clone();
                let rid = self.rid;
                match inner.view.adb.create_find(
                    &ns_name,
                    &self.domain,
                    options,
                    now,
                    move |more| {
                        let _ = tx.send(ShardEvent::FindDone { rid, more });
                    },
                ) {
                    crate::addrdb::FindOutcome::Found(find) => self.finds.push(find),
                    crate::addrdb::FindOutcome::Pending => self.pending += 1,
                    crate::addrdb::FindOutcome::NoAddresses => {}
                }
            }
        }

        if self.finds.is_empty() && self.forwaddrs.is_empty() {
            if self.pending > 0 {
                GatherOutcome::Wait
            } else {
                debug!(rid = self.rid, domain = %self.domain, "no candidate addresses");
                GatherOutcome::Fail(FetchError::ServFail)
            }
        } else {
            self.finds
                .sort_by_key(|f| f.addrs.first().map(|a| a.entry.srtt()).unwrap_or(u32::MAX));
            self.cursor = None;
            GatherOutcome::Found
        }
    }

    /// Yields the next untried address: unmarked forwarders first, then a
    /// round-robin walk of the finds. Marks what it returns.
    pub(crate) fn next_address(&mut self) -> Option<QueryTarget> {
        for addr in self.forwaddrs.iter_mut() {
            if !addr.marked {
                addr.marked = true;
                self.cursor = None;
                return Some(QueryTarget {
                    entry: addr.entry.clone(),
                    forwarder: true,
                });
            }
        }

        let n = self.finds.len();
        if n == 0 {
            return None;
        }
        let order: Vec<usize> = match self.cursor {
            None => (0..n).collect(),
            Some(current) => ((current + 1)..n).chain(0..current).collect(),
        };
        for index in order {
            if let Some(addr) = self.finds[index].addrs.iter_mut().find(|a| !a.marked) {
                addr.marked = true;
                let target = QueryTarget {
                    entry: addr.entry.clone(),
                    forwarder: addr.forwarder,
                };
                self.cursor = Some(index);
                return Some(target);
            }
        }
        None
    }

    /// Tries the next address, restarting the gather cycle when the
    /// current round is exhausted.
    pub(crate) fn try_next(&mut self, inner: &Arc<ResolverInner>) {
        debug_assert!(!self.has_attr(ATTR_ADDRWAIT));

        let target = match self.next_address() {
            Some(target) => target,
            None => {
                // Round exhausted: start over.
                self.cancel_queries(inner, true);
                self.cleanup_finds();
                self.cleanup_forwaddrs();
                match self.gather_addresses(inner) {
                    GatherOutcome::Wait => {
                        trace!(rid = self.rid, "waiting for addresses");
                        self.set_attr(ATTR_ADDRWAIT);
                        return;
                    }
                    GatherOutcome::Fail(err) => {
                        self.done(inner, Err(err));
                        return;
                    }
                    GatherOutcome::Found => {}
                }
                match self.next_address() {
                    Some(target) => target,
                    None => {
                        self.done(inner, Err(FetchError::ServFail));
                        return;
                    }
                }
            }
        };

        let options = self.options;
        if let Err(err) = self.issue_query(inner, target, options) {
            self.done(inner, Err(err));
        }
    }

    // =======================================================================
    // Query issuance
    // =======================================================================

    /// Issues one query to `target`, arming the retry timer.
    pub(crate) fn issue_query(
        &mut self,
        inner: &Arc<ResolverInner>,
        target: QueryTarget,
        options: FetchOptions,
    ) -> Result<(), FetchError> {
        self.interval = retry_interval(self.restarts, target.entry.srtt());
        self.start_timer(inner);

        let qid = self.next_qid;
        self.next_qid += 1;
        trace!(
            rid = self.rid,
            qid,
            server = %target.entry.sockaddr,
            tcp = options.tcp,
            "issuing query"
        );

        let mut query = NsQuery {
            qid,
            target,
            options,
            start: Instant::now(),
            id: 0,
            udp: None,
            tcp: None,
            connecting: false,
            io_task: None,
        };

        if options.tcp {
            query.id = rand::random();
            query.connecting = true;
            let tx = inner.shards[self.shard].tx.clone();
            query.io_task = Some(query::spawn_connect(
                query.target.entry.sockaddr,
                tx,
                self.rid,
                qid,
            ));
            self.queries.insert(qid, query);
            return Ok(());
        }

        let dispatcher = match query.target.entry.sockaddr {
            SocketAddr::V4(_) => inner.dispatch4.clone(),
            SocketAddr::V6(_) => inner.dispatch6.clone(),
        }
        .ok_or(FetchError::ServFail)?;
        let route = Route {
            tx: inner.shards[self.shard].tx.clone(),
            shard: self.shard,
            rid: self.rid,
            qid,
        };
        let id = dispatcher
            .add_response(query.target.entry.sockaddr, route)
            .ok_or(FetchError::ServFail)?;
        query.id = id;
        query.udp = Some(dispatcher);
        self.queries.insert(qid, query);

        match self.send_query(inner, qid) {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(mut query) = self.queries.remove(&qid) {
                    query.teardown();
                }
                Err(err)
            }
        }
    }

    /// Renders and sends the question for an issued query.
    pub(crate) fn send_query(
        &mut self,
        inner: &Arc<ResolverInner>,
        qid: u64,
    ) -> Result<(), FetchError> {
        let tx = inner.shards[self.shard].tx.clone();
        let rid = self.rid;
        let question = Question {
            name: self.name.clone(),
            rtype: self.rtype,
            class: self.class,
        };

        let Some(query) = self.queries.get_mut(&qid) else {
            return Ok(());
        };
        let mut msg = Message::query(question);
        msg.header.id = query.id;
        // RD goes out when the caller asked for recursion or we're talking
        // to a forwarder.
        msg.header.rd = query.options.recursive || query.target.forwarder;

        if !query.options.noedns0 {
            if query.target.entry.flags() & ADDR_FLAG_NOEDNS0 != 0 {
                // Known to dislike EDNS0.
                query.options.noedns0 = true;
            } else {
                msg.edns = Some(Edns::advertising(ADVERTISED_UDP_SIZE));
            }
        }

        let wire = msg.to_wire();
        if let Some(dispatcher) = &query.udp {
            if wire.len() > UDP_SEND_LIMIT {
                return Err(FetchError::ServFail);
            }
            dispatcher.send(query.target.entry.sockaddr, wire, tx, rid, qid);
        } else {
            let stream = query.tcp.take().ok_or(FetchError::ServFail)?;
            query.io_task = Some(query::spawn_tcp_exchange(stream, wire, tx, rid, qid));
        }
        trace!(rid, qid, "query sent");
        Ok(())
    }

    /// Cancels one query, folding its fate into the server's SRTT.
    ///
    /// With a `finish` time the measured RTT is averaged in; with
    /// `no_response` the SRTT is penalized and replaced.
    pub(crate) fn cancel_query(
        &mut self,
        inner: &Arc<ResolverInner>,
        qid: u64,
        finish: Option<Instant>,
        no_response: bool,
    ) {
        let Some(mut query) = self.queries.remove(&qid) else {
            return;
        };
        if finish.is_some() || no_response {
            let (rtt, how) = match finish {
                Some(at) => (
                    at.saturating_duration_since(query.start)
                        .as_micros()
                        .min(u32::MAX as u128) as u32,
                    RttAdjust::Average,
                ),
                None => (
                    query
                        .target
                        .entry
                        .srtt()
                        .saturating_add(100_000u32.saturating_mul(self.restarts))
                        .min(10_000_000),
                    RttAdjust::Replace,
                ),
            };
            inner.view.adb.adjust_srtt(&query.target.entry, rtt, how);
        }
        query.teardown();
    }

    pub(crate) fn cancel_queries(&mut self, inner: &Arc<ResolverInner>, no_response: bool) {
        let qids: Vec<u64> = self.queries.keys().copied().collect();
        for qid in qids {
            self.cancel_query(inner, qid, None, no_response);
        }
    }

    pub(crate) fn cleanup_finds(&mut self) {
        self.finds.clear();
        self.cursor = None;
    }

    pub(crate) fn cleanup_forwaddrs(&mut self) {
        self.forwaddrs.clear();
    }

    pub(crate) fn stop_everything(&mut self, inner: &Arc<ResolverInner>) {
        self.cancel_queries(inner, false);
        self.cleanup_finds();
        self.cleanup_forwaddrs();
        self.stop_timer();
    }

    /// Ends the fetch: stops all activity, marks done, fans the result out.
    pub(crate) fn done(&mut self, inner: &Arc<ResolverInner>, result: Result<(), FetchError>) {
        trace!(rid = self.rid, ok = result.is_ok(), "fetch done");
        self.stop_everything(inner);
        let shard = &inner.shards[self.shard];
        let mut st = shard.state.lock();
        if let Some(sh) = st.fetches.get_mut(&self.rid) {
            sh.state = FetchState::Done;
            resolver::send_events(sh, &result);
        }
    }
}

// ===========================================================================
// Shard event loop
// ===========================================================================

/// Runs one shard's event loop until its channel closes.
pub(crate) async fn run_shard(
    shard_idx: usize,
    mut rx: ShardReceiver,
    inner: Weak<ResolverInner>,
) {
    let mut resolutions: HashMap<u64, Resolution> = HashMap::new();
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            ShardEvent::Start { rid, resolution } => {
                resolutions.insert(rid, *resolution);
                on_start(&mut resolutions, rid, &inner, shard_idx);
            }
            ShardEvent::Control { rid } => on_control(&mut resolutions, rid, &inner, shard_idx),
            ShardEvent::Timeout {
                rid,
                epoch,
                lifetime,
            } => on_timeout(&mut resolutions, rid, epoch, lifetime, &inner),
            ShardEvent::FindDone { rid, more } => {
                on_find_done(&mut resolutions, rid, more, &inner, shard_idx)
            }
            ShardEvent::Connected { rid, qid, result } => {
                on_connected(&mut resolutions, rid, qid, result, &inner)
            }
            ShardEvent::SendError { rid, qid } => {
                if let Some(r) = resolutions.get_mut(&rid) {
                    r.cancel_query(&inner, qid, None, false);
                }
            }
            ShardEvent::Response { rid, qid, payload } => {
                crate::response::on_response(&mut resolutions, rid, qid, payload, &inner)
            }
        }
    }
}

/// Removes a resolution entirely, notifying shutdown listeners when this
/// empties an exiting shard.
pub(crate) fn destroy_resolution(
    map: &mut HashMap<u64, Resolution>,
    rid: u64,
    inner: &Arc<ResolverInner>,
    shard_idx: usize,
) {
    if let Some(mut r) = map.remove(&rid) {
        r.stop_timer();
        trace!(rid, "resolution destroyed");
    }
    let shard = &inner.shards[shard_idx];
    let emptied = {
        let mut st = shard.state.lock();
        st.fetches.remove(&rid);
        st.exiting && st.fetches.is_empty()
    };
    if emptied {
        resolver::shard_emptied(inner);
    }
}

fn on_start(
    map: &mut HashMap<u64, Resolution>,
    rid: u64,
    inner: &Arc<ResolverInner>,
    shard_idx: usize,
) {
    let shutting_down = {
        let shard = &inner.shards[shard_idx];
        let mut st = shard.state.lock();
        match st.fetches.get_mut(&rid) {
            Some(sh) if sh.want_shutdown => {
                // Asked to die before it ever ran; any waiters see CANCELED.
                sh.state = FetchState::Done;
                resolver::send_events(sh, &Err(FetchError::Canceled));
                true
            }
            Some(sh) => {
                sh.state = FetchState::Active;
                false
            }
            None => true,
        }
    };
    if shutting_down {
        destroy_resolution(map, rid, inner, shard_idx);
    } else if let Some(r) = map.get_mut(&rid) {
        trace!(rid, name = %r.name, rtype = %r.rtype, "fetch starting");
        r.try_next(inner);
    }
}

fn on_control(
    map: &mut HashMap<u64, Resolution>,
    rid: u64,
    inner: &Arc<ResolverInner>,
    shard_idx: usize,
) {
    let destroy = {
        let Some(r) = map.get_mut(&rid) else {
            return;
        };
        r.set_attr(ATTR_SHUTTINGDOWN);
        let shard = &inner.shards[shard_idx];
        let mut st = shard.state.lock();
        let Some(sh) = st.fetches.get_mut(&rid) else {
            return;
        };
        if sh.state != FetchState::Done {
            r.stop_everything(inner);
            sh.state = FetchState::Done;
            resolver::send_events(sh, &Err(FetchError::Canceled));
        }
        sh.references == 0 && r.pending == 0 && r.validating == 0
    };
    if destroy {
        destroy_resolution(map, rid, inner, shard_idx);
    }
}

fn on_timeout(
    map: &mut HashMap<u64, Resolution>,
    rid: u64,
    epoch: u64,
    lifetime: bool,
    inner: &Arc<ResolverInner>,
) {
    let Some(r) = map.get_mut(&rid) else {
        return;
    };
    if epoch != r.timer_epoch() {
        return; // a stale arm generation
    }
    if lifetime {
        r.done(inner, Err(FetchError::Timeout));
    } else {
        // Idle tick: running queries stay out; just try another server.
        r.clear_attr(ATTR_ADDRWAIT);
        r.try_next(inner);
    }
}

fn on_find_done(
    map: &mut HashMap<u64, Resolution>,
    rid: u64,
    more: bool,
    inner: &Arc<ResolverInner>,
    shard_idx: usize,
) {
    let destroy = {
        let Some(r) = map.get_mut(&rid) else {
            return;
        };
        trace!(rid, more, "address lookout finished");
        r.pending = r.pending.saturating_sub(1);
        if r.has_attr(ATTR_ADDRWAIT) {
            r.clear_attr(ATTR_ADDRWAIT);
            if more {
                r.try_next(inner);
            } else if r.pending == 0 {
                // Nothing else to wait for and no addresses to show.
                r.done(inner, Err(FetchError::ServFail));
            }
            false
        } else if r.has_attr(ATTR_SHUTTINGDOWN) && r.pending == 0 && r.validating == 0 {
            let shard = &inner.shards[shard_idx];
            let st = shard.state.lock();
            st.fetches.get(&rid).is_some_and(|sh| sh.references == 0)
        } else {
            false
        }
    };
    if destroy {
        destroy_resolution(map, rid, inner, shard_idx);
    }
}

fn on_connected(
    map: &mut HashMap<u64, Resolution>,
    rid: u64,
    qid: u64,
    result: std::io::Result<tokio::net::TcpStream>,
    inner: &Arc<ResolverInner>,
) {
    let Some(r) = map.get_mut(&rid) else {
        return; // canceled; the stream drops here
    };
    let connected = {
        let Some(query) = r.queries.get_mut(&qid) else {
            return;
        };
        query.connecting = false;
        match result {
            Ok(stream) => {
                query.tcp = Some(stream);
                true
            }
            Err(err) => {
                debug!(rid, qid, error = %err, "tcp connect failed");
                false
            }
        }
    };
    if connected {
        if r.send_query(inner, qid).is_err() {
            r.cancel_query(inner, qid, None, false);
        }
    } else {
        r.cancel_query(inner, qid, None, false);
    }
}
