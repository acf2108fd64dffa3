//! The resolver service: shards, fetch creation and coalescing, and the
//! shutdown cascade.

use crate::addrdb::AddressFetcher;
use crate::dispatch::Dispatcher;
use crate::events::{ShardEvent, ShardSender};
use crate::fetch::{Fetch, FetchAnswer, FetchResult};
use crate::resolution::{run_shard, Resolution};
use crate::view::View;
use crate::{
    FetchArgs, FetchError, FetchOptions, ForwardPolicy, NoValidator, Validator,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use skein_proto::{Name, RecordClass, RecordType};
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Resolver construction parameters.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Number of shards (and shard tasks) the fetch population is
    /// partitioned into.
    pub ntasks: usize,
    /// Record class served.
    pub class: RecordClass,
    /// Try to open an IPv6 dispatcher.
    pub enable_v6: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            ntasks: 8,
            class: RecordClass::IN,
            enable_v6: true,
        }
    }
}

/// Lifecycle state of a shared fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchState {
    /// Created, start event not yet processed.
    Init,
    /// Running.
    Active,
    /// Result fanned out.
    Done,
}

/// Coalescing identity of a fetch.
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) struct FetchKey {
    pub name: Name,
    pub rtype: RecordType,
    pub options: FetchOptions,
}

/// One waiting caller.
pub(crate) struct Waiter {
    pub fetch_id: u64,
    pub tx: oneshot::Sender<FetchResult>,
}

/// Shard-locked bookkeeping for one resolution.
pub(crate) struct SharedFetchState {
    pub key: FetchKey,
    pub state: FetchState,
    pub want_shutdown: bool,
    pub references: u32,
    pub waiters: Vec<Waiter>,
    /// The canonical answer, bound by the commit path before fan-out.
    pub answer: Option<FetchAnswer>,
}

/// Shard-locked state.
pub(crate) struct ShardState {
    pub exiting: bool,
    pub fetches: HashMap<u64, SharedFetchState>,
}

/// One shard: its event channel and its lock.
pub(crate) struct Shard {
    pub tx: ShardSender,
    pub state: Mutex<ShardState>,
}

/// Resolver-locked state.
pub(crate) struct ResolverState {
    pub exiting: bool,
    pub active_shards: usize,
    pub shutdown_waiters: Vec<oneshot::Sender<()>>,
}

/// Shared resolver internals.
pub struct ResolverInner {
    pub(crate) class: RecordClass,
    pub(crate) view: Arc<View>,
    pub(crate) shards: Vec<Shard>,
    pub(crate) frozen: AtomicBool,
    forward: Mutex<(Vec<SocketAddr>, ForwardPolicy)>,
    pub(crate) state: Mutex<ResolverState>,
    pub(crate) dispatch4: Option<Arc<Dispatcher>>,
    pub(crate) dispatch6: Option<Arc<Dispatcher>>,
    validator: Mutex<Arc<dyn Validator>>,
    next_id: AtomicU64,
}

impl ResolverInner {
    pub(crate) fn forward_config(&self) -> (Vec<SocketAddr>, ForwardPolicy) {
        let guard = self.forward.lock();
        (guard.0.clone(), guard.1)
    }

    pub(crate) fn forward_policy(&self) -> ForwardPolicy {
        self.forward.lock().1
    }

    pub(crate) fn validator(&self) -> Arc<dyn Validator> {
        self.validator.lock().clone()
    }

    fn shard_for(&self, name: &Name) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        name.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Creates or joins a fetch. See [`Resolver::create_fetch`].
    pub(crate) fn create_fetch(
        inner: &Arc<Self>,
        name: &Name,
        rtype: RecordType,
        args: FetchArgs,
    ) -> Result<Fetch, FetchError> {
        if !inner.frozen.load(Ordering::Acquire) {
            return Err(FetchError::NotFrozen);
        }
        debug!(name = %name, rtype = %rtype, "createfetch");

        let shard_idx = inner.shard_for(name);
        let shard = &inner.shards[shard_idx];
        let key = FetchKey {
            name: name.clone(),
            rtype,
            options: args.options,
        };
        let now = Instant::now();

        let mut st = shard.state.lock();
        if st.exiting {
            return Err(FetchError::ShuttingDown);
        }

        let existing = if args.options.unshared {
            None
        } else {
            st.fetches
                .iter()
                .find(|(_, sh)| sh.state != FetchState::Done && sh.key == key)
                .map(|(rid, _)| *rid)
        };

        let (rid, resolution) = match existing {
            Some(rid) => {
                trace!(rid, "joining existing fetch");
                (rid, None)
            }
            None => {
                let rid = inner.next_id.fetch_add(1, Ordering::Relaxed);
                let resolution =
                    Resolution::new(inner, rid, shard_idx, name.clone(), rtype, &args, now);
                st.fetches.insert(
                    rid,
                    SharedFetchState {
                        key,
                        state: FetchState::Init,
                        want_shutdown: false,
                        references: 0,
                        waiters: Vec::new(),
                        answer: None,
                    },
                );
                (rid, Some(Box::new(resolution)))
            }
        };

        let fetch_id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let Some(sh) = st.fetches.get_mut(&rid) else {
            return Err(FetchError::ShuttingDown);
        };
        sh.waiters.push(Waiter { fetch_id, tx });
        sh.references += 1;
        drop(st);

        if let Some(resolution) = resolution {
            let _ = shard.tx.send(ShardEvent::Start { rid, resolution });
        }

        Ok(Fetch {
            fetch_id,
            shard: shard_idx,
            rid,
            rx: Some(rx),
            resolver: inner.clone(),
        })
    }

    /// Releases one caller's reference; the last reference starts the
    /// resolution's shutdown. Invoked from [`Fetch`]'s drop.
    pub(crate) fn destroy_fetch(inner: &Arc<Self>, shard_idx: usize, rid: u64, fetch_id: u64) {
        let shard = &inner.shards[shard_idx];
        let mut st = shard.state.lock();
        let Some(sh) = st.fetches.get_mut(&rid) else {
            return;
        };
        // A handle dropped without awaiting still holds a waiter slot;
        // its receiver is gone either way.
        if let Some(pos) = sh.waiters.iter().position(|w| w.fetch_id == fetch_id) {
            sh.waiters.remove(pos);
        }
        sh.references = sh.references.saturating_sub(1);
        if sh.references == 0 {
            sh.want_shutdown = true;
            let started = sh.state != FetchState::Init;
            drop(st);
            if started {
                let _ = shard.tx.send(ShardEvent::Control { rid });
            }
        }
    }
}

/// Delivers every waiter exactly one result.
///
/// Callers hold the shard lock. When an answer has been bound it wins;
/// otherwise the terminating result is translated per waiter.
pub(crate) fn send_events(sh: &mut SharedFetchState, result: &Result<(), FetchError>) {
    let answer = sh.answer.clone();
    for waiter in sh.waiters.drain(..) {
        let reply = match (&answer, result) {
            (Some(answer), _) => Ok(answer.clone()),
            (None, Ok(())) => Err(FetchError::ServFail),
            (None, Err(err)) => Err(err.clone()),
        };
        let _ = waiter.tx.send(reply);
    }
}

/// An exiting shard ran out of resolutions.
pub(crate) fn shard_emptied(inner: &Arc<ResolverInner>) {
    let mut state = inner.state.lock();
    if !state.exiting {
        return;
    }
    state.active_shards = state.active_shards.saturating_sub(1);
    if state.active_shards == 0 {
        debug!("all shards quiesced");
        for tx in state.shutdown_waiters.drain(..) {
            let _ = tx.send(());
        }
    }
}

/// The iterative resolver service.
///
/// Configure (forwarders, policy, validator), then [`Resolver::freeze`],
/// then fetch. Shutdown is explicit: [`Resolver::shutdown`] cancels every
/// in-flight fetch and, once all shards quiesce, fires the
/// [`Resolver::when_shutdown`] listeners.
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<ResolverInner>,
}

impl Resolver {
    /// Creates a resolver over `view`. Must run within a tokio runtime;
    /// binds the shared UDP dispatchers and spawns the shard tasks.
    pub fn new(config: ResolverConfig, view: Arc<View>) -> io::Result<Self> {
        let dispatch4 = Some(Arc::new(Dispatcher::bind_v4()?));
        let dispatch6 = if config.enable_v6 {
            Dispatcher::bind_v6().ok().map(Arc::new)
        } else {
            None
        };

        let ntasks = config.ntasks.max(1);
        let mut shards = Vec::with_capacity(ntasks);
        let mut receivers = Vec::with_capacity(ntasks);
        for _ in 0..ntasks {
            let (tx, rx) = mpsc::unbounded_channel();
            shards.push(Shard {
                tx,
                state: Mutex::new(ShardState {
                    exiting: false,
                    fetches: HashMap::new(),
                }),
            });
            receivers.push(rx);
        }

        let inner = Arc::new(ResolverInner {
            class: config.class,
            view,
            shards,
            frozen: AtomicBool::new(false),
            forward: Mutex::new((Vec::new(), ForwardPolicy::None)),
            state: Mutex::new(ResolverState {
                exiting: false,
                active_shards: ntasks,
                shutdown_waiters: Vec::new(),
            }),
            dispatch4,
            dispatch6,
            validator: Mutex::new(Arc::new(NoValidator)),
            next_id: AtomicU64::new(1),
        });

        for (index, rx) in receivers.into_iter().enumerate() {
            tokio::spawn(run_shard(index, rx, Arc::downgrade(&inner)));
        }

        debug!(ntasks, "resolver created");
        Ok(Self { inner })
    }

    /// The view this resolver works against.
    pub fn view(&self) -> &Arc<View> {
        &self.inner.view
    }

    /// Sets the default forwarders. Rejected once frozen.
    pub fn set_forwarders(&self, forwarders: Vec<SocketAddr>) -> Result<(), FetchError> {
        if self.inner.frozen.load(Ordering::Acquire) {
            return Err(FetchError::Frozen);
        }
        self.inner.forward.lock().0 = forwarders;
        Ok(())
    }

    /// Sets the forwarding policy. Rejected once frozen.
    pub fn set_forward_policy(&self, policy: ForwardPolicy) -> Result<(), FetchError> {
        if self.inner.frozen.load(Ordering::Acquire) {
            return Err(FetchError::Frozen);
        }
        self.inner.forward.lock().1 = policy;
        Ok(())
    }

    /// Installs a validation hook. Rejected once frozen.
    pub fn set_validator(&self, validator: Arc<dyn Validator>) -> Result<(), FetchError> {
        if self.inner.frozen.load(Ordering::Acquire) {
            return Err(FetchError::Frozen);
        }
        *self.inner.validator.lock() = validator;
        Ok(())
    }

    /// Freezes configuration and opens the resolver for fetches. Also
    /// wires this resolver into the address database as the out-of-band
    /// address fetcher for glueless delegations.
    pub fn freeze(&self) {
        self.inner.frozen.store(true, Ordering::Release);
        self.inner
            .view
            .adb
            .set_fetcher(Arc::new(ResolverFetcher {
                inner: Arc::downgrade(&self.inner),
                in_flight: Mutex::new(HashSet::new()),
            }));
    }

    /// Starts (or joins) a fetch for (name, type).
    ///
    /// Identical in-flight questions coalesce unless
    /// [`FetchOptions::unshared`] is set; every caller still receives its
    /// own result exactly once.
    pub fn create_fetch(
        &self,
        name: &Name,
        rtype: RecordType,
        args: FetchArgs,
    ) -> Result<Fetch, FetchError> {
        ResolverInner::create_fetch(&self.inner, name, rtype, args)
    }

    /// Cancels one waiter; other waiters of a shared fetch are unaffected.
    pub fn cancel_fetch(&self, fetch: &Fetch) {
        let shard = &self.inner.shards[fetch.shard];
        let mut st = shard.state.lock();
        if let Some(sh) = st.fetches.get_mut(&fetch.rid) {
            if sh.state != FetchState::Done {
                if let Some(pos) = sh
                    .waiters
                    .iter()
                    .position(|w| w.fetch_id == fetch.fetch_id)
                {
                    let waiter = sh.waiters.remove(pos);
                    let _ = waiter.tx.send(Err(FetchError::Canceled));
                }
            }
        }
    }

    /// Shuts the resolver down: every in-flight fetch is canceled, every
    /// shard drains, and the shutdown listeners fire. Idempotent.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.exiting {
            return;
        }
        debug!("resolver shutdown");
        state.exiting = true;

        for (index, shard) in inner.shards.iter().enumerate() {
            let mut st = shard.state.lock();
            for (rid, sh) in st.fetches.iter_mut() {
                if !sh.want_shutdown {
                    sh.want_shutdown = true;
                    if sh.state != FetchState::Init {
                        let _ = shard.tx.send(ShardEvent::Control { rid: *rid });
                    }
                }
            }
            if let Some(dispatcher) = &inner.dispatch4 {
                dispatcher.cancel_shard(index);
            }
            if let Some(dispatcher) = &inner.dispatch6 {
                dispatcher.cancel_shard(index);
            }
            st.exiting = true;
            if st.fetches.is_empty() {
                state.active_shards = state.active_shards.saturating_sub(1);
            }
        }

        if state.active_shards == 0 {
            for tx in state.shutdown_waiters.drain(..) {
                let _ = tx.send(());
            }
        }
    }

    /// Completes once shutdown has finished (immediately, if it already
    /// has).
    pub fn when_shutdown(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.state.lock();
        if state.exiting && state.active_shards == 0 {
            let _ = tx.send(());
        } else {
            state.shutdown_waiters.push(tx);
        }
        rx
    }
}

/// Resolves nameserver addresses through the resolver itself, for
/// delegations that arrive without usable glue.
struct ResolverFetcher {
    inner: Weak<ResolverInner>,
    /// Names being fetched right now; repeats are dropped so glueless
    /// loops fail fast instead of spiraling.
    in_flight: Mutex<HashSet<(Name, RecordType)>>,
}

#[async_trait]
impl AddressFetcher for ResolverFetcher {
    async fn fetch(&self, name: &Name, start_at_root: bool) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut rtypes = vec![RecordType::A];
        if inner.dispatch6.is_some() {
            rtypes.push(RecordType::AAAA);
        }
        for rtype in rtypes {
            if !self.in_flight.lock().insert((name.clone(), rtype)) {
                continue;
            }
            let mut args = FetchArgs {
                options: FetchOptions {
                    unshared: true,
                    ..FetchOptions::default()
                },
                ..FetchArgs::default()
            };
            if start_at_root {
                args.domain = Some(inner.view.hint_nameservers());
            }
            if let Ok(fetch) = ResolverInner::create_fetch(&inner, name, rtype, args) {
                let _ = fetch.outcome().await;
            }
            self.in_flight.lock().remove(&(name.clone(), rtype));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hints::Hints;

    fn test_view() -> Arc<View> {
        View::new(Hints::custom(
            Name::root(),
            vec![(
                "ns.test".parse().unwrap(),
                vec!["127.0.0.1:53".parse().unwrap()],
            )],
        ))
    }

    #[tokio::test]
    async fn create_fetch_requires_freeze() {
        let resolver = Resolver::new(ResolverConfig::default(), test_view()).unwrap();
        let err = resolver
            .create_fetch(
                &"www.isc.org".parse().unwrap(),
                RecordType::A,
                FetchArgs::default(),
            )
            .unwrap_err();
        assert_eq!(err, FetchError::NotFrozen);
    }

    #[tokio::test]
    async fn configuration_is_rejected_after_freeze() {
        let resolver = Resolver::new(ResolverConfig::default(), test_view()).unwrap();
        resolver.freeze();
        assert_eq!(
            resolver.set_forwarders(vec!["192.0.2.1:53".parse().unwrap()]),
            Err(FetchError::Frozen)
        );
        assert_eq!(
            resolver.set_forward_policy(ForwardPolicy::Only),
            Err(FetchError::Frozen)
        );
    }

    #[tokio::test]
    async fn shard_assignment_is_case_insensitive() {
        let resolver = Resolver::new(ResolverConfig::default(), test_view()).unwrap();
        let a = resolver.inner.shard_for(&"WWW.ISC.ORG".parse().unwrap());
        let b = resolver.inner.shard_for(&"www.isc.org".parse().unwrap());
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn shutdown_without_fetches_completes_immediately() {
        let resolver = Resolver::new(ResolverConfig::default(), test_view()).unwrap();
        resolver.freeze();
        resolver.shutdown();
        resolver
            .when_shutdown()
            .await
            .expect("shutdown notification");
        // And createfetch is now refused.
        let err = resolver
            .create_fetch(
                &"www.isc.org".parse().unwrap(),
                RecordType::A,
                FetchArgs::default(),
            )
            .unwrap_err();
        assert_eq!(err, FetchError::ShuttingDown);
    }
}
