//! Caller-facing fetch handles and results.

use crate::resolver::ResolverInner;
use crate::FetchError;
use skein_cache::StoredRrset;
use skein_proto::Name;
use std::sync::Arc;
use tokio::sync::oneshot;

/// What kind of answer a successful fetch produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerKind {
    /// A positive answer of the queried type.
    Positive,
    /// The chain ended at a CNAME; the caller re-queries the target.
    Cname,
    /// The chain ended at a DNAME; the caller re-queries the substitution.
    Dname,
    /// The name does not exist (negative entry covers every type).
    NegativeName,
    /// The name exists but the queried type does not.
    NegativeType,
}

/// A delivered answer. The rdataset handles alias the cache: every waiter
/// of a coalesced fetch receives clones of the same stored data.
#[derive(Debug, Clone)]
pub struct FetchAnswer {
    /// Answer kind.
    pub kind: AnswerKind,
    /// Owner name of the answer data.
    pub name: Name,
    /// The answer rdataset (or negative entry), when bound.
    pub rdataset: Option<Arc<StoredRrset>>,
    /// The covering signature rdataset, when present.
    pub sig_rdataset: Option<Arc<StoredRrset>>,
}

/// Exactly one of these reaches every waiter.
pub type FetchResult = Result<FetchAnswer, FetchError>;

/// A caller's handle on an in-flight (possibly shared) fetch.
///
/// Await [`Fetch::outcome`] for the result. Dropping the handle releases
/// the caller's reference; the underlying resolution shuts down once the
/// last reference is gone.
pub struct Fetch {
    pub(crate) fetch_id: u64,
    pub(crate) shard: usize,
    pub(crate) rid: u64,
    pub(crate) rx: Option<oneshot::Receiver<FetchResult>>,
    pub(crate) resolver: Arc<ResolverInner>,
}

impl std::fmt::Debug for Fetch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetch")
            .field("fetch_id", &self.fetch_id)
            .field("shard", &self.shard)
            .field("rid", &self.rid)
            .finish_non_exhaustive()
    }
}

impl Fetch {
    /// Waits for the fetch's single result.
    pub async fn outcome(mut self) -> FetchResult {
        match self.rx.take() {
            Some(rx) => rx.await.unwrap_or(Err(FetchError::Canceled)),
            None => Err(FetchError::Canceled),
        }
    }

    /// This waiter's id, used by [`crate::Resolver::cancel_fetch`].
    pub fn id(&self) -> u64 {
        self.fetch_id
    }
}

impl Drop for Fetch {
    fn drop(&mut self) {
        ResolverInner::destroy_fetch(&self.resolver, self.shard, self.rid, self.fetch_id);
    }
}
