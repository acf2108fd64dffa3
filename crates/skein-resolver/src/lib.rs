//! # skein-resolver
//!
//! An iterative DNS resolver. Given a (name, type, class) question it walks
//! the delegation hierarchy from configured hints (or follows forwarders),
//! caches every record it learns along the way, and fans a single result
//! out to all callers that joined the same in-flight question.
//!
//! ## Shape
//!
//! - [`Resolver`] partitions in-flight questions into shards, each serviced
//!   by one event-loop task; duplicate questions coalesce onto one
//!   resolution per shard.
//! - A resolution walks addresses from the address database
//!   ([`addrdb::AddrDb`]), sends UDP queries through shared dispatchers
//!   (TCP gets a private connection), classifies responses, and commits
//!   cacheable data to [`skein_cache::CacheDb`].
//! - Callers hold a [`Fetch`] and await its single [`FetchResult`].

pub mod addrdb;
pub mod fetch;
pub mod hints;
pub mod view;

mod commit;
mod dispatch;
mod events;
mod query;
mod resolution;
mod resolver;
mod response;

pub use fetch::{AnswerKind, Fetch, FetchAnswer, FetchResult};
pub use hints::Hints;
pub use resolver::{Resolver, ResolverConfig};
pub use view::View;

use skein_proto::Rrset;
use thiserror::Error;

/// Absolute lifetime of one fetch.
pub const FETCH_LIFETIME: std::time::Duration = std::time::Duration::from_secs(90);

/// Restart cap; exceeding it fails the fetch.
pub const MAX_RESTARTS: u32 = 10;

/// UDP payload size advertised in outbound EDNS0 OPT records.
pub const ADVERTISED_UDP_SIZE: u16 = 2048;

/// How long a lame-server marking lasts.
pub const LAME_TTL: std::time::Duration = std::time::Duration::from_secs(600);

/// Per-fetch options.
///
/// Options participate in coalescing: two fetches join the same resolution
/// only when their options match exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FetchOptions {
    /// Set RD on outbound queries.
    pub recursive: bool,
    /// Force TCP for the first query.
    pub tcp: bool,
    /// Never advertise EDNS0.
    pub noedns0: bool,
    /// Do not join an existing resolution; force a private one.
    pub unshared: bool,
    /// Bypass the validation hook and cache directly.
    pub novalidate: bool,
}

/// Extra inputs to [`Resolver::create_fetch`].
#[derive(Debug, Clone, Default)]
pub struct FetchArgs {
    /// Explicit starting zone cut and its NS rdataset. When absent the
    /// resolver consults the view (or the root, in forward-only mode).
    pub domain: Option<(skein_proto::Name, Rrset)>,
    /// Fetch-local forwarders, tried before the resolver's defaults.
    pub forwarders: Vec<std::net::SocketAddr>,
    /// Fetch options.
    pub options: FetchOptions,
}

/// Forwarding policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardPolicy {
    /// Resolve iteratively; configured forwarders are still tried first.
    #[default]
    None,
    /// Try forwarders first, then fall back to iteration.
    First,
    /// Use forwarders exclusively.
    Only,
}

/// Why a fetch ended without an answer, or why an API call was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The fetch's absolute lifetime ran out.
    #[error("the fetch timed out")]
    Timeout,
    /// No server produced a usable answer.
    #[error("no server produced a usable answer")]
    ServFail,
    /// The caller canceled this waiter.
    #[error("the fetch was canceled")]
    Canceled,
    /// The resolver is shutting down.
    #[error("the resolver is shutting down")]
    ShuttingDown,
    /// The answer needs validation and no validator is wired in.
    #[error("response validation is not available")]
    ValidationUnavailable,
    /// The operation requires a frozen resolver.
    #[error("the resolver is not frozen yet")]
    NotFrozen,
    /// The operation requires an unfrozen resolver.
    #[error("the resolver is already frozen")]
    Frozen,
}

/// Hook for DNSSEC validation of to-be-cached rdatasets.
///
/// The resolver only reserves the surface: the default implementation
/// reports that validation is unavailable, which fails fetches whose data
/// lies under a configured security root (unless the fetch sets
/// [`FetchOptions::novalidate`]).
pub trait Validator: Send + Sync {
    /// Validates `rrset` (with its covering signature, if present) before
    /// it is cached. `is_answer` marks the rdataset the caller asked for.
    fn validate(
        &self,
        rrset: &Rrset,
        sig: Option<&Rrset>,
        is_answer: bool,
    ) -> Result<(), FetchError>;
}

/// The default, absent validator.
pub(crate) struct NoValidator;

impl Validator for NoValidator {
    fn validate(&self, _: &Rrset, _: Option<&Rrset>, _: bool) -> Result<(), FetchError> {
        Err(FetchError::ValidationUnavailable)
    }
}
