//! End-to-end resolution against scripted mock upstreams.
//!
//! Each test runs a real resolver against a UDP (and sometimes TCP) mock
//! bound on localhost. Scripts are keyed by question and answered in
//! sequence, so one socket can play every server in a delegation chain.

use parking_lot::Mutex;
use skein_proto::{
    Message, Name, RData, Rcode, RecordType, Section,
};
use skein_resolver::addrdb::ADDR_FLAG_NOEDNS0;
use skein_resolver::{
    AnswerKind, FetchArgs, FetchError, FetchOptions, ForwardPolicy, Hints, Resolver,
    ResolverConfig, View,
};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::timeout;

// ============================================================================
// Mock upstream
// ============================================================================

type Responder = Box<dyn Fn(&Message) -> Option<Message> + Send + Sync>;

struct Script {
    responders: Vec<Responder>,
    next: usize,
}

#[derive(Default)]
struct Scripts {
    map: HashMap<(Name, RecordType), Script>,
}

impl Scripts {
    fn respond(&mut self, query: &Message) -> Option<Message> {
        let q = query.questions.first()?;
        let script = self.map.get_mut(&(q.name.clone(), q.rtype))?;
        if script.responders.is_empty() {
            return None;
        }
        let index = script.next.min(script.responders.len() - 1);
        script.next += 1;
        (script.responders[index])(query)
    }
}

struct MockUpstream {
    addr: SocketAddr,
    scripts: Arc<Mutex<Scripts>>,
    queries: Arc<AtomicU64>,
}

impl MockUpstream {
    async fn start(latency: Duration) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("mock bind");
        let addr = socket.local_addr().expect("mock addr");
        let scripts: Arc<Mutex<Scripts>> = Arc::new(Mutex::new(Scripts::default()));
        let queries = Arc::new(AtomicU64::new(0));

        let loop_scripts = scripts.clone();
        let loop_queries = queries.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                loop_queries.fetch_add(1, Ordering::Relaxed);
                let Ok(query) = Message::parse(&buf[..len]) else {
                    continue;
                };
                let Some(response) = loop_scripts.lock().respond(&query) else {
                    continue;
                };
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                let _ = socket.send_to(&response.to_wire(), src).await;
            }
        });

        Self {
            addr,
            scripts,
            queries,
        }
    }

    /// Serves the same scripts over TCP on the mock's port.
    async fn serve_tcp(&self) {
        let listener = TcpListener::bind(self.addr).await.expect("tcp mock bind");
        let scripts = self.scripts.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let scripts = scripts.clone();
                tokio::spawn(async move {
                    let mut len_buf = [0u8; 2];
                    if stream.read_exact(&mut len_buf).await.is_err() {
                        return;
                    }
                    let len = u16::from_be_bytes(len_buf) as usize;
                    let mut buf = vec![0u8; len];
                    if stream.read_exact(&mut buf).await.is_err() {
                        return;
                    }
                    let Ok(query) = Message::parse(&buf) else {
                        return;
                    };
                    let Some(response) = scripts.lock().respond(&query) else {
                        return;
                    };
                    let wire = response.to_wire();
                    let _ = stream.write_all(&(wire.len() as u16).to_be_bytes()).await;
                    let _ = stream.write_all(&wire).await;
                });
            }
        });
    }

    fn on(&self, qname: &str, rtype: RecordType, responder: Responder) {
        let mut scripts = self.scripts.lock();
        scripts
            .map
            .entry((name(qname), rtype))
            .or_insert_with(|| Script {
                responders: Vec::new(),
                next: 0,
            })
            .responders
            .push(responder);
    }

    fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Response builders
// ============================================================================

fn name(s: &str) -> Name {
    s.parse().expect("test name")
}

fn a(octet: u8) -> RData {
    RData::A(Ipv4Addr::new(192, 0, 2, octet))
}

fn soa(zone: &str) -> RData {
    RData::Soa {
        mname: name(&format!("ns.{zone}")),
        rname: name(&format!("hostmaster.{zone}")),
        serial: 1,
        refresh: 7200,
        retry: 3600,
        expire: 604800,
        minimum: 900,
    }
}

/// Authoritative answer with one rdataset at the question name.
fn answer(query: &Message, rdatas: &[RData], rtype: RecordType) -> Message {
    let mut msg = Message::response(query);
    msg.header.aa = true;
    let owner = query.questions[0].name.clone();
    for rdata in rdatas {
        msg.add_record(Section::Answer, &owner, rtype, 300, rdata.clone());
    }
    msg
}

/// Referral to `zone` served by `ns` with glue at `glue_ip`.
fn referral(query: &Message, zone: &str, ns: &str, glue_ip: Ipv4Addr) -> Message {
    let mut msg = Message::response(query);
    msg.add_record(
        Section::Authority,
        &name(zone),
        RecordType::NS,
        3600,
        RData::Ns(name(ns)),
    );
    msg.add_record(
        Section::Additional,
        &name(ns),
        RecordType::A,
        3600,
        RData::A(glue_ip),
    );
    msg
}

fn nxdomain(query: &Message, zone: &str) -> Message {
    let mut msg = Message::response(query);
    msg.header.aa = true;
    msg.header.rcode = Rcode::NXDOMAIN;
    msg.add_record(Section::Authority, &name(zone), RecordType::SOA, 900, soa(zone));
    msg
}

// ============================================================================
// Harness
// ============================================================================

async fn resolver_for(mock: &MockUpstream) -> Resolver {
    let view = View::new(Hints::custom(
        Name::root(),
        vec![(name("ns.test"), vec![mock.addr])],
    ));
    view.adb.set_port(mock.addr.port());
    let config = ResolverConfig {
        ntasks: 4,
        enable_v6: false,
        ..ResolverConfig::default()
    };
    let resolver = Resolver::new(config, view).expect("resolver");
    resolver.freeze();
    resolver
}

async fn fetch_one(
    resolver: &Resolver,
    qname: &str,
    rtype: RecordType,
    options: FetchOptions,
) -> skein_resolver::FetchResult {
    let fetch = resolver
        .create_fetch(
            &name(qname),
            rtype,
            FetchArgs {
                options,
                ..FetchArgs::default()
            },
        )
        .expect("create fetch");
    timeout(Duration::from_secs(10), fetch.outcome())
        .await
        .expect("fetch deadline")
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn answers_from_hinted_server() {
    let mock = MockUpstream::start(Duration::ZERO).await;
    mock.on(
        "host.test",
        RecordType::A,
        Box::new(|q| Some(answer(q, &[a(99)], RecordType::A))),
    );
    let resolver = resolver_for(&mock).await;

    let reply = fetch_one(&resolver, "host.test", RecordType::A, FetchOptions::default())
        .await
        .expect("positive answer");
    assert_eq!(reply.kind, AnswerKind::Positive);
    assert_eq!(reply.name, name("host.test"));
    let rdataset = reply.rdataset.expect("bound rdataset");
    assert_eq!(rdataset.rdatas, vec![a(99)]);

    // The answer also landed in the cache, at answer-grade trust.
    let cached = resolver
        .view()
        .cache
        .find_rrset(&name("host.test"), RecordType::A, std::time::Instant::now())
        .expect("cached answer");
    assert_eq!(cached.trust, skein_proto::Trust::AuthAnswer);
    resolver.shutdown();
}

#[tokio::test]
async fn follows_a_referral_chain() {
    let mock = MockUpstream::start(Duration::ZERO).await;
    let mock_ip = Ipv4Addr::new(127, 0, 0, 1);
    // The same socket plays root, org, and isc.org in sequence.
    mock.on(
        "www.isc.org",
        RecordType::A,
        Box::new(move |q| Some(referral(q, "org", "ns.org", mock_ip))),
    );
    mock.on(
        "www.isc.org",
        RecordType::A,
        Box::new(move |q| Some(referral(q, "isc.org", "ns.isc.org", mock_ip))),
    );
    mock.on(
        "www.isc.org",
        RecordType::A,
        Box::new(|q| Some(answer(q, &[a(80)], RecordType::A))),
    );
    let resolver = resolver_for(&mock).await;

    let reply = fetch_one(&resolver, "www.isc.org", RecordType::A, FetchOptions::default())
        .await
        .expect("positive answer");
    assert_eq!(reply.kind, AnswerKind::Positive);
    assert_eq!(reply.rdataset.expect("rdataset").rdatas, vec![a(80)]);

    // The walk left the delegations and glue behind in the cache.
    let now = std::time::Instant::now();
    let cache = &resolver.view().cache;
    assert!(cache.find_rrset(&name("org"), RecordType::NS, now).is_some());
    assert!(cache.find_rrset(&name("isc.org"), RecordType::NS, now).is_some());
    assert!(cache.find_rrset(&name("ns.org"), RecordType::A, now).is_some());
    assert_eq!(mock.query_count(), 3);
    resolver.shutdown();
}

#[tokio::test]
async fn negative_answer_for_missing_name() {
    let mock = MockUpstream::start(Duration::ZERO).await;
    mock.on(
        "nonexistant.flame.test",
        RecordType::A,
        Box::new(|q| Some(nxdomain(q, "flame.test"))),
    );
    let resolver = resolver_for(&mock).await;

    let reply = fetch_one(
        &resolver,
        "nonexistant.flame.test",
        RecordType::A,
        FetchOptions::default(),
    )
    .await
    .expect("negative answer");
    assert_eq!(reply.kind, AnswerKind::NegativeName);
    let rdataset = reply.rdataset.expect("negative entry");
    assert!(rdataset.is_negative());
    assert_eq!(rdataset.covers, RecordType::ANY);
    assert!(rdataset.soa.is_some());
    resolver.shutdown();
}

#[tokio::test]
async fn chases_a_cname_to_its_tail() {
    let mock = MockUpstream::start(Duration::ZERO).await;
    mock.on(
        "alias.test",
        RecordType::A,
        Box::new(|q| {
            Some(answer(
                q,
                &[RData::Cname(name("target.test"))],
                RecordType::CNAME,
            ))
        }),
    );
    let resolver = resolver_for(&mock).await;

    let reply = fetch_one(&resolver, "alias.test", RecordType::A, FetchOptions::default())
        .await
        .expect("cname answer");
    assert_eq!(reply.kind, AnswerKind::Cname);
    assert_eq!(reply.name, name("alias.test"));
    let rdataset = reply.rdataset.expect("cname rdataset");
    assert_eq!(rdataset.rtype, RecordType::CNAME);
    assert_eq!(rdataset.rdatas, vec![RData::Cname(name("target.test"))]);
    resolver.shutdown();
}

#[tokio::test]
async fn truncation_retries_over_tcp() {
    let mock = MockUpstream::start(Duration::ZERO).await;
    mock.serve_tcp().await;

    let big_txt = RData::Txt(vec![bytes::Bytes::from(vec![b'x'; 200])]);
    let tcp_txt = big_txt.clone();
    // Over UDP: truncated. Over TCP (second script entry): the real thing.
    mock.on(
        "big.test",
        RecordType::TXT,
        Box::new(|q| {
            let mut msg = Message::response(q);
            msg.header.tc = true;
            Some(msg)
        }),
    );
    mock.on(
        "big.test",
        RecordType::TXT,
        Box::new(move |q| Some(answer(q, &[tcp_txt.clone()], RecordType::TXT))),
    );
    let resolver = resolver_for(&mock).await;

    let reply = fetch_one(&resolver, "big.test", RecordType::TXT, FetchOptions::default())
        .await
        .expect("tcp answer");
    assert_eq!(reply.kind, AnswerKind::Positive);
    assert_eq!(reply.rdataset.expect("rdataset").rdatas, vec![big_txt]);
    resolver.shutdown();
}

#[tokio::test]
async fn duplicate_questions_coalesce() {
    let mock = MockUpstream::start(Duration::from_millis(150)).await;
    mock.on(
        "slow.test",
        RecordType::A,
        Box::new(|q| Some(answer(q, &[a(42)], RecordType::A))),
    );
    let resolver = resolver_for(&mock).await;

    let first = resolver
        .create_fetch(&name("slow.test"), RecordType::A, FetchArgs::default())
        .expect("first fetch");
    let second = resolver
        .create_fetch(&name("slow.test"), RecordType::A, FetchArgs::default())
        .expect("second fetch");

    let (first, second) = tokio::join!(
        timeout(Duration::from_secs(10), first.outcome()),
        timeout(Duration::from_secs(10), second.outcome()),
    );
    let first = first.expect("deadline").expect("first answer");
    let second = second.expect("deadline").expect("second answer");

    // One resolution, one wire round-trip, one shared cache handle.
    assert_eq!(mock.query_count(), 1);
    assert!(Arc::ptr_eq(
        first.rdataset.as_ref().expect("first rdataset"),
        second.rdataset.as_ref().expect("second rdataset"),
    ));
    resolver.shutdown();
}

#[tokio::test]
async fn formerr_disables_edns_for_the_server() {
    let mock = MockUpstream::start(Duration::ZERO).await;
    mock.on(
        "picky.test",
        RecordType::A,
        Box::new(|q| {
            // First exchange: reject the OPT-bearing query outright.
            if q.edns.is_none() {
                return None;
            }
            let mut msg = Message::response(q);
            msg.header.rcode = Rcode::FORMERR;
            Some(msg)
        }),
    );
    mock.on(
        "picky.test",
        RecordType::A,
        Box::new(|q| {
            // The retry must come without EDNS0.
            if q.edns.is_some() {
                return None;
            }
            Some(answer(q, &[a(7)], RecordType::A))
        }),
    );
    let resolver = resolver_for(&mock).await;

    let reply = fetch_one(&resolver, "picky.test", RecordType::A, FetchOptions::default())
        .await
        .expect("answer after EDNS retreat");
    assert_eq!(reply.kind, AnswerKind::Positive);

    // The allergy is remembered against the server.
    let entry = resolver.view().adb.entry(mock.addr);
    assert_ne!(entry.flags() & ADDR_FLAG_NOEDNS0, 0);
    resolver.shutdown();
}

#[tokio::test]
async fn forwarders_first_falls_back_to_iteration() {
    // The forwarder refuses everything; iteration must take over.
    let forwarder = MockUpstream::start(Duration::ZERO).await;
    forwarder.on(
        "mixed.test",
        RecordType::A,
        Box::new(|q| {
            let mut msg = Message::response(q);
            msg.header.rcode = Rcode::REFUSED;
            Some(msg)
        }),
    );
    let authority = MockUpstream::start(Duration::ZERO).await;
    authority.on(
        "mixed.test",
        RecordType::A,
        Box::new(|q| Some(answer(q, &[a(21)], RecordType::A))),
    );

    let view = View::new(Hints::custom(
        Name::root(),
        vec![(name("ns.test"), vec![authority.addr])],
    ));
    view.adb.set_port(authority.addr.port());
    let config = ResolverConfig {
        ntasks: 4,
        enable_v6: false,
        ..ResolverConfig::default()
    };
    let resolver = Resolver::new(config, view).expect("resolver");
    resolver
        .set_forwarders(vec![forwarder.addr])
        .expect("forwarders");
    resolver
        .set_forward_policy(ForwardPolicy::First)
        .expect("policy");
    resolver.freeze();

    let reply = fetch_one(&resolver, "mixed.test", RecordType::A, FetchOptions::default())
        .await
        .expect("fallback answer");
    assert_eq!(reply.kind, AnswerKind::Positive);
    assert_eq!(reply.rdataset.expect("rdataset").rdatas, vec![a(21)]);

    // The forwarder was consulted once, then iteration finished the job.
    assert_eq!(forwarder.query_count(), 1);
    assert_eq!(authority.query_count(), 1);
    resolver.shutdown();
}

#[tokio::test]
async fn shutdown_cancels_pending_fetches() {
    // A mock with no scripts never answers.
    let mock = MockUpstream::start(Duration::ZERO).await;
    let resolver = resolver_for(&mock).await;

    let fetch = resolver
        .create_fetch(&name("stuck.test"), RecordType::A, FetchArgs::default())
        .expect("create fetch");
    tokio::time::sleep(Duration::from_millis(100)).await;

    resolver.shutdown();
    let reply = timeout(Duration::from_secs(5), fetch.outcome())
        .await
        .expect("cancel deadline");
    assert_eq!(reply.unwrap_err(), FetchError::Canceled);

    timeout(Duration::from_secs(5), resolver.when_shutdown())
        .await
        .expect("shutdown deadline")
        .expect("shutdown notification");
}

#[tokio::test]
async fn canceling_one_waiter_leaves_the_other() {
    let mock = MockUpstream::start(Duration::from_millis(150)).await;
    mock.on(
        "shared.test",
        RecordType::A,
        Box::new(|q| Some(answer(q, &[a(5)], RecordType::A))),
    );
    let resolver = resolver_for(&mock).await;

    let keeper = resolver
        .create_fetch(&name("shared.test"), RecordType::A, FetchArgs::default())
        .expect("keeper");
    let doomed = resolver
        .create_fetch(&name("shared.test"), RecordType::A, FetchArgs::default())
        .expect("doomed");

    resolver.cancel_fetch(&doomed);
    let doomed_reply = timeout(Duration::from_secs(5), doomed.outcome())
        .await
        .expect("cancel deadline");
    assert_eq!(doomed_reply.unwrap_err(), FetchError::Canceled);

    let kept = timeout(Duration::from_secs(10), keeper.outcome())
        .await
        .expect("deadline")
        .expect("kept answer");
    assert_eq!(kept.kind, AnswerKind::Positive);
    resolver.shutdown();
}
