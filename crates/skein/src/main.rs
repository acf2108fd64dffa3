//! skein — command-line lookup harness.
//!
//! Resolves one question iteratively from the root hints, or through a
//! forwarder with `--server`.

use anyhow::{Context, Result};
use clap::Parser;
use skein_proto::{Name, RecordType};
use skein_resolver::{
    AnswerKind, FetchArgs, FetchOptions, ForwardPolicy, Hints, Resolver, ResolverConfig, View,
};
use std::net::SocketAddr;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Iterative DNS lookup tool.
#[derive(Parser, Debug)]
#[command(name = "skein", version, about)]
struct Cli {
    /// Name to resolve.
    name: String,

    /// Record type.
    #[arg(default_value = "A")]
    rtype: String,

    /// Forward to this server before iterating from the roots.
    /// May be given multiple times.
    #[arg(short, long)]
    server: Vec<SocketAddr>,

    /// Use the forwarders exclusively; never iterate.
    #[arg(long, requires = "server")]
    forward_only: bool,

    /// Force TCP for the first query.
    #[arg(long)]
    tcp: bool,

    /// Set the recursion-desired bit on outbound queries.
    #[arg(long)]
    recursive: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).context("bad log level")?)
        .init();

    let name: Name = cli.name.parse().context("bad name")?;
    let rtype: RecordType = cli.rtype.parse().context("bad record type")?;

    let view = View::new(Hints::iana());
    let resolver = Resolver::new(ResolverConfig::default(), view)
        .context("creating resolver")?;

    let forwarding = !cli.server.is_empty();
    if forwarding {
        resolver.set_forwarders(cli.server.clone())?;
        resolver.set_forward_policy(if cli.forward_only {
            ForwardPolicy::Only
        } else {
            ForwardPolicy::First
        })?;
    }
    resolver.freeze();

    let args = FetchArgs {
        options: FetchOptions {
            tcp: cli.tcp,
            recursive: cli.recursive || forwarding,
            ..FetchOptions::default()
        },
        ..FetchArgs::default()
    };

    debug!(name = %name, rtype = %rtype, "starting lookup");
    let fetch = resolver.create_fetch(&name, rtype, args)?;
    let outcome = fetch.outcome().await;

    let status = match outcome {
        Ok(answer) => {
            match answer.kind {
                AnswerKind::Positive => println!(";; answer"),
                AnswerKind::Cname => println!(";; alias (re-query the CNAME target)"),
                AnswerKind::Dname => println!(";; redirection (re-query the substituted name)"),
                AnswerKind::NegativeName => println!(";; no such name"),
                AnswerKind::NegativeType => println!(";; no such record type"),
            }
            if let Some(rdataset) = &answer.rdataset {
                if rdataset.is_negative() {
                    if let Some(soa) = &rdataset.soa {
                        println!("{}\t{}\tSOA\t{}", answer.name, rdataset.ttl, soa);
                    }
                } else {
                    for rdata in &rdataset.rdatas {
                        println!(
                            "{}\t{}\t{}\t{}",
                            answer.name, rdataset.ttl, rdataset.rtype, rdata
                        );
                    }
                }
            }
            if let Some(sig) = &answer.sig_rdataset {
                for rdata in &sig.rdatas {
                    println!("{}\t{}\tSIG\t{}", answer.name, sig.ttl, rdata);
                }
            }
            0
        }
        Err(err) => {
            eprintln!(";; lookup failed: {err}");
            1
        }
    };

    resolver.shutdown();
    let _ = resolver.when_shutdown().await;
    std::process::exit(status);
}
