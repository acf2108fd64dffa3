//! Outbound queries: one record per question sent to one server.

use crate::addrdb::AddrEntry;
use crate::dispatch::Dispatcher;
use crate::events::{ShardEvent, ShardSender};
use crate::FetchOptions;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// Ceiling on a framed TCP response.
const TCP_RESPONSE_LIMIT: usize = 4096;

/// Ceiling on an outbound UDP datagram.
pub(crate) const UDP_SEND_LIMIT: usize = 512;

/// The server one query targets. The entry is shared database state; the
/// forwarder bit is how this fetch found it.
#[derive(Clone)]
pub(crate) struct QueryTarget {
    /// Shared address entry (SRTT, flags).
    pub entry: Arc<AddrEntry>,
    /// Reached through a forwarder list.
    pub forwarder: bool,
}

/// One outstanding outbound query.
pub(crate) struct NsQuery {
    /// Query id within the owning resolution.
    pub qid: u64,
    /// Target server.
    pub target: QueryTarget,
    /// Effective options (TCP/EDNS0 state may differ from the fetch's).
    pub options: FetchOptions,
    /// Send time, for RTT measurement.
    pub start: Instant,
    /// Message id on the wire.
    pub id: u16,
    /// The shared dispatcher holding this query's response slot (UDP).
    pub udp: Option<Arc<Dispatcher>>,
    /// The private connection (TCP), present between connect and send.
    pub tcp: Option<TcpStream>,
    /// Still connecting (TCP).
    pub connecting: bool,
    /// Connect/exchange task, aborted on cancel.
    pub io_task: Option<JoinHandle<()>>,
}

impl NsQuery {
    /// Releases transport resources. RTT accounting is the caller's job.
    pub fn teardown(&mut self) {
        if let Some(dispatcher) = self.udp.take() {
            dispatcher.remove_response(self.target.entry.sockaddr, self.id);
        }
        if let Some(task) = self.io_task.take() {
            task.abort();
        }
        self.tcp = None;
    }
}

/// Computes the per-query retry interval.
///
/// Two seconds for the first rounds through the address list, exponential
/// afterwards; never less than the doubled smoothed RTT, never more than
/// thirty seconds.
pub(crate) fn retry_interval(restarts: u32, srtt_us: u32) -> Duration {
    let schedule = if restarts < 3 {
        2
    } else {
        2u64 << (restarts - 1).min(30)
    };
    let doubled_rtt_secs = srtt_us as u64 / 500_000;
    Duration::from_secs(schedule.max(doubled_rtt_secs).min(30))
}

/// Spawns the TCP connect for a query; completion lands on the shard.
pub(crate) fn spawn_connect(
    addr: std::net::SocketAddr,
    tx: ShardSender,
    rid: u64,
    qid: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = TcpStream::connect(addr).await;
        let _ = tx.send(ShardEvent::Connected { rid, qid, result });
    })
}

/// Spawns the framed TCP exchange: one length-prefixed write, one
/// length-prefixed read. Success or failure lands as a response event.
pub(crate) fn spawn_tcp_exchange(
    mut stream: TcpStream,
    wire: Bytes,
    tx: ShardSender,
    rid: u64,
    qid: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let exchange = async {
            let len = wire.len() as u16;
            stream.write_all(&len.to_be_bytes()).await?;
            stream.write_all(&wire).await?;

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let resp_len = u16::from_be_bytes(len_buf) as usize;
            if resp_len > TCP_RESPONSE_LIMIT {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "oversized tcp response",
                ));
            }
            let mut resp = vec![0u8; resp_len];
            stream.read_exact(&mut resp).await?;
            Ok(Bytes::from(resp))
        };
        let payload = exchange.await.map(|bytes| (bytes, Instant::now()));
        let _ = tx.send(ShardEvent::Response { rid, qid, payload });
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_interval_schedule() {
        // Two seconds for the first rounds.
        assert_eq!(retry_interval(1, 0), Duration::from_secs(2));
        assert_eq!(retry_interval(2, 0), Duration::from_secs(2));
        // Exponential afterwards.
        assert_eq!(retry_interval(3, 0), Duration::from_secs(8));
        assert_eq!(retry_interval(4, 0), Duration::from_secs(16));
        // Clamped at thirty seconds.
        assert_eq!(retry_interval(5, 0), Duration::from_secs(30));
        assert_eq!(retry_interval(10, 0), Duration::from_secs(30));
    }

    #[test]
    fn retry_interval_respects_srtt() {
        // 2.5 s smoothed RTT doubles to 5 s, beating the 2 s schedule.
        assert_eq!(retry_interval(1, 2_500_000), Duration::from_secs(5));
        // But the 30 s ceiling still binds.
        assert_eq!(retry_interval(1, 60_000_000), Duration::from_secs(30));
    }

    #[test]
    fn retry_interval_stays_in_bounds() {
        for restarts in 0..=10 {
            for srtt in [0, 1_000, 1_000_000, 50_000_000] {
                let iv = retry_interval(restarts, srtt);
                assert!(iv >= Duration::from_secs(2), "too short: {iv:?}");
                assert!(iv <= Duration::from_secs(30), "too long: {iv:?}");
            }
        }
    }
}
