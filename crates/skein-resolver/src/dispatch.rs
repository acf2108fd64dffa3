//! Outbound query dispatchers.
//!
//! The resolver shares one UDP dispatcher per address family; it owns the
//! socket, hands out (destination, message-id) response slots, and routes
//! incoming datagrams to the shard that registered the slot. TCP queries
//! do not come through here; each gets a private connection owned by its
//! query.

use crate::events::{ShardEvent, ShardSender};
use bytes::Bytes;
use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// First source port tried for the shared UDP socket.
const PORT_SEARCH_START: u16 = 5353;

/// Last source port tried (inclusive).
const PORT_SEARCH_END: u16 = 5399;

/// Receive buffer size for responses.
const RECV_BUFFER_SIZE: usize = 4096;

/// Attempts at picking an unused message id for a destination.
const ID_ALLOC_ATTEMPTS: usize = 64;

/// Where a response slot routes to.
#[derive(Clone)]
pub(crate) struct Route {
    /// The registering shard's event channel.
    pub tx: ShardSender,
    /// The registering shard's index (for shutdown cancellation).
    pub shard: usize,
    /// Resolution id.
    pub rid: u64,
    /// Query id within the resolution.
    pub qid: u64,
}

/// A shared UDP dispatcher for one address family.
pub(crate) struct Dispatcher {
    socket: Arc<UdpSocket>,
    routes: Arc<DashMap<(SocketAddr, u16), Route>>,
    recv_task: JoinHandle<()>,
    local: SocketAddr,
}

impl Dispatcher {
    /// Binds the IPv4 dispatcher, searching the source-port range.
    pub fn bind_v4() -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        let mut bound = Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            "no free source port",
        ));
        for port in PORT_SEARCH_START..=PORT_SEARCH_END {
            let addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port);
            match socket.bind(&addr.into()) {
                Ok(()) => {
                    bound = Ok(());
                    break;
                }
                Err(err) => bound = Err(err),
            }
        }
        bound?;
        Self::from_socket(socket)
    }

    /// Binds the IPv6 dispatcher on an ephemeral port.
    pub fn bind_v6() -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_only_v6(true)?;
        socket.bind(&SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0).into())?;
        Self::from_socket(socket)
    }

    fn from_socket(socket: Socket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        let std_socket: std::net::UdpSocket = socket.into();
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        let local = socket.local_addr()?;
        let routes: Arc<DashMap<(SocketAddr, u16), Route>> = Arc::new(DashMap::new());

        let recv_socket = socket.clone();
        let recv_routes = routes.clone();
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((len, src)) => {
                        if len < 2 {
                            trace!(src = %src, len, "runt datagram dropped");
                            continue;
                        }
                        let id = u16::from_be_bytes([buf[0], buf[1]]);
                        let Some(route) = recv_routes.get(&(src, id)).map(|r| r.clone()) else {
                            trace!(src = %src, id, "datagram for unknown slot dropped");
                            continue;
                        };
                        let payload = Bytes::copy_from_slice(&buf[..len]);
                        let _ = route.tx.send(ShardEvent::Response {
                            rid: route.rid,
                            qid: route.qid,
                            payload: Ok((payload, Instant::now())),
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "udp receive error");
                    }
                }
            }
        });

        debug!(addr = %local, "udp dispatcher bound");
        Ok(Self {
            socket,
            routes,
            recv_task,
            local,
        })
    }

    /// The dispatcher's bound address.
    #[allow(dead_code)]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Reserves a response slot for `dest`, returning the message id.
    pub fn add_response(&self, dest: SocketAddr, route: Route) -> Option<u16> {
        for _ in 0..ID_ALLOC_ATTEMPTS {
            let id: u16 = rand::random();
            let mut claimed = false;
            self.routes.entry((dest, id)).or_insert_with(|| {
                claimed = true;
                route.clone()
            });
            if claimed {
                return Some(id);
            }
        }
        None
    }

    /// Releases a response slot.
    pub fn remove_response(&self, dest: SocketAddr, id: u16) {
        self.routes.remove(&(dest, id));
    }

    /// Drops every slot registered by `shard`.
    pub fn cancel_shard(&self, shard: usize) {
        self.routes.retain(|_, route| route.shard != shard);
    }

    /// Sends a datagram, reporting failure back to the owning shard.
    pub fn send(&self, dest: SocketAddr, data: Bytes, tx: ShardSender, rid: u64, qid: u64) {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            if let Err(err) = socket.send_to(&data, dest).await {
                debug!(dest = %dest, error = %err, "udp send failed");
                let _ = tx.send(ShardEvent::SendError { rid, qid });
            }
        });
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn binds_within_search_range() {
        let d = Dispatcher::bind_v4().expect("bind v4");
        let port = d.local_addr().port();
        assert!((PORT_SEARCH_START..=PORT_SEARCH_END).contains(&port));

        // A second dispatcher takes the next port over.
        let d2 = Dispatcher::bind_v4().expect("bind second v4");
        assert_ne!(d2.local_addr().port(), port);
    }

    #[tokio::test]
    async fn routes_datagrams_by_source_and_id() {
        let d = Dispatcher::bind_v4().expect("bind v4");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let peer = UdpSocket::bind("127.0.0.1:0").await.expect("peer bind");
        let peer_addr = peer.local_addr().expect("peer addr");
        let id = d
            .add_response(
                peer_addr,
                Route {
                    tx,
                    shard: 0,
                    rid: 7,
                    qid: 3,
                },
            )
            .expect("slot");

        let mut datagram = vec![0u8; 12];
        datagram[..2].copy_from_slice(&id.to_be_bytes());
        peer.send_to(&datagram, d.local_addr())
            .await
            .expect("peer send");

        match rx.recv().await {
            Some(ShardEvent::Response { rid, qid, payload }) => {
                assert_eq!(rid, 7);
                assert_eq!(qid, 3);
                assert_eq!(payload.expect("payload").0.len(), 12);
            }
            _ => panic!("expected a response event"),
        }

        d.remove_response(peer_addr, id);
        assert!(d.routes.is_empty());
    }
}
