//! The UDP Socket Pool (spec §4.4): factory and owner of RTP/RTCP socket
//! pairs, keyed by `(local-ip, rtp-port)` and reference-counted across
//! every RTP Stream that shares one.

use std::net::{IpAddr, SocketAddr};
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;
use tracing::warn;

use crate::error::{Error, Result};

/// Floor below which the RTCP receive buffer is never shrunk further
/// (spec §4.4).
pub const RTCP_RECV_BUFFER_FLOOR: usize = 32 * 1024;

/// How many `(p, p+1)` candidates to try before giving up on a free pair.
const MAX_PORT_PROBE_ATTEMPTS: u16 = 500;

/// A bound RTP (even port, outgoing) + RTCP (odd port, demuxing incoming)
/// socket pair (spec §3).
pub struct UdpSocketPair {
    pub rtp: UdpSocket,
    pub rtcp: UdpSocket,
    pub local_ip: IpAddr,
    pub rtp_port: u16,
}

impl UdpSocketPair {
    pub fn rtcp_port(&self) -> u16 {
        self.rtp_port + 1
    }
}

struct Entry {
    pair: Arc<UdpSocketPair>,
    refcount: AtomicUsize,
}

/// Factory and owner of [`UdpSocketPair`]s. Cheap to clone; every clone
/// shares the same underlying map.
#[derive(Clone)]
pub struct SocketPool {
    entries: Arc<DashMap<(IpAddr, u16), Arc<Entry>>>,
    rtcp_recv_buffer_bytes: usize,
}

/// A refcounted lease on a [`UdpSocketPair`]. Dropping the last handle for
/// a given `(local_ip, rtp_port)` destroys the underlying sockets
/// (spec §3: "destroyed when the last holder releases it").
pub struct SocketPairHandle {
    pool: Arc<DashMap<(IpAddr, u16), Arc<Entry>>>,
    key: (IpAddr, u16),
    pair: Arc<UdpSocketPair>,
}

impl Deref for SocketPairHandle {
    type Target = UdpSocketPair;

    fn deref(&self) -> &Self::Target {
        &self.pair
    }
}

impl Clone for SocketPairHandle {
    fn clone(&self) -> Self {
        if let Some(entry) = self.pool.get(&self.key) {
            entry.refcount.fetch_add(1, Ordering::SeqCst);
        }
        SocketPairHandle {
            pool: self.pool.clone(),
            key: self.key,
            pair: self.pair.clone(),
        }
    }
}

impl Drop for SocketPairHandle {
    fn drop(&mut self) {
        let remove = self
            .pool
            .get(&self.key)
            .map(|entry| entry.refcount.fetch_sub(1, Ordering::SeqCst) == 1)
            .unwrap_or(false);
        if remove {
            self.pool.remove(&self.key);
        }
    }
}

impl SocketPool {
    pub fn new(rtcp_recv_buffer_bytes: usize) -> Self {
        SocketPool {
            entries: Arc::new(DashMap::new()),
            rtcp_recv_buffer_bytes,
        }
    }

    /// Acquire an existing shared pair if one is already registered for
    /// `(local_ip, rtp_port)`, bumping its refcount.
    pub fn acquire_existing(&self, local_ip: IpAddr, rtp_port: u16) -> Option<SocketPairHandle> {
        let key = (local_ip, rtp_port);
        let entry = self.entries.get(&key)?;
        entry.refcount.fetch_add(1, Ordering::SeqCst);
        Some(SocketPairHandle {
            pool: self.entries.clone(),
            key,
            pair: entry.pair.clone(),
        })
    }

    /// Whatever port this pool already has bound for `local_ip`, if any —
    /// lets `acquire` share one pair per ip (spec §4.4) instead of probing
    /// a fresh pair on every call.
    fn existing_port_for(&self, local_ip: IpAddr) -> Option<u16> {
        self.entries.iter().find(|kv| kv.key().0 == local_ip).map(|kv| kv.key().1)
    }

    /// `acquire(local-ip)` (spec §4.4): return the pair already bound for
    /// `local_ip`, bumping its refcount, if one exists; otherwise probe
    /// for a free even/odd pair starting at `base_port`, bind both, size
    /// the RTCP receive buffer, and register the pair with refcount 1.
    pub async fn acquire(&self, local_ip: IpAddr, base_port: u16) -> Result<SocketPairHandle> {
        if let Some(port) = self.existing_port_for(local_ip) {
            if let Some(handle) = self.acquire_existing(local_ip, port) {
                return Ok(handle);
            }
        }

        let mut candidate = base_port - (base_port % 2); // round down to even

        for _ in 0..MAX_PORT_PROBE_ATTEMPTS {
            match self.try_bind_pair(local_ip, candidate).await {
                Ok(pair) => {
                    let key = (local_ip, candidate);
                    self.entries.insert(
                        key,
                        Arc::new(Entry {
                            pair: Arc::new(pair),
                            refcount: AtomicUsize::new(1),
                        }),
                    );
                    let entry = self.entries.get(&key).unwrap();
                    return Ok(SocketPairHandle {
                        pool: self.entries.clone(),
                        key,
                        pair: entry.pair.clone(),
                    });
                }
                Err(_) => {
                    candidate = candidate.saturating_add(2);
                }
            }
        }

        Err(Error::NoFreePortPair(base_port, local_ip))
    }

    async fn try_bind_pair(&self, local_ip: IpAddr, rtp_port: u16) -> Result<UdpSocketPair> {
        let rtcp_port = rtp_port.checked_add(1).ok_or(Error::NoFreePortPair(rtp_port, local_ip))?;

        let rtp = bind_udp(SocketAddr::new(local_ip, rtp_port))?;
        let rtcp = match bind_udp(SocketAddr::new(local_ip, rtcp_port)) {
            Ok(sock) => sock,
            Err(e) => {
                drop(rtp);
                return Err(e);
            }
        };

        size_rtcp_recv_buffer(&rtcp, self.rtcp_recv_buffer_bytes);

        Ok(UdpSocketPair {
            rtp,
            rtcp,
            local_ip,
            rtp_port,
        })
    }

    pub fn active_pair_count(&self) -> usize {
        self.entries.len()
    }
}

fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// Set the RTCP socket's receive buffer from configuration, halving on
/// `ENOBUFS`-like failure down to [`RTCP_RECV_BUFFER_FLOOR`] (spec §4.4).
fn size_rtcp_recv_buffer(socket: &UdpSocket, requested_bytes: usize) {
    let sock2 = socket2::SockRef::from(socket);
    let mut size = requested_bytes;
    loop {
        match sock2.set_recv_buffer_size(size) {
            Ok(()) => return,
            Err(e) => {
                if size <= RTCP_RECV_BUFFER_FLOOR {
                    warn!(
                        error = %e,
                        size,
                        "could not grow RTCP receive buffer past the floor, leaving OS default"
                    );
                    return;
                }
                size = (size / 2).max(RTCP_RECV_BUFFER_FLOOR);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn acquire_binds_an_even_odd_pair() {
        let pool = SocketPool::new(64 * 1024);
        let handle = pool
            .acquire(IpAddr::V4(Ipv4Addr::LOCALHOST), 16000)
            .await
            .unwrap();
        assert_eq!(handle.rtp_port % 2, 0);
        assert_eq!(handle.rtcp_port(), handle.rtp_port + 1);
        assert_eq!(pool.active_pair_count(), 1);
    }

    #[tokio::test]
    async fn release_destroys_pair_at_zero_refcount() {
        let pool = SocketPool::new(64 * 1024);
        let handle = pool
            .acquire(IpAddr::V4(Ipv4Addr::LOCALHOST), 16100)
            .await
            .unwrap();
        let cloned = handle.clone();
        assert_eq!(pool.active_pair_count(), 1);

        drop(handle);
        assert_eq!(pool.active_pair_count(), 1, "still held by the clone");

        drop(cloned);
        assert_eq!(pool.active_pair_count(), 0);
    }

    #[tokio::test]
    async fn acquire_existing_shares_the_same_pair() {
        let pool = SocketPool::new(64 * 1024);
        let first = pool
            .acquire(IpAddr::V4(Ipv4Addr::LOCALHOST), 16200)
            .await
            .unwrap();
        let port = first.rtp_port;

        let second = pool
            .acquire_existing(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
            .expect("pair should be shareable");
        assert_eq!(second.rtp_port, port);

        drop(first);
        assert_eq!(pool.active_pair_count(), 1);
        drop(second);
        assert_eq!(pool.active_pair_count(), 0);
    }

    #[tokio::test]
    async fn probes_past_a_port_taken_outside_the_pool() {
        let pool = SocketPool::new(64 * 1024);
        let _blocker = UdpSocket::bind((Ipv4Addr::LOCALHOST, 16300)).await.unwrap();
        let handle = pool
            .acquire(IpAddr::V4(Ipv4Addr::LOCALHOST), 16300)
            .await
            .unwrap();
        assert_ne!(handle.rtp_port, 16300, "the taken port must be skipped");
    }

    #[tokio::test]
    async fn acquire_shares_the_pair_already_bound_for_an_ip() {
        let pool = SocketPool::new(64 * 1024);
        let first = pool
            .acquire(IpAddr::V4(Ipv4Addr::LOCALHOST), 16400)
            .await
            .unwrap();
        let second = pool
            .acquire(IpAddr::V4(Ipv4Addr::LOCALHOST), 16400)
            .await
            .unwrap();
        assert_eq!(
            first.rtp_port, second.rtp_port,
            "acquire(local-ip) must return the shared pair, not bind a new one (spec §4.4)"
        );
        assert_eq!(pool.active_pair_count(), 1);

        drop(first);
        assert_eq!(pool.active_pair_count(), 1, "still held by the second handle");
        drop(second);
        assert_eq!(pool.active_pair_count(), 0);
    }
}
