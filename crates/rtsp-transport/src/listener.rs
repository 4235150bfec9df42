//! The Listener Set (spec §4.4): one TCP accept task per configured
//! `(ip, port)`, rebuildable on prefs reload without disturbing untouched
//! entries.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::Result;

/// Invoked once per accepted connection. Implemented by `session-core` to
/// spin up a fresh RTSP Session task (spec §2: "Listener → RTSP Session").
pub trait AcceptHandler: Send + Sync + 'static {
    fn on_accept(&self, stream: TcpStream, local_addr: SocketAddr, peer_addr: SocketAddr);
}

struct BoundListener {
    join: JoinHandle<()>,
}

impl Drop for BoundListener {
    fn drop(&mut self) {
        self.join.abort();
    }
}

/// Owns the live set of bound TCP listeners and reconciles it against a
/// desired address set on demand.
pub struct ListenerSet<H: AcceptHandler> {
    handler: Arc<H>,
    listeners: DashMap<SocketAddr, BoundListener>,
}

impl<H: AcceptHandler> ListenerSet<H> {
    pub fn new(handler: Arc<H>) -> Self {
        ListenerSet {
            handler,
            listeners: DashMap::new(),
        }
    }

    pub fn bound_addresses(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|e| *e.key()).collect()
    }

    /// Reconcile the live listener set against `desired`: kept entries are
    /// left untouched, missing ones are bound and armed for read, and
    /// entries no longer desired are killed (spec §4.4). Bind failures
    /// (address-in-use, permission-denied) are logged and skipped; the
    /// caller decides whether "zero listeners bound" is fatal (only true
    /// at startup, per spec §4.4/§7).
    pub async fn rebuild(&self, desired: &[SocketAddr]) {
        let desired_set: HashSet<SocketAddr> = desired.iter().copied().collect();

        let to_remove: Vec<SocketAddr> = self
            .listeners
            .iter()
            .map(|e| *e.key())
            .filter(|addr| !desired_set.contains(addr))
            .collect();
        for addr in to_remove {
            info!(%addr, "removing listener no longer in desired set");
            self.listeners.remove(&addr);
        }

        for addr in desired_set {
            if self.listeners.contains_key(&addr) {
                continue;
            }
            match self.bind_and_spawn(addr).await {
                Ok(bound) => {
                    info!(%addr, "listener bound");
                    self.listeners.insert(addr, bound);
                }
                Err(e) => {
                    warn!(%addr, error = %e, "failed to bind listener, skipping");
                }
            }
        }
    }

    async fn bind_and_spawn(&self, addr: SocketAddr) -> Result<BoundListener> {
        let listener = TcpListener::bind(addr).await?;
        let handler = self.handler.clone();

        let join = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let local_addr = stream.local_addr().unwrap_or(addr);
                        handler.on_accept(stream, local_addr, peer_addr);
                    }
                    Err(e) => {
                        warn!(%addr, error = %e, "accept() failed");
                    }
                }
            }
        });

        Ok(BoundListener { join })
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingHandler {
        accepted: Arc<AtomicUsize>,
    }

    impl AcceptHandler for CountingHandler {
        fn on_accept(&self, _stream: TcpStream, _local: SocketAddr, _peer: SocketAddr) {
            self.accepted.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn rebuild_binds_and_tears_down_listeners() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(CountingHandler { accepted: accepted.clone() });
        let set = ListenerSet::new(handler);

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        // Bind an ephemeral port first to discover one, then rebuild with it.
        let probe = TcpListener::bind(addr).await.unwrap();
        let bound_addr = probe.local_addr().unwrap();
        drop(probe);

        set.rebuild(&[bound_addr]).await;
        assert_eq!(set.len(), 1);

        let conn = TcpStream::connect(bound_addr).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        drop(conn);

        set.rebuild(&[]).await;
        assert_eq!(set.len(), 0);
    }

    #[tokio::test]
    async fn rebuild_is_a_noop_for_unchanged_entries() {
        let handler = Arc::new(CountingHandler {
            accepted: Arc::new(AtomicUsize::new(0)),
        });
        let set = ListenerSet::new(handler);

        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        set.rebuild(&[addr]).await;
        set.rebuild(&[addr]).await;
        assert_eq!(set.len(), 1);
    }
}
