//! The global HTTP tunnel map (spec §4.6, §5): pairs a GET session waiting
//! under a cookie with the POST that later carries the same cookie and
//! hands its input socket over. Mutex held only during register/resolve,
//! never across I/O (spec §5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{oneshot, Notify};

use infra_common::tasks::Mailbox;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("a GET session is already registered under this X-Sessioncookie")]
    CookieInUse,
}

/// What the GET half registers about itself so a later POST can bind to
/// it (spec §4.6).
pub struct PendingTunnel {
    pub get_session_id: u64,
    pub get_mailbox: Arc<Mailbox>,
    /// The GET session's per-connection read mutex. A POST may only bind
    /// while this is acquirable (spec §4.6: "Binding requires the GET
    /// session's read mutex to be acquirable; if not, the bind is
    /// refused").
    pub read_mutex: Arc<tokio::sync::Mutex<()>>,
}

struct Entry {
    pending: PendingTunnel,
    socket_tx: oneshot::Sender<(OwnedReadHalf, Bytes)>,
}

#[derive(Debug)]
pub enum BindOutcome {
    /// The POST's socket was handed to the GET session, which has been
    /// signalled to resume as a normal RTSP session.
    Bound { get_session_id: u64 },
    /// No GET ever registered under this cookie within the wait budget.
    NotFound,
    /// A GET is registered, but its read mutex was held (mid-request) at
    /// bind time; the bind is refused per spec §4.6.
    ReadMutexBusy,
}

/// The process-wide tunnel map (spec §3: "at most one RTSP Session is
/// registered in the HTTP-tunnel map under any given cookie until both
/// halves have bound").
pub struct TunnelMap {
    entries: Mutex<HashMap<String, Entry>>,
    waiters: Mutex<HashMap<String, Arc<Notify>>>,
}

impl TunnelMap {
    pub fn new() -> Arc<Self> {
        Arc::new(TunnelMap {
            entries: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
        })
    }

    /// Register the GET half under `cookie`. Returns the receiving end of
    /// the one-shot channel the eventual POST's input socket arrives on.
    pub fn register_get(
        &self,
        cookie: &str,
        pending: PendingTunnel,
    ) -> Result<oneshot::Receiver<(OwnedReadHalf, Bytes)>, Error> {
        let mut entries = self.entries.lock();
        if entries.contains_key(cookie) {
            return Err(Error::CookieInUse);
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(
            cookie.to_string(),
            Entry {
                pending,
                socket_tx: tx,
            },
        );
        if let Some(notify) = self.waiters.lock().remove(cookie) {
            notify.notify_waiters();
        }
        Ok(rx)
    }

    /// Attempt to bind the POST half's input socket to the GET session
    /// registered under `cookie`, waiting up to `wait` if the POST arrived
    /// first (spec §4.6). Simultaneous arrivals are serialized by the
    /// `entries` mutex. `prefetched` is whatever raw bytes were already read
    /// past the POST's header block (the start of its continuous base64
    /// stream); the GET session decodes it the same way as anything read
    /// off the socket afterward.
    pub async fn bind_post(
        &self,
        cookie: &str,
        input: OwnedReadHalf,
        prefetched: Bytes,
        wait: Duration,
    ) -> BindOutcome {
        let deadline = Instant::now() + wait;

        loop {
            let attempt = {
                let mut entries = self.entries.lock();
                if let Some(entry) = entries.get(cookie) {
                    let lock_result = entry.pending.read_mutex.clone().try_lock_owned();
                    Some((lock_result, entries.remove(cookie)))
                } else {
                    None
                }
            };

            match attempt {
                None => {
                    if Instant::now() >= deadline {
                        return BindOutcome::NotFound;
                    }
                    let notify = self
                        .waiters
                        .lock()
                        .entry(cookie.to_string())
                        .or_insert_with(|| Arc::new(Notify::new()))
                        .clone();
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let _ = tokio::time::timeout(remaining, notify.notified()).await;
                }
                Some((Ok(_guard), Some(entry))) => {
                    let _ = entry.socket_tx.send((input, prefetched));
                    entry
                        .pending
                        .get_mailbox
                        .signal(infra_common::tasks::flags::USER_SIGNAL);
                    return BindOutcome::Bound {
                        get_session_id: entry.pending.get_session_id,
                    };
                }
                Some((Err(_), entry)) => {
                    // Refused: read mutex busy. Put the entry back since
                    // this POST attempt failed, not the pairing itself.
                    if let Some(entry) = entry {
                        self.entries.lock().insert(cookie.to_string(), entry);
                    }
                    return BindOutcome::ReadMutexBusy;
                }
                Some((Ok(_), None)) => unreachable!("entry observed present just above"),
            }
        }
    }

    pub fn is_registered(&self, cookie: &str) -> bool {
        self.entries.lock().contains_key(cookie)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_mailbox() -> Arc<Mailbox> {
        Mailbox::new()
    }

    #[tokio::test]
    async fn register_twice_under_same_cookie_is_rejected() {
        let map = TunnelMap::new();
        let pending = PendingTunnel {
            get_session_id: 1,
            get_mailbox: dummy_mailbox(),
            read_mutex: Arc::new(tokio::sync::Mutex::new(())),
        };
        assert!(map.register_get("c0", pending).is_ok());

        let pending2 = PendingTunnel {
            get_session_id: 2,
            get_mailbox: dummy_mailbox(),
            read_mutex: Arc::new(tokio::sync::Mutex::new(())),
        };
        assert!(matches!(map.register_get("c0", pending2), Err(Error::CookieInUse)));
    }

    #[tokio::test]
    async fn bind_post_refused_when_read_mutex_busy() {
        let map = TunnelMap::new();
        let read_mutex = Arc::new(tokio::sync::Mutex::new(()));
        let _held = read_mutex.clone().lock_owned().await;

        let pending = PendingTunnel {
            get_session_id: 7,
            get_mailbox: dummy_mailbox(),
            read_mutex,
        };
        map.register_get("busy", pending).unwrap();

        let (_client, read_half) = loopback_read_half().await;
        let outcome = map
            .bind_post("busy", read_half, Bytes::new(), Duration::from_millis(20))
            .await;
        assert!(matches!(outcome, BindOutcome::ReadMutexBusy));
        assert!(map.is_registered("busy"), "entry restored after refusal");
    }

    async fn loopback_read_half() -> (tokio::net::TcpStream, OwnedReadHalf) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (read_half, _write_half) = server.into_split();
        (client, read_half)
    }

    #[tokio::test]
    async fn get_arriving_first_then_post_binds_immediately() {
        let map = TunnelMap::new();
        let pending = PendingTunnel {
            get_session_id: 42,
            get_mailbox: dummy_mailbox(),
            read_mutex: Arc::new(tokio::sync::Mutex::new(())),
        };
        let rx = map.register_get("c1", pending).unwrap();

        let (_client, read_half) = loopback_read_half().await;
        let outcome = map
            .bind_post("c1", read_half, Bytes::new(), Duration::from_millis(100))
            .await;
        assert!(matches!(outcome, BindOutcome::Bound { get_session_id: 42 }));
        assert!(rx.await.is_ok());
        assert!(!map.is_registered("c1"));
    }

    #[tokio::test]
    async fn post_arriving_first_waits_for_the_get() {
        let map = TunnelMap::new();
        let map2 = map.clone();

        let (_client, read_half) = loopback_read_half().await;
        let waiter = tokio::spawn(async move {
            map2.bind_post("late", read_half, Bytes::new(), Duration::from_millis(500))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let pending = PendingTunnel {
            get_session_id: 99,
            get_mailbox: dummy_mailbox(),
            read_mutex: Arc::new(tokio::sync::Mutex::new(())),
        };
        map.register_get("late", pending).unwrap();

        let outcome = waiter.await.unwrap();
        assert!(matches!(outcome, BindOutcome::Bound { get_session_id: 99 }));
    }
}
