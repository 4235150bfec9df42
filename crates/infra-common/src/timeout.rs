//! The Timeout Service (spec §4.3): a single periodic task that scans
//! registered `(deadline, task)` entries and signals whichever tasks are
//! due. `refresh` is O(1) (an atomic-ish map write); the scanner reads the
//! current deadline lazily on its next tick, exactly as spec §4.3 asks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::tasks::{flags, Mailbox};

struct Entry {
    deadline: Instant,
    mailbox: Arc<Mailbox>,
    /// One-shot entries (from `TaskAction::ReenqueueAfter`) are removed the
    /// first time they fire; periodic entries (session idle timeouts) stay
    /// registered until explicitly unregistered.
    one_shot: bool,
}

/// Shared by every crate that needs deadline-driven wakeups: RTSP/RTP
/// session idle timeouts, and a task's own `ReenqueueAfter` reschedules.
pub struct TimeoutService {
    entries: DashMap<u64, Entry>,
    tick: Duration,
    running: AtomicBool,
}

impl TimeoutService {
    pub fn new(tick: Duration) -> Arc<Self> {
        Arc::new(TimeoutService {
            entries: DashMap::new(),
            tick,
            running: AtomicBool::new(false),
        })
    }

    /// Register (or replace) a recurring deadline for `task_id`, signalling
    /// `mailbox` with [`flags::TIMEOUT`] whenever it's found due. Used for
    /// RTSP/RTP session idle timeouts (spec §5: "every session carries a
    /// timeout task entry").
    pub fn register(&self, task_id: u64, mailbox: Arc<Mailbox>, deadline: Instant) {
        self.entries.insert(
            task_id,
            Entry {
                deadline,
                mailbox,
                one_shot: false,
            },
        );
    }

    /// Register a one-shot reschedule for a `TaskAction::ReenqueueAfter`
    /// return value (spec §4.2's "positive N" case).
    pub fn register_oneshot(&self, task_id: u64, mailbox: Arc<Mailbox>, deadline: Instant) {
        self.entries.insert(
            task_id,
            Entry {
                deadline,
                mailbox,
                one_shot: true,
            },
        );
    }

    /// Write a new absolute deadline for an already-registered task
    /// (spec §4.3: "Tasks refresh their deadline by writing a new absolute
    /// time"). No-op if the task isn't registered.
    pub fn refresh(&self, task_id: u64, deadline: Instant) {
        if let Some(mut entry) = self.entries.get_mut(&task_id) {
            entry.deadline = deadline;
        }
    }

    pub fn unregister(&self, task_id: u64) {
        self.entries.remove(&task_id);
    }

    /// Spawn the scanner loop. Idempotent: calling twice on the same
    /// instance is a no-op after the first call.
    pub fn spawn_scanner(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }
        let service = self.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.tick);
            loop {
                interval.tick().await;
                service.scan_due();
            }
        }))
    }

    fn scan_due(&self) {
        let now = Instant::now();
        let due: Vec<u64> = self
            .entries
            .iter()
            .filter(|e| e.deadline <= now)
            .map(|e| *e.key())
            .collect();

        for id in due {
            let fired = if self.entries.get(&id).map(|e| e.one_shot).unwrap_or(false) {
                self.entries.remove(&id).map(|(_, e)| e.mailbox)
            } else {
                self.entries.get(&id).map(|e| e.mailbox.clone())
            };

            if let Some(mailbox) = fired {
                trace!(task_id = id, "timeout fired");
                mailbox.signal(flags::TIMEOUT);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_after_deadline_and_refresh_extends_it() {
        let service = TimeoutService::new(Duration::from_millis(5));
        let _scanner = service.spawn_scanner();

        let mailbox = Mailbox::new();
        service.register(1, mailbox.clone(), Instant::now() + Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(3)).await;
        // Refresh before it fires - should push the deadline out.
        service.refresh(1, Instant::now() + Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(15)).await;
        let events = mailbox_take(&mailbox);
        assert_eq!(events & flags::TIMEOUT, 0, "refresh should have delayed the fire");

        tokio::time::sleep(Duration::from_millis(60)).await;
        let events = mailbox_take(&mailbox);
        assert_ne!(events & flags::TIMEOUT, 0);
    }

    #[tokio::test]
    async fn oneshot_entry_is_removed_after_firing() {
        let service = TimeoutService::new(Duration::from_millis(5));
        let _scanner = service.spawn_scanner();

        let mailbox = Mailbox::new();
        service.register_oneshot(7, mailbox.clone(), Instant::now() + Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(service.entries.get(&7).is_none());
    }

    fn mailbox_take(mailbox: &Arc<Mailbox>) -> u8 {
        mailbox.take_pending()
    }
}
