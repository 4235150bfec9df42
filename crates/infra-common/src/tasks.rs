//! The Task Scheduler (spec §4.2) and its mailbox signalling (spec §5).
//!
//! The spec describes a hand-rolled worker pool popping runnable tasks off
//! a FIFO and invoking a cooperative `run` hook. Tokio's multi-threaded
//! runtime already *is* that worker pool: every [`Task`] becomes one
//! spawned `tokio::task` that loops on its own [`Mailbox`], so "N worker
//! threads" becomes "N tokio runtime threads" and "signal/re-enqueue"
//! becomes `Notify::notify_one` plus a bitflag OR. Every suspension point
//! and ordering guarantee in spec §4.2/§5 is preserved by this mapping;
//! only the FIFO-popping mechanism changes. `forceSameThread()` has no
//! counterpart here: a Tokio task is never polled by two workers at once,
//! so a lock held across an `.await` is never handed off mid-hold the way
//! the spec's worry about "lock hand-off across workers" describes.

use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{Error, Result};
use crate::timeout::TimeoutService;

/// Mailbox event flags (spec §4.2: "bit flags: read-ready, write-ready,
/// timeout, kill, user-signal").
pub mod flags {
    pub const READABLE: u8 = 1 << 0;
    pub const WRITABLE: u8 = 1 << 1;
    pub const TIMEOUT: u8 = 1 << 2;
    pub const KILL: u8 = 1 << 3;
    pub const USER_SIGNAL: u8 = 1 << 4;
}

/// What a [`Task::run`] invocation asks the scheduler to do next,
/// corresponding to the three return classes in spec §4.2's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    /// Negative: terminate; the scheduler detaches and drops the task.
    Terminate,
    /// Zero: the task will be re-signalled externally (poller, another
    /// task, an administrative kill).
    AwaitSignal,
    /// Positive N microseconds: re-enqueue after N via the Timeout Service.
    ReenqueueAfter(Duration),
}

/// A task's mailbox: the bit flags pending delivery plus a wake-up.
/// `signal` is idempotent and safe to call from any thread.
pub struct Mailbox {
    flags: AtomicU8,
    notify: Notify,
}

impl Mailbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Mailbox {
            flags: AtomicU8::new(0),
            notify: Notify::new(),
        })
    }

    /// OR `flag` into the pending mailbox and wake the task if it is
    /// waiting (spec §4.2: `signal(task, flag)`).
    pub fn signal(&self, flag: u8) {
        self.flags.fetch_or(flag, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_killed(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & flags::KILL != 0
    }

    /// Non-blocking drain of whatever flags are currently pending, without
    /// waiting for a notification. Useful for tests and for a task that
    /// wants to poll its mailbox instead of suspending on it.
    pub fn take_pending(&self) -> u8 {
        self.flags.swap(0, Ordering::SeqCst)
    }

    /// Public variant of [`Mailbox::wait_and_clear`] for tasks that drive
    /// their own long-lived loop (one `run` invocation spanning an entire
    /// connection, e.g. an RTSP Session) and need to race a socket read
    /// against an administrative kill or timeout signal, rather than being
    /// re-invoked by the scheduler on every event.
    pub async fn wait_for_signal(&self) -> u8 {
        self.wait_and_clear().await
    }

    /// Wait for at least one pending flag, then atomically take and clear
    /// all of them ("invoke run(events) with and-cleared flags").
    async fn wait_and_clear(&self) -> u8 {
        loop {
            let notified = self.notify.notified();
            let current = self.flags.swap(0, Ordering::SeqCst);
            if current != 0 {
                return current;
            }
            notified.await;
        }
    }
}

/// A cooperatively scheduled unit of work: an RTSP Session, an RTP Session
/// timeout watchdog, a Listener's accept loop, etc.
#[async_trait::async_trait]
pub trait Task: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Handle one batch of mailbox events and say what happens next.
    async fn run(&self, events: u8) -> TaskAction;
}

struct TrackedTask {
    id: u64,
    name: String,
    handle: JoinHandle<()>,
    started_at: Instant,
}

impl TrackedTask {
    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Spawns and tracks [`Task`]s the way the spec's worker pool does,
/// wiring each one to the shared [`TimeoutService`] for positive-N
/// reschedules. Mirrors the teacher's `LayerTaskManager` shutdown
/// discipline: cancel, wait with a timeout, then force-abort stragglers.
pub struct Scheduler {
    next_id: AtomicUsize,
    tasks: tokio::sync::Mutex<Vec<TrackedTask>>,
    cancel: CancellationToken,
    timeouts: Arc<TimeoutService>,
    max_tasks: usize,
    shutdown_timeout: Duration,
}

impl Scheduler {
    pub fn new(timeouts: Arc<TimeoutService>, max_tasks: usize, shutdown_timeout: Duration) -> Arc<Self> {
        Arc::new(Scheduler {
            next_id: AtomicUsize::new(0),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            timeouts,
            max_tasks,
            shutdown_timeout,
        })
    }

    /// Spawn `task`, driving its mailbox loop until it terminates or the
    /// scheduler is shut down.
    pub async fn spawn<T: Task>(self: &Arc<Self>, task: Arc<T>) -> Result<(u64, Arc<Mailbox>)> {
        self.spawn_with_mailbox(task, Mailbox::new()).await
    }

    /// Like [`spawn`](Self::spawn), but with a caller-supplied mailbox
    /// instead of a freshly created one. Needed when other state (e.g. an
    /// RTSP Session's handle, registered in a session map before the task
    /// itself is spawned) must already hold a reference to the same mailbox
    /// the scheduler will drive.
    pub async fn spawn_with_mailbox<T: Task>(
        self: &Arc<Self>,
        task: Arc<T>,
        mailbox: Arc<Mailbox>,
    ) -> Result<(u64, Arc<Mailbox>)> {
        let active = self.tasks.lock().await.len();
        if active >= self.max_tasks {
            return Err(Error::TaskLimitReached {
                layer: "scheduler".into(),
                active,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as u64;
        let name = task.name().to_string();

        let scheduler = self.clone();
        let mailbox_for_loop = mailbox.clone();
        let cancel = self.cancel.clone();
        let timeouts = self.timeouts.clone();
        let name_for_loop = name.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = drive(task, mailbox_for_loop.clone(), timeouts.clone(), id) => {}
                _ = cancel.cancelled() => {
                    debug!(task = %name_for_loop, "task cancelled at shutdown");
                }
            }
            timeouts.unregister(id);
            scheduler.remove(id).await;
        });

        self.tasks.lock().await.push(TrackedTask {
            id,
            name,
            handle,
            started_at: Instant::now(),
        });

        Ok((id, mailbox))
    }

    async fn remove(&self, id: u64) {
        self.tasks.lock().await.retain(|t| t.id != id);
    }

    pub async fn active_task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Cancel every tracked task, wait up to `shutdown_timeout` for them
    /// to unwind gracefully, then abort anything still running.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let deadline = tokio::time::sleep(self.shutdown_timeout);
        tokio::pin!(deadline);
        loop {
            if self.tasks.lock().await.iter().all(TrackedTask::is_finished) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                _ = &mut deadline => {
                    warn!("scheduler shutdown timed out, aborting stragglers");
                    break;
                }
            }
        }

        let mut tasks = self.tasks.lock().await;
        for t in tasks.iter() {
            if !t.is_finished() {
                warn!(task = %t.name, runtime = ?t.started_at.elapsed(), "force aborting task");
                t.handle.abort();
            }
        }
        tasks.clear();
    }
}

async fn drive<T: Task>(task: Arc<T>, mailbox: Arc<Mailbox>, timeouts: Arc<TimeoutService>, id: u64) {
    loop {
        let events = mailbox.wait_and_clear().await;
        match task.run(events).await {
            TaskAction::Terminate => break,
            TaskAction::AwaitSignal => continue,
            TaskAction::ReenqueueAfter(delay) => {
                timeouts.register_oneshot(id, mailbox.clone(), Instant::now() + delay);
            }
        }
    }
}

/// Spawn a plain, untracked future the way a one-off background job (e.g.
/// the dynamic-rate probe OPTIONS round trip) is fired and forgotten.
pub fn spawn_detached<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(future)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingTask {
        name: String,
        calls: Arc<AtomicU32>,
        terminate_after: u32,
    }

    #[async_trait::async_trait]
    impl Task for CountingTask {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, _events: u8) -> TaskAction {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.terminate_after {
                TaskAction::Terminate
            } else {
                TaskAction::AwaitSignal
            }
        }
    }

    #[tokio::test]
    async fn task_runs_until_it_terminates() {
        let timeouts = TimeoutService::new(Duration::from_millis(5));
        let scheduler = Scheduler::new(timeouts, 100, Duration::from_secs(1));

        let calls = Arc::new(AtomicU32::new(0));
        let task = Arc::new(CountingTask {
            name: "counter".into(),
            calls: calls.clone(),
            terminate_after: 3,
        });

        let (_id, mailbox) = scheduler.spawn(task).await.unwrap();
        mailbox.signal(flags::USER_SIGNAL);
        mailbox.signal(flags::USER_SIGNAL);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.active_task_count().await, 0);
    }

    #[tokio::test]
    async fn task_limit_is_enforced() {
        let timeouts = TimeoutService::new(Duration::from_millis(5));
        let scheduler = Scheduler::new(timeouts, 1, Duration::from_secs(1));

        let task1 = Arc::new(CountingTask {
            name: "a".into(),
            calls: Arc::new(AtomicU32::new(0)),
            terminate_after: u32::MAX,
        });
        scheduler.spawn(task1).await.unwrap();

        let task2 = Arc::new(CountingTask {
            name: "b".into(),
            calls: Arc::new(AtomicU32::new(0)),
            terminate_after: u32::MAX,
        });
        assert!(matches!(
            scheduler.spawn(task2).await,
            Err(Error::TaskLimitReached { .. })
        ));
    }
}
