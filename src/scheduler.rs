//! Shared scheduling facility for delayed callbacks.
//!
//! Debounced invalidation and delayed deactivation both run through a
//! [`Scheduler`]. [`ThreadScheduler`] runs tasks on one background thread;
//! [`ManualScheduler`] keeps a virtual clock that tests advance explicitly.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// A deferred unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks after a delay.
pub trait Scheduler: Send + Sync {
    /// Run `task` once `delay` has elapsed, unless the returned handle is
    /// cancelled first.
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;
}

/// Cancellation handle for a scheduled task.
///
/// Dropping the handle does not cancel the task.
#[derive(Clone, Debug, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    fn new() -> Self {
        Self::default()
    }

    /// Prevent the task from running. Has no effect once it has run.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// --- Thread Scheduler ---

enum Command {
    Schedule(Timer),
    Shutdown,
}

struct Timer {
    deadline: Instant,
    seq: u64,
    task: Task,
    handle: TimerHandle,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // Reversed so the max-heap yields the earliest deadline.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Scheduler backed by a single background thread.
pub struct ThreadScheduler {
    sender: Sender<Command>,
    next_seq: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadScheduler {
    /// Spawn the scheduler thread.
    pub fn new() -> std::io::Result<Self> {
        let (sender, receiver) = unbounded();
        let worker = std::thread::Builder::new()
            .name("canopy-scheduler".to_string())
            .spawn(move || run_worker(receiver))?;

        debug!("Scheduler thread started");

        Ok(Self {
            sender,
            next_seq: AtomicU64::new(0),
            worker: Mutex::new(Some(worker)),
        })
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new();
        let timer = Timer {
            deadline: Instant::now() + delay,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            task,
            handle: handle.clone(),
        };
        if self.sender.send(Command::Schedule(timer)).is_err() {
            // Worker is gone; nothing will ever run.
            handle.cancel();
        }
        handle
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() != std::thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

fn run_worker(receiver: Receiver<Command>) {
    let mut timers: BinaryHeap<Timer> = BinaryHeap::new();

    loop {
        let command = match timers.peek() {
            Some(next) => {
                let wait = next.deadline.saturating_duration_since(Instant::now());
                match receiver.recv_timeout(wait) {
                    Ok(cmd) => Some(cmd),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match receiver.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => break,
            },
        };

        match command {
            Some(Command::Schedule(timer)) => timers.push(timer),
            Some(Command::Shutdown) => break,
            None => {}
        }

        let now = Instant::now();
        while timers.peek().map_or(false, |t| t.deadline <= now) {
            if let Some(timer) = timers.pop() {
                if !timer.handle.is_cancelled() {
                    trace!(seq = timer.seq, "Running scheduled task");
                    (timer.task)();
                }
            }
        }
    }

    debug!(dropped = timers.len(), "Scheduler thread stopped");
}

// --- Manual Scheduler ---

struct ManualState {
    now: Duration,
    next_seq: u64,
    queue: BTreeMap<(Duration, u64), (Task, TimerHandle)>,
}

/// Scheduler driven by a virtual clock.
///
/// Nothing runs until [`advance`](Self::advance) or
/// [`run_pending`](Self::run_pending) is called. Tasks run on the calling
/// thread, outside the internal lock, so they may schedule further tasks.
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: Duration::ZERO,
                next_seq: 0,
                queue: BTreeMap::new(),
            }),
        }
    }

    /// Virtual time elapsed since creation.
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Number of scheduled, uncancelled tasks.
    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .queue
            .values()
            .filter(|(_, h)| !h.is_cancelled())
            .count()
    }

    /// Move the clock forward, running every task that falls due.
    ///
    /// Returns the number of tasks run.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.state.lock().now + by;
        let mut ran = 0;

        loop {
            let next = {
                let mut state = self.state.lock();
                let due = state
                    .queue
                    .keys()
                    .next()
                    .copied()
                    .filter(|(deadline, _)| *deadline <= target);
                match due {
                    Some(key) => {
                        state.now = key.0;
                        state.queue.remove(&key)
                    }
                    None => None,
                }
            };

            match next {
                Some((task, handle)) => {
                    if !handle.is_cancelled() {
                        task();
                        ran += 1;
                    }
                }
                None => break,
            }
        }

        self.state.lock().now = target;
        ran
    }

    /// Run every task already due without moving the clock.
    pub fn run_pending(&self) -> usize {
        self.advance(Duration::ZERO)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new();
        let mut state = self.state.lock();
        let key = (state.now + delay, state.next_seq);
        state.next_seq += 1;
        state.queue.insert(key, (task, handle.clone()));
        handle
    }
}
