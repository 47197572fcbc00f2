//! Delayed task scheduler
//!
//! One background thread owns a deadline heap and receives new tasks over a
//! crossbeam channel. Each task carries a [`Token`]. A token moves
//! `Pending -> Running -> Done` when its task fires, or `Pending -> Cancelled`
//! when cancelled first; the two transitions race on one atomic, so a task
//! that has started can no longer be cancelled and a cancelled task never
//! starts.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

const PENDING: u8 = 0;
const CANCELLED: u8 = 1;
const RUNNING: u8 = 2;
const DONE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Pending,
    Cancelled,
    Running,
    Done,
}

/// Handle on one scheduled task
#[derive(Debug, Clone)]
pub struct Token {
    id: u64,
    state: Arc<AtomicU8>,
}

impl Token {
    fn new(id: u64) -> Self {
        Self { id, state: Arc::new(AtomicU8::new(PENDING)) }
    }

    /// Cancel if the task has not started; returns whether it was cancelled
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_ok()
    }

    fn claim(&self) -> bool {
        self.state
            .compare_exchange(PENDING, RUNNING, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_ok()
    }

    fn finish(&self) {
        self.state.store(DONE, AtomicOrdering::Release);
    }

    pub fn state(&self) -> TokenState {
        match self.state.load(AtomicOrdering::Acquire) {
            PENDING => TokenState::Pending,
            CANCELLED => TokenState::Cancelled,
            RUNNING => TokenState::Running,
            _ => TokenState::Done,
        }
    }

    /// Same scheduled task
    pub fn same(&self, other: &Token) -> bool {
        self.id == other.id
    }
}

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    due: Instant,
    token: Token,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.token.id == other.token.id
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // reversed: BinaryHeap is a max-heap and the earliest deadline must surface first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.token.id.cmp(&self.token.id))
    }
}

pub struct Scheduler {
    tx: Sender<Entry>,
    next_id: AtomicU64,
}

impl Scheduler {
    /// Start a scheduler with its own worker thread
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded::<Entry>();
        thread::spawn(move || run(rx));
        Self { tx, next_id: AtomicU64::new(1) }
    }

    /// Run `task` after `delay` unless the returned token is cancelled first
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> Token {
        let token = Token::new(self.next_id.fetch_add(1, AtomicOrdering::Relaxed));
        let entry = Entry {
            due: Instant::now() + delay,
            token: token.clone(),
            task: Box::new(task),
        };
        trace!(task = token.id, ?delay, "scheduling task");
        if self.tx.send(entry).is_err() {
            warn!("scheduler thread is gone; task {} dropped", token.id);
            token.cancel();
        }
        token
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide scheduler
pub fn global() -> &'static Scheduler {
    static SCHEDULER: OnceLock<Scheduler> = OnceLock::new();
    SCHEDULER.get_or_init(Scheduler::new)
}

fn run(rx: Receiver<Entry>) {
    let mut queue: BinaryHeap<Entry> = BinaryHeap::new();
    loop {
        let received = match queue.peek() {
            Some(next) => rx.recv_timeout(next.due.saturating_duration_since(Instant::now())),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(entry) => queue.push(entry),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) if queue.is_empty() => break,
            Err(RecvTimeoutError::Disconnected) => {
                if let Some(next) = queue.peek() {
                    thread::sleep(next.due.saturating_duration_since(Instant::now()));
                }
            }
        }

        let now = Instant::now();
        while queue.peek().is_some_and(|next| next.due <= now) {
            let Some(entry) = queue.pop() else { break };
            fire(entry);
        }
    }
}

fn fire(entry: Entry) {
    if !entry.token.claim() {
        trace!(task = entry.token.id, "skipping cancelled task");
        return;
    }
    trace!(task = entry.token.id, "running task");
    if panic::catch_unwind(AssertUnwindSafe(entry.task)).is_err() {
        warn!("scheduled task {} panicked", entry.token.id);
    }
    entry.token.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_tasks_fire_in_deadline_order() {
        let scheduler = Scheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, delay) in [("late", 60), ("early", 10), ("middle", 30)] {
            let order = order.clone();
            scheduler.schedule(Duration::from_millis(delay), move || {
                order.lock().unwrap().push(label);
            });
        }

        assert!(wait_for(|| order.lock().unwrap().len() == 3));
        assert_eq!(*order.lock().unwrap(), vec!["early", "middle", "late"]);
    }

    #[test]
    fn test_cancelled_task_never_runs() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let token = scheduler.schedule(Duration::from_millis(30), move || {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        });
        assert!(token.cancel());
        assert_eq!(token.state(), TokenState::Cancelled);

        thread::sleep(Duration::from_millis(80));
        assert_eq!(runs.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn test_started_task_cannot_be_cancelled() {
        let scheduler = Scheduler::new();
        let token = scheduler.schedule(Duration::ZERO, || {});

        assert!(wait_for(|| token.state() == TokenState::Done));
        assert!(!token.cancel());
        assert_eq!(token.state(), TokenState::Done);
    }

    #[test]
    fn test_panicking_task_does_not_stop_scheduler() {
        let scheduler = Scheduler::new();
        scheduler.schedule(Duration::ZERO, || panic!("boom"));
        let token = scheduler.schedule(Duration::from_millis(10), || {});
        assert!(wait_for(|| token.state() == TokenState::Done));
    }
}
