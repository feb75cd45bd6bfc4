//! Run-loop event pump executed by the notification thread
//!
//! A `RunLoop` is the thread-affine primitive native streams attach to:
//! - Sources: registered callbacks that fire once per signal
//! - Performs: one-shot closures queued from any thread
//! - Delayed performs: one-shot closures that fire after a deadline
//!
//! Everything attached to a run loop executes on the thread inside `run()`.
//! A panicking source or perform is logged and does not end the loop.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::any::Any;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::error;

/// Callback attached to a run loop, performed once per signal
pub trait RunLoopSource: Send + Sync {
    fn perform(&self);
}

/// Identifies a source registered with [`RunLoop::add_source`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

type Perform = Box<dyn FnOnce() + Send>;

static NEXT_RUN_LOOP_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RunLoop = RunLoop::new();
}

/// Reference to a run loop; clones refer to the same loop
#[derive(Clone)]
pub struct RunLoop {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    state: Mutex<State>,
    cond: Condvar,
}

#[derive(Default)]
struct State {
    sources: Vec<SourceEntry>,
    performs: VecDeque<Perform>,
    timers: BinaryHeap<Timer>,
    next_source: u64,
    next_timer: u64,
    running: bool,
    stop_requested: bool,
}

struct SourceEntry {
    id: SourceId,
    source: Arc<dyn RunLoopSource>,
    signaled: bool,
}

struct Timer {
    deadline: Instant,
    seq: u64,
    perform: Perform,
}

// Min-heap on (deadline, seq)
impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

/// Work collected under the lock for one iteration
struct Batch {
    sources: Vec<Arc<dyn RunLoopSource>>,
    performs: Vec<Perform>,
}

impl Batch {
    fn is_empty(&self) -> bool {
        self.sources.is_empty() && self.performs.is_empty()
    }
}

impl RunLoop {
    /// Create a run loop not yet bound to any thread
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_RUN_LOOP_ID.fetch_add(1, AtomicOrdering::Relaxed),
                state: Mutex::new(State::default()),
                cond: Condvar::new(),
            }),
        }
    }

    /// The run loop belonging to the calling thread
    pub fn current() -> Self {
        CURRENT.with(|run_loop| run_loop.clone())
    }

    /// Process-unique identity of this run loop
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether both references point at the same run loop
    pub fn ptr_eq(&self, other: &RunLoop) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register a source; it fires on the next iteration after each `signal_source`
    pub fn add_source(&self, source: Arc<dyn RunLoopSource>) -> SourceId {
        let mut state = self.inner.state.lock();
        let id = SourceId(state.next_source);
        state.next_source += 1;
        state.sources.push(SourceEntry {
            id,
            source,
            signaled: false,
        });
        id
    }

    /// Unregister a source. Pending signals for it are discarded.
    pub fn remove_source(&self, id: SourceId) {
        self.inner.state.lock().sources.retain(|entry| entry.id != id);
    }

    /// Mark a source as signaled. Does not wake a sleeping loop; see `wake_up`.
    pub fn signal_source(&self, id: SourceId) {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.sources.iter_mut().find(|entry| entry.id == id) {
            entry.signaled = true;
        }
    }

    /// Wake the loop if it is sleeping
    pub fn wake_up(&self) {
        let _state = self.inner.state.lock();
        self.inner.cond.notify_all();
    }

    /// Queue a closure to run on the loop's thread
    pub fn perform<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        state.performs.push_back(Box::new(f));
        self.inner.cond.notify_all();
    }

    /// Queue a closure to run on the loop's thread once `delay` has elapsed
    pub fn perform_after<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        let seq = state.next_timer;
        state.next_timer += 1;
        state.timers.push(Timer {
            deadline: Instant::now() + delay,
            seq,
            perform: Box::new(f),
        });
        self.inner.cond.notify_all();
    }

    /// Ask `run` to return after finishing its current iteration.
    /// Has no effect on a loop that is not running.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if state.running {
            state.stop_requested = true;
            self.inner.cond.notify_all();
        }
    }

    /// Whether some thread is inside `run`
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Pump the loop on the calling thread until `stop` is called
    pub fn run(&self) {
        let mut state = self.inner.state.lock();
        state.running = true;

        loop {
            if state.stop_requested {
                state.stop_requested = false;
                break;
            }

            let batch = Self::collect(&mut state);
            if batch.is_empty() {
                match state.timers.peek().map(|timer| timer.deadline) {
                    Some(deadline) => {
                        self.inner.cond.wait_until(&mut state, deadline);
                    }
                    None => self.inner.cond.wait(&mut state),
                }
                continue;
            }

            let run_loop = self.inner.id;
            MutexGuard::unlocked(&mut state, || {
                for source in batch.sources {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| source.perform())) {
                        error!(run_loop, "run loop source panicked: {}", panic_message(&*payload));
                    }
                }
                for perform in batch.performs {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(perform)) {
                        error!(run_loop, "run loop perform panicked: {}", panic_message(&*payload));
                    }
                }
            });
        }

        state.running = false;
    }

    fn collect(state: &mut State) -> Batch {
        let sources = state
            .sources
            .iter_mut()
            .filter(|entry| entry.signaled)
            .map(|entry| {
                entry.signaled = false;
                entry.source.clone()
            })
            .collect();

        let mut performs: Vec<Perform> = state.performs.drain(..).collect();

        let now = Instant::now();
        while state.timers.peek().is_some_and(|timer| timer.deadline <= now) {
            if let Some(timer) = state.timers.pop() {
                performs.push(timer.perform);
            }
        }

        Batch { sources, performs }
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

impl Default for RunLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RunLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLoop").field("id", &self.inner.id).finish()
    }
}
