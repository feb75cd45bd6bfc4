//! Notification thread: one background run loop per event loop
//!
//! Started lazily by the first watch, torn down once with the event loop.
//! All native stream mutation is posted here through the signal queue and
//! runs on this thread in posting order.

use crate::config::WatchConfig;
use crate::error::{Result, WatchError};
use crate::platform;
use crate::runloop::{panic_message, RunLoop, RunLoopSource, SourceId};
use crate::signal::{Signal, SignalQueue};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// Background thread hosting native subscriptions
pub struct NotificationRunLoop {
    thread_name: String,
    stack_size: usize,
    state: Mutex<Option<Running>>,
    spawned: AtomicUsize,
}

struct Running {
    thread: JoinHandle<()>,
    run_loop: RunLoop,
    wake_source: SourceId,
    queue: Arc<SignalQueue>,
}

impl Running {
    fn post(&self, signal: Signal) -> Result<()> {
        self.queue.push(signal)?;
        self.run_loop.signal_source(self.wake_source);
        self.run_loop.wake_up();
        Ok(())
    }
}

impl NotificationRunLoop {
    pub fn new(config: &WatchConfig) -> Self {
        Self {
            thread_name: config.thread_name.clone(),
            stack_size: config.stack_size,
            state: Mutex::new(None),
            spawned: AtomicUsize::new(0),
        }
    }

    /// Start the notification thread if it is not running yet
    ///
    /// Returns once the thread has published its run loop, so work may be
    /// posted as soon as this returns.
    pub fn ensure_started(&self) -> Result<RunLoop> {
        let mut state = self.state.lock();
        if let Some(running) = state.as_ref() {
            if !running.thread.is_finished() {
                return Ok(running.run_loop.clone());
            }
        }

        if let Some(dead) = state.take() {
            warn!(run_loop = dead.run_loop.id(), "notification thread exited unexpectedly, restarting");
            if dead.thread.join().is_err() {
                error!("notification thread panicked");
            }
            release_leftovers(dead.queue.take());
        }

        let queue = Arc::new(SignalQueue::new());
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let thread_queue = queue.clone();
        let thread = thread::Builder::new()
            .name(self.thread_name.clone())
            .stack_size(self.stack_size)
            .spawn(move || run_loop_body(thread_queue, ready_tx))
            .map_err(|e| WatchError::ResourceExhausted(format!("cannot spawn notification thread: {}", e)))?;

        let (run_loop, wake_source) = match ready_rx.recv() {
            Ok(published) => published,
            Err(_) => {
                let _ = thread.join();
                return Err(WatchError::ResourceExhausted(
                    "notification thread exited during startup".to_string(),
                ));
            }
        };

        self.spawned.fetch_add(1, Ordering::SeqCst);
        debug!(run_loop = run_loop.id(), thread = %self.thread_name, "notification run loop started");

        *state = Some(Running {
            thread,
            run_loop: run_loop.clone(),
            wake_source,
            queue,
        });
        Ok(run_loop)
    }

    /// Queue work for the notification thread and wake it
    pub(crate) fn signal(&self, signal: Signal) -> Result<()> {
        let state = self.state.lock();
        let running = state
            .as_ref()
            .ok_or(WatchError::InvalidState("notification run loop is not running"))?;
        if running.thread.is_finished() {
            return Err(WatchError::ResourceExhausted(
                "notification thread has exited".to_string(),
            ));
        }
        running.post(signal)
    }

    /// Run a closure on the notification thread
    pub fn perform<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.signal(Signal::Perform(Box::new(f)))
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Whether the thread is started and still pumping its run loop
    pub fn is_alive(&self) -> bool {
        self.state
            .lock()
            .as_ref()
            .is_some_and(|running| !running.thread.is_finished())
    }

    /// The published run loop, if the thread is running
    pub fn run_loop(&self) -> Option<RunLoop> {
        self.state.lock().as_ref().map(|running| running.run_loop.clone())
    }

    /// How many notification threads have ever been spawned
    pub fn threads_spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Stop and join the notification thread, releasing anything still queued
    pub fn teardown(&self) {
        let Some(running) = self.state.lock().take() else {
            return;
        };

        if let Err(err) = running.post(Signal::Terminate) {
            error!("cannot queue termination: {}", err);
            running.run_loop.stop();
        }

        if running.thread.thread().id() == thread::current().id() {
            warn!("notification run loop torn down from its own thread; not joining");
        } else if running.thread.join().is_err() {
            error!("notification thread panicked");
        }

        release_leftovers(running.queue.take());
        debug!(run_loop = running.run_loop.id(), "notification run loop torn down");
    }
}

impl Drop for NotificationRunLoop {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for NotificationRunLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationRunLoop")
            .field("thread_name", &self.thread_name)
            .field("started", &self.is_started())
            .field("threads_spawned", &self.threads_spawned())
            .field("queued", &self.state.lock().as_ref().map(|running| running.queue.len()))
            .finish()
    }
}

/// Body of the notification thread
fn run_loop_body(queue: Arc<SignalQueue>, ready: Sender<(RunLoop, SourceId)>) {
    let run_loop = RunLoop::current();
    let source = run_loop.add_source(Arc::new(SignalDrain {
        queue,
        run_loop: run_loop.clone(),
    }));

    if ready.send((run_loop.clone(), source)).is_err() {
        run_loop.remove_source(source);
        return;
    }

    run_loop.run();
    run_loop.remove_source(source);
}

/// Wake source: drains the signal queue on the notification thread
struct SignalDrain {
    queue: Arc<SignalQueue>,
    run_loop: RunLoop,
}

impl RunLoopSource for SignalDrain {
    fn perform(&self) {
        // Panics are contained per item; the rest of the batch still runs
        for signal in self.queue.take() {
            match signal {
                Signal::Terminate => self.run_loop.stop(),
                Signal::Perform(f) => {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
                        error!("deferred work panicked: {}", panic_message(&*payload));
                    }
                }
                Signal::Subscribe(watcher) => {
                    let started = panic::catch_unwind(AssertUnwindSafe(|| watcher.schedule_and_start(&self.run_loop)));
                    if let Err(payload) = started {
                        error!("stream start panicked: {}", panic_message(&*payload));
                        watcher.started.post();
                    }
                }
                Signal::Unsubscribe { stream, done } => {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| platform::release(stream))) {
                        error!("stream release panicked: {}", panic_message(&*payload));
                    }
                    let _ = done.send(());
                }
            }
        }
    }
}

/// Items still queued after the thread exited
fn release_leftovers(leftovers: Vec<Signal>) {
    if leftovers.is_empty() {
        return;
    }
    debug!(count = leftovers.len(), "releasing signals queued after termination");

    for signal in leftovers {
        match signal {
            // Never started; unblock any close waiting on it
            Signal::Subscribe(watcher) => watcher.started.post(),
            Signal::Unsubscribe { stream, done } => {
                platform::release(stream);
                let _ = done.send(());
            }
            Signal::Perform(_) | Signal::Terminate => {}
        }
    }
}
