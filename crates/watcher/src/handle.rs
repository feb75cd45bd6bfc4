//! Per-watch state and lifecycle
//!
//! [`FsEvent`] lives on the event-loop thread. The part the notification
//! thread touches ([`WatcherShared`]) sits behind an `Arc` and only exposes
//! lock-protected state: the native stream, the pending event queue and the
//! `started` semaphore.

use crate::error::{Result, WatchError};
use crate::event_loop::{ActiveRef, EventLoop};
use crate::fsevents::NotificationRunLoop;
use crate::platform::{self, Delivery, NativeStream, RawRecord, StreamSpec};
use crate::runloop::RunLoop;
use crate::signal::Signal;
use crate::sync::Semaphore;
use crate::translate::{translate, EventKind, TranslatedEvent};
use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// How often a close waiting on stream start rechecks the notification thread
const START_POLL: Duration = Duration::from_millis(100);

/// Watch callback: handle, path relative to the root (`None` for the root
/// itself), event kind and status (always 0)
pub type EventCallback = Box<dyn FnMut(&FsEvent, Option<&Path>, EventKind, i32)>;

/// Lifecycle of a watch; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Initializing,
    Active,
    Closing,
    Closed,
}

/// Watch state shared with the notification thread
pub(crate) struct WatcherShared {
    resolved: Option<PathBuf>,
    recursive: bool,
    /// Delivered batches, oldest first
    pending: Mutex<Vec<Vec<TranslatedEvent>>>,
    /// Posted once the stream has been scheduled and started
    pub(crate) started: Semaphore,
    stream: Mutex<Option<Box<dyn NativeStream>>>,
    wake: Arc<Notify>,
}

impl WatcherShared {
    /// Runs on the notification thread
    pub(crate) fn schedule_and_start(&self, run_loop: &RunLoop) {
        if let Some(stream) = self.stream.lock().as_mut() {
            stream.schedule(run_loop);
            if let Err(err) = stream.start() {
                error!(path = ?self.resolved, "cannot start native stream: {}", err);
            }
        }
        self.started.post();
    }

    /// Native delivery callback; runs on the notification thread
    pub(crate) fn deliver(&self, records: &[RawRecord]) {
        let events = translate(records, self.resolved.as_deref(), self.recursive);
        if events.is_empty() {
            return;
        }

        {
            let mut pending = self.pending.lock();
            if pending.try_reserve(1).is_err() {
                error!(
                    dropped = events.len(),
                    "{}; dropping delivery",
                    WatchError::OutOfMemory("pending event batch")
                );
                return;
            }
            trace!(events = events.len(), "queued delivery");
            pending.push(events);
        }

        self.wake.notify_one();
    }

    pub(crate) fn take_pending(&self) -> Vec<Vec<TranslatedEvent>> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().iter().map(Vec::len).sum()
    }

    fn has_stream(&self) -> bool {
        self.stream.lock().is_some()
    }
}

/// A filesystem watch whose callback runs on the event loop's thread
///
/// Clones refer to the same watch. Dropping the last clone closes it.
#[derive(Clone)]
pub struct FsEvent {
    pub(crate) inner: Rc<HandleInner>,
}

pub(crate) struct HandleInner {
    path: PathBuf,
    pub(crate) shared: Arc<WatcherShared>,
    pub(crate) state: Cell<HandleState>,
    /// Cleared once the watched root is gone
    pub(crate) watching: Cell<bool>,
    pub(crate) callback: RefCell<EventCallback>,
    wake_task: RefCell<Option<JoinHandle<()>>>,
    active: RefCell<Option<ActiveRef>>,
    fsevents: Arc<NotificationRunLoop>,
}

impl FsEvent {
    pub(crate) fn start(
        event_loop: &EventLoop,
        path: &Path,
        recursive: bool,
        callback: EventCallback,
    ) -> Result<FsEvent> {
        let config = event_loop.config();
        let resolved = match path.canonicalize() {
            Ok(resolved) => Some(resolved),
            Err(source) if config.strict_paths => {
                return Err(WatchError::InvalidPath {
                    path: path.to_path_buf(),
                    source,
                })
            }
            Err(err) => {
                warn!(path = %path.display(), "cannot resolve watched path, paths will not be stripped: {}", err);
                None
            }
        };

        let wake = Arc::new(Notify::new());
        let shared = Arc::new(WatcherShared {
            resolved: resolved.clone(),
            recursive,
            pending: Mutex::new(Vec::new()),
            started: Semaphore::new(0),
            stream: Mutex::new(None),
            wake: wake.clone(),
        });

        let weak: Weak<WatcherShared> = Arc::downgrade(&shared);
        let delivery: Delivery = Arc::new(move |records: &[RawRecord]| {
            if let Some(shared) = weak.upgrade() {
                shared.deliver(records);
            }
        });

        let spec = StreamSpec {
            path: resolved.unwrap_or_else(|| path.to_path_buf()),
            latency: config.latency(),
        };
        let backend = event_loop.backend_for_watch();
        let stream = backend.create_stream(spec, delivery)?;
        *shared.stream.lock() = Some(stream);

        let fsevents = event_loop.fsevents().clone();
        fsevents.ensure_started()?;

        let inner = Rc::new(HandleInner {
            path: path.to_path_buf(),
            shared: shared.clone(),
            state: Cell::new(HandleState::Initializing),
            watching: Cell::new(true),
            callback: RefCell::new(callback),
            wake_task: RefCell::new(None),
            active: RefCell::new(None),
            fsevents,
        });

        let task = event_loop.spawn_internal(crate::dispatch::wake_loop(wake, Rc::downgrade(&inner)));
        *inner.wake_task.borrow_mut() = Some(task);

        if let Err(err) = inner.fsevents.signal(Signal::Subscribe(shared.clone())) {
            if let Some(task) = inner.wake_task.borrow_mut().take() {
                task.abort();
            }
            if let Some(stream) = shared.stream.lock().take() {
                platform::release(stream);
            }
            inner.state.set(HandleState::Closed);
            return Err(err);
        }

        *inner.active.borrow_mut() = Some(event_loop.acquire_ref());
        inner.state.set(HandleState::Active);
        debug!(path = %path.display(), recursive, backend = backend.name(), "watch started");

        Ok(FsEvent { inner })
    }

    /// Close the watch
    ///
    /// Blocks until the native stream has started and then been released on
    /// the notification thread. Events still queued are discarded. Fails
    /// with `InvalidState` if the watch is already closed.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    /// Stop watching and close
    pub fn stop(&self) -> Result<()> {
        self.inner.watching.set(false);
        self.inner.close()
    }

    /// The path as given to `watch`
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// The symlink-resolved root, if resolution succeeded
    pub fn resolved_path(&self) -> Option<&Path> {
        self.inner.shared.resolved.as_deref()
    }

    pub fn is_recursive(&self) -> bool {
        self.inner.shared.recursive
    }

    pub fn state(&self) -> HandleState {
        self.inner.state.get()
    }

    pub fn is_active(&self) -> bool {
        self.state() == HandleState::Active
    }

    /// Events delivered by the notification thread and not yet dispatched
    pub fn pending_events(&self) -> usize {
        self.inner.shared.pending_len()
    }
}

impl HandleInner {
    pub(crate) fn close(&self) -> Result<()> {
        if !self.shared.has_stream() {
            return Err(WatchError::InvalidState("watch is not active"));
        }
        self.state.set(HandleState::Closing);

        // Subscribe is always queued ahead of this, so the wait is short
        // unless the notification thread is gone
        while !self.shared.started.wait_timeout(START_POLL) {
            if !self.fsevents.is_alive() {
                warn!(path = %self.path.display(), "notification thread gone before stream started");
                break;
            }
        }

        if let Some(stream) = self.shared.stream.lock().take() {
            let (done_tx, done_rx) = crossbeam_channel::bounded(1);
            match self.fsevents.signal(Signal::Unsubscribe { stream, done: done_tx }) {
                Ok(()) => {
                    if done_rx.recv().is_err() {
                        warn!(path = %self.path.display(), "notification thread exited before releasing stream");
                    }
                }
                // The stream went down with the rejected signal
                Err(err) => debug!(path = %self.path.display(), "stream released locally: {}", err),
            }
        }

        if let Some(task) = self.wake_task.borrow_mut().take() {
            task.abort();
        }

        let discarded: usize = self.shared.take_pending().iter().map(Vec::len).sum();
        if discarded > 0 {
            debug!(path = %self.path.display(), discarded, "discarded pending events on close");
        }

        self.watching.set(false);
        self.active.borrow_mut().take();
        self.state.set(HandleState::Closed);
        debug!(path = %self.path.display(), "watch closed");
        Ok(())
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if self.shared.has_stream() {
            if let Err(err) = self.close() {
                warn!(path = %self.path.display(), "close on drop failed: {}", err);
            }
        }
    }
}

impl fmt::Debug for FsEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsEvent")
            .field("path", &self.inner.path)
            .field("resolved", &self.inner.shared.resolved)
            .field("recursive", &self.inner.shared.recursive)
            .field("state", &self.inner.state.get())
            .finish()
    }
}
