//! Single-threaded event loop that watch callbacks run on
//!
//! A current-thread tokio runtime drives a `LocalSet`; every watch callback
//! runs inside it, on the thread that calls one of the `run*` methods.
//! Each loop owns its notification run loop and tears it down on drop.

use crate::config::{BackendKind, WatchConfig};
use crate::error::{Result, WatchError};
use crate::fsevents::NotificationRunLoop;
use crate::handle::{EventCallback, FsEvent};
use crate::platform::{self, Backend, NullBackend};
use crate::translate::EventKind;
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, LocalSet};
use tracing::{debug, warn};

/// Event loop owning watches and the thread that hosts their subscriptions
pub struct EventLoop {
    local: LocalSet,
    runtime: Runtime,
    fsevents: Arc<NotificationRunLoop>,
    backend: Arc<dyn Backend>,
    config: WatchConfig,
    refs: Rc<HandleRefs>,
}

impl EventLoop {
    /// Event loop with default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(WatchConfig::default())
    }

    /// Event loop using the backend named by `config`
    pub fn with_config(config: WatchConfig) -> Result<Self> {
        let backend = platform::backend_for(config.backend);
        Self::with_backend(config, backend)
    }

    /// Event loop subscribing through an explicit backend
    pub fn with_backend(config: WatchConfig, backend: Arc<dyn Backend>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| WatchError::ResourceExhausted(format!("cannot build event loop runtime: {}", e)))?;

        Ok(Self {
            local: LocalSet::new(),
            runtime,
            fsevents: Arc::new(NotificationRunLoop::new(&config)),
            backend,
            config,
            refs: Rc::new(HandleRefs::default()),
        })
    }

    /// Watch `path`, invoking `callback` on this loop's thread for every event
    ///
    /// The callback receives the handle, the path relative to the watched
    /// root (`None` for the root itself), the event kind and a status that is
    /// always 0.
    pub fn watch<F>(&self, path: impl AsRef<Path>, recursive: bool, callback: F) -> Result<FsEvent>
    where
        F: FnMut(&FsEvent, Option<&Path>, EventKind, i32) + 'static,
    {
        let callback: EventCallback = Box::new(callback);
        FsEvent::start(self, path.as_ref(), recursive, callback)
    }

    /// Run until no active watch remains
    pub fn run(&self) {
        self.run_until(self.idle());
    }

    /// Resolves once no active watch remains; only makes progress while the
    /// loop is being run
    pub fn idle(&self) -> impl Future<Output = ()> + 'static {
        let refs = self.refs.clone();
        async move { refs.idle().await }
    }

    /// Run until `future` completes
    ///
    /// Must not be called from inside a watch callback.
    pub fn run_until<F: Future>(&self, future: F) -> F::Output {
        self.local.block_on(&self.runtime, future)
    }

    /// Run until no active watch remains or `timeout` elapses.
    /// Returns whether the loop went idle.
    pub fn run_for(&self, timeout: Duration) -> bool {
        let idle = self.idle();
        self.run_until(async move { tokio::time::timeout(timeout, idle).await.is_ok() })
    }

    /// Number of active watches keeping `run` from returning
    pub fn active_handles(&self) -> usize {
        self.refs.count.get()
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// The notification run loop owned by this event loop
    pub fn fsevents(&self) -> &Arc<NotificationRunLoop> {
        &self.fsevents
    }

    /// Backend for a new watch, after the capability check
    pub(crate) fn backend_for_watch(&self) -> Arc<dyn Backend> {
        if self.backend.is_supported() || self.config.backend == BackendKind::Native {
            return self.backend.clone();
        }
        warn!(backend = self.backend.name(), "{}; watching with no-op streams", WatchError::SystemNotSupported);
        Arc::new(NullBackend)
    }

    /// Spawn a task that does not keep `run` alive
    pub(crate) fn spawn_internal<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        self.local.spawn_local(future)
    }

    /// Reference that keeps `run` alive until dropped
    pub(crate) fn acquire_ref(&self) -> ActiveRef {
        self.refs.count.set(self.refs.count.get() + 1);
        ActiveRef {
            refs: self.refs.clone(),
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if self.refs.count.get() > 0 {
            debug!(active = self.refs.count.get(), "event loop dropped with active watches");
        }
        self.fsevents.teardown();
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("backend", &self.backend.name())
            .field("active_handles", &self.active_handles())
            .field("fsevents", &self.fsevents)
            .finish()
    }
}

/// Count of handles keeping the loop alive
#[derive(Default)]
pub(crate) struct HandleRefs {
    count: Cell<usize>,
    released: Notify,
}

impl HandleRefs {
    async fn idle(&self) {
        while self.count.get() > 0 {
            self.released.notified().await;
        }
    }
}

/// Keeps the event loop alive while held
pub(crate) struct ActiveRef {
    refs: Rc<HandleRefs>,
}

impl Drop for ActiveRef {
    fn drop(&mut self) {
        let count = self.refs.count.get().saturating_sub(1);
        self.refs.count.set(count);
        if count == 0 {
            self.refs.released.notify_one();
        }
    }
}
