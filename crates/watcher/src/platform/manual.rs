//! Scripted facility: batches are injected by the embedder
//!
//! Useful wherever changes are known without asking the OS (virtual
//! filesystems, replay) and for exercising the bridge deterministically.

use super::{Backend, Delivery, NativeStream, RawRecord, StreamSpec};
use crate::error::{Result, WatchError};
use crate::runloop::RunLoop;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Backend delivering injected batches; clones share the same streams
#[derive(Debug, Clone)]
pub struct ManualBackend {
    inner: Arc<ManualInner>,
}

#[derive(Debug)]
struct ManualInner {
    supported: bool,
    streams: Mutex<Vec<Weak<StreamShared>>>,
    created: AtomicUsize,
    started: AtomicUsize,
    stopped: AtomicUsize,
    released: AtomicUsize,
}

struct StreamShared {
    path: PathBuf,
    delivery: Delivery,
    run_loop: Mutex<Option<RunLoop>>,
    active: AtomicBool,
}

impl std::fmt::Debug for StreamShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamShared")
            .field("path", &self.path)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl ManualBackend {
    pub fn new() -> Self {
        Self::with_support(true)
    }

    /// A backend that fails the capability check
    pub fn unsupported() -> Self {
        Self::with_support(false)
    }

    fn with_support(supported: bool) -> Self {
        Self {
            inner: Arc::new(ManualInner {
                supported,
                streams: Mutex::new(Vec::new()),
                created: AtomicUsize::new(0),
                started: AtomicUsize::new(0),
                stopped: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
            }),
        }
    }

    /// Deliver `records` as one batch to every started stream watching `path`
    ///
    /// Delivery happens on the notification thread. Returns how many streams
    /// the batch was queued for.
    pub fn emit(&self, path: &Path, records: Vec<RawRecord>) -> usize {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.emit_matching(records, |stream| stream.path == path || stream.path == canonical)
    }

    /// Deliver `records` as one batch to every started stream
    pub fn emit_all(&self, records: Vec<RawRecord>) -> usize {
        self.emit_matching(records, |_| true)
    }

    fn emit_matching<F>(&self, records: Vec<RawRecord>, matches: F) -> usize
    where
        F: Fn(&StreamShared) -> bool,
    {
        let targets: Vec<Arc<StreamShared>> = {
            let mut streams = self.inner.streams.lock();
            streams.retain(|weak| weak.strong_count() > 0);
            streams
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|stream| stream.active.load(Ordering::SeqCst) && matches(stream))
                .collect()
        };

        let mut queued = 0;
        for stream in targets {
            let Some(run_loop) = stream.run_loop.lock().clone() else {
                continue;
            };
            let records = records.clone();
            let target = stream.clone();
            run_loop.perform(move || {
                if target.active.load(Ordering::SeqCst) {
                    (target.delivery)(&records);
                }
            });
            queued += 1;
        }
        queued
    }

    pub fn streams_created(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }

    pub fn streams_started(&self) -> usize {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn streams_stopped(&self) -> usize {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn streams_released(&self) -> usize {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Streams currently started and not yet stopped
    pub fn active_streams(&self) -> usize {
        self.inner
            .streams
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|stream| stream.active.load(Ordering::SeqCst))
            .count()
    }
}

impl Default for ManualBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for ManualBackend {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn is_supported(&self) -> bool {
        self.inner.supported
    }

    fn create_stream(&self, spec: StreamSpec, delivery: Delivery) -> Result<Box<dyn NativeStream>> {
        let shared = Arc::new(StreamShared {
            path: spec.path,
            delivery,
            run_loop: Mutex::new(None),
            active: AtomicBool::new(false),
        });
        self.inner.streams.lock().push(Arc::downgrade(&shared));
        self.inner.created.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(ManualStream {
            shared,
            backend: self.inner.clone(),
        }))
    }
}

struct ManualStream {
    shared: Arc<StreamShared>,
    backend: Arc<ManualInner>,
}

impl NativeStream for ManualStream {
    fn schedule(&mut self, run_loop: &RunLoop) {
        *self.shared.run_loop.lock() = Some(run_loop.clone());
    }

    fn start(&mut self) -> Result<()> {
        if self.shared.run_loop.lock().is_none() {
            return Err(WatchError::InvalidState("stream started before being scheduled"));
        }
        self.shared.active.store(true, Ordering::SeqCst);
        self.backend.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        if self.shared.active.swap(false, Ordering::SeqCst) {
            self.backend.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn invalidate(&mut self) {
        self.shared.run_loop.lock().take();
    }
}

impl Drop for ManualStream {
    fn drop(&mut self) {
        self.stop();
        self.invalidate();
        self.backend.released.fetch_add(1, Ordering::SeqCst);
    }
}
