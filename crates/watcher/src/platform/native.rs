//! OS notification facility through `notify`
//!
//! `notify` reports events on its own thread, one event at a time. Records
//! are buffered and flushed as a single delivery `latency` after the first
//! record of a burst, through a delayed perform on the attached run loop, so
//! deliveries always happen on the notification thread.

use super::{Backend, Delivery, NativeStream, RawRecord, StreamSpec};
use crate::error::{Result, WatchError};
use crate::runloop::RunLoop;
use crate::translate::EventFlags;
use notify::event::{CreateKind, EventKind, MetadataKind, ModifyKind, RemoveKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Backend using the platform's recommended `notify` watcher
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBackend;

impl NativeBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn is_supported(&self) -> bool {
        cfg!(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "windows",
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "netbsd",
            target_os = "dragonfly"
        ))
    }

    fn create_stream(&self, spec: StreamSpec, delivery: Delivery) -> Result<Box<dyn NativeStream>> {
        let coalescer = Coalescer::new(spec.latency, delivery);

        let handler = coalescer.clone();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            handler.on_event(res);
        })?;

        Ok(Box::new(NotifyStream {
            path: spec.path,
            watcher: Some(watcher),
            coalescer,
            watching: false,
        }))
    }
}

struct NotifyStream {
    path: PathBuf,
    watcher: Option<RecommendedWatcher>,
    coalescer: Arc<Coalescer>,
    watching: bool,
}

impl NativeStream for NotifyStream {
    fn schedule(&mut self, run_loop: &RunLoop) {
        *self.coalescer.run_loop.lock() = Some(run_loop.clone());
    }

    fn start(&mut self) -> Result<()> {
        let watcher = self
            .watcher
            .as_mut()
            .ok_or(WatchError::InvalidState("stream already released"))?;

        // Recursion is filtered during translation, like the native facility
        self.coalescer.active.store(true, Ordering::SeqCst);
        if let Err(err) = watcher.watch(&self.path, RecursiveMode::Recursive) {
            self.coalescer.active.store(false, Ordering::SeqCst);
            return Err(err.into());
        }
        self.watching = true;
        debug!(path = %self.path.display(), "native stream started");
        Ok(())
    }

    fn stop(&mut self) {
        self.coalescer.active.store(false, Ordering::SeqCst);
        if !self.watching {
            return;
        }
        self.watching = false;
        if let Some(watcher) = self.watcher.as_mut() {
            if let Err(err) = watcher.unwatch(&self.path) {
                // Root already gone
                debug!(path = %self.path.display(), "unwatch failed: {}", err);
            }
        }
    }

    fn invalidate(&mut self) {
        self.coalescer.run_loop.lock().take();
        self.coalescer.records.lock().clear();
    }
}

impl Drop for NotifyStream {
    // A pending flush holds the coalescer, which must not hold the run loop back
    fn drop(&mut self) {
        self.stop();
        self.invalidate();
        self.watcher.take();
    }
}

/// Buffers records between notify's thread and the run loop
struct Coalescer {
    latency: Duration,
    delivery: Delivery,
    records: Mutex<Vec<RawRecord>>,
    run_loop: Mutex<Option<RunLoop>>,
    flush_scheduled: AtomicBool,
    active: AtomicBool,
}

impl Coalescer {
    fn new(latency: Duration, delivery: Delivery) -> Arc<Self> {
        Arc::new(Self {
            latency,
            delivery,
            records: Mutex::new(Vec::new()),
            run_loop: Mutex::new(None),
            flush_scheduled: AtomicBool::new(false),
            active: AtomicBool::new(false),
        })
    }

    /// Runs on notify's thread
    fn on_event(self: &Arc<Self>, res: notify::Result<notify::Event>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                warn!("native watcher error: {}", err);
                return;
            }
        };

        if !self.active.load(Ordering::SeqCst) {
            return;
        }

        let flags = flags_for(&event);
        if flags.is_empty() {
            return;
        }

        {
            let mut records = self.records.lock();
            for path in event.paths {
                records.push(RawRecord { path, flags });
            }
        }

        self.schedule_flush();
    }

    fn schedule_flush(self: &Arc<Self>) {
        if self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let run_loop = self.run_loop.lock().clone();
        match run_loop {
            Some(run_loop) => {
                let this = self.clone();
                run_loop.perform_after(self.latency, move || this.flush());
            }
            None => self.flush_scheduled.store(false, Ordering::SeqCst),
        }
    }

    /// Runs on the notification thread
    fn flush(&self) {
        // Cleared first so records arriving from now on schedule a new flush
        self.flush_scheduled.store(false, Ordering::SeqCst);

        let batch = std::mem::take(&mut *self.records.lock());
        if batch.is_empty() || !self.active.load(Ordering::SeqCst) {
            return;
        }

        trace!(records = batch.len(), "delivering native batch");
        (self.delivery)(&batch);
    }
}

/// Map a notify event onto native record flags. Access events map to nothing.
pub(crate) fn flags_for(event: &notify::Event) -> EventFlags {
    let mut flags = match &event.kind {
        EventKind::Create(kind) => EventFlags::ITEM_CREATED | entry_type(*kind == CreateKind::Folder, *kind == CreateKind::File),
        EventKind::Remove(kind) => EventFlags::ITEM_REMOVED | entry_type(*kind == RemoveKind::Folder, *kind == RemoveKind::File),
        EventKind::Modify(ModifyKind::Name(_)) => EventFlags::ITEM_RENAMED,
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::Ownership)) => EventFlags::ITEM_CHANGE_OWNER,
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::Extended)) => EventFlags::ITEM_XATTR_MOD,
        EventKind::Modify(ModifyKind::Metadata(_)) => EventFlags::ITEM_INODE_META_MOD,
        EventKind::Modify(_) => EventFlags::ITEM_MODIFIED,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => EventFlags::empty(),
    };

    if event.need_rescan() {
        flags |= EventFlags::MUST_SCAN_SUBDIRS | EventFlags::USER_DROPPED;
    }

    flags
}

fn entry_type(is_dir: bool, is_file: bool) -> EventFlags {
    if is_dir {
        EventFlags::ITEM_IS_DIR
    } else if is_file {
        EventFlags::ITEM_IS_FILE
    } else {
        EventFlags::empty()
    }
}
