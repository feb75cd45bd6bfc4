//! Common utilities for integration tests

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use watcher::{EventKind, EventLoop, ManualBackend, WatchConfig};

/// Callback invocations recorded by a test watch
pub type Recorded = Rc<RefCell<Vec<Seen>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seen {
    pub path: Option<PathBuf>,
    pub kind: EventKind,
    pub thread: std::thread::ThreadId,
}

/// A watched temp directory behind a scripted backend
pub struct Fixture {
    pub temp_dir: TempDir,
    pub root: PathBuf,
    pub backend: ManualBackend,
    pub event_loop: EventLoop,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(WatchConfig::default())
    }

    pub fn with_config(config: WatchConfig) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().canonicalize().unwrap();
        let backend = ManualBackend::new();
        let event_loop = EventLoop::with_backend(config, Arc::new(backend.clone())).unwrap();
        Self {
            temp_dir,
            root,
            backend,
            event_loop,
        }
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Drive the loop until `expected` streams are started
    pub fn wait_for_streams(&self, expected: usize) {
        let backend = &self.backend;
        let started = self.event_loop.run_until(async {
            tokio::time::timeout(Duration::from_secs(5), async {
                while backend.active_streams() < expected {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
            .await
        });
        assert!(started.is_ok(), "streams never started");
    }

    /// Drive the loop briefly so queued wakes are processed
    ///
    /// The timer is created inside the future so it registers with the
    /// loop's runtime.
    pub fn pump(&self, duration: Duration) {
        self.event_loop.run_until(async move { tokio::time::sleep(duration).await });
    }
}

pub fn recorder() -> Recorded {
    Rc::default()
}

pub fn relative(path: &str) -> Option<PathBuf> {
    Some(Path::new(path).to_path_buf())
}
